use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Resets the device. On hardware this never returns.
pub trait Restarter: Send + Sync {
    fn restart(&self);
}

/// Restarts after `delay` on a detached thread, giving an in-flight
/// response time to reach the client.
pub fn schedule_restart(restarter: Arc<dyn Restarter>, delay: Duration) -> thread::JoinHandle<()> {
    log::info!("Restart scheduled in {} ms", delay.as_millis());
    thread::spawn(move || {
        thread::sleep(delay);
        log::warn!("Restarting now");
        restarter.restart();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRestarter;

    #[test]
    fn restart_happens_after_the_delay() {
        let restarter = SimRestarter::new();
        let handle = schedule_restart(Arc::new(restarter.clone()), Duration::from_millis(20));
        assert_eq!(restarter.count(), 0);
        handle.join().unwrap();
        assert_eq!(restarter.count(), 1);
    }
}
