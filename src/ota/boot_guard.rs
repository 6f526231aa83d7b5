//! Boot validation guard.
//!
//! Runs once per boot. If the running image is still pending verification,
//! it waits out the grace period and then marks the image valid. A
//! [`RollbackTrigger`] fired before that reverts to the previous slot.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::slots::{SlotStorage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// Nothing to verify on this boot
    AlreadyValid,
    Confirmed,
    /// Only observable where a reboot does not end the process
    RolledBack,
}

/// Hook for a health check to reject the running image early
#[derive(Clone)]
pub struct RollbackTrigger {
    tx: Sender<String>,
}

impl RollbackTrigger {
    pub fn fire(&self, reason: &str) {
        if self.tx.send(reason.to_string()).is_err() {
            log::debug!("Rollback trigger fired after the grace period ended");
        }
    }
}

pub struct BootGuard<S: SlotStorage> {
    storage: Arc<Mutex<S>>,
    grace: Duration,
    rx: Receiver<String>,
    // Keeps the channel open so the wait always lasts the full grace period
    _keepalive: Sender<String>,
}

impl<S: SlotStorage> BootGuard<S> {
    pub fn new(storage: Arc<Mutex<S>>, grace: Duration) -> (Self, RollbackTrigger) {
        let (tx, rx) = mpsc::channel();
        let trigger = RollbackTrigger { tx: tx.clone() };
        let guard = Self {
            storage,
            grace,
            rx,
            _keepalive: tx,
        };
        (guard, trigger)
    }

    pub fn run(self) -> Result<BootOutcome, StorageError> {
        let record = self.lock()?.boot_record()?;
        if !record.pending_verify {
            log::info!("Running image in slot {:?} already valid", record.active_slot);
            return Ok(BootOutcome::AlreadyValid);
        }

        log::warn!(
            "Image in slot {:?} pending verification, confirming in {} s",
            record.active_slot,
            self.grace.as_secs()
        );

        match self.rx.recv_timeout(self.grace) {
            Ok(reason) => {
                log::error!("Rolling back new image: {}", reason);
                self.lock()?.rollback_and_reboot()?;
                Ok(BootOutcome::RolledBack)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.lock()?.mark_valid(record.active_slot)?;
                log::info!("Image in slot {:?} marked valid", record.active_slot);
                Ok(BootOutcome::Confirmed)
            }
        }
    }

    /// Runs the guard on its own thread so it never delays startup.
    pub fn spawn(self) -> thread::JoinHandle<Result<BootOutcome, StorageError>>
    where
        S: Send + 'static,
    {
        thread::spawn(move || {
            let outcome = self.run();
            if let Err(e) = &outcome {
                log::error!("Boot validation failed: {}", e);
            }
            outcome
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, S>, StorageError> {
        self.storage
            .lock()
            .map_err(|_| StorageError::Failed("slot storage lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::slots::BootState;
    use crate::sim::SimSlots;

    fn pending_slots() -> SimSlots {
        let slots = SimSlots::new();
        slots.install_image(1, b"new image");
        slots.reboot();
        slots
    }

    #[test]
    fn valid_image_needs_no_action() {
        let slots = SimSlots::new();
        let (guard, _trigger) = BootGuard::new(Arc::new(Mutex::new(slots.clone())), Duration::from_secs(30));
        assert_eq!(guard.run().unwrap(), BootOutcome::AlreadyValid);
    }

    #[test]
    fn pending_image_is_confirmed_after_grace() {
        let slots = pending_slots();
        assert_eq!(slots.state(1), BootState::PendingVerify);

        let (guard, _trigger) =
            BootGuard::new(Arc::new(Mutex::new(slots.clone())), Duration::from_millis(20));
        assert_eq!(guard.run().unwrap(), BootOutcome::Confirmed);
        assert_eq!(slots.state(1), BootState::Valid);
    }

    #[test]
    fn trigger_rolls_back_before_grace_elapses() {
        let slots = pending_slots();
        let (guard, trigger) =
            BootGuard::new(Arc::new(Mutex::new(slots.clone())), Duration::from_secs(30));
        let handle = guard.spawn();
        trigger.fire("health check failed");

        assert_eq!(handle.join().unwrap().unwrap(), BootOutcome::RolledBack);
        assert_eq!(slots.state(1), BootState::Invalid);
        assert_eq!(slots.running_slot_index(), 0);
    }
}
