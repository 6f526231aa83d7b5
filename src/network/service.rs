//! Lifecycle of the network-facing listener.
//!
//! One listener is bound at a time. The route table is whatever the
//! [`ServiceFactory`] registers in `bind`; it stays fixed until the instance
//! is stopped, which drops it.

use std::fmt;

use super::link::LinkRole;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    AlreadyRunning,
    Bind(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::AlreadyRunning => write!(f, "service already running"),
            ServiceError::Bind(msg) => write!(f, "failed to bind service: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Creates listener instances. Dropping the returned value must unbind it.
pub trait ServiceFactory {
    type Service;

    fn bind(&mut self, role: LinkRole) -> Result<Self::Service, ServiceError>;
}

/// Opaque reference to a running listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHandle {
    id: u32,
    role: LinkRole,
}

impl ServiceHandle {
    pub fn role(&self) -> LinkRole {
        self.role
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

pub struct ServiceManager<F: ServiceFactory> {
    factory: F,
    running: Option<(ServiceHandle, F::Service)>,
    next_id: u32,
}

impl<F: ServiceFactory> ServiceManager<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            running: None,
            next_id: 1,
        }
    }

    /// Binds a new listener. Callers must stop the current one first.
    pub fn start(&mut self, role: LinkRole) -> Result<ServiceHandle, ServiceError> {
        if self.running.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }

        let service = self.factory.bind(role)?;
        let handle = ServiceHandle {
            id: self.next_id,
            role,
        };
        self.next_id = self.next_id.wrapping_add(1);
        self.running = Some((handle, service));

        log::info!("Service started for {} (instance {})", role, handle.id);
        Ok(handle)
    }

    /// Idempotent. `None`, a stale handle, or an already stopped service are
    /// all no-ops.
    pub fn stop(&mut self, handle: Option<ServiceHandle>) -> StopOutcome {
        let Some(handle) = handle else {
            return StopOutcome::NotRunning;
        };

        match &self.running {
            Some((current, _)) if *current == handle => {
                // Dropping the instance unbinds the listener
                self.running = None;
                log::info!("Service stopped (instance {})", handle.id);
                StopOutcome::Stopped
            }
            Some(_) => {
                log::debug!("Ignoring stop for stale service instance {}", handle.id);
                StopOutcome::NotRunning
            }
            None => StopOutcome::NotRunning,
        }
    }

    pub fn current(&self) -> Option<ServiceHandle> {
        self.running.as_ref().map(|(handle, _)| *handle)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingFactory {
        binds: usize,
        fail: bool,
    }

    impl ServiceFactory for CountingFactory {
        type Service = ();

        fn bind(&mut self, _role: LinkRole) -> Result<(), ServiceError> {
            if self.fail {
                return Err(ServiceError::Bind("port in use".into()));
            }
            self.binds += 1;
            Ok(())
        }
    }

    #[test]
    fn second_start_is_rejected_until_stopped() {
        let mut manager = ServiceManager::new(CountingFactory::default());
        let handle = manager.start(LinkRole::Station).unwrap();
        assert_eq!(manager.start(LinkRole::AccessPoint), Err(ServiceError::AlreadyRunning));
        assert_eq!(manager.current(), Some(handle));

        assert_eq!(manager.stop(Some(handle)), StopOutcome::Stopped);
        let next = manager.start(LinkRole::AccessPoint).unwrap();
        assert_eq!(next.role(), LinkRole::AccessPoint);
        assert_eq!(manager.factory().binds, 2);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut manager = ServiceManager::new(CountingFactory::default());
        assert_eq!(manager.stop(None), StopOutcome::NotRunning);

        let handle = manager.start(LinkRole::Station).unwrap();
        assert_eq!(manager.stop(Some(handle)), StopOutcome::Stopped);
        assert_eq!(manager.stop(Some(handle)), StopOutcome::NotRunning);
        assert!(!manager.is_running());
    }

    #[test]
    fn stale_handle_does_not_stop_newer_instance() {
        let mut manager = ServiceManager::new(CountingFactory::default());
        let old = manager.start(LinkRole::Station).unwrap();
        manager.stop(Some(old));
        let new = manager.start(LinkRole::Station).unwrap();

        assert_eq!(manager.stop(Some(old)), StopOutcome::NotRunning);
        assert_eq!(manager.current(), Some(new));
    }

    #[test]
    fn bind_failure_leaves_nothing_running() {
        let mut manager = ServiceManager::new(CountingFactory {
            binds: 0,
            fail: true,
        });
        assert!(matches!(manager.start(LinkRole::Station), Err(ServiceError::Bind(_))));
        assert!(manager.current().is_none());
    }
}
