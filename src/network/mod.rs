//! Connectivity: station credentials, the link driver contract, the service
//! lifecycle and the supervisor that arbitrates between station and
//! fallback access point.

pub mod credentials;
pub mod link;
pub mod service;
pub mod supervisor;

pub use credentials::{CredentialsError, NetworkCredentials};
pub use link::{EventSink, LinkConfig, LinkDriver, LinkError, LinkEvent, LinkRole, PeerId};
pub use service::{ServiceError, ServiceFactory, ServiceHandle, ServiceManager, StopOutcome};
pub use supervisor::{
    NetworkMode, NetworkSnapshot, NetworkState, Supervisor, SupervisorEvent, SupervisorHandle,
    SupervisorInbox,
};
