// OTA (Over-The-Air) update module

pub mod boot_guard;
pub mod restart;
pub mod session;
pub mod slots;

pub use boot_guard::{BootGuard, BootOutcome, RollbackTrigger};
pub use restart::{schedule_restart, Restarter};
pub use session::{UpdateError, UpdateProgress, UpdateService, UpdateSession, UpdateStatus};
pub use slots::{BootRecord, BootState, SlotStorage, StorageError};

// Update flow:
// 1. begin: claim the single session, open the inactive slot
// 2. write: stream chunks, transient flash errors retried in place
// 3. finalize: length/digest check, flash finalize, set boot slot
// 4. restart after a short delay
// 5. next boot: boot guard confirms the image after the grace period
