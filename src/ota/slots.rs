use std::fmt;

/// Image state as tracked by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    /// Written and selected, never booted
    New,
    /// Booted once, not yet confirmed
    PendingVerify,
    Valid,
    Invalid,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRecord<Slot> {
    pub active_slot: Slot,
    pub pending_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    NoInactiveSlot,
    /// A single hiccup worth retrying
    Transient(String),
    Failed(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NoInactiveSlot => write!(f, "no inactive firmware slot"),
            StorageError::Transient(msg) => write!(f, "transient storage error: {}", msg),
            StorageError::Failed(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Dual-slot firmware storage with boot pointer control.
///
/// A `Writer` is consumed by `finalize` or `abort`, so a write cursor can
/// never outlive its transaction.
pub trait SlotStorage {
    type Slot: Copy + Eq + fmt::Debug;
    type Writer;

    fn running_slot(&self) -> Result<Self::Slot, StorageError>;
    fn boot_slot(&self) -> Result<Self::Slot, StorageError>;
    fn inactive_slot(&self) -> Result<Self::Slot, StorageError>;

    fn begin_write(&mut self, slot: Self::Slot) -> Result<Self::Writer, StorageError>;
    fn write(&mut self, writer: &mut Self::Writer, bytes: &[u8]) -> Result<(), StorageError>;
    fn finalize(&mut self, writer: Self::Writer) -> Result<(), StorageError>;
    fn abort(&mut self, writer: Self::Writer);

    fn set_boot_slot(&mut self, slot: Self::Slot) -> Result<(), StorageError>;
    fn boot_state(&self, slot: Self::Slot) -> Result<BootState, StorageError>;
    fn mark_valid(&mut self, slot: Self::Slot) -> Result<(), StorageError>;

    /// Invalidates the running image and reboots into the previous one.
    /// Only returns on failure.
    fn rollback_and_reboot(&mut self) -> Result<(), StorageError>;

    fn boot_record(&self) -> Result<BootRecord<Self::Slot>, StorageError> {
        let active_slot = self.running_slot()?;
        let pending_verify = self.boot_state(active_slot)? == BootState::PendingVerify;
        Ok(BootRecord {
            active_slot,
            pending_verify,
        })
    }
}
