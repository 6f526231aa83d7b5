//! Firmware update session.
//!
//! [`UpdateService`] hands out at most one [`UpdateSession`] at a time. The
//! session owns the write cursor for its whole life and releases the claim
//! when it reaches Committed or Aborted, or when it is dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::restart::{schedule_restart, Restarter};
use super::slots::{SlotStorage, StorageError};

/// Attempts per chunk before a transient flash error is treated as fatal
const WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Idle,
    Begin,
    Streaming,
    Finalizing,
    Committed,
    Aborted,
}

impl UpdateStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdateStatus::Committed | UpdateStatus::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    Busy,
    NoInactiveSlot,
    InvalidState(UpdateStatus),
    Storage(StorageError),
    LengthMismatch { declared: u64, written: u64 },
    DigestMismatch,
    Disconnected,
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::Busy => write!(f, "another update is in progress"),
            UpdateError::NoInactiveSlot => write!(f, "no inactive slot to write to"),
            UpdateError::InvalidState(status) => {
                write!(f, "operation not valid in state {:?}", status)
            }
            UpdateError::Storage(e) => write!(f, "{}", e),
            UpdateError::LengthMismatch { declared, written } => write!(
                f,
                "declared length {} but {} bytes were written",
                declared, written
            ),
            UpdateError::DigestMismatch => write!(f, "image digest mismatch"),
            UpdateError::Disconnected => write!(f, "uploader disconnected"),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<StorageError> for UpdateError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NoInactiveSlot => UpdateError::NoInactiveSlot,
            other => UpdateError::Storage(other),
        }
    }
}

/// Last known status, published for the status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateProgress {
    pub status: UpdateStatus,
    pub bytes_written: u64,
}

impl Default for UpdateProgress {
    fn default() -> Self {
        Self {
            status: UpdateStatus::Idle,
            bytes_written: 0,
        }
    }
}

pub struct UpdateService<S: SlotStorage> {
    storage: Arc<Mutex<S>>,
    active: Arc<AtomicBool>,
    progress: Arc<Mutex<UpdateProgress>>,
    restarter: Arc<dyn Restarter>,
    restart_delay: Duration,
}

impl<S: SlotStorage> Clone for UpdateService<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            active: self.active.clone(),
            progress: self.progress.clone(),
            restarter: self.restarter.clone(),
            restart_delay: self.restart_delay,
        }
    }
}

impl<S: SlotStorage> UpdateService<S> {
    pub fn new(storage: Arc<Mutex<S>>, restarter: Arc<dyn Restarter>, restart_delay: Duration) -> Self {
        Self {
            storage,
            active: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Mutex::new(UpdateProgress::default())),
            restarter,
            restart_delay,
        }
    }

    /// Claims the single session and opens the inactive slot. A concurrent
    /// call gets `Busy` and the running session is left alone.
    pub fn begin(&self) -> Result<UpdateSession<S>, UpdateError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("Rejecting update: another session is active");
            return Err(UpdateError::Busy);
        }

        let mut session = UpdateSession {
            service: self.clone(),
            slot: None,
            writer: None,
            bytes_written: 0,
            hasher: Sha256::new(),
            status: UpdateStatus::Begin,
        };
        session.publish();

        let opened = lock_storage(&self.storage).and_then(|mut storage| {
            let slot = storage.inactive_slot()?;
            let writer = storage.begin_write(slot)?;
            Ok((slot, writer))
        });

        match opened {
            Ok((slot, writer)) => {
                log::info!("Update session started, target slot {:?}", slot);
                session.slot = Some(slot);
                session.writer = Some(writer);
                session.status = UpdateStatus::Streaming;
                session.publish();
                Ok(session)
            }
            Err(e) => {
                let err = UpdateError::from(e);
                log::error!("Failed to begin update: {}", err);
                session.abort();
                Err(err)
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> UpdateProgress {
        match self.progress.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

fn lock_storage<S>(storage: &Mutex<S>) -> Result<MutexGuard<'_, S>, StorageError> {
    storage
        .lock()
        .map_err(|_| StorageError::Failed("slot storage lock poisoned".into()))
}

pub struct UpdateSession<S: SlotStorage> {
    service: UpdateService<S>,
    slot: Option<S::Slot>,
    writer: Option<S::Writer>,
    bytes_written: u64,
    hasher: Sha256,
    status: UpdateStatus,
}

impl<S: SlotStorage> UpdateSession<S> {
    pub fn status(&self) -> UpdateStatus {
        self.status
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Appends `chunk` to the target slot. Transient flash errors are
    /// retried; anything else aborts the session.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        if self.status != UpdateStatus::Streaming {
            return Err(UpdateError::InvalidState(self.status));
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(UpdateError::InvalidState(self.status));
        };

        let result = lock_storage(&self.service.storage).and_then(|mut storage| {
            let mut attempt = 1;
            loop {
                match storage.write(writer, chunk) {
                    Err(StorageError::Transient(msg)) if attempt < WRITE_ATTEMPTS => {
                        log::warn!("Flash write hiccup ({}), retry {}", msg, attempt);
                        attempt += 1;
                    }
                    other => break other,
                }
            }
        });

        if let Err(e) = result {
            log::error!("Firmware write failed at {} bytes: {}", self.bytes_written, e);
            self.abort();
            return Err(UpdateError::Storage(e));
        }

        self.hasher.update(chunk);
        self.bytes_written += chunk.len() as u64;
        self.publish();
        Ok(())
    }

    /// Finalizes the image and points the bootloader at it. Either both
    /// steps succeed and the session is Committed (restart scheduled), or it
    /// is Aborted with the boot pointer untouched.
    pub fn finalize(
        &mut self,
        declared_len: Option<u64>,
        expected_digest: Option<&[u8; 32]>,
    ) -> Result<(), UpdateError> {
        if self.status != UpdateStatus::Streaming {
            return Err(UpdateError::InvalidState(self.status));
        }

        if let Some(declared) = declared_len {
            if declared != self.bytes_written {
                let err = UpdateError::LengthMismatch {
                    declared,
                    written: self.bytes_written,
                };
                log::error!("{}", err);
                self.abort();
                return Err(err);
            }
        }

        if let Some(expected) = expected_digest {
            let actual = self.hasher.clone().finalize();
            if actual.as_slice() != expected.as_slice() {
                log::error!("Image SHA-256 does not match the uploader's digest");
                self.abort();
                return Err(UpdateError::DigestMismatch);
            }
        }

        let (Some(slot), Some(writer)) = (self.slot, self.writer.take()) else {
            return Err(UpdateError::InvalidState(self.status));
        };
        self.status = UpdateStatus::Finalizing;
        self.publish();

        let result = lock_storage(&self.service.storage).and_then(|mut storage| {
            storage.finalize(writer)?;
            storage.set_boot_slot(slot)
        });

        match result {
            Ok(()) => {
                log::info!(
                    "Update committed: {} bytes to slot {:?}",
                    self.bytes_written,
                    slot
                );
                self.finish(UpdateStatus::Committed);
                schedule_restart(self.service.restarter.clone(), self.service.restart_delay);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to finalize update: {}", e);
                self.finish(UpdateStatus::Aborted);
                Err(UpdateError::Storage(e))
            }
        }
    }

    /// Releases the write cursor without making the slot bootable.
    /// Idempotent; a no-op once Committed.
    pub fn abort(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        if let Some(writer) = self.writer.take() {
            match lock_storage(&self.service.storage) {
                Ok(mut storage) => storage.abort(writer),
                Err(e) => log::error!("Could not release write handle: {}", e),
            }
        }
        log::warn!("Update aborted after {} bytes", self.bytes_written);
        self.finish(UpdateStatus::Aborted);
    }

    fn finish(&mut self, status: UpdateStatus) {
        self.status = status;
        self.publish();
        self.service.active.store(false, Ordering::Release);
    }

    fn publish(&self) {
        let progress = UpdateProgress {
            status: self.status,
            bytes_written: self.bytes_written,
        };
        match self.service.progress.lock() {
            Ok(mut guard) => *guard = progress,
            Err(poisoned) => *poisoned.into_inner() = progress,
        }
    }
}

impl<S: SlotStorage> Drop for UpdateSession<S> {
    fn drop(&mut self) {
        self.abort();
    }
}
