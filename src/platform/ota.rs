//! Firmware slots on the ESP-IDF OTA partitions.

use core::ffi::c_void;

use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_boot_partition,
    esp_ota_get_next_update_partition, esp_ota_get_running_partition,
    esp_ota_get_state_partition, esp_ota_handle_t, esp_ota_img_states_t,
    esp_ota_mark_app_invalid_rollback_and_reboot, esp_ota_mark_app_valid_cancel_rollback,
    esp_ota_set_boot_partition, esp_ota_write, esp_partition_t, EspError, ESP_ERR_FLASH_OP_TIMEOUT,
    ESP_ERR_TIMEOUT, OTA_SIZE_UNKNOWN,
};

use crate::ota::slots::{BootState, SlotStorage, StorageError};

/// Pointer into the static partition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition(*const esp_partition_t);

// Partition table entries live in flash-mapped memory for the whole
// program run and are never written through this pointer.
unsafe impl Send for Partition {}

impl Partition {
    fn from_raw(ptr: *const esp_partition_t) -> Result<Self, StorageError> {
        if ptr.is_null() {
            Err(StorageError::Failed("partition lookup returned null".into()))
        } else {
            Ok(Self(ptr))
        }
    }

    pub fn label(&self) -> String {
        // SAFETY: non-null by construction, label is a NUL-padded array
        let label = unsafe { &(*self.0).label };
        label
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8 as char)
            .collect()
    }
}

pub struct OtaWriter {
    handle: esp_ota_handle_t,
}

fn failed(op: &str, err: EspError) -> StorageError {
    let code = err.code();
    if code == ESP_ERR_TIMEOUT as i32 || code == ESP_ERR_FLASH_OP_TIMEOUT as i32 {
        StorageError::Transient(format!("{}: {}", op, err))
    } else {
        StorageError::Failed(format!("{}: {}", op, err))
    }
}

/// The app partitions `ota_0` / `ota_1`
#[derive(Default)]
pub struct EspSlots;

impl EspSlots {
    pub fn new() -> Self {
        let slots = Self;
        if let Ok(running) = slots.running_slot() {
            log::info!("Running from partition '{}'", running.label());
        }
        slots
    }
}

impl SlotStorage for EspSlots {
    type Slot = Partition;
    type Writer = OtaWriter;

    fn running_slot(&self) -> Result<Partition, StorageError> {
        Partition::from_raw(unsafe { esp_ota_get_running_partition() })
    }

    fn boot_slot(&self) -> Result<Partition, StorageError> {
        Partition::from_raw(unsafe { esp_ota_get_boot_partition() })
    }

    fn inactive_slot(&self) -> Result<Partition, StorageError> {
        let next = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if next.is_null() {
            return Err(StorageError::NoInactiveSlot);
        }
        Ok(Partition(next))
    }

    fn begin_write(&mut self, slot: Partition) -> Result<OtaWriter, StorageError> {
        let mut handle: esp_ota_handle_t = 0;
        esp!(unsafe { esp_ota_begin(slot.0, OTA_SIZE_UNKNOWN as usize, &mut handle) })
            .map_err(|e| failed("esp_ota_begin", e))?;
        log::info!("Erased partition '{}' for writing", slot.label());
        Ok(OtaWriter { handle })
    }

    fn write(&mut self, writer: &mut OtaWriter, bytes: &[u8]) -> Result<(), StorageError> {
        esp!(unsafe { esp_ota_write(writer.handle, bytes.as_ptr() as *const c_void, bytes.len()) })
            .map_err(|e| failed("esp_ota_write", e))
    }

    fn finalize(&mut self, writer: OtaWriter) -> Result<(), StorageError> {
        // esp_ota_end releases the handle on failure as well
        esp!(unsafe { esp_ota_end(writer.handle) }).map_err(|e| failed("esp_ota_end", e))
    }

    fn abort(&mut self, writer: OtaWriter) {
        if let Err(e) = esp!(unsafe { esp_ota_abort(writer.handle) }) {
            log::warn!("esp_ota_abort: {}", e);
        }
    }

    fn set_boot_slot(&mut self, slot: Partition) -> Result<(), StorageError> {
        esp!(unsafe { esp_ota_set_boot_partition(slot.0) })
            .map_err(|e| failed("esp_ota_set_boot_partition", e))
    }

    fn boot_state(&self, slot: Partition) -> Result<BootState, StorageError> {
        let mut state: esp_ota_img_states_t = 0;
        match esp!(unsafe { esp_ota_get_state_partition(slot.0, &mut state) }) {
            Ok(()) => {}
            // Factory image or a slot without OTA metadata
            Err(e) if e.code() == esp_idf_sys::ESP_ERR_NOT_SUPPORTED as i32 => {
                return Ok(BootState::Undefined)
            }
            Err(e) if e.code() == esp_idf_sys::ESP_ERR_NOT_FOUND as i32 => {
                return Ok(BootState::Undefined)
            }
            Err(e) => return Err(failed("esp_ota_get_state_partition", e)),
        }
        Ok(match state {
            esp_idf_sys::esp_ota_img_states_t_ESP_OTA_IMG_NEW => BootState::New,
            esp_idf_sys::esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY => BootState::PendingVerify,
            esp_idf_sys::esp_ota_img_states_t_ESP_OTA_IMG_VALID => BootState::Valid,
            esp_idf_sys::esp_ota_img_states_t_ESP_OTA_IMG_INVALID
            | esp_idf_sys::esp_ota_img_states_t_ESP_OTA_IMG_ABORTED => BootState::Invalid,
            _ => BootState::Undefined,
        })
    }

    fn mark_valid(&mut self, slot: Partition) -> Result<(), StorageError> {
        let running = self.running_slot()?;
        if running != slot {
            return Err(StorageError::Failed(format!(
                "only the running partition can be confirmed, not '{}'",
                slot.label()
            )));
        }
        esp!(unsafe { esp_ota_mark_app_valid_cancel_rollback() })
            .map_err(|e| failed("esp_ota_mark_app_valid_cancel_rollback", e))
    }

    fn rollback_and_reboot(&mut self) -> Result<(), StorageError> {
        esp!(unsafe { esp_ota_mark_app_invalid_rollback_and_reboot() })
            .map_err(|e| failed("esp_ota_mark_app_invalid_rollback_and_reboot", e))
    }
}
