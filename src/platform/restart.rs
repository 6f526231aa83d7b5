use crate::ota::restart::Restarter;

/// Software reset through `esp_restart`
pub struct EspRestarter;

impl Restarter for EspRestarter {
    fn restart(&self) {
        unsafe { esp_idf_sys::esp_restart() };
    }
}
