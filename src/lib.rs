//! Light node firmware core.
//!
//! Everything outside [`platform`] is hardware-independent and is exercised
//! by the host test suite. The `platform` module binds the collaborator
//! traits to ESP-IDF and only builds for `target_os = "espidf"`.

pub mod config;
pub mod http;
pub mod lights;
pub mod logging;
pub mod network;
pub mod ota;
#[cfg(not(target_os = "espidf"))]
pub mod sim;
pub mod store;
pub mod templates;
pub mod version;

#[cfg(target_os = "espidf")]
pub mod platform;
