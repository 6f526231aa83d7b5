//! ESP-IDF bindings for the collaborator traits.

pub mod http;
pub mod ledc;
pub mod mdns;
pub mod nvs;
pub mod ota;
pub mod restart;
pub mod wifi;
