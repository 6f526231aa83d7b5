// HTML templates for the web server

/// Control page served at `/`
pub const INDEX_PAGE: &str = include_str!("index.html");

/// Firmware upload page served at `/ota`
pub const OTA_PAGE: &str = include_str!("ota.html");
