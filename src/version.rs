// Centralized version information

// Firmware version reported on the status endpoint and in the boot banner
pub const FIRMWARE_VERSION: &str = "v0.3.2-rust";

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Full version string including Cargo version
pub fn full_version() -> String {
    format!("{} ({})", FIRMWARE_VERSION, CARGO_VERSION)
}
