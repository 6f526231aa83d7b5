use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::network::credentials::NetworkCredentials;
use crate::network::link::AccessPointParams;
use crate::store::{self, keys, SharedStore};

const CONNECT_TIMEOUT_MAX_MS: u64 = 300_000;
const FAULT_BACKOFF_CEILING_SECS: u64 = 3600;
const BOOT_GRACE_MAX_SECS: u64 = 3600;

/// Tunables of the connectivity supervisor, the update path and the device
/// identity. Persisted as one JSON blob; missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
    pub ap_channel: u8,
    pub ap_max_clients: u16,
    pub boot_grace_seconds: u64,
    pub ap_probe_interval_seconds: u64,
    pub fault_backoff_max_secs: u64,
    pub ap: AccessPointConfig,
    pub ota: OtaConfig,
    pub identity: DeviceIdentity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub restart_delay_ms: u64,
    pub recv_timeout_retries: u32,
    pub chunk_size: usize,
    pub auth_user: String,
    pub auth_password: String,
    pub auth_realm: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub hostname: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            connect_timeout_ms: 15_000,
            ap_channel: 1,
            ap_max_clients: 4,
            boot_grace_seconds: 30,
            ap_probe_interval_seconds: 60,
            fault_backoff_max_secs: 60,
            ap: AccessPointConfig::default(),
            ota: OtaConfig::default(),
            identity: DeviceIdentity::default(),
        }
    }
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "esp_wifi_network".to_string(),
            password: "password".to_string(),
        }
    }
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 2000,
            recv_timeout_retries: 20,
            chunk_size: 1024,
            auth_user: "admin".to_string(),
            auth_password: "admin".to_string(),
            auth_realm: "Hello".to_string(),
        }
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            hostname: "my-esp32".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ap_probe_interval(&self) -> Duration {
        Duration::from_secs(self.ap_probe_interval_seconds)
    }

    pub fn boot_grace(&self) -> Duration {
        Duration::from_secs(self.boot_grace_seconds)
    }

    pub fn fault_backoff_max(&self) -> Duration {
        Duration::from_secs(self.fault_backoff_max_secs)
    }

    pub fn access_point(&self) -> AccessPointParams {
        AccessPointParams {
            ssid: self.ap.ssid.clone(),
            password: self.ap.password.clone(),
            channel: self.ap_channel,
            max_clients: self.ap_max_clients,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=CONNECT_TIMEOUT_MAX_MS).contains(&self.connect_timeout_ms) {
            bail!("connect_timeout_ms must be 1 to {}", CONNECT_TIMEOUT_MAX_MS);
        }
        if self.ap_probe_interval_seconds == 0 {
            bail!("ap_probe_interval_seconds must be non-zero");
        }
        if !(1..=BOOT_GRACE_MAX_SECS).contains(&self.boot_grace_seconds) {
            bail!("boot_grace_seconds must be 1 to {}", BOOT_GRACE_MAX_SECS);
        }
        if !(1..=FAULT_BACKOFF_CEILING_SECS).contains(&self.fault_backoff_max_secs) {
            bail!("fault_backoff_max_secs must be 1 to {}", FAULT_BACKOFF_CEILING_SECS);
        }
        if !(1..=13).contains(&self.ap_channel) {
            bail!("AP channel {} outside 1..=13", self.ap_channel);
        }
        if !(1..=10).contains(&self.ap_max_clients) {
            bail!("AP max clients {} outside 1..=10", self.ap_max_clients);
        }
        if self.ap.ssid.is_empty() || self.ap.ssid.len() > 32 {
            bail!("AP SSID must be 1 to 32 bytes");
        }
        // WPA2 needs 8..=63; empty means an open AP
        let pass_len = self.ap.password.len();
        if (1..8).contains(&pass_len) || pass_len > 63 {
            bail!("AP password must be empty or 8 to 63 bytes");
        }
        if self.ota.chunk_size == 0 {
            bail!("OTA chunk size must be non-zero");
        }
        if self.identity.hostname.is_empty() {
            bail!("hostname cannot be empty");
        }
        Ok(())
    }

    pub fn save(&self, store: &SharedStore) -> Result<()> {
        store::with_store(store, |s| store::save_json(s, keys::SUPERVISOR, self))?;
        log::info!("Supervisor configuration saved");
        Ok(())
    }
}

/// Loads the stored configuration. Missing, unparsable or invalid blobs
/// fall back to defaults, which are written back for next boot.
pub fn load_or_default(store: &SharedStore) -> SupervisorConfig {
    let loaded = store::with_store(store, |s| store::load_json::<SupervisorConfig>(s, keys::SUPERVISOR));

    match loaded {
        Ok(Some(config)) => match config.validate() {
            Ok(()) => {
                log::info!("Loaded supervisor configuration from store");
                return config;
            }
            Err(e) => log::warn!("Stored configuration invalid: {}, using defaults", e),
        },
        Ok(None) => log::info!("No stored configuration, using defaults"),
        Err(e) => log::warn!("Failed to load configuration: {}, using defaults", e),
    }

    let config = SupervisorConfig::default();
    if let Err(e) = config.save(store) {
        log::warn!("Failed to save default configuration: {:?}", e);
    }
    config
}

/// Station credentials compiled in from `wifi_config.h`, if any
pub fn build_time_credentials() -> Option<NetworkCredentials> {
    let ssid = env!("WIFI_SSID");
    let password = env!("WIFI_PASSWORD");
    if ssid.is_empty() {
        return None;
    }
    match NetworkCredentials::new(ssid, password) {
        Ok(creds) => Some(creds),
        Err(e) => {
            log::warn!("Ignoring build-time credentials: {}", e);
            None
        }
    }
}

/// Writes `seed` to the store when no credentials are provisioned yet.
/// Returns whether anything was written.
pub fn seed_credentials(store: &SharedStore, seed: Option<&NetworkCredentials>) -> Result<bool> {
    let Some(seed) = seed else {
        return Ok(false);
    };
    let seeded = store::with_store(store, |s| {
        if store::load_credentials(s)?.is_some() {
            return Ok(false);
        }
        store::save_credentials(s, seed)?;
        Ok(true)
    })?;
    if seeded {
        log::info!("Seeded station credentials for SSID '{}'", seed.ssid());
    }
    Ok(seeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConfigStore, MemoryStore};

    #[test]
    fn defaults_are_valid() {
        let config = SupervisorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.access_point().max_clients, 4);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = SupervisorConfig::default();
        config.ap_channel = 14;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.ap_probe_interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.ap.password = "short".into();
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.ap.password.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_caps_timing_values() {
        let mut config = SupervisorConfig::default();
        config.connect_timeout_ms = 300_000;
        config.fault_backoff_max_secs = 3600;
        assert!(config.validate().is_ok());

        config.connect_timeout_ms = u64::MAX - 1;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.fault_backoff_max_secs = 3601;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.boot_grace_seconds = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn stored_huge_backoff_is_replaced_by_defaults() {
        let mut backing = MemoryStore::new();
        let blob = format!(r#"{{"fault_backoff_max_secs": {}}}"#, u64::MAX);
        backing.set(keys::SUPERVISOR, blob.as_bytes()).unwrap();
        assert_eq!(load_or_default(&store::shared(backing)), SupervisorConfig::default());
    }

    #[test]
    fn missing_config_is_defaulted_and_written_back() {
        let store = store::shared(MemoryStore::new());
        let config = load_or_default(&store);
        assert_eq!(config, SupervisorConfig::default());

        let stored = store::with_store(&store, |s| s.get(keys::SUPERVISOR)).unwrap();
        assert!(!stored.is_empty());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let mut backing = MemoryStore::new();
        backing
            .set(keys::SUPERVISOR, br#"{"max_retries": 3, "ap": {"ssid": "setup"}}"#)
            .unwrap();
        let store = store::shared(backing);

        let config = load_or_default(&store);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.ap.ssid, "setup");
        assert_eq!(config.ap.password, "password");
        assert_eq!(config.ota.restart_delay_ms, 2000);
    }

    #[test]
    fn invalid_or_garbage_config_falls_back() {
        let mut backing = MemoryStore::new();
        backing.set(keys::SUPERVISOR, br#"{"ap_channel": 99}"#).unwrap();
        assert_eq!(load_or_default(&store::shared(backing)), SupervisorConfig::default());

        let mut backing = MemoryStore::new();
        backing.set(keys::SUPERVISOR, b"not json").unwrap();
        assert_eq!(load_or_default(&store::shared(backing)), SupervisorConfig::default());
    }

    #[test]
    fn seeding_never_overwrites_provisioned_credentials() {
        let store = store::shared(MemoryStore::new());
        let first = NetworkCredentials::new("first", "").unwrap();
        let second = NetworkCredentials::new("second", "").unwrap();

        assert!(seed_credentials(&store, Some(&first)).unwrap());
        assert!(!seed_credentials(&store, Some(&second)).unwrap());
        assert!(!seed_credentials(&store, None).unwrap());

        let loaded = store::with_store(&store, |s| store::load_credentials(s)).unwrap();
        assert_eq!(loaded, Some(first));
    }
}
