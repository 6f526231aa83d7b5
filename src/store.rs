//! Durable key/value settings.
//!
//! The firmware keeps everything it must survive a reboot with in one
//! namespace of the configuration store: station credentials, light
//! settings, the broker URI and the supervisor configuration blob. The
//! [`ConfigStore`] trait is the collaborator contract; NVS implements it on
//! the device and [`MemoryStore`] on the host.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::lights::{LightInfo, LIGHT_COUNT};
use crate::network::credentials::NetworkCredentials;

/// Namespace shared by every key below
pub const NAMESPACE: &str = "esp_saved_data";

pub mod keys {
    pub const WIFI_SSID: &str = "wifi_ssid";
    pub const WIFI_PASS: &str = "wifi_pass";
    pub const MQTT_URI: &str = "mqtt_uri";
    pub const SUPERVISOR: &str = "supervisor";

    pub const LIGHT_NAME: [&str; 4] = ["l0_name", "l1_name", "l2_name", "l3_name"];
    pub const LIGHT_ENABLED: [&str; 4] = ["l0_en", "l1_en", "l2_en", "l3_en"];
}

/// Longest broker URI the store accepts
pub const MQTT_URI_MAX_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    Encoding(String),
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "key not found"),
            StoreError::Encoding(msg) => write!(f, "stored value malformed: {}", msg),
            StoreError::Backend(msg) => write!(f, "store backend error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Namespaced key/value persistence. Writes become durable on `commit`.
pub trait ConfigStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<Mutex<dyn ConfigStore + Send>>;

pub fn shared<S: ConfigStore + Send + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Runs `f` with the store locked. A poisoned lock is reported as a backend
/// error rather than propagated as a panic.
pub fn with_store<T>(
    store: &SharedStore,
    f: impl FnOnce(&mut (dyn ConfigStore + Send)) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut guard = store
        .lock()
        .map_err(|e| StoreError::Backend(format!("store lock poisoned: {}", e)))?;
    f(&mut *guard)
}

/// In-memory store with NVS-like staging: `set` is visible immediately,
/// `commit` makes it survive [`MemoryStore::reopen`].
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    staged: BTreeMap<String, Vec<u8>>,
    durable: BTreeMap<String, Vec<u8>>,
    read_only: bool,
    commits: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// What a fresh boot would see: only committed values.
    pub fn reopen(&self) -> Self {
        Self {
            staged: BTreeMap::new(),
            durable: self.durable.clone(),
            read_only: false,
            commits: 0,
        }
    }

    /// Makes every `set`/`commit` fail, for exercising error paths.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.staged
            .get(key)
            .or_else(|| self.durable.get(key))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::Backend("store is read-only".into()));
        }
        self.staged.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::Backend("store is read-only".into()));
        }
        let staged = std::mem::take(&mut self.staged);
        self.durable.extend(staged);
        self.commits += 1;
        Ok(())
    }
}

fn get_optional(store: &dyn ConfigStore, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    match store.get(key) {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

fn get_string(store: &dyn ConfigStore, key: &str) -> Result<Option<String>, StoreError> {
    get_optional(store, key)?
        .map(|bytes| {
            // NVS strings written by older firmware carry a trailing NUL
            let bytes = bytes.strip_suffix(b"\0").unwrap_or(&bytes[..]).to_vec();
            String::from_utf8(bytes).map_err(|e| StoreError::Encoding(format!("{}: {}", key, e)))
        })
        .transpose()
}

/// Stored station credentials, `None` when no SSID has been provisioned.
/// Malformed stored values are logged and treated as absent.
pub fn load_credentials(store: &dyn ConfigStore) -> Result<Option<NetworkCredentials>, StoreError> {
    let Some(ssid) = get_string(store, keys::WIFI_SSID)? else {
        log::info!("No station SSID stored");
        return Ok(None);
    };
    if ssid.is_empty() {
        return Ok(None);
    }
    let passphrase = get_string(store, keys::WIFI_PASS)?.unwrap_or_default();

    match NetworkCredentials::new(&ssid, &passphrase) {
        Ok(credentials) => {
            log::info!("Loaded station credentials for SSID '{}'", credentials.ssid());
            Ok(Some(credentials))
        }
        Err(e) => {
            log::warn!("Ignoring stored credentials: {}", e);
            Ok(None)
        }
    }
}

/// Replaces both credential keys and commits them as one unit.
pub fn save_credentials(
    store: &mut dyn ConfigStore,
    credentials: &NetworkCredentials,
) -> Result<(), StoreError> {
    store.set(keys::WIFI_SSID, credentials.ssid().as_bytes())?;
    store.set(keys::WIFI_PASS, credentials.passphrase().as_bytes())?;
    store.commit()?;
    log::info!("Station credentials saved for SSID '{}'", credentials.ssid());
    Ok(())
}

pub fn load_lights(store: &dyn ConfigStore) -> Result<[LightInfo; LIGHT_COUNT], StoreError> {
    let mut lights: [LightInfo; LIGHT_COUNT] = Default::default();
    for (i, light) in lights.iter_mut().enumerate() {
        if let Some(name) = get_string(store, keys::LIGHT_NAME[i])? {
            light.name = name;
        }
        if let Some(enabled) = get_optional(store, keys::LIGHT_ENABLED[i])? {
            light.enabled = enabled.first().copied().unwrap_or(0) != 0;
        }
    }
    Ok(lights)
}

/// Persists names and enabled flags. Levels are runtime-only.
pub fn save_lights(store: &mut dyn ConfigStore, lights: &[LightInfo]) -> Result<(), StoreError> {
    for (i, light) in lights.iter().take(LIGHT_COUNT).enumerate() {
        store.set(keys::LIGHT_NAME[i], light.name.as_bytes())?;
        store.set(keys::LIGHT_ENABLED[i], &[u8::from(light.enabled)])?;
    }
    store.commit()
}

pub fn load_broker_uri(store: &dyn ConfigStore) -> Result<Option<String>, StoreError> {
    Ok(get_string(store, keys::MQTT_URI)?.filter(|uri| !uri.is_empty()))
}

pub fn save_broker_uri(store: &mut dyn ConfigStore, uri: &str) -> Result<(), StoreError> {
    store.set(keys::MQTT_URI, uri.as_bytes())?;
    store.commit()
}

pub fn load_json<T: DeserializeOwned>(
    store: &dyn ConfigStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    get_optional(store, key)?
        .map(|bytes| {
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Encoding(format!("{}: {}", key, e)))
        })
        .transpose()
}

pub fn save_json<T: Serialize>(
    store: &mut dyn ConfigStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_vec(value).map_err(|e| StoreError::Encoding(e.to_string()))?;
    store.set(key, &json)?;
    store.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncommitted_values_do_not_survive_reopen() {
        let mut store = MemoryStore::new();
        store.set("a", b"1").unwrap();
        assert_eq!(store.get("a").unwrap(), b"1");
        assert_eq!(store.reopen().get("a"), Err(StoreError::NotFound));

        store.commit().unwrap();
        assert_eq!(store.reopen().get("a").unwrap(), b"1");
    }

    #[test]
    fn credentials_round_trip_through_reopen() {
        let mut store = MemoryStore::new();
        let creds = NetworkCredentials::new("HomeNet", "applesauce").unwrap();
        save_credentials(&mut store, &creds).unwrap();

        let reloaded = load_credentials(&store.reopen()).unwrap();
        assert_eq!(reloaded, Some(creds));
    }

    #[test]
    fn missing_or_empty_ssid_means_no_credentials() {
        let mut store = MemoryStore::new();
        assert_eq!(load_credentials(&store).unwrap(), None);

        store.set(keys::WIFI_SSID, b"").unwrap();
        assert_eq!(load_credentials(&store).unwrap(), None);
    }

    #[test]
    fn oversized_stored_ssid_is_ignored() {
        let mut store = MemoryStore::new();
        store.set(keys::WIFI_SSID, "x".repeat(40).as_bytes()).unwrap();
        assert_eq!(load_credentials(&store).unwrap(), None);
    }

    #[test]
    fn legacy_nul_terminated_strings_are_accepted() {
        let mut store = MemoryStore::new();
        store.set(keys::MQTT_URI, b"mqtt://broker.local\0").unwrap();
        assert_eq!(
            load_broker_uri(&store).unwrap().as_deref(),
            Some("mqtt://broker.local")
        );
    }

    #[test]
    fn lights_persist_names_and_enabled_flags() {
        let mut store = MemoryStore::new();
        let mut lights: [LightInfo; LIGHT_COUNT] = Default::default();
        lights[0].name = "porch".into();
        lights[0].enabled = true;
        lights[0].level = 200;
        lights[3].name = "shed".into();
        save_lights(&mut store, &lights).unwrap();

        let loaded = load_lights(&store.reopen()).unwrap();
        assert_eq!(loaded[0].name, "porch");
        assert!(loaded[0].enabled);
        assert_eq!(loaded[0].level, 0);
        assert_eq!(loaded[3].name, "shed");
        assert!(!loaded[3].enabled);
    }

    #[test]
    fn read_only_store_reports_backend_errors() {
        let mut store = MemoryStore::new();
        store.set_read_only(true);
        let creds = NetworkCredentials::new("a", "").unwrap();
        assert!(matches!(
            save_credentials(&mut store, &creds),
            Err(StoreError::Backend(_))
        ));
    }
}
