use std::collections::BTreeMap;

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

use crate::store::{ConfigStore, StoreError, NAMESPACE};

/// Largest value read back from NVS
const MAX_VALUE_LEN: usize = 1024;

/// NVS-backed configuration store. Every value is kept as a blob; writes
/// are staged in RAM and reach flash on `commit`.
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
    pending: BTreeMap<String, Vec<u8>>,
}

impl NvsStore {
    pub fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NAMESPACE, true)?;
        log::info!("NVS namespace '{}' opened", NAMESPACE);
        Ok(Self {
            nvs,
            pending: BTreeMap::new(),
        })
    }
}

impl ConfigStore for NvsStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        if let Some(value) = self.pending.get(key) {
            return Ok(value.clone());
        }
        let mut buf = vec![0u8; MAX_VALUE_LEN];
        match self.nvs.get_blob(key, &mut buf) {
            Ok(Some(data)) => Ok(data.to_vec()),
            Ok(None) => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Backend(format!("read '{}': {}", key, e))),
        }
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if value.len() > MAX_VALUE_LEN {
            return Err(StoreError::Encoding(format!(
                "'{}' is {} bytes, max {}",
                key,
                value.len(),
                MAX_VALUE_LEN
            )));
        }
        self.pending.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        while let Some((key, value)) = self.pending.pop_first() {
            if let Err(e) = self.nvs.set_blob(&key, &value) {
                let err = StoreError::Backend(format!("write '{}': {}", key, e));
                self.pending.insert(key, value);
                return Err(err);
            }
        }
        Ok(())
    }
}
