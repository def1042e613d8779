//! Persistent configuration boundary.
//!
//! The hub keeps a handful of settings across reboots: which GPIO drives the
//! RF transmitter, whether keep-alive is enabled, and the OTA updater state.
//! Storage and its encoding belong to the platform; the core only sees
//! [`ConfigStore`], whose getters and setters are each atomic.

use crate::ota::{OtaUpdateConfig, OtaUpdateStep};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Errors raised by a [`ConfigStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The backing storage refused the write.
    #[error("config storage is read-only")]
    ReadOnly,
    /// The backing storage could not be read or written.
    #[error("config storage failed")]
    Storage,
}

/// RF transmitter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RfConfig {
    /// GPIO driving the transmitter, `None` when no usable pin is known.
    pub tx_pin: Option<u8>,
    /// Whether idle shockers receive keep-alive pulses.
    pub keep_alive_enabled: bool,
}

impl Default for RfConfig {
    fn default() -> Self {
        Self {
            tx_pin: Some(crate::consts::DEFAULT_RF_TX_PIN),
            keep_alive_enabled: true,
        }
    }
}

/// Atomic access to the persisted settings the core reads and writes.
pub trait ConfigStore: Send + Sync {
    /// Current RF settings.
    fn rf_config(&self) -> Result<RfConfig, ConfigError>;
    /// Persists the transmitter pin.
    fn set_rf_tx_pin(&self, pin: Option<u8>) -> Result<(), ConfigError>;
    /// Persists the keep-alive switch.
    fn set_keep_alive_enabled(&self, enabled: bool) -> Result<(), ConfigError>;
    /// Current OTA updater settings and state.
    fn ota_update_config(&self) -> Result<OtaUpdateConfig, ConfigError>;
    /// Persists the id of the update being installed.
    fn set_ota_update_id(&self, id: u32) -> Result<(), ConfigError>;
    /// Persists the install/boot step.
    fn set_ota_update_step(&self, step: OtaUpdateStep) -> Result<(), ConfigError>;
}

#[derive(Debug, Default, Clone)]
struct StoredConfig {
    rf: RfConfig,
    ota: OtaUpdateConfig,
}

/// In-process [`ConfigStore`].
///
/// Writes can be refused with [`MemoryConfigStore::set_read_only`], which
/// stands in for a failing flash partition.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    inner: Mutex<StoredConfig>,
    read_only: AtomicBool,
}

impl MemoryConfigStore {
    /// A store seeded with the given settings.
    pub fn new(rf: RfConfig, ota: OtaUpdateConfig) -> Self {
        Self {
            inner: Mutex::new(StoredConfig { rf, ota }),
            read_only: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent write fail with [`ConfigError::ReadOnly`].
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn write(&self, f: impl FnOnce(&mut StoredConfig)) -> Result<(), ConfigError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(ConfigError::ReadOnly);
        }
        f(&mut self.inner.lock());
        Ok(())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn rf_config(&self) -> Result<RfConfig, ConfigError> {
        Ok(self.inner.lock().rf)
    }

    fn set_rf_tx_pin(&self, pin: Option<u8>) -> Result<(), ConfigError> {
        self.write(|c| c.rf.tx_pin = pin)
    }

    fn set_keep_alive_enabled(&self, enabled: bool) -> Result<(), ConfigError> {
        self.write(|c| c.rf.keep_alive_enabled = enabled)
    }

    fn ota_update_config(&self) -> Result<OtaUpdateConfig, ConfigError> {
        Ok(self.inner.lock().ota.clone())
    }

    fn set_ota_update_id(&self, id: u32) -> Result<(), ConfigError> {
        self.write(|c| c.ota.update_id = id)
    }

    fn set_ota_update_step(&self, step: OtaUpdateStep) -> Result<(), ConfigError> {
        self.write(|c| c.ota.update_step = step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_default_pin_with_keep_alive() {
        let store = MemoryConfigStore::default();
        let rf = store.rf_config().unwrap();

        assert_eq!(rf.tx_pin, Some(crate::consts::DEFAULT_RF_TX_PIN));
        assert!(rf.keep_alive_enabled);
        assert_eq!(store.ota_update_config().unwrap().update_step, OtaUpdateStep::None);
    }

    #[test]
    fn test_read_only_store_rejects_writes() {
        let store = MemoryConfigStore::default();
        store.set_rf_tx_pin(Some(4)).unwrap();
        store.set_read_only(true);

        assert_eq!(store.set_rf_tx_pin(Some(5)), Err(ConfigError::ReadOnly));
        assert_eq!(
            store.set_ota_update_step(OtaUpdateStep::Updating),
            Err(ConfigError::ReadOnly)
        );
        assert_eq!(store.rf_config().unwrap().tx_pin, Some(4));
    }
}
