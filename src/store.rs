//! Persistent device state.
//!
//! Two files exist per device under the adapter's storage directory:
//! `info` holds everything that survives a restart of a bonded or
//! trusted device, `cache` holds what was merely observed (names,
//! service records, the attribute database outline) and may exist even
//! for devices that are not persistent themselves.
//!
//! Writes are whole-file rewrites; the engine coalesces rapid mutations
//! and flushes once per idle tick.

use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{Address, Result};

/// `[general]` group of the info file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct General {
    /// Remote name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Locally assigned alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Class of device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<u32>,
    /// GAP appearance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appearance: Option<u16>,
    /// Bearers the device supports: `BR/EDR`, `LE` or both.
    pub supported_technologies: Vec<String>,
    /// Identity address type.
    pub address_type: String,
    /// Preferred bearer for connecting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_bearer: Option<String>,
    /// Bearer of the last successful connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_bearer: Option<String>,
    /// The device is trusted.
    pub trusted: bool,
    /// The device is blocked.
    pub blocked: bool,
    /// The device was cable-paired.
    pub cable_pairing: bool,
    /// The device may wake the host.
    pub wake_allowed: bool,
    /// Resolved service UUIDs.
    pub services: Vec<String>,
}

/// `[device_id]` group of the info file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdGroup {
    /// Assigner of the vendor id.
    pub source: u16,
    /// Vendor id.
    pub vendor: u16,
    /// Product id.
    pub product: u16,
    /// Product version.
    pub version: u16,
}

/// `[long_term_key]` group of the info file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongTermKeyGroup {
    /// Key value in hexadecimal.
    pub key: String,
    /// Key was generated in the central role.
    pub central: bool,
    /// Encryption key size in bytes.
    pub enc_size: u8,
}

/// Signature key groups of the info file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureKeyGroup {
    /// Key value in hexadecimal.
    pub key: String,
    /// Sign counter.
    pub counter: u32,
    /// Key was exchanged over an authenticated link.
    pub authenticated: bool,
}

/// `[[set_identity_resolving_keys]]` entries of the info file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetIdentityKeyGroup {
    /// Key value in hexadecimal.
    pub key: String,
    /// Size of the coordinated set.
    pub size: u8,
    /// Rank of the device in the set.
    pub rank: u8,
    /// The key value is encrypted.
    pub encrypted: bool,
}

/// `[service_changed]` group of the info file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceChangedGroup {
    /// Client characteristic configuration on the LE bearer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ccc_le: Option<u16>,
    /// Client characteristic configuration on the BR/EDR bearer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ccc_bredr: Option<u16>,
}

/// Persistent state of one device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    /// General device state.
    pub general: General,
    /// Device ID metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceIdGroup>,
    /// Long-term key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_term_key: Option<LongTermKeyGroup>,
    /// Key signing outbound writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_signature_key: Option<SignatureKeyGroup>,
    /// Key verifying inbound signed writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_signature_key: Option<SignatureKeyGroup>,
    /// Set identity resolving keys.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub set_identity_resolving_keys: Vec<SetIdentityKeyGroup>,
    /// Service Changed subscription state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_changed: Option<ServiceChangedGroup>,
}

/// One cached SDP record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceRecordEntry {
    /// Record handle.
    pub handle: u32,
    /// Service class UUIDs.
    pub uuids: Vec<String>,
    /// Raw record bytes in hexadecimal.
    pub value: String,
}

/// One cached primary GATT service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeEntry {
    /// Service UUID.
    pub uuid: String,
    /// First attribute handle.
    pub start: u16,
    /// Last attribute handle.
    pub end: u16,
}

/// Observed state of one device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCache {
    /// Last observed remote name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Seconds since device creation when name resolution last failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_resolve_failed: Option<u64>,
    /// Cached SDP records.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub service_records: Vec<ServiceRecordEntry>,
    /// Cached primary GATT services.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<AttributeEntry>,
}

/// Per-adapter persistent storage.
///
/// Every device owns one directory named after its address, containing
/// the `info` and `cache` files.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Opens the store rooted at the adapter's storage directory.
    ///
    /// The directory is created lazily on the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn device_dir(&self, address: Address) -> PathBuf {
        self.root.join(address.to_string())
    }

    fn write(&self, path: &Path, text: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the info file of a device.
    pub fn store_info(&self, address: Address, info: &DeviceInfo) -> Result<()> {
        let path = self.device_dir(address).join("info");
        log::trace!("{address}: storing info at {}", path.display());
        self.write(&path, &toml::to_string_pretty(info)?)
    }

    /// Reads the info file of a device, `None` if it was never stored.
    pub fn load_info(&self, address: Address) -> Result<Option<DeviceInfo>> {
        match self.read(&self.device_dir(address).join("info"))? {
            Some(text) => Ok(Some(toml::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Writes the cache file of a device.
    pub fn store_cache(&self, address: Address, cache: &DeviceCache) -> Result<()> {
        let path = self.device_dir(address).join("cache");
        self.write(&path, &toml::to_string_pretty(cache)?)
    }

    /// Reads the cache file of a device.
    pub fn load_cache(&self, address: Address) -> Result<Option<DeviceCache>> {
        match self.read(&self.device_dir(address).join("cache"))? {
            Some(text) => Ok(Some(toml::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Removes everything stored for a device.
    pub fn remove_device(&self, address: Address) -> Result<()> {
        let dir = self.device_dir(address);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                log::trace!("{address}: removed stored state at {}", dir.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Addresses of all devices with a stored info file.
    pub fn list(&self) -> Result<Vec<Address>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut addresses = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(address) = entry.file_name().to_string_lossy().parse::<Address>() else {
                continue;
            };
            if entry.path().join("info").is_file() {
                addresses.push(address);
            }
        }
        addresses.sort();
        Ok(addresses)
    }
}

/// Encodes key bytes for storage.
pub(crate) fn key_to_hex(value: &[u8; 16]) -> String {
    hex::encode(value)
}

/// Decodes key bytes from storage, `None` on malformed input.
pub(crate) fn key_from_hex(text: &str) -> Option<[u8; 16]> {
    let bytes = hex::decode(text).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_store() -> Store {
        let dir = std::env::temp_dir().join(format!("bluedev-store-{}", Uuid::new_v4()));
        Store::new(dir)
    }

    fn sample_info() -> DeviceInfo {
        DeviceInfo {
            general: General {
                name: Some("Speaker".into()),
                alias: None,
                class: Some(0x240404),
                appearance: None,
                supported_technologies: vec!["BR/EDR".into(), "LE".into()],
                address_type: "public".into(),
                preferred_bearer: Some("le".into()),
                last_used_bearer: Some("br/edr".into()),
                trusted: true,
                blocked: false,
                cable_pairing: false,
                wake_allowed: true,
                services: vec!["0000110b-0000-1000-8000-00805f9b34fb".into()],
            },
            device_id: Some(DeviceIdGroup { source: 1, vendor: 0x1d6b, product: 0x246, version: 0x540 }),
            long_term_key: Some(LongTermKeyGroup {
                key: key_to_hex(&[0xab; 16]),
                central: true,
                enc_size: 16,
            }),
            local_signature_key: Some(SignatureKeyGroup {
                key: key_to_hex(&[1; 16]),
                counter: 4,
                authenticated: false,
            }),
            remote_signature_key: Some(SignatureKeyGroup {
                key: key_to_hex(&[2; 16]),
                counter: 9,
                authenticated: true,
            }),
            set_identity_resolving_keys: vec![SetIdentityKeyGroup {
                key: key_to_hex(&[3; 16]),
                size: 2,
                rank: 1,
                encrypted: false,
            }],
            service_changed: Some(ServiceChangedGroup { ccc_le: Some(2), ccc_bredr: None }),
        }
    }

    #[test]
    fn info_roundtrips() {
        let store = test_store();
        let address: Address = "AA:BB:CC:DD:EE:01".parse().unwrap();
        let info = sample_info();

        store.store_info(address, &info).unwrap();
        assert_eq!(store.load_info(address).unwrap(), Some(info));

        store.remove_device(address).unwrap();
        assert_eq!(store.load_info(address).unwrap(), None);
    }

    #[test]
    fn cache_roundtrips() {
        let store = test_store();
        let address: Address = "AA:BB:CC:DD:EE:02".parse().unwrap();
        let cache = DeviceCache {
            name: Some("Speaker".into()),
            name_resolve_failed: Some(120),
            service_records: vec![ServiceRecordEntry {
                handle: 0x10000,
                uuids: vec!["0000110b-0000-1000-8000-00805f9b34fb".into()],
                value: "35060900a55f".into(),
            }],
            attributes: vec![AttributeEntry {
                uuid: "0000180f-0000-1000-8000-00805f9b34fb".into(),
                start: 0x10,
                end: 0x1f,
            }],
        };

        store.store_cache(address, &cache).unwrap();
        assert_eq!(store.load_cache(address).unwrap(), Some(cache));
    }

    #[test]
    fn list_returns_devices_with_info() {
        let store = test_store();
        assert!(store.list().unwrap().is_empty());

        let with_info: Address = "AA:BB:CC:DD:EE:03".parse().unwrap();
        let cache_only: Address = "AA:BB:CC:DD:EE:04".parse().unwrap();
        store.store_info(with_info, &sample_info()).unwrap();
        store.store_cache(cache_only, &DeviceCache::default()).unwrap();

        assert_eq!(store.list().unwrap(), vec![with_info]);
    }

    #[test]
    fn key_hex_roundtrips() {
        let key = [0x5a; 16];
        assert_eq!(key_from_hex(&key_to_hex(&key)), Some(key));
        assert_eq!(key_from_hex("zz"), None);
        assert_eq!(key_from_hex("0011"), None);
    }
}
