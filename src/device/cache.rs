//! Advertising and EIR cache.
//!
//! Merges everything the controller reports about a device outside of a
//! connection: EIR from inquiry, advertising data from scanning and the
//! odds and ends SDP delivers. The merge rules decide which observable
//! properties actually changed, so the controller emits only real
//! changes.

use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::event::AdvReport;

/// Transmit power sentinel meaning "not observed".
pub const TX_POWER_UNKNOWN: i8 = 127;

/// Minimum RSSI movement that is worth a property change.
const RSSI_DELTA: i16 = 8;

/// Observable fields of the cache that a merge can change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CacheField {
    /// Remote name.
    Name,
    /// Class of device.
    Class,
    /// GAP appearance.
    Appearance,
    /// Transmit power.
    TxPower,
    /// Signal strength.
    Rssi,
    /// Advertising data flags.
    Flags,
    /// UUIDs observed in advertising or EIR.
    EirUuids,
    /// Manufacturer specific data.
    ManufacturerData,
    /// Service data.
    ServiceData,
    /// Raw advertising data records.
    AdvertisingData,
}

/// Cached advertising and EIR state of a device.
#[derive(Clone, Debug, Default)]
pub struct AdvCache {
    /// Last non-empty remote name.
    pub name: Option<String>,
    /// Class of device.
    pub class: Option<u32>,
    /// GAP appearance. Set once; a zero never clears it.
    pub appearance: Option<u16>,
    /// Advertised transmit power.
    pub tx_power: Option<i16>,
    /// Last reported signal strength.
    pub rssi: Option<i16>,
    /// Advertising data flags.
    pub flags: Vec<u8>,
    /// UUIDs observed in advertising or EIR, distinct from resolved ones.
    pub eir_uuids: BTreeSet<Uuid>,
    /// Manufacturer specific data keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Raw advertising data records keyed by AD type.
    pub advertising_data: HashMap<u8, Vec<u8>>,
}

impl AdvCache {
    /// Merges a report into the cache and returns the fields whose
    /// observable value changed.
    pub fn merge(&mut self, report: &AdvReport) -> Vec<CacheField> {
        let mut changed = Vec::new();

        if let Some(name) = &report.name {
            if !name.is_empty() && self.name.as_deref() != Some(name.as_str()) {
                self.name = Some(name.clone());
                changed.push(CacheField::Name);
            }
        }

        if let Some(class) = report.class {
            if self.class != Some(class) {
                self.class = Some(class);
                changed.push(CacheField::Class);
            }
        }

        if let Some(appearance) = report.appearance {
            if appearance != 0 && self.appearance.is_none() {
                self.appearance = Some(appearance);
                changed.push(CacheField::Appearance);
            }
        }

        if report.tx_power != TX_POWER_UNKNOWN {
            let tx_power = i16::from(report.tx_power);
            if self.tx_power != Some(tx_power) {
                self.tx_power = Some(tx_power);
                changed.push(CacheField::TxPower);
            }
        }

        if report.rssi != 0 {
            let old = self.rssi;
            self.rssi = Some(report.rssi);
            match old {
                None | Some(0) => changed.push(CacheField::Rssi),
                Some(old) if (report.rssi - old).abs() >= RSSI_DELTA => {
                    changed.push(CacheField::Rssi)
                }
                Some(_) => {}
            }
        }

        if !report.flags.is_empty() && self.flags != report.flags {
            self.flags = report.flags.clone();
            changed.push(CacheField::Flags);
        }

        let uuids_before = self.eir_uuids.len();
        self.eir_uuids.extend(report.uuids.iter().copied());
        if self.eir_uuids.len() != uuids_before {
            changed.push(CacheField::EirUuids);
        }

        if merge_map(&mut self.manufacturer_data, &report.manufacturer_data, report.replace_data) {
            changed.push(CacheField::ManufacturerData);
        }
        if merge_map(&mut self.service_data, &report.service_data, report.replace_data) {
            changed.push(CacheField::ServiceData);
        }
        if merge_map(&mut self.advertising_data, &report.data, report.replace_data) {
            changed.push(CacheField::AdvertisingData);
        }

        changed
    }

    /// Stores a name obtained from remote name resolution.
    ///
    /// Returns `true` if the name changed.
    pub fn set_name(&mut self, name: &str) -> bool {
        if name.is_empty() || self.name.as_deref() == Some(name) {
            return false;
        }
        self.name = Some(name.to_string());
        true
    }
}

fn merge_map<K>(
    cache: &mut HashMap<K, Vec<u8>>, report: &HashMap<K, Vec<u8>>, replace: bool,
) -> bool
where
    K: std::hash::Hash + Eq + Clone,
{
    if replace {
        if !report.is_empty() && cache != report {
            *cache = report.clone();
            return true;
        }
        return false;
    }
    let mut changed = false;
    for (key, value) in report {
        if cache.get(key) != Some(value) {
            cache.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid_ext::ids;

    #[test]
    fn last_non_empty_name_wins() {
        let mut cache = AdvCache::default();
        let changed = cache.merge(&AdvReport { name: Some("Speaker".into()), ..Default::default() });
        assert!(changed.contains(&CacheField::Name));

        let changed = cache.merge(&AdvReport { name: Some(String::new()), ..Default::default() });
        assert!(!changed.contains(&CacheField::Name));
        assert_eq!(cache.name.as_deref(), Some("Speaker"));

        let changed = cache.merge(&AdvReport { name: Some("Speaker Pro".into()), ..Default::default() });
        assert!(changed.contains(&CacheField::Name));
        assert_eq!(cache.name.as_deref(), Some("Speaker Pro"));
    }

    #[test]
    fn appearance_is_set_once_and_ignores_zero() {
        let mut cache = AdvCache::default();
        assert!(!cache.merge(&AdvReport { appearance: Some(0), ..Default::default() })
            .contains(&CacheField::Appearance));

        assert!(cache.merge(&AdvReport { appearance: Some(0x03c1), ..Default::default() })
            .contains(&CacheField::Appearance));
        assert!(!cache.merge(&AdvReport { appearance: Some(0x03c2), ..Default::default() })
            .contains(&CacheField::Appearance));
        assert_eq!(cache.appearance, Some(0x03c1));
    }

    #[test]
    fn tx_power_sentinel_is_unknown() {
        let mut cache = AdvCache::default();
        assert!(cache.merge(&AdvReport::default()).is_empty());
        assert_eq!(cache.tx_power, None);

        assert!(cache.merge(&AdvReport { tx_power: -8, ..Default::default() })
            .contains(&CacheField::TxPower));
        assert_eq!(cache.tx_power, Some(-8));
    }

    #[test]
    fn rssi_changes_need_a_minimum_delta() {
        let mut cache = AdvCache::default();
        assert!(cache.merge(&AdvReport { rssi: -60, ..Default::default() })
            .contains(&CacheField::Rssi));
        // moves by less than the threshold, still stored
        assert!(!cache.merge(&AdvReport { rssi: -64, ..Default::default() })
            .contains(&CacheField::Rssi));
        assert_eq!(cache.rssi, Some(-64));
        assert!(cache.merge(&AdvReport { rssi: -72, ..Default::default() })
            .contains(&CacheField::Rssi));
    }

    #[test]
    fn uuids_are_a_union() {
        let mut cache = AdvCache::default();
        assert!(cache.merge(&AdvReport { uuids: vec![ids::AUDIO_SINK], ..Default::default() })
            .contains(&CacheField::EirUuids));
        assert!(!cache.merge(&AdvReport { uuids: vec![ids::AUDIO_SINK], ..Default::default() })
            .contains(&CacheField::EirUuids));
        assert!(cache.merge(&AdvReport { uuids: vec![ids::AUDIO_SOURCE], ..Default::default() })
            .contains(&CacheField::EirUuids));
        assert_eq!(cache.eir_uuids.len(), 2);
    }

    #[test]
    fn duplicate_flag_replaces_data_records() {
        let mut cache = AdvCache::default();
        let mut first = HashMap::new();
        first.insert(0x004c_u16, vec![1, 2]);
        cache.merge(&AdvReport { manufacturer_data: first, ..Default::default() });

        let mut second = HashMap::new();
        second.insert(0x0075_u16, vec![3]);
        let changed = cache.merge(&AdvReport {
            manufacturer_data: second.clone(),
            replace_data: false,
            ..Default::default()
        });
        assert!(changed.contains(&CacheField::ManufacturerData));
        assert_eq!(cache.manufacturer_data.len(), 2);

        let changed = cache.merge(&AdvReport {
            manufacturer_data: second.clone(),
            replace_data: true,
            ..Default::default()
        });
        assert!(changed.contains(&CacheField::ManufacturerData));
        assert_eq!(cache.manufacturer_data, second);
    }
}
