//! Persisted device snapshots.
//!
//! A snapshot captures everything needed to impersonate a device without
//! touching it again: the advertisement and scan response (as AD type →
//! value maps), and the service tree with upstream handles, properties
//! and last known values. Snapshots are JSON documents written with
//! `--devicestorepath` and loaded with `--deviceloadpath`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adv::{
    AdValue, AdvRecord, AD_FLAGS, AD_MANUFACTURER, AD_NAME_COMPLETE, AD_NAME_SHORT,
    AD_SERVICE_DATA16, AD_TX_POWER, AD_UUIDS128_COMPLETE, AD_UUIDS128_INCOMPLETE,
    AD_UUIDS16_COMPLETE, AD_UUIDS16_INCOMPLETE, DataMap,
};
use crate::api::bleuuid::{parse_uuid, BleUuid};
use crate::api::{AddressType, BDAddr, CharPropFlags};
use crate::gatt::{AttributeTree, CharacteristicDef, ServiceDef};
use crate::{Error, Result};

/// One AD type's value in the snapshot. The concrete shape depends on the
/// AD type; `serde(untagged)` picks the first matching variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdEntry {
    /// Flags or Tx power.
    Number(i64),
    /// Local names.
    Text(String),
    /// Service UUID lists, short or full form.
    Uuids(Vec<String>),
    /// Service data or manufacturer data, keyed by hex identifier.
    Map(BTreeMap<String, Vec<u8>>),
    /// Unknown AD types with several fields.
    Blocks(Vec<Vec<u8>>),
    /// Unknown AD types with a single field.
    Bytes(Vec<u8>),
}

/// AD type → value section (`advertisement` / `scanresponse`).
pub type AdSection = BTreeMap<u8, AdEntry>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The handle the real device uses for this characteristic's value.
    #[serde(default)]
    pub handle: u16,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    /// Optional write length constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxlen: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub characteristics: BTreeMap<Uuid, CharacteristicConfig>,
}

/// The snapshot document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectto: Option<BDAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addrtype: Option<AddressType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub advertisement: AdSection,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scanresponse: AdSection,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<Uuid, ServiceConfig>,
}

impl DeviceConfig {
    pub fn load(path: &Path) -> Result<DeviceConfig> {
        let file = File::open(path).map_err(|err| {
            Error::Configuration(format!("cannot open {}: {}", path.display(), err))
        })?;
        let config: DeviceConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| {
                Error::Configuration(format!("cannot parse {}: {}", path.display(), err))
            })?;
        info!("loaded device snapshot from {}", path.display());
        Ok(config)
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|err| {
            Error::Configuration(format!("cannot create {}: {}", path.display(), err))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(|err| {
            Error::Configuration(format!("cannot write {}: {}", path.display(), err))
        })?;
        info!("stored device snapshot to {}", path.display());
        Ok(())
    }

    pub fn advertisement_record(&self) -> AdvRecord {
        section_to_record(&self.advertisement)
    }

    pub fn scan_response_record(&self) -> AdvRecord {
        section_to_record(&self.scanresponse)
    }

    pub fn tree(&self) -> AttributeTree {
        config_to_tree(&self.services)
    }
}

/// Snapshot a record as an AD section.
pub fn record_to_section(record: &AdvRecord) -> AdSection {
    let mut section = AdSection::new();
    for (ad_type, value) in record.iter() {
        let entry = match value {
            AdValue::Flags(flags) => AdEntry::Number(*flags as i64),
            AdValue::Uuids16(list) => {
                AdEntry::Uuids(list.iter().map(|short| format!("{:04X}", short)).collect())
            }
            AdValue::Uuids128(list) => {
                AdEntry::Uuids(list.iter().map(Uuid::to_string).collect())
            }
            AdValue::Name(name) => AdEntry::Text(name.clone()),
            AdValue::TxPower(dbm) => AdEntry::Number(*dbm as i64),
            AdValue::DataMap(map) => AdEntry::Map(
                map.iter()
                    .map(|(key, data)| (format!("{:04X}", key), data.to_vec()))
                    .collect(),
            ),
            AdValue::Opaque(fields) => match fields.as_slice() {
                [single] => AdEntry::Bytes(single.clone()),
                many => AdEntry::Blocks(many.to_vec()),
            },
        };
        section.insert(ad_type, entry);
    }
    section
}

/// Rebuild a record from an AD section. Entries whose shape does not
/// match their AD type are skipped with a warning; nothing here is a
/// mandatory context.
pub fn section_to_record(section: &AdSection) -> AdvRecord {
    let mut record = AdvRecord::new();
    for (ad_type, entry) in section {
        match (*ad_type, entry) {
            (AD_FLAGS, AdEntry::Number(flags)) if (0..=255).contains(flags) => {
                record.set_flags(*flags as u8)
            }
            (AD_UUIDS16_INCOMPLETE | AD_UUIDS16_COMPLETE, AdEntry::Uuids(list)) => {
                let shorts: Vec<u16> = list
                    .iter()
                    .filter_map(|text| parse_uuid(text).and_then(|uuid| uuid.to_ble_u16()))
                    .collect();
                if !shorts.is_empty() {
                    record.set(*ad_type, AdValue::Uuids16(shorts));
                }
            }
            (AD_UUIDS128_INCOMPLETE | AD_UUIDS128_COMPLETE, AdEntry::Uuids(list)) => {
                let uuids: Vec<Uuid> = list.iter().filter_map(|text| parse_uuid(text)).collect();
                if !uuids.is_empty() {
                    record.set(*ad_type, AdValue::Uuids128(uuids));
                }
            }
            (AD_NAME_SHORT | AD_NAME_COMPLETE, AdEntry::Text(name)) => {
                record.set(*ad_type, AdValue::Name(name.clone()))
            }
            (AD_TX_POWER, AdEntry::Number(dbm)) if (-128..=127).contains(dbm) => {
                record.set_tx_power(*dbm as i8)
            }
            (AD_SERVICE_DATA16 | AD_MANUFACTURER, AdEntry::Map(map)) => {
                let mut data_map = DataMap::new();
                for (key, data) in map {
                    match parse_hex_key(key) {
                        Some(id) => data_map.insert(id, data.clone()),
                        None => warn!("skipping AD map entry with bad key {:?}", key),
                    }
                }
                if !data_map.is_empty() {
                    record.set(*ad_type, AdValue::DataMap(data_map));
                }
            }
            (_, AdEntry::Bytes(payload)) => {
                record.set(*ad_type, AdValue::Opaque(vec![payload.clone()]))
            }
            (_, AdEntry::Blocks(fields)) => {
                record.set(*ad_type, AdValue::Opaque(fields.clone()))
            }
            (ad_type, entry) => warn!(
                "skipping snapshot entry for AD type {:#04x}: unexpected shape {:?}",
                ad_type, entry
            ),
        }
    }
    record
}

/// Keys in the data maps are hex identifiers, with or without `0x`.
fn parse_hex_key(key: &str) -> Option<u16> {
    let hex = key.strip_prefix("0x").unwrap_or(key);
    u16::from_str_radix(hex, 16).ok()
}

/// Snapshot an attribute tree.
pub fn tree_to_config(tree: &AttributeTree) -> BTreeMap<Uuid, ServiceConfig> {
    let mut services = BTreeMap::new();
    for service in tree.services() {
        let mut characteristics = BTreeMap::new();
        for characteristic in &service.characteristics {
            characteristics.insert(
                characteristic.uuid,
                CharacteristicConfig {
                    name: characteristic.name.clone(),
                    handle: characteristic.handle,
                    properties: characteristic
                        .properties
                        .names()
                        .iter()
                        .map(|name| name.to_string())
                        .collect(),
                    value: characteristic.value.clone(),
                    maxlen: characteristic.max_len,
                },
            );
        }
        services.insert(
            service.uuid,
            ServiceConfig {
                name: service.name.clone(),
                characteristics,
            },
        );
    }
    services
}

/// Rebuild an attribute tree from a snapshot. Characteristics without an
/// upstream handle get one assigned in tree order.
pub fn config_to_tree(services: &BTreeMap<Uuid, ServiceConfig>) -> AttributeTree {
    let mut defs = Vec::new();
    for (uuid, service) in services {
        let mut service_def = ServiceDef::new(*uuid);
        if service.name.is_some() {
            service_def.name = service.name.clone();
        }
        for (char_uuid, characteristic) in &service.characteristics {
            let mut def = CharacteristicDef::new(
                *char_uuid,
                characteristic.handle,
                CharPropFlags::from_names(&characteristic.properties),
            );
            if characteristic.name.is_some() {
                def.name = characteristic.name.clone();
            }
            def.value = characteristic.value.clone();
            def.max_len = characteristic.maxlen;
            service_def.characteristics.push(def);
        }
        defs.push(service_def);
    }
    AttributeTree::new(defs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;

    fn sample_record() -> AdvRecord {
        let mut record = AdvRecord::new();
        record.set_flags(0x06);
        record.set_local_name("Thermo");
        record.set(AD_UUIDS16_COMPLETE, AdValue::Uuids16(vec![0x180f]));
        record.add_service_data(0xfd50, vec![0x41, 0x00, 0x00]);
        record.add_manufacturer(0x004c, vec![0x12]);
        record.set_tx_power(-4);
        record
    }

    #[test]
    fn section_round_trip() {
        let record = sample_record();
        let section = record_to_section(&record);
        let restored = section_to_record(&section);
        // sections are sorted by AD type, so compare per type
        for (ad_type, value) in record.iter() {
            assert_eq!(restored.get(ad_type), Some(value), "AD type {:#04x}", ad_type);
        }
        assert_eq!(restored.ad_types().len(), record.ad_types().len());
    }

    #[test]
    fn opaque_entries_round_trip() {
        let mut record = AdvRecord::new();
        record.set(0x26, AdValue::Opaque(vec![vec![0x01, 0x01, 0x00]]));
        let restored = section_to_record(&record_to_section(&record));
        assert_eq!(restored.get(0x26), record.get(0x26));
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let mut section = AdSection::new();
        section.insert(AD_FLAGS, AdEntry::Text("not flags".to_string()));
        section.insert(AD_NAME_COMPLETE, AdEntry::Text("Device".to_string()));
        let record = section_to_record(&section);
        assert_eq!(record.flags(), None);
        assert_eq!(record.local_name(), Some("Device"));
    }

    #[test]
    fn tree_round_trip() {
        let mut service = ServiceDef::new(uuid_from_u16(0x180f));
        let mut characteristic = CharacteristicDef::new(
            uuid_from_u16(0x2a19),
            0x002a,
            CharPropFlags::READ | CharPropFlags::NOTIFY,
        );
        characteristic.value = Some(vec![0x64]);
        service.characteristics.push(characteristic);
        let tree = AttributeTree::new(vec![service]);

        let restored = config_to_tree(&tree_to_config(&tree));
        assert_eq!(restored, tree);
    }

    #[test]
    fn document_json_round_trip() {
        let config = DeviceConfig {
            advname: Some("Thermo".to_string()),
            connectto: Some("DC:23:4F:DD:48:3E".parse().unwrap()),
            addrtype: Some(AddressType::Random),
            advertisement: record_to_section(&sample_record()),
            scanresponse: AdSection::new(),
            services: tree_to_config(&config_to_tree(&BTreeMap::new())),
        };
        let json = serde_json::to_string_pretty(&config).unwrap();
        let restored: DeviceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn hex_keys_accepted_with_and_without_prefix() {
        assert_eq!(parse_hex_key("FD50"), Some(0xfd50));
        assert_eq!(parse_hex_key("0x004c"), Some(0x004c));
        assert_eq!(parse_hex_key("zz"), None);
    }

    #[test]
    fn hand_written_document_parses() {
        let json = r#"{
            "advname": "Thermo",
            "connectto": "DC:23:4F:DD:48:3E",
            "addrtype": "public",
            "advertisement": {
                "1": 6,
                "9": "Thermo",
                "22": { "FD50": [65, 0, 0] }
            },
            "services": {
                "0000180f-0000-1000-8000-00805f9b34fb": {
                    "name": "Battery Service",
                    "characteristics": {
                        "00002a19-0000-1000-8000-00805f9b34fb": {
                            "handle": 42,
                            "properties": ["read", "notify"],
                            "value": [100],
                            "maxlen": 1
                        }
                    }
                }
            }
        }"#;
        let config: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.advname.as_deref(), Some("Thermo"));
        assert_eq!(config.addrtype, Some(AddressType::Public));

        let record = config.advertisement_record();
        assert_eq!(record.flags(), Some(0x06));
        assert_eq!(record.local_name(), Some("Thermo"));
        let map = match record.get(AD_SERVICE_DATA16) {
            Some(AdValue::DataMap(map)) => map,
            other => panic!("unexpected service data {:?}", other),
        };
        assert_eq!(map.get(0xfd50), Some(&[65, 0, 0][..]));

        let tree = config.tree();
        let (_, characteristic) = tree.find_characteristic(42).unwrap();
        assert_eq!(characteristic.uuid, uuid_from_u16(0x2a19));
        assert_eq!(
            characteristic.properties,
            CharPropFlags::READ | CharPropFlags::NOTIFY
        );
        assert_eq!(characteristic.value, Some(vec![100]));
        assert_eq!(characteristic.max_len, Some(1));
    }

    #[test]
    fn snapshot_round_trips_through_codec() {
        // the persisted advertisement must survive section conversion and
        // the wire codec unchanged
        let record = sample_record();
        let section = record_to_section(&record);
        let restored = section_to_record(&section);
        let bytes = crate::adv::codec::encode(&restored).unwrap();
        let decoded = crate::adv::codec::decode(&bytes).unwrap();
        for (ad_type, value) in restored.iter() {
            assert_eq!(decoded.get(ad_type), Some(value));
        }
    }
}
