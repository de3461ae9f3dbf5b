//! The advertising-data model.
//!
//! An [`AdvRecord`] is the typed, in-memory form of one Advertisement Data
//! payload (Core Spec Vol 3 Part C §11): a mapping from AD type to a typed
//! value, preserving the order fields were first seen in so that the wire
//! codec in [`codec`] can reproduce a parsed payload byte for byte.
//!
//! Records are built three ways: decoded from scanned bytes, loaded from a
//! persisted snapshot, or assembled through the typed mutators the
//! [`Advertiser`](crate::advertiser::Advertiser) exposes.

pub mod codec;

use uuid::Uuid;

use crate::api::bleuuid::{uuid_from_u16, BleUuid};

/// Flags.
pub const AD_FLAGS: u8 = 0x01;
/// Incomplete list of 16-bit service UUIDs.
pub const AD_UUIDS16_INCOMPLETE: u8 = 0x02;
/// Complete list of 16-bit service UUIDs.
pub const AD_UUIDS16_COMPLETE: u8 = 0x03;
/// Incomplete list of 128-bit service UUIDs.
pub const AD_UUIDS128_INCOMPLETE: u8 = 0x06;
/// Complete list of 128-bit service UUIDs.
pub const AD_UUIDS128_COMPLETE: u8 = 0x07;
/// Shortened local name.
pub const AD_NAME_SHORT: u8 = 0x08;
/// Complete local name.
pub const AD_NAME_COMPLETE: u8 = 0x09;
/// Tx power level.
pub const AD_TX_POWER: u8 = 0x0a;
/// Service data, 16-bit service UUID.
pub const AD_SERVICE_DATA16: u8 = 0x16;
/// Manufacturer specific data.
pub const AD_MANUFACTURER: u8 = 0xff;

/// Maximum serialised length of an advertisement or scan response PDU.
pub const MAX_AD_LEN: usize = 31;

/// An insertion-ordered mapping from a 16-bit key (service UUID or company
/// identifier) to an octet payload, with last-writer-wins semantics on
/// duplicate keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataMap {
    entries: Vec<(u16, Vec<u8>)>,
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the payload for `key`. A replaced entry keeps its
    /// original position.
    pub fn insert(&mut self, key: u16, value: Vec<u8>) {
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(index) => self.entries[index].1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: u16) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.entries.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(u16, Vec<u8>)> for DataMap {
    fn from_iter<T: IntoIterator<Item = (u16, Vec<u8>)>>(iter: T) -> Self {
        let mut map = DataMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// The typed value carried by one AD type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdValue {
    /// 0x01 — one octet of flags.
    Flags(u8),
    /// 0x02/0x03 — an ordered list of 16-bit service UUIDs.
    Uuids16(Vec<u16>),
    /// 0x06/0x07 — an ordered list of 128-bit service UUIDs.
    Uuids128(Vec<Uuid>),
    /// 0x08/0x09 — a UTF-8 local name.
    Name(String),
    /// 0x0A — signed Tx power in dBm.
    TxPower(i8),
    /// 0x16/0xFF — service data or manufacturer data entries.
    DataMap(DataMap),
    /// Any other AD type, kept as the raw payload of each field so unknown
    /// data round-trips unchanged.
    Opaque(Vec<Vec<u8>>),
}

/// One advertisement (or scan response) payload in typed form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvRecord {
    fields: Vec<(u8, AdValue)>,
}

impl AdvRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &AdValue)> {
        self.fields.iter().map(|(t, v)| (*t, v))
    }

    /// The set of AD types present in the record.
    pub fn ad_types(&self) -> Vec<u8> {
        self.fields.iter().map(|(t, _)| *t).collect()
    }

    pub fn get(&self, ad_type: u8) -> Option<&AdValue> {
        self.fields
            .iter()
            .find(|(t, _)| *t == ad_type)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, ad_type: u8) -> Option<&mut AdValue> {
        self.fields
            .iter_mut()
            .find(|(t, _)| *t == ad_type)
            .map(|(_, v)| v)
    }

    /// Replace the value for an AD type, keeping its position, or append a
    /// new field.
    pub fn set(&mut self, ad_type: u8, value: AdValue) {
        match self.fields.iter().position(|(t, _)| *t == ad_type) {
            Some(index) => self.fields[index].1 = value,
            None => self.fields.push((ad_type, value)),
        }
    }

    pub fn remove(&mut self, ad_type: u8) -> Option<AdValue> {
        let index = self.fields.iter().position(|(t, _)| *t == ad_type)?;
        Some(self.fields.remove(index).1)
    }

    pub fn flags(&self) -> Option<u8> {
        match self.get(AD_FLAGS) {
            Some(AdValue::Flags(flags)) => Some(*flags),
            _ => None,
        }
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.set(AD_FLAGS, AdValue::Flags(flags));
    }

    /// The local name, preferring the complete form over the shortened one.
    pub fn local_name(&self) -> Option<&str> {
        for ad_type in [AD_NAME_COMPLETE, AD_NAME_SHORT] {
            if let Some(AdValue::Name(name)) = self.get(ad_type) {
                return Some(name);
            }
        }
        None
    }

    pub fn set_local_name(&mut self, name: &str) {
        self.set(AD_NAME_COMPLETE, AdValue::Name(name.to_string()));
    }

    pub fn set_short_name(&mut self, name: &str) {
        self.set(AD_NAME_SHORT, AdValue::Name(name.to_string()));
    }

    pub fn set_tx_power(&mut self, dbm: i8) {
        self.set(AD_TX_POWER, AdValue::TxPower(dbm));
    }

    /// Replace the advertised service UUID lists, splitting the input into
    /// the complete 16-bit and 128-bit forms.
    pub fn set_service_uuids(&mut self, uuids: &[Uuid]) {
        let mut short = Vec::new();
        let mut long = Vec::new();
        for uuid in uuids {
            match uuid.to_ble_u16() {
                Some(short_form) => short.push(short_form),
                None => long.push(*uuid),
            }
        }
        self.remove(AD_UUIDS16_INCOMPLETE);
        self.remove(AD_UUIDS128_INCOMPLETE);
        if short.is_empty() {
            self.remove(AD_UUIDS16_COMPLETE);
        } else {
            self.set(AD_UUIDS16_COMPLETE, AdValue::Uuids16(short));
        }
        if long.is_empty() {
            self.remove(AD_UUIDS128_COMPLETE);
        } else {
            self.set(AD_UUIDS128_COMPLETE, AdValue::Uuids128(long));
        }
    }

    /// All advertised service UUIDs, in 128-bit form, across the complete
    /// and incomplete lists.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        let mut uuids = Vec::new();
        for ad_type in [AD_UUIDS16_INCOMPLETE, AD_UUIDS16_COMPLETE] {
            if let Some(AdValue::Uuids16(list)) = self.get(ad_type) {
                uuids.extend(list.iter().map(|short| uuid_from_u16(*short)));
            }
        }
        for ad_type in [AD_UUIDS128_INCOMPLETE, AD_UUIDS128_COMPLETE] {
            if let Some(AdValue::Uuids128(list)) = self.get(ad_type) {
                uuids.extend(list.iter().copied());
            }
        }
        uuids
    }

    pub fn add_manufacturer(&mut self, company: u16, data: Vec<u8>) {
        self.upsert_map(AD_MANUFACTURER, company, data);
    }

    pub fn add_service_data(&mut self, service: u16, data: Vec<u8>) {
        self.upsert_map(AD_SERVICE_DATA16, service, data);
    }

    fn upsert_map(&mut self, ad_type: u8, key: u16, data: Vec<u8>) {
        let index = match self.fields.iter().position(|(t, _)| *t == ad_type) {
            Some(index) => index,
            None => {
                self.fields.push((ad_type, AdValue::DataMap(DataMap::new())));
                self.fields.len() - 1
            }
        };
        match &mut self.fields[index].1 {
            AdValue::DataMap(map) => map.insert(key, data),
            other => {
                log::warn!(
                    "replacing non-mapping value for AD type {:#04x}: {:?}",
                    ad_type,
                    other
                );
                *other = AdValue::DataMap(DataMap::from_iter([(key, data)]));
            }
        }
    }

    /// Accumulate another record into this one: flags, names and Tx power
    /// replace, UUID lists append without duplicates, data mappings merge
    /// with last-writer-wins on duplicate inner keys, and opaque fields
    /// replace wholesale.
    pub fn merge(&mut self, other: &AdvRecord) {
        for (ad_type, value) in other.iter() {
            let index = self.fields.iter().position(|(t, _)| *t == ad_type);
            let Some(index) = index else {
                self.fields.push((ad_type, value.clone()));
                continue;
            };
            match (&mut self.fields[index].1, value) {
                (AdValue::Uuids16(existing), AdValue::Uuids16(incoming)) => {
                    for uuid in incoming {
                        if !existing.contains(uuid) {
                            existing.push(*uuid);
                        }
                    }
                }
                (AdValue::Uuids128(existing), AdValue::Uuids128(incoming)) => {
                    for uuid in incoming {
                        if !existing.contains(uuid) {
                            existing.push(*uuid);
                        }
                    }
                }
                (AdValue::DataMap(existing), AdValue::DataMap(incoming)) => {
                    for (key, data) in incoming.iter() {
                        existing.insert(key, data.to_vec());
                    }
                }
                (existing, _) => *existing = value.clone(),
            }
        }
    }

}
