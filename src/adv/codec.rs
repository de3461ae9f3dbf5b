//! Wire codec for advertising data.
//!
//! Advertising payloads are a sequence of length-prefixed TLV fields: one
//! length octet (payload length plus one), one AD type octet, then the
//! payload. The codec maintains an identity law in both directions:
//! decoding a well-formed payload and re-encoding it reproduces the input
//! bytes, and encoding a record and decoding it reproduces the record.
//!
//! A zero length octet (the end-of-data sentinel) and a field running past
//! the end of the buffer are rejected as malformed. Payloads with a valid
//! frame but an unexpected shape (a two octet flags field, an odd-length
//! UUID list) are preserved opaquely rather than dropped, so they still
//! round-trip.

use uuid::Uuid;

use super::{
    AdValue, AdvRecord, AD_FLAGS, AD_MANUFACTURER, AD_NAME_COMPLETE, AD_NAME_SHORT,
    AD_SERVICE_DATA16, AD_TX_POWER, AD_UUIDS128_COMPLETE, AD_UUIDS128_INCOMPLETE,
    AD_UUIDS16_COMPLETE, AD_UUIDS16_INCOMPLETE,
};
use crate::{Error, Result};

/// Largest payload a single TLV field can carry: the length octet counts
/// the AD type octet too.
const MAX_FIELD_PAYLOAD: usize = 254;

/// Serialise a record into advertising-data bytes, fields in record order.
///
/// The result may well exceed 31 octets; fitting it into advertisement and
/// scan response PDUs is the advertiser's concern, not the codec's.
pub fn encode(record: &AdvRecord) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for (ad_type, value) in record.iter() {
        for field in encode_value(ad_type, value)? {
            bytes.extend_from_slice(&field);
        }
    }
    Ok(bytes)
}

/// Serialise a single AD type's value into complete TLV fields.
///
/// Mapping values (service data, manufacturer data) and 128-bit UUID lists
/// produce one field per entry; everything else produces exactly one field.
/// The per-field granularity is what the advertiser's size fitting works
/// on.
pub fn encode_value(ad_type: u8, value: &AdValue) -> Result<Vec<Vec<u8>>> {
    let mut fields = Vec::new();
    match value {
        AdValue::Flags(flags) => fields.push(make_field(ad_type, &[*flags])?),
        AdValue::Uuids16(uuids) => {
            let mut payload = Vec::with_capacity(uuids.len() * 2);
            for uuid in uuids {
                payload.extend_from_slice(&uuid.to_le_bytes());
            }
            fields.push(make_field(ad_type, &payload)?);
        }
        AdValue::Uuids128(uuids) => {
            for uuid in uuids {
                let mut payload = *uuid.as_bytes();
                payload.reverse();
                fields.push(make_field(ad_type, &payload)?);
            }
        }
        AdValue::Name(name) => fields.push(make_field(ad_type, name.as_bytes())?),
        AdValue::TxPower(dbm) => fields.push(make_field(ad_type, &[*dbm as u8])?),
        AdValue::DataMap(map) => {
            for (key, data) in map.iter() {
                let mut payload = Vec::with_capacity(2 + data.len());
                payload.extend_from_slice(&key.to_le_bytes());
                payload.extend_from_slice(data);
                fields.push(make_field(ad_type, &payload)?);
            }
        }
        AdValue::Opaque(raw_fields) => {
            for payload in raw_fields {
                fields.push(make_field(ad_type, payload)?);
            }
        }
    }
    Ok(fields)
}

fn make_field(ad_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FIELD_PAYLOAD {
        return Err(Error::MalformedAd(format!(
            "payload of {} octets cannot be length-prefixed",
            payload.len()
        )));
    }
    let mut field = Vec::with_capacity(payload.len() + 2);
    field.push(payload.len() as u8 + 1);
    field.push(ad_type);
    field.extend_from_slice(payload);
    Ok(field)
}

/// Parse advertising-data bytes into a record.
pub fn decode(bytes: &[u8]) -> Result<AdvRecord> {
    let mut record = AdvRecord::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let len = rest[0] as usize;
        if len == 0 {
            return Err(Error::MalformedAd("zero length field".to_string()));
        }
        if rest.len() < len + 1 {
            return Err(Error::MalformedAd(format!(
                "field of {} octets truncated to {}",
                len,
                rest.len() - 1
            )));
        }
        let ad_type = rest[1];
        absorb(&mut record, ad_type, &rest[2..len + 1]);
        rest = &rest[len + 1..];
    }
    Ok(record)
}

/// Merge one parsed field into the record under construction.
fn absorb(record: &mut AdvRecord, ad_type: u8, payload: &[u8]) {
    match ad_type {
        AD_FLAGS if payload.len() == 1 => record.set_flags(payload[0]),
        AD_UUIDS16_INCOMPLETE | AD_UUIDS16_COMPLETE if payload.len() % 2 == 0 => {
            let incoming: Vec<u16> = payload
                .chunks_exact(2)
                .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
                .collect();
            if record.get(ad_type).is_none() {
                record.set(ad_type, AdValue::Uuids16(incoming));
            } else if let Some(AdValue::Uuids16(existing)) = record.get_mut(ad_type) {
                existing.extend(incoming);
            }
        }
        AD_UUIDS128_INCOMPLETE | AD_UUIDS128_COMPLETE if payload.len() % 16 == 0 => {
            let incoming: Vec<Uuid> = payload
                .chunks_exact(16)
                .map(|chunk| {
                    let mut be: [u8; 16] = chunk.try_into().unwrap();
                    be.reverse();
                    Uuid::from_bytes(be)
                })
                .collect();
            if record.get(ad_type).is_none() {
                record.set(ad_type, AdValue::Uuids128(incoming));
            } else if let Some(AdValue::Uuids128(existing)) = record.get_mut(ad_type) {
                existing.extend(incoming);
            }
        }
        AD_NAME_SHORT | AD_NAME_COMPLETE => match std::str::from_utf8(payload) {
            Ok(name) => record.set(ad_type, AdValue::Name(name.to_string())),
            Err(_) => absorb_opaque(record, ad_type, payload),
        },
        AD_TX_POWER if payload.len() == 1 => record.set_tx_power(payload[0] as i8),
        AD_SERVICE_DATA16 if payload.len() >= 2 => {
            let key = u16::from_le_bytes([payload[0], payload[1]]);
            record.add_service_data(key, payload[2..].to_vec());
        }
        AD_MANUFACTURER if payload.len() >= 2 => {
            let key = u16::from_le_bytes([payload[0], payload[1]]);
            record.add_manufacturer(key, payload[2..].to_vec());
        }
        _ => absorb_opaque(record, ad_type, payload),
    }
}

fn absorb_opaque(record: &mut AdvRecord, ad_type: u8, payload: &[u8]) {
    if record.get(ad_type).is_none() {
        record.set(ad_type, AdValue::Opaque(vec![payload.to_vec()]));
        return;
    }
    match record.get_mut(ad_type) {
        Some(AdValue::Opaque(fields)) => fields.push(payload.to_vec()),
        other => {
            log::warn!(
                "skipping field with AD type {:#04x}: shape conflicts with {:?}",
                ad_type,
                other
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::AD_SERVICE_DATA16;

    /// Flags 0x06 plus service data for 0xFD50.
    const SAMPLE: [u8; 10] = [0x02, 0x01, 0x06, 0x05, 0x16, 0x50, 0xfd, 0x41, 0x00, 0x00];

    #[test]
    fn decode_sample() {
        let record = decode(&SAMPLE).unwrap();
        assert_eq!(record.flags(), Some(0x06));
        let map = match record.get(AD_SERVICE_DATA16) {
            Some(AdValue::DataMap(map)) => map,
            other => panic!("unexpected service data {:?}", other),
        };
        assert_eq!(map.get(0xfd50), Some(&[0x41, 0x00, 0x00][..]));
    }

    #[test]
    fn sample_round_trips() {
        let record = decode(&SAMPLE).unwrap();
        assert_eq!(encode(&record).unwrap(), SAMPLE.to_vec());
    }

    #[test]
    fn record_round_trips() {
        let long = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let mut record = AdvRecord::new();
        record.set_flags(0x06);
        record.set_local_name("Thermo");
        record.set(AD_UUIDS16_COMPLETE, AdValue::Uuids16(vec![0x180f, 0x180d]));
        record.set(AD_UUIDS128_COMPLETE, AdValue::Uuids128(vec![long]));
        record.set_tx_power(-8);
        record.add_service_data(0xfd50, vec![0x41, 0x00]);
        record.add_manufacturer(0x004c, vec![0x12, 0x34]);
        record.add_manufacturer(0xffff, vec![0x56]);

        let bytes = encode(&record).unwrap();
        assert_eq!(decode(&bytes).unwrap(), record);
    }

    #[test]
    fn unknown_types_kept_opaque() {
        // 0x26 is not modelled; it must survive a round trip untouched.
        let bytes = [0x04, 0x26, 0x01, 0x01, 0x00, 0x02, 0x01, 0x06];
        let record = decode(&bytes).unwrap();
        assert_eq!(
            record.get(0x26),
            Some(&AdValue::Opaque(vec![vec![0x01, 0x01, 0x00]]))
        );
        assert_eq!(encode(&record).unwrap(), bytes.to_vec());
    }

    #[test]
    fn uuid128_little_endian_on_wire() {
        let uuid = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let mut record = AdvRecord::new();
        record.set(AD_UUIDS128_COMPLETE, AdValue::Uuids128(vec![uuid]));
        let bytes = encode(&record).unwrap();
        assert_eq!(bytes[0], 17);
        assert_eq!(bytes[1], AD_UUIDS128_COMPLETE);
        // last payload octet is the first octet of the canonical form
        assert_eq!(bytes[17], 0x6e);
        assert_eq!(decode(&bytes).unwrap(), record);
    }

    #[test]
    fn zero_length_rejected() {
        let result = decode(&[0x02, 0x01, 0x06, 0x00]);
        assert!(matches!(result, Err(Error::MalformedAd(_))));
    }

    #[test]
    fn truncated_tail_rejected() {
        let result = decode(&[0x05, 0x16, 0x50, 0xfd]);
        assert!(matches!(result, Err(Error::MalformedAd(_))));
    }

    #[test]
    fn multiple_fields_same_type_round_trip() {
        // two manufacturer fields with distinct company identifiers
        let bytes = [
            0x04, 0xff, 0xff, 0xff, 0x01, // company 0xFFFF
            0x04, 0xff, 0x4c, 0x00, 0x02, // company 0x004C
        ];
        let record = decode(&bytes).unwrap();
        assert_eq!(encode(&record).unwrap(), bytes.to_vec());
    }

    #[test]
    fn shape_invalid_payload_kept_opaque() {
        // a flags field with two octets does not match the modelled shape
        let bytes = [0x03, 0x01, 0x06, 0x00];
        let record = decode(&bytes).unwrap();
        assert_eq!(
            record.get(AD_FLAGS),
            Some(&AdValue::Opaque(vec![vec![0x06, 0x00]]))
        );
        assert_eq!(encode(&record).unwrap(), bytes.to_vec());
    }

    #[test]
    fn split_uuid16_fields_accumulate() {
        // two complete-list fields merge into one ordered list
        let bytes = [0x03, 0x03, 0x0f, 0x18, 0x03, 0x03, 0x0d, 0x18];
        let record = decode(&bytes).unwrap();
        assert_eq!(
            record.get(AD_UUIDS16_COMPLETE),
            Some(&AdValue::Uuids16(vec![0x180f, 0x180d]))
        );
    }

    #[test]
    fn empty_record_encodes_empty() {
        assert_eq!(encode(&AdvRecord::new()).unwrap(), Vec::<u8>::new());
        assert_eq!(decode(&[]).unwrap(), AdvRecord::new());
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let mut record = AdvRecord::new();
        record.set(0x21, AdValue::Opaque(vec![vec![0u8; 300]]));
        assert!(matches!(encode(&record), Err(Error::MalformedAd(_))));
    }

    #[test]
    fn name_is_utf8_on_the_wire() {
        let mut record = AdvRecord::new();
        record.set_local_name("Träger");
        let bytes = encode(&record).unwrap();
        assert_eq!(decode(&bytes).unwrap().local_name(), Some("Träger"));
    }
}
