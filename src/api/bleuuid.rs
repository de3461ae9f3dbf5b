//! Utilities for dealing with BLE UUIDs and their 16-bit short forms.

use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Convert a 16-bit BLE short UUID to a full 128-bit UUID by filling in the
/// standard Bluetooth Base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// An extension trait for `Uuid` which provides BLE-specific methods.
pub trait BleUuid {
    /// If the UUID is a valid 16-bit BLE short UUID then return its short
    /// form, otherwise return `None`.
    fn to_ble_u16(&self) -> Option<u16>;

    /// Convert the UUID to a string, using the short format if applicable.
    fn to_short_string(&self) -> String;
}

impl BleUuid for Uuid {
    fn to_ble_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn to_short_string(&self) -> String {
        if let Some(uuid16) = self.to_ble_u16() {
            format!("{:04X}", uuid16)
        } else {
            self.to_string()
        }
    }
}

/// Parse a UUID given either as a 16-bit short form (`180F` or `0x180f`) or
/// as a full 128-bit string.
pub fn parse_uuid(s: &str) -> Option<Uuid> {
    let trimmed = s.trim();
    let hex = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if hex.len() <= 4 {
        return u16::from_str_radix(hex, 16).ok().map(uuid_from_u16);
    }
    Uuid::parse_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_from_u16_test() {
        assert_eq!(
            uuid_from_u16(0x1122),
            Uuid::parse_str("00001122-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn uuid_to_from_u16_success() {
        let uuid = Uuid::parse_str("00001234-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(uuid_from_u16(uuid.to_ble_u16().unwrap()), uuid);
    }

    #[test]
    fn uuid_to_u16_fail() {
        assert_eq!(
            Uuid::parse_str("12345678-0000-1000-8000-00805f9b34fb")
                .unwrap()
                .to_ble_u16(),
            None
        );
        assert_eq!(
            Uuid::parse_str("12340000-0000-1000-8000-00805f9b34fb")
                .unwrap()
                .to_ble_u16(),
            None
        );
        assert_eq!(Uuid::nil().to_ble_u16(), None);
    }

    #[test]
    fn to_short_string_forms() {
        assert_eq!(uuid_from_u16(0x180f).to_short_string(), "180F");
        let uuid_str = "12345678-9000-1000-8000-00805f9b34fb";
        let uuid = Uuid::parse_str(uuid_str).unwrap();
        assert_eq!(uuid.to_short_string(), uuid_str);
    }

    #[test]
    fn parse_uuid_forms() {
        assert_eq!(parse_uuid("180F"), Some(uuid_from_u16(0x180f)));
        assert_eq!(parse_uuid("0x180f"), Some(uuid_from_u16(0x180f)));
        assert_eq!(
            parse_uuid("0000fd50-0000-1000-8000-00805f9b34fb"),
            Some(uuid_from_u16(0xfd50))
        );
        assert_eq!(parse_uuid("not-a-uuid"), None);
    }
}
