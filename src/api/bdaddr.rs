//! Implementation of Bluetooth's MAC address.

use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter, LowerHex, UpperHex};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The 6 octet address identifying a Bluetooth device, most significant
/// octet first.
#[derive(Copy, Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BDAddr {
    octets: [u8; 6],
}

/// An error parsing a [`BDAddr`] from a string.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ParseBDAddrError {
    #[error("Bluetooth address has to be 6 bytes long")]
    IncorrectByteCount,
    #[error("invalid digit in address: {0}")]
    InvalidDigit(#[from] std::num::ParseIntError),
}

impl Display for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        <Self as UpperHex>::fmt(self, f)
    }
}

impl LowerHex for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let a = &self.octets;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl UpperHex for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let a = &self.octets;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl Debug for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}

impl From<[u8; 6]> for BDAddr {
    /// Build an address from an array; `octets[0]` is the MSB.
    fn from(octets: [u8; 6]) -> Self {
        Self { octets }
    }
}

impl<'a> TryFrom<&'a [u8]> for BDAddr {
    type Error = ParseBDAddrError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self {
            octets: slice
                .try_into()
                .map_err(|_| ParseBDAddrError::IncorrectByteCount)?,
        })
    }
}

impl FromStr for BDAddr {
    type Err = ParseBDAddrError;

    /// Parses an address of the form `aa:bb:cc:dd:ee:ff` or `aabbccddeeff`;
    /// both hex digit cases are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_ascii() {
            return Err(ParseBDAddrError::IncorrectByteCount);
        }
        let parts: Vec<&str> = if s.contains(':') {
            s.split(':').collect()
        } else if s.len() == 12 {
            (0..6).map(|i| &s[2 * i..2 * i + 2]).collect()
        } else {
            return Err(ParseBDAddrError::IncorrectByteCount);
        };
        if parts.len() != 6 {
            return Err(ParseBDAddrError::IncorrectByteCount);
        }
        let mut octets = [0; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            *octet = u8::from_str_radix(part, 16)?;
        }
        Ok(Self { octets })
    }
}

impl BDAddr {
    /// The underlying array, MSB first.
    pub fn into_inner(self) -> [u8; 6] {
        self.octets
    }

    /// The address reversed into the octet order HCI commands carry on the
    /// wire (least significant octet first).
    pub fn to_le_octets(self) -> [u8; 6] {
        let mut le = self.octets;
        le.reverse();
        le
    }
}

impl Serialize for BDAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct BDAddrVisitor;

impl Visitor<'_> for BDAddrVisitor {
    type Value = BDAddr;

    fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
        formatter.write_str("a Bluetooth address like \"00:11:22:33:44:55\"")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for BDAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(BDAddrVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: BDAddr = BDAddr {
        octets: [0xdc, 0x23, 0x4f, 0xdd, 0x48, 0x3e],
    };

    #[test]
    fn parse_addr() {
        let addr = BDAddr::from([0x2a, 0x00, 0xaa, 0xbb, 0xcc, 0xdd]);

        let result: Result<BDAddr, _> = "2a:00:aa:bb:cc:dd".parse();
        assert_eq!(result, Ok(addr));
        let result: Result<BDAddr, _> = "2a00AabbCcdd".parse();
        assert_eq!(result, Ok(addr));
        let result: Result<BDAddr, _> = "2A:00:00".parse();
        assert_eq!(result, Err(ParseBDAddrError::IncorrectByteCount));
        let result: Result<BDAddr, _> = "2A:00:AA:BB:CC:ZZ".parse();
        assert!(matches!(result, Err(ParseBDAddrError::InvalidDigit(_))));
    }

    #[test]
    fn display_addr() {
        assert_eq!(format!("{}", ADDR), "DC:23:4F:DD:48:3E");
        assert_eq!(format!("{:x}", ADDR), "dc:23:4f:dd:48:3e");
    }

    #[test]
    fn le_octets_reversed() {
        assert_eq!(
            ADDR.to_le_octets(),
            [0x3e, 0x48, 0xdd, 0x4f, 0x23, 0xdc]
        );
    }

    #[test]
    fn serde_round_trip() {
        let json = serde_json::to_string(&ADDR).unwrap();
        assert_eq!(json, "\"DC:23:4F:DD:48:3E\"");
        let back: BDAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ADDR);
    }
}
