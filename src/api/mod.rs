//! The `api` module contains the types shared by every other part of the
//! crate: Bluetooth addresses, characteristic property flags, notification
//! sinks, and the [`Connector`] capability set implemented by the upstream
//! back-end.
//!
//! The GATT mock server and the relay depend only on `dyn Connector`, never
//! on a concrete back-end, so a different transport (or a test fake) can be
//! slotted in without touching them.

pub(crate) mod bdaddr;
pub mod bleuuid;

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::adv::AdvRecord;
use crate::gatt::AttributeTree;
use crate::Result;

pub use self::bdaddr::{BDAddr, ParseBDAddrError};

/// The address type of a BLE device.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl AddressType {
    /// The other address type, used when connecting falls back from the
    /// hinted type.
    pub fn other(&self) -> AddressType {
        match *self {
            AddressType::Public => AddressType::Random,
            AddressType::Random => AddressType::Public,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            AddressType::Public => "public",
            AddressType::Random => "random",
        }
    }
}

impl Display for AddressType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error parsing an [`AddressType`] from a string.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
#[error("address type must be \"public\" or \"random\", got {0:?}")]
pub struct ParseAddressTypeError(String);

impl FromStr for AddressType {
    type Err = ParseAddressTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "public" => Ok(AddressType::Public),
            "random" => Ok(AddressType::Random),
            other => Err(ParseAddressTypeError(other.to_string())),
        }
    }
}

bitflags! {
    /// The property set of a GATT characteristic, with the bit assignment
    /// of the characteristic declaration in the Bluetooth core spec.
    #[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
    pub struct CharPropFlags: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// (flag, snapshot name) pairs, in declaration bit order. The names match
/// what BlueZ reports for remote characteristics.
const CHAR_PROP_NAMES: [(CharPropFlags, &str); 8] = [
    (CharPropFlags::BROADCAST, "broadcast"),
    (CharPropFlags::READ, "read"),
    (
        CharPropFlags::WRITE_WITHOUT_RESPONSE,
        "write-without-response",
    ),
    (CharPropFlags::WRITE, "write"),
    (CharPropFlags::NOTIFY, "notify"),
    (CharPropFlags::INDICATE, "indicate"),
    (
        CharPropFlags::AUTHENTICATED_SIGNED_WRITES,
        "authenticated-signed-writes",
    ),
    (CharPropFlags::EXTENDED_PROPERTIES, "extended-properties"),
];

impl CharPropFlags {
    /// The property names carried by this flag set, for logs and the
    /// persisted snapshot.
    pub fn names(&self) -> Vec<&'static str> {
        CHAR_PROP_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Rebuild a flag set from property names. Unknown names are ignored
    /// with a warning so snapshots written by newer stacks still load.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> CharPropFlags {
        let mut flags = CharPropFlags::empty();
        for name in names {
            let name = name.as_ref();
            match CHAR_PROP_NAMES.iter().find(|(_, n)| *n == name) {
                Some((flag, _)) => flags.insert(*flag),
                None => log::warn!("ignoring unknown characteristic property {:?}", name),
            }
        }
        flags
    }
}

/// A capability to push one notification payload to some interested party.
///
/// Sinks are compared by identity, not by content: subscribing the same
/// sink twice for a handle is the same as subscribing it once, and
/// unsubscribing a sink that was never registered is a no-op.
#[derive(Clone)]
pub struct Sink {
    inner: Arc<dyn Fn(&[u8]) + Send + Sync>,
}

impl Sink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        Sink { inner: Arc::new(f) }
    }

    /// Deliver one payload. Must be safe to call concurrently with other
    /// sinks, but a single sink is never invoked concurrently with itself.
    pub fn emit(&self, value: &[u8]) {
        (self.inner)(value)
    }

    /// Identity comparison used by the subscription table.
    pub fn same(&self, other: &Sink) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for Sink {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Sink({:p})", Arc::as_ptr(&self.inner))
    }
}

/// The capability set of an upstream connector: connect, scan, discover,
/// read, write, subscribe and poll against the real peripheral.
///
/// All methods are blocking and mutually exclusive; the back-end serialises
/// them behind a single mutex so upstream I/O on one characteristic is
/// totally ordered. Notification sinks fire on the pump thread, from
/// [`Connector::poll`].
pub trait Connector: Send + Sync {
    /// The address of the upstream device this connector targets.
    fn address(&self) -> BDAddr;

    fn is_connected(&self) -> bool;

    /// Establish the upstream connection, preferring `hint` and falling
    /// back to the other address type, with one retry for each. Returns
    /// the address type that was actually accepted.
    fn connect(&self, hint: AddressType) -> Result<AddressType>;

    fn disconnect(&self) -> Result<()>;

    /// Observe the device's advertising for up to `timeout` and return the
    /// accumulated advertisement and scan-response records.
    fn scan_for(&self, timeout: Duration) -> Result<(AdvRecord, AdvRecord)>;

    /// Walk the remote attribute database and return it as an ordered
    /// tree. The result includes the GAP and GATT profile services; the
    /// caller filters them before exposing a copy.
    fn discover_services(&self) -> Result<AttributeTree>;

    /// Read the characteristic value behind an upstream handle.
    fn read(&self, handle: u16) -> Result<Vec<u8>>;

    /// Write a characteristic value. Whether the write expects a response
    /// is decided from the characteristic's declared properties.
    fn write(&self, handle: u16, value: &[u8]) -> Result<()>;

    /// Enable notifications (CCCD value 0x0001) for a handle and register
    /// `sink` for its payloads.
    fn subscribe_notify(&self, handle: u16, sink: Sink) -> Result<()>;

    /// Enable indications (CCCD value 0x0002) for a handle and register
    /// `sink` for its payloads.
    fn subscribe_indicate(&self, handle: u16, sink: Sink) -> Result<()>;

    /// Remove a sink registration, disabling the subscription (CCCD value
    /// 0x0000) once the last sink for the handle is gone. Idempotent.
    fn unsubscribe(&self, handle: u16, sink: &Sink) -> Result<()>;

    /// Block for at most `max_wait` and dispatch at most one batch of
    /// pending upstream events to the registered sinks.
    fn poll(&self, max_wait: Duration) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_type_parse() {
        assert_eq!("public".parse(), Ok(AddressType::Public));
        assert_eq!("random".parse(), Ok(AddressType::Random));
        assert!("static".parse::<AddressType>().is_err());
        assert_eq!(AddressType::Public.other(), AddressType::Random);
        assert_eq!(AddressType::Random.other(), AddressType::Public);
    }

    #[test]
    fn char_prop_names_round_trip() {
        let flags = CharPropFlags::READ | CharPropFlags::NOTIFY | CharPropFlags::WRITE;
        let names = flags.names();
        assert_eq!(names, vec!["read", "write", "notify"]);
        assert_eq!(CharPropFlags::from_names(&names), flags);
    }

    #[test]
    fn char_prop_unknown_name_ignored() {
        let flags = CharPropFlags::from_names(&["read", "encrypt-read"]);
        assert_eq!(flags, CharPropFlags::READ);
    }

    #[test]
    fn sink_identity() {
        let a = Sink::new(|_| {});
        let b = Sink::new(|_| {});
        let a2 = a.clone();
        assert!(a.same(&a2));
        assert!(!a.same(&b));
    }
}
