//! A Bluetooth Low Energy GATT man-in-the-middle proxy.
//!
//! `gattmitm` connects to a real BLE peripheral as a central, clones its
//! advertisement, scan response and GATT attribute database onto the local
//! BlueZ controller, and then relays every attribute operation from a
//! connected central into the real device while logging traffic in both
//! directions.
//!
//! The crate is split along the data path:
//!
//! * [`api`] — shared types ([`api::BDAddr`], [`api::CharPropFlags`]) and
//!   the [`api::Connector`] capability set every upstream back-end
//!   implements.
//! * [`adv`] — the advertising-data model and its wire codec.
//! * [`gatt`] — the service/characteristic/descriptor tree cloned from the
//!   upstream device.
//! * [`connector`] — the BlueZ-backed upstream connector.
//! * [`pump`] — the worker thread draining upstream notifications.
//! * [`advertiser`], [`mgmt`] — programming the local controller with the
//!   cloned advertisement.
//! * [`mock`], [`relay`] — the local GATT server and the per-characteristic
//!   relays behind it.
//! * [`mitm`] — the orchestrator tying all of the above together.
//! * [`config`] — persisted device snapshots.

pub mod adv;
pub mod advertiser;
pub mod api;
pub mod config;
pub mod connector;
pub mod gatt;
pub mod mgmt;
pub mod mitm;
pub mod mock;
pub mod pump;
pub mod relay;

use crate::api::BDAddr;

/// The main error type returned by nearly every fallible operation in this
/// crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Advertising data that cannot be parsed or encoded.
    #[error("malformed advertising data: {0}")]
    MalformedAd(String),

    /// A single advertising field that can never fit a 31 octet PDU.
    #[error("advertising field of {0} octets exceeds the 31 octet limit")]
    AdvTooLarge(usize),

    /// Both address types were tried (with one retry each) without success.
    #[error("unable to connect to {0}")]
    ConnectFailed(BDAddr),

    /// An upstream operation was attempted without an established
    /// connection.
    #[error("not connected to the upstream device")]
    NotConnected,

    /// An upstream read or write did not complete in time. Surfaced to the
    /// downstream central as a GATT failure so it can retry.
    #[error("upstream request timed out")]
    UpstreamTimeout,

    /// The upstream connection died. Fatal to the session.
    #[error("upstream connection lost: {0}")]
    UpstreamLost(String),

    /// The characteristic's properties do not allow the operation.
    #[error("operation not permitted")]
    NotPermitted,

    /// No handler or backing source exists for the operation.
    #[error("operation not supported")]
    NotSupported,

    /// A declared value length constraint was violated.
    #[error("invalid value length {got}, at most {max} octets allowed")]
    InvalidValueLength { got: usize, max: usize },

    /// Registering the advertisement or the GATT application with the
    /// local controller failed. Fatal at start time.
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    /// The requested device could not be found during discovery.
    #[error("device {0} not found")]
    DeviceNotFound(BDAddr),

    /// Invalid command line, snapshot or session configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other error bubbling up from the Bluetooth stack.
    #[error("bluetooth error: {0}")]
    Bluetooth(String),
}

impl From<bluez_async::BluetoothError> for Error {
    fn from(error: bluez_async::BluetoothError) -> Self {
        Error::Bluetooth(error.to_string())
    }
}

impl From<bluer::Error> for Error {
    fn from(error: bluer::Error) -> Self {
        Error::Bluetooth(error.to_string())
    }
}

/// Convenience alias for results carrying [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;
