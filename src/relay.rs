//! Per-characteristic relays.
//!
//! Every characteristic the mock server exposes gets one [`Relay`],
//! closed over the upstream handle and the declared properties. Server
//! reads and writes block on the connector until the real device answers;
//! upstream notifications are wrapped into value pushes towards the
//! connected central. Every hop is logged with direction, handle and
//! payload hex.
//!
//! Without a connector (snapshot-only mode) the relay falls back to a
//! local value cell seeded from the snapshot, so the mock still behaves
//! like a device.

use std::sync::{Arc, Mutex};

use log::{debug, info};
use uuid::Uuid;

use crate::api::bleuuid::BleUuid;
use crate::api::{CharPropFlags, Connector, Sink};
use crate::gatt::CharacteristicDef;
use crate::{Error, Result};

pub struct Relay {
    connector: Option<Arc<dyn Connector>>,
    uuid: Uuid,
    handle: u16,
    properties: CharPropFlags,
    max_len: Option<usize>,
    cell: Mutex<Option<Vec<u8>>>,
}

impl Relay {
    pub fn new(connector: Option<Arc<dyn Connector>>, definition: &CharacteristicDef) -> Self {
        Relay {
            connector,
            uuid: definition.uuid,
            handle: definition.handle,
            properties: definition.properties,
            max_len: definition.max_len,
            cell: Mutex::new(definition.value.clone()),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn properties(&self) -> CharPropFlags {
        self.properties
    }

    /// Serve a client read: forward to the upstream device, or answer from
    /// the snapshot cell when running without one.
    pub fn read(&self) -> Result<Vec<u8>> {
        if !self.properties.contains(CharPropFlags::READ) {
            return Err(Error::NotPermitted);
        }
        match &self.connector {
            Some(connector) => {
                let value = connector.read(self.handle)?;
                info!(
                    "relay read {:#06x} {} -> [{}]",
                    self.handle,
                    self.uuid.to_short_string(),
                    hex::encode(&value),
                );
                Ok(value)
            }
            None => {
                let value = self.cell.lock().unwrap().clone().ok_or(Error::NotSupported)?;
                debug!(
                    "serving read of {} from the snapshot value",
                    self.uuid.to_short_string()
                );
                Ok(value)
            }
        }
    }

    /// Serve a client write.
    pub fn write(&self, value: &[u8]) -> Result<()> {
        if !self
            .properties
            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            return Err(Error::NotPermitted);
        }
        if let Some(max) = self.max_len {
            if value.len() > max {
                return Err(Error::InvalidValueLength {
                    got: value.len(),
                    max,
                });
            }
        }
        match &self.connector {
            Some(connector) => {
                connector.write(self.handle, value)?;
                info!(
                    "relay write {:#06x} {} <- [{}]",
                    self.handle,
                    self.uuid.to_short_string(),
                    hex::encode(value),
                );
                Ok(())
            }
            None => {
                debug!(
                    "storing write to {} in the snapshot value",
                    self.uuid.to_short_string()
                );
                *self.cell.lock().unwrap() = Some(value.to_vec());
                Ok(())
            }
        }
    }

    /// Subscribe `sink` upstream, choosing notifications over indications
    /// when the characteristic declares both.
    pub fn subscribe(&self, sink: Sink) -> Result<()> {
        let connector = self.connector.as_ref().ok_or(Error::NotSupported)?;
        if self.properties.contains(CharPropFlags::NOTIFY) {
            connector.subscribe_notify(self.handle, sink)
        } else if self.properties.contains(CharPropFlags::INDICATE) {
            connector.subscribe_indicate(self.handle, sink)
        } else {
            Err(Error::NotSupported)
        }
    }

    /// Remove the sink's upstream registration. A sink that was never
    /// subscribed unsubscribes without effect.
    pub fn unsubscribe(&self, sink: &Sink) -> Result<()> {
        match &self.connector {
            Some(connector) => connector.unsubscribe(self.handle, sink),
            None => Ok(()),
        }
    }

    /// Wrap a push capability into the sink handed to the connector.
    /// Zero-length upstream payloads are dropped here because the
    /// downstream value-changed machinery refuses empty arrays.
    pub fn notify_sink<F>(&self, push: F) -> Sink
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let handle = self.handle;
        let uuid = self.uuid;
        Sink::new(move |value| {
            if value.is_empty() {
                debug!(
                    "dropping empty notification from {:#06x} {}",
                    handle,
                    uuid.to_short_string()
                );
                return;
            }
            info!(
                "relay notify {:#06x} {} -> [{}]",
                handle,
                uuid.to_short_string(),
                hex::encode(value),
            );
            push(value.to_vec());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn definition(properties: CharPropFlags) -> CharacteristicDef {
        let mut definition = CharacteristicDef::new(uuid_from_u16(0x2a19), 0x002a, properties);
        definition.value = Some(vec![0x64]);
        definition
    }

    #[test]
    fn read_without_property_not_permitted() {
        let relay = Relay::new(None, &definition(CharPropFlags::WRITE));
        assert!(matches!(relay.read(), Err(Error::NotPermitted)));
    }

    #[test]
    fn snapshot_read_and_write() {
        let relay = Relay::new(
            None,
            &definition(CharPropFlags::READ | CharPropFlags::WRITE),
        );
        assert_eq!(relay.read().unwrap(), vec![0x64]);
        relay.write(&[0x42]).unwrap();
        assert_eq!(relay.read().unwrap(), vec![0x42]);
    }

    #[test]
    fn read_without_backing_source_not_supported() {
        let mut definition = definition(CharPropFlags::READ);
        definition.value = None;
        let relay = Relay::new(None, &definition);
        assert!(matches!(relay.read(), Err(Error::NotSupported)));
    }

    #[test]
    fn write_length_constraint() {
        let mut definition = definition(CharPropFlags::WRITE);
        definition.max_len = Some(2);
        let relay = Relay::new(None, &definition);
        relay.write(&[0x01, 0x02]).unwrap();
        assert!(matches!(
            relay.write(&[0x01, 0x02, 0x03]),
            Err(Error::InvalidValueLength { got: 3, max: 2 })
        ));
    }

    #[test]
    fn subscribe_without_connector_not_supported() {
        let relay = Relay::new(None, &definition(CharPropFlags::NOTIFY));
        let sink = Sink::new(|_| {});
        assert!(matches!(relay.subscribe(sink), Err(Error::NotSupported)));
    }

    #[test]
    fn notify_sink_drops_empty_payloads() {
        let relay = Relay::new(None, &definition(CharPropFlags::NOTIFY));
        let pushes = Arc::new(AtomicUsize::new(0));
        let counter = pushes.clone();
        let sink = relay.notify_sink(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sink.emit(&[]);
        assert_eq!(pushes.load(Ordering::SeqCst), 0);
        sink.emit(&[0xde, 0xad]);
        assert_eq!(pushes.load(Ordering::SeqCst), 1);
    }
}
