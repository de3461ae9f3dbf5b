//! The BlueZ-backed upstream connector.
//!
//! `bluez-async` is a tokio-native library, but the rest of the crate
//! wants the connector to be a set of plain blocking calls serialised by
//! one mutex (the notification pump is an ordinary thread). The connector
//! therefore owns a small private runtime and every method is a
//! `block_on` around the async session, so callers never need a runtime
//! of their own and never run on one another's tasks.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bluez_async::{
    BluetoothEvent, BluetoothSession, CharacteristicEvent, CharacteristicId, DeviceEvent,
    DeviceId, DeviceInfo, DiscoveryFilter, MacAddress, WriteOptions, WriteType,
};
use futures::StreamExt;
use log::{debug, info, trace, warn};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use uuid::Uuid;

use crate::adv::AdvRecord;
use crate::api::bleuuid::BleUuid;
use crate::api::{AddressType, BDAddr, CharPropFlags, Connector, Sink};
use crate::connector::SubscriptionTable;
use crate::gatt::{AttributeTree, CharacteristicDef, DescriptorDef, ServiceDef};
use crate::{Error, Result};

/// Upper bound on one connect attempt; both address types get one retry
/// each.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long one attempt may search for the device before giving up.
const FIND_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on a single upstream read, write or CCCD update.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for the device to show up in discovery.
const FIND_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Upper bound on a single `poll` call.
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

/// BlueZ does not surface the raw flags octet of a scanned advertisement,
/// so the clone assumes the usual "LE General Discoverable, BR/EDR not
/// supported" value.
const DEFAULT_ADV_FLAGS: u8 = 0x06;

/// What the event forwarder pushes towards `poll`.
enum UpstreamEvent {
    Value { handle: u16, value: Vec<u8> },
    Disconnected,
}

/// One characteristic of the connected device, addressed by its upstream
/// handle.
#[derive(Clone, Debug)]
struct RemoteCharacteristic {
    id: CharacteristicId,
    uuid: Uuid,
    flags: CharPropFlags,
}

/// State of an established connection.
struct Link {
    device: DeviceId,
    address_type: AddressType,
    characteristics: HashMap<u16, RemoteCharacteristic>,
    events: UnboundedReceiver<UpstreamEvent>,
    event_tx: UnboundedSender<UpstreamEvent>,
    forwarder_started: bool,
}

#[derive(Default)]
struct State {
    session: Option<BluetoothSession>,
    link: Option<Link>,
}

/// Implementation of [`Connector`] on top of the BlueZ D-Bus API.
pub struct BluezConnector {
    address: BDAddr,
    rt: Runtime,
    state: Mutex<State>,
    subscriptions: SubscriptionTable,
}

impl BluezConnector {
    pub fn new(address: BDAddr) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .thread_name("gattmitm-upstream")
            .build()?;
        Ok(BluezConnector {
            address,
            rt,
            state: Mutex::new(State::default()),
            subscriptions: SubscriptionTable::new(),
        })
    }

    /// Open the shared D-Bus session on first use.
    fn session(&self, state: &mut State) -> Result<BluetoothSession> {
        if let Some(session) = &state.session {
            return Ok(session.clone());
        }
        let session = self.rt.block_on(async {
            let (dbus_task, session) = BluetoothSession::new().await?;
            tokio::spawn(dbus_task);
            Ok::<_, Error>(session)
        })?;
        state.session = Some(session.clone());
        Ok(session)
    }

    fn subscribe(&self, handle: u16, sink: Sink, indicate: bool) -> Result<()> {
        let state = self.state.lock().unwrap();
        let session = state.session.clone().ok_or(Error::NotConnected)?;
        let link = state.link.as_ref().ok_or(Error::NotConnected)?;
        let characteristic = link
            .characteristics
            .get(&handle)
            .ok_or(Error::NotSupported)?;
        if self.subscriptions.count(handle) == 0 {
            let cccd_value: u16 = if indicate { 0x0002 } else { 0x0001 };
            debug!(
                "enabling {} on {} handle {:#06x} (CCCD {:#06x})",
                if indicate { "indications" } else { "notifications" },
                characteristic.uuid.to_short_string(),
                handle,
                cccd_value,
            );
            self.rt
                .block_on(timeout(
                    REQUEST_TIMEOUT,
                    session.start_notify(&characteristic.id),
                ))
                .map_err(|_| Error::UpstreamTimeout)??;
        }
        if !self.subscriptions.subscribe(handle, sink) {
            trace!("sink already registered for handle {:#06x}", handle);
        }
        Ok(())
    }
}

impl Connector for BluezConnector {
    fn address(&self) -> BDAddr {
        self.address
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().link.is_some()
    }

    fn connect(&self, hint: AddressType) -> Result<AddressType> {
        let mut state = self.state.lock().unwrap();
        if let Some(link) = &state.link {
            return Ok(link.address_type);
        }
        let session = self.session(&mut state)?;

        for wanted in [hint, hint.other()] {
            for attempt in 1..=2 {
                match self
                    .rt
                    .block_on(try_connect(&session, self.address, wanted))
                {
                    Ok(link) => {
                        info!(
                            "connected to {} ({} address)",
                            self.address, link.address_type
                        );
                        let accepted = link.address_type;
                        state.link = Some(link);
                        return Ok(accepted);
                    }
                    Err(err) => {
                        debug!(
                            "connect to {} as {} failed (attempt {}): {}",
                            self.address, wanted, attempt, err
                        );
                    }
                }
            }
        }
        Err(Error::ConnectFailed(self.address))
    }

    fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let session = state.session.clone();
        if let (Some(session), Some(link)) = (session, state.link.take()) {
            info!("disconnecting from {}", self.address);
            if let Err(err) = self.rt.block_on(session.disconnect(&link.device)) {
                warn!("upstream disconnect failed: {}", err);
            }
        }
        self.subscriptions.clear();
        Ok(())
    }

    fn scan_for(&self, window: Duration) -> Result<(AdvRecord, AdvRecord)> {
        let mut state = self.state.lock().unwrap();
        let session = self.session(&mut state)?;
        self.rt.block_on(scan(&session, self.address, window))
    }

    fn discover_services(&self) -> Result<AttributeTree> {
        let mut state = self.state.lock().unwrap();
        let session = state.session.clone().ok_or(Error::NotConnected)?;
        let link = state.link.as_mut().ok_or(Error::NotConnected)?;
        let (tree, characteristics) =
            self.rt.block_on(walk_database(&session, &link.device))?;
        link.characteristics = characteristics;
        if !link.forwarder_started {
            spawn_forwarder(&self.rt, &session, link);
            link.forwarder_started = true;
        }
        info!(
            "discovered {} services with {} characteristics",
            tree.services().len(),
            tree.characteristic_count(),
        );
        Ok(tree)
    }

    fn read(&self, handle: u16) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let session = state.session.clone().ok_or(Error::NotConnected)?;
        let link = state.link.as_ref().ok_or(Error::NotConnected)?;
        let characteristic = link
            .characteristics
            .get(&handle)
            .ok_or(Error::NotSupported)?;
        let value = self
            .rt
            .block_on(timeout(
                REQUEST_TIMEOUT,
                session.read_characteristic_value(&characteristic.id),
            ))
            .map_err(|_| Error::UpstreamTimeout)??;
        trace!("read {:#06x}: {} octets", handle, value.len());
        Ok(value)
    }

    fn write(&self, handle: u16, value: &[u8]) -> Result<()> {
        let state = self.state.lock().unwrap();
        let session = state.session.clone().ok_or(Error::NotConnected)?;
        let link = state.link.as_ref().ok_or(Error::NotConnected)?;
        let characteristic = link
            .characteristics
            .get(&handle)
            .ok_or(Error::NotSupported)?;
        // write-with-response whenever the characteristic declares it
        let write_type = if characteristic.flags.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        let options = WriteOptions {
            write_type: Some(write_type),
            ..Default::default()
        };
        self.rt
            .block_on(timeout(
                REQUEST_TIMEOUT,
                session.write_characteristic_value_with_options(
                    &characteristic.id,
                    value.to_vec(),
                    options,
                ),
            ))
            .map_err(|_| Error::UpstreamTimeout)??;
        trace!("wrote {:#06x}: {} octets ({})", handle, value.len(), write_type);
        Ok(())
    }

    fn subscribe_notify(&self, handle: u16, sink: Sink) -> Result<()> {
        self.subscribe(handle, sink, false)
    }

    fn subscribe_indicate(&self, handle: u16, sink: Sink) -> Result<()> {
        self.subscribe(handle, sink, true)
    }

    fn unsubscribe(&self, handle: u16, sink: &Sink) -> Result<()> {
        let (removed, remaining) = self.subscriptions.unsubscribe(handle, sink);
        if !removed {
            return Ok(());
        }
        if remaining == 0 {
            let state = self.state.lock().unwrap();
            if let (Some(session), Some(link)) = (&state.session, &state.link) {
                if let Some(characteristic) = link.characteristics.get(&handle) {
                    debug!(
                        "disabling notifications on handle {:#06x} (CCCD 0x0000)",
                        handle
                    );
                    if let Err(err) = self
                        .rt
                        .block_on(session.stop_notify(&characteristic.id))
                    {
                        warn!("stop notify on {:#06x} failed: {}", handle, err);
                    }
                }
            }
        }
        Ok(())
    }

    fn poll(&self, max_wait: Duration) -> Result<()> {
        let max_wait = max_wait.min(MAX_POLL_WAIT);
        let mut batch = Vec::new();
        let outcome = {
            let mut state = self.state.lock().unwrap();
            let link = state.link.as_mut().ok_or(Error::NotConnected)?;
            let events = &mut link.events;
            let outcome = self.rt.block_on(async {
                let first = match timeout(max_wait, events.recv()).await {
                    Err(_) => return Ok(()), // nothing pending this round
                    Ok(None) => {
                        return Err(Error::UpstreamLost("event stream closed".to_string()))
                    }
                    Ok(Some(event)) => event,
                };
                let mut queue = vec![first];
                while let Ok(event) = events.try_recv() {
                    queue.push(event);
                }
                for event in queue {
                    match event {
                        UpstreamEvent::Value { handle, value } => batch.push((handle, value)),
                        UpstreamEvent::Disconnected => {
                            return Err(Error::UpstreamLost(
                                "device disconnected".to_string(),
                            ))
                        }
                    }
                }
                Ok(())
            });
            if outcome.is_err() {
                state.link = None;
            }
            outcome
        };
        match outcome {
            Ok(()) => {
                // sinks run on the caller's (pump) thread, outside the mutex
                for (handle, value) in batch {
                    let delivered = self.subscriptions.dispatch(handle, &value);
                    trace!(
                        "notification for {:#06x} delivered to {} sink(s)",
                        handle,
                        delivered
                    );
                }
                Ok(())
            }
            Err(err) => {
                self.subscriptions.clear();
                Err(err)
            }
        }
    }
}

/// One connect attempt for one address type: find the device, check the
/// reported address type, connect with a bounded wait.
async fn try_connect(
    session: &BluetoothSession,
    address: BDAddr,
    wanted: AddressType,
) -> Result<Link> {
    let device = find_device(session, address, Some(wanted)).await?;
    timeout(CONNECT_ATTEMPT_TIMEOUT, session.connect(&device.id))
        .await
        .map_err(|_| Error::UpstreamTimeout)??;
    let info = session.get_device_info(&device.id).await?;
    let (event_tx, events) = mpsc::unbounded_channel();
    Ok(Link {
        device: device.id,
        address_type: address_type_from(info.address_type),
        characteristics: HashMap::new(),
        events,
        event_tx,
        forwarder_started: false,
    })
}

/// Wait until BlueZ knows the device, starting a discovery round if it
/// does not already. With `wanted` set, an entry with the other address
/// type does not count as a match.
async fn find_device(
    session: &BluetoothSession,
    address: BDAddr,
    wanted: Option<AddressType>,
) -> Result<DeviceInfo> {
    let deadline = tokio::time::Instant::now() + FIND_TIMEOUT;
    let mut discovering = false;
    let result = loop {
        let devices = session.get_devices().await?;
        let found = devices.into_iter().find(|device| {
            mac_to_addr(&device.mac_address) == address
                && wanted
                    .map(|w| address_type_from(device.address_type) == w)
                    .unwrap_or(true)
        });
        if let Some(device) = found {
            break Ok(device);
        }
        if tokio::time::Instant::now() >= deadline {
            break Err(Error::DeviceNotFound(address));
        }
        if !discovering {
            debug!("device {} not cached, starting discovery", address);
            session.start_discovery().await?;
            discovering = true;
        }
        tokio::time::sleep(FIND_POLL_INTERVAL).await;
    };
    if discovering {
        if let Err(err) = session.stop_discovery().await {
            debug!("stop discovery failed: {}", err);
        }
    }
    result
}

/// Observe the device's advertising for `window`, returning what the first
/// sighting carried (the advertisement) and what only showed up afterwards
/// (the scan response).
async fn scan(
    session: &BluetoothSession,
    address: BDAddr,
    window: Duration,
) -> Result<(AdvRecord, AdvRecord)> {
    let filter = DiscoveryFilter {
        duplicate_data: Some(true),
        ..Default::default()
    };
    session.start_discovery_with_filter(&filter).await?;
    info!("scanning for {}", address);

    let deadline = tokio::time::Instant::now() + window;
    let result = scan_inner(session, address, deadline).await;
    if let Err(err) = session.stop_discovery().await {
        debug!("stop discovery failed: {}", err);
    }
    result
}

async fn scan_inner(
    session: &BluetoothSession,
    address: BDAddr,
    deadline: tokio::time::Instant,
) -> Result<(AdvRecord, AdvRecord)> {
    // wait for the first sighting
    let device = loop {
        let devices = session.get_devices().await?;
        if let Some(device) = devices
            .into_iter()
            .find(|device| mac_to_addr(&device.mac_address) == address)
        {
            break device;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::DeviceNotFound(address));
        }
        tokio::time::sleep(FIND_POLL_INTERVAL).await;
    };

    let mut advertisement = baseline_record(&device);
    let mut scan_response = AdvRecord::new();

    // everything the device reports after the first sighting that was not
    // part of the advertisement belongs to the scan response
    let mut events = Box::pin(session.device_event_stream(&device.id).await?);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.next()).await {
        let update = match event {
            BluetoothEvent::Device { event, .. } => record_from_event(event),
            _ => None,
        };
        let Some(update) = update else { continue };
        for (ad_type, value) in update.iter() {
            let mut single = AdvRecord::new();
            single.set(ad_type, value.clone());
            if advertisement.get(ad_type).is_some() {
                advertisement.merge(&single);
            } else {
                scan_response.merge(&single);
            }
        }
    }

    // the local name usually arrives with the scan response and only shows
    // up on the device properties
    let info = session.get_device_info(&device.id).await?;
    if let Some(name) = info.name {
        let current = advertisement.local_name().map(str::to_string);
        match current.as_deref() {
            None => scan_response.set_local_name(&name),
            Some(current) if current != name => advertisement.set_local_name(&name),
            _ => {}
        }
    }

    info!(
        "scan captured AD types {:02x?} / scan response {:02x?}",
        advertisement.ad_types(),
        scan_response.ad_types(),
    );
    Ok((advertisement, scan_response))
}

/// The advertisement record implied by the first discovery snapshot.
fn baseline_record(device: &DeviceInfo) -> AdvRecord {
    let mut record = AdvRecord::new();
    record.set_flags(DEFAULT_ADV_FLAGS);
    if let Some(name) = &device.name {
        record.set_local_name(name);
    }
    if !device.services.is_empty() {
        record.set_service_uuids(&device.services);
    }
    if let Some(tx_power) = device.tx_power {
        record.set_tx_power(tx_power.clamp(i8::MIN as i16, i8::MAX as i16) as i8);
    }
    let mut manufacturer: Vec<_> = device.manufacturer_data.iter().collect();
    manufacturer.sort_by_key(|(company, _)| **company);
    for (company, data) in manufacturer {
        record.add_manufacturer(*company, data.clone());
    }
    let mut service_data: Vec<_> = device.service_data.iter().collect();
    service_data.sort_by_key(|(uuid, _)| **uuid);
    for (uuid, data) in service_data {
        match uuid.to_ble_u16() {
            Some(short) => record.add_service_data(short, data.clone()),
            None => debug!(
                "skipping service data with 128-bit UUID {} (not representable as AD type 0x16)",
                uuid
            ),
        }
    }
    record
}

fn record_from_event(event: DeviceEvent) -> Option<AdvRecord> {
    let mut record = AdvRecord::new();
    match event {
        DeviceEvent::ManufacturerData { manufacturer_data } => {
            let mut entries: Vec<_> = manufacturer_data.into_iter().collect();
            entries.sort_by_key(|(company, _)| *company);
            for (company, data) in entries {
                record.add_manufacturer(company, data);
            }
        }
        DeviceEvent::ServiceData { service_data } => {
            let mut entries: Vec<_> = service_data.into_iter().collect();
            entries.sort_by_key(|(uuid, _)| *uuid);
            for (uuid, data) in entries {
                if let Some(short) = uuid.to_ble_u16() {
                    record.add_service_data(short, data);
                }
            }
        }
        DeviceEvent::Services { services } => record.set_service_uuids(&services),
        _ => return None,
    }
    if record.is_empty() {
        None
    } else {
        Some(record)
    }
}

/// Walk the remote database into the attribute tree plus the handle
/// mapping the relay addresses upstream operations with.
async fn walk_database(
    session: &BluetoothSession,
    device: &DeviceId,
) -> Result<(AttributeTree, HashMap<u16, RemoteCharacteristic>)> {
    let mut services = Vec::new();
    let mut by_handle = HashMap::new();
    for service in session.get_services(device).await? {
        let mut service_def = ServiceDef::new(service.uuid);
        service_def.primary = service.primary;
        for characteristic in session.get_characteristics(&service.id).await? {
            let Some(handle) = handle_from_id(&characteristic.id) else {
                warn!(
                    "cannot determine handle for characteristic {}, skipping",
                    characteristic.uuid
                );
                continue;
            };
            let flags = prop_flags_from(characteristic.flags);
            let mut def = CharacteristicDef::new(characteristic.uuid, handle, flags);
            for descriptor in session
                .get_descriptors(&characteristic.id)
                .await
                .unwrap_or_default()
            {
                def.descriptors.push(DescriptorDef::new(descriptor.uuid));
            }
            by_handle.insert(
                handle,
                RemoteCharacteristic {
                    id: characteristic.id,
                    uuid: characteristic.uuid,
                    flags,
                },
            );
            service_def.characteristics.push(def);
        }
        services.push(service_def);
    }
    Ok((AttributeTree::new(services), by_handle))
}

/// Forward characteristic value events from the session's event stream
/// into the channel `poll` drains. Lives on the connector's runtime for
/// the duration of the link.
fn spawn_forwarder(rt: &Runtime, session: &BluetoothSession, link: &Link) {
    let session = session.clone();
    let device = link.device.clone();
    let tx = link.event_tx.clone();
    let by_id: HashMap<CharacteristicId, u16> = link
        .characteristics
        .iter()
        .map(|(handle, characteristic)| (characteristic.id.clone(), *handle))
        .collect();
    rt.spawn(async move {
        let mut events = match session.device_event_stream(&device).await {
            Ok(events) => Box::pin(events),
            Err(err) => {
                warn!("cannot open upstream event stream: {}", err);
                let _ = tx.send(UpstreamEvent::Disconnected);
                return;
            }
        };
        while let Some(event) = events.next().await {
            match event {
                BluetoothEvent::Characteristic {
                    id,
                    event: CharacteristicEvent::Value { value },
                } => {
                    if let Some(handle) = by_id.get(&id) {
                        let _ = tx.send(UpstreamEvent::Value {
                            handle: *handle,
                            value,
                        });
                    }
                }
                BluetoothEvent::Device {
                    event: DeviceEvent::Connected { connected: false },
                    ..
                } => {
                    let _ = tx.send(UpstreamEvent::Disconnected);
                    return;
                }
                _ => {}
            }
        }
        let _ = tx.send(UpstreamEvent::Disconnected);
    });
}

/// BlueZ object paths end in the attribute handle (`.../charNNNN`); that
/// is the same 16-bit number the peripheral's own database uses.
fn handle_from_id(id: &CharacteristicId) -> Option<u16> {
    let path = id.to_string();
    let tail = path.rsplit('/').next()?;
    let hex = tail.strip_prefix("char")?;
    u16::from_str_radix(hex, 16).ok()
}

fn mac_to_addr(mac: &MacAddress) -> BDAddr {
    BDAddr::from(<[u8; 6]>::from(mac.clone()))
}

fn address_type_from(address_type: bluez_async::AddressType) -> AddressType {
    match address_type {
        bluez_async::AddressType::Public => AddressType::Public,
        bluez_async::AddressType::Random => AddressType::Random,
    }
}

fn prop_flags_from(flags: bluez_async::CharacteristicFlags) -> CharPropFlags {
    use bluez_async::CharacteristicFlags;
    let mut result = CharPropFlags::empty();
    if flags.contains(CharacteristicFlags::BROADCAST) {
        result.insert(CharPropFlags::BROADCAST);
    }
    if flags.contains(CharacteristicFlags::READ) {
        result.insert(CharPropFlags::READ);
    }
    if flags.contains(CharacteristicFlags::WRITE_WITHOUT_RESPONSE) {
        result.insert(CharPropFlags::WRITE_WITHOUT_RESPONSE);
    }
    if flags.contains(CharacteristicFlags::WRITE) {
        result.insert(CharPropFlags::WRITE);
    }
    if flags.contains(CharacteristicFlags::NOTIFY) {
        result.insert(CharPropFlags::NOTIFY);
    }
    if flags.contains(CharacteristicFlags::INDICATE) {
        result.insert(CharPropFlags::INDICATE);
    }
    if flags.contains(CharacteristicFlags::SIGNED_WRITE) {
        result.insert(CharPropFlags::AUTHENTICATED_SIGNED_WRITES);
    }
    if flags.contains(CharacteristicFlags::EXTENDED_PROPERTIES) {
        result.insert(CharPropFlags::EXTENDED_PROPERTIES);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prop_flags_conversion() {
        use bluez_async::CharacteristicFlags;
        let flags = CharacteristicFlags::READ
            | CharacteristicFlags::NOTIFY
            | CharacteristicFlags::SIGNED_WRITE;
        let converted = prop_flags_from(flags);
        assert_eq!(
            converted,
            CharPropFlags::READ
                | CharPropFlags::NOTIFY
                | CharPropFlags::AUTHENTICATED_SIGNED_WRITES
        );
    }
}
