//! Relay and pump behaviour against an in-memory upstream device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gattmitm::adv::AdvRecord;
use gattmitm::api::bleuuid::uuid_from_u16;
use gattmitm::api::{AddressType, BDAddr, CharPropFlags, Connector, Sink};
use gattmitm::connector::SubscriptionTable;
use gattmitm::gatt::{AttributeTree, CharacteristicDef};
use gattmitm::pump::NotificationPump;
use gattmitm::relay::Relay;
use gattmitm::{Error, Result};

#[derive(Default)]
struct FakeDevice {
    values: HashMap<u16, Vec<u8>>,
    writes: Vec<(u16, Vec<u8>)>,
    pending: Vec<(u16, Vec<u8>)>,
    connected: bool,
    attempts: Vec<AddressType>,
    fail_polls: bool,
}

/// An upstream connector backed by an in-memory device. `accepts` is the
/// address type the device answers on; `None` means unreachable.
struct FakeConnector {
    address: BDAddr,
    accepts: Option<AddressType>,
    device: Mutex<FakeDevice>,
    subscriptions: SubscriptionTable,
}

impl FakeConnector {
    fn new(accepts: AddressType) -> Self {
        FakeConnector {
            address: BDAddr::from([0xdc, 0x23, 0x4f, 0xdd, 0x48, 0x3e]),
            accepts: Some(accepts),
            device: Mutex::new(FakeDevice::default()),
            subscriptions: SubscriptionTable::new(),
        }
    }

    fn unreachable() -> Self {
        FakeConnector {
            accepts: None,
            ..FakeConnector::new(AddressType::Public)
        }
    }

    fn set_value(&self, handle: u16, value: Vec<u8>) {
        self.device.lock().unwrap().values.insert(handle, value);
    }

    fn push_notification(&self, handle: u16, value: Vec<u8>) {
        self.device.lock().unwrap().pending.push((handle, value));
    }

    fn writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.device.lock().unwrap().writes.clone()
    }

    fn attempts(&self) -> Vec<AddressType> {
        self.device.lock().unwrap().attempts.clone()
    }

    fn fail_polls(&self) {
        self.device.lock().unwrap().fail_polls = true;
    }
}

impl Connector for FakeConnector {
    fn address(&self) -> BDAddr {
        self.address
    }

    fn is_connected(&self) -> bool {
        self.device.lock().unwrap().connected
    }

    fn connect(&self, hint: AddressType) -> Result<AddressType> {
        let mut device = self.device.lock().unwrap();
        if device.connected {
            return Ok(self.accepts.unwrap_or(hint));
        }
        for wanted in [hint, hint.other()] {
            for _retry in 0..2 {
                device.attempts.push(wanted);
                if Some(wanted) == self.accepts {
                    device.connected = true;
                    return Ok(wanted);
                }
            }
        }
        Err(Error::ConnectFailed(self.address))
    }

    fn disconnect(&self) -> Result<()> {
        self.device.lock().unwrap().connected = false;
        self.subscriptions.clear();
        Ok(())
    }

    fn scan_for(&self, _timeout: Duration) -> Result<(AdvRecord, AdvRecord)> {
        Ok((AdvRecord::new(), AdvRecord::new()))
    }

    fn discover_services(&self) -> Result<AttributeTree> {
        Ok(AttributeTree::new(Vec::new()))
    }

    fn read(&self, handle: u16) -> Result<Vec<u8>> {
        self.device
            .lock()
            .unwrap()
            .values
            .get(&handle)
            .cloned()
            .ok_or(Error::NotSupported)
    }

    fn write(&self, handle: u16, value: &[u8]) -> Result<()> {
        self.device
            .lock()
            .unwrap()
            .writes
            .push((handle, value.to_vec()));
        Ok(())
    }

    fn subscribe_notify(&self, handle: u16, sink: Sink) -> Result<()> {
        self.subscriptions.subscribe(handle, sink);
        Ok(())
    }

    fn subscribe_indicate(&self, handle: u16, sink: Sink) -> Result<()> {
        self.subscriptions.subscribe(handle, sink);
        Ok(())
    }

    fn unsubscribe(&self, handle: u16, sink: &Sink) -> Result<()> {
        self.subscriptions.unsubscribe(handle, sink);
        Ok(())
    }

    fn poll(&self, max_wait: Duration) -> Result<()> {
        let batch: Vec<(u16, Vec<u8>)> = {
            let mut device = self.device.lock().unwrap();
            if device.fail_polls {
                return Err(Error::UpstreamLost("link dropped".to_string()));
            }
            device.pending.drain(..).collect()
        };
        if batch.is_empty() {
            thread::sleep(max_wait.min(Duration::from_millis(1)));
        }
        for (handle, value) in batch {
            self.subscriptions.dispatch(handle, &value);
        }
        Ok(())
    }
}

fn definition(handle: u16, properties: CharPropFlags) -> CharacteristicDef {
    CharacteristicDef::new(uuid_from_u16(0x2a19), handle, properties)
}

fn collector() -> (Arc<Mutex<Vec<Vec<u8>>>>, impl Fn(Vec<u8>) + Send + Sync + 'static) {
    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    (seen, move |value: Vec<u8>| {
        sink_seen.lock().unwrap().push(value)
    })
}

#[test]
fn client_read_observes_upstream_bytes() {
    let connector = Arc::new(FakeConnector::new(AddressType::Public));
    connector.set_value(0x002a, vec![0x5a]);

    let relay = Relay::new(
        Some(connector.clone()),
        &definition(0x002a, CharPropFlags::READ),
    );
    assert_eq!(relay.read().unwrap(), vec![0x5a]);

    // a later upstream change is visible on the next read
    connector.set_value(0x002a, vec![0x5b, 0x00]);
    assert_eq!(relay.read().unwrap(), vec![0x5b, 0x00]);
}

#[test]
fn client_write_reaches_upstream() {
    let connector = Arc::new(FakeConnector::new(AddressType::Public));
    let relay = Relay::new(
        Some(connector.clone()),
        &definition(0x002c, CharPropFlags::WRITE),
    );
    relay.write(&[0x01, 0x02]).unwrap();
    assert_eq!(connector.writes(), vec![(0x002c, vec![0x01, 0x02])]);
}

#[test]
fn notification_fans_out_to_every_subscriber_once() {
    let connector = Arc::new(FakeConnector::new(AddressType::Public));
    let relay = Relay::new(
        Some(connector.clone()),
        &definition(0x0030, CharPropFlags::NOTIFY),
    );

    let (first_seen, first_push) = collector();
    let (second_seen, second_push) = collector();
    let first = relay.notify_sink(first_push);
    let second = relay.notify_sink(second_push);
    relay.subscribe(first).unwrap();
    relay.subscribe(second).unwrap();

    connector.push_notification(0x0030, vec![0xde, 0xad, 0xbe, 0xef]);
    connector.poll(Duration::from_millis(10)).unwrap();

    assert_eq!(*first_seen.lock().unwrap(), vec![vec![0xde, 0xad, 0xbe, 0xef]]);
    assert_eq!(
        *second_seen.lock().unwrap(),
        vec![vec![0xde, 0xad, 0xbe, 0xef]]
    );
}

#[test]
fn empty_notification_is_suppressed() {
    let connector = Arc::new(FakeConnector::new(AddressType::Public));
    let relay = Relay::new(
        Some(connector.clone()),
        &definition(0x0030, CharPropFlags::NOTIFY),
    );

    let (seen, push) = collector();
    relay.subscribe(relay.notify_sink(push)).unwrap();

    connector.push_notification(0x0030, Vec::new());
    connector.poll(Duration::from_millis(10)).unwrap();
    assert!(seen.lock().unwrap().is_empty());

    connector.push_notification(0x0030, vec![0x01]);
    connector.poll(Duration::from_millis(10)).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![vec![0x01]]);
}

#[test]
fn double_subscribe_delivers_once() {
    let connector = Arc::new(FakeConnector::new(AddressType::Public));
    let relay = Relay::new(
        Some(connector.clone()),
        &definition(0x0030, CharPropFlags::NOTIFY),
    );

    let (seen, push) = collector();
    let sink = relay.notify_sink(push);
    relay.subscribe(sink.clone()).unwrap();
    relay.subscribe(sink.clone()).unwrap();

    connector.push_notification(0x0030, vec![0x42]);
    connector.poll(Duration::from_millis(10)).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);

    // unsubscribing twice (and a never-subscribed sink) is a no-op
    relay.unsubscribe(&sink).unwrap();
    relay.unsubscribe(&sink).unwrap();
    connector.push_notification(0x0030, vec![0x43]);
    connector.poll(Duration::from_millis(10)).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn connect_retries_both_address_types() {
    let connector = FakeConnector::new(AddressType::Public);
    let accepted = connector.connect(AddressType::Random).unwrap();
    assert_eq!(accepted, AddressType::Public);
    // hinted type twice, then the fallback succeeds on its first try
    assert_eq!(
        connector.attempts(),
        vec![
            AddressType::Random,
            AddressType::Random,
            AddressType::Public
        ]
    );

    // a second connect is a no-op reporting the accepted type
    assert_eq!(connector.connect(AddressType::Random).unwrap(), AddressType::Public);
    assert_eq!(connector.attempts().len(), 3);
}

#[test]
fn connect_failure_after_exhausting_both_types() {
    let connector = FakeConnector::unreachable();
    let result = connector.connect(AddressType::Random);
    assert!(matches!(result, Err(Error::ConnectFailed(_))));
    // one retry for the hinted type, one for the fallback
    assert_eq!(
        connector.attempts(),
        vec![
            AddressType::Random,
            AddressType::Random,
            AddressType::Public,
            AddressType::Public
        ]
    );
    assert!(!connector.is_connected());
}

#[test]
fn pump_dispatches_and_stops_cleanly() {
    let connector = Arc::new(FakeConnector::new(AddressType::Public));
    let relay = Relay::new(
        Some(connector.clone()),
        &definition(0x0030, CharPropFlags::NOTIFY),
    );
    let (seen, push) = collector();
    relay.subscribe(relay.notify_sink(push)).unwrap();

    let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut pump = NotificationPump::start(connector.clone(), fatal_tx).unwrap();
    assert!(pump.is_running());

    connector.push_notification(0x0030, vec![0x11]);
    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*seen.lock().unwrap(), vec![vec![0x11]]);

    pump.stop();
    assert!(!pump.is_running());
    // double stop is a no-op
    pump.stop();
    assert!(fatal_rx.try_recv().is_err());
}

#[test]
fn pump_stops_itself_on_connector_failure() {
    let connector = Arc::new(FakeConnector::new(AddressType::Public));
    connector.fail_polls();

    let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut pump = NotificationPump::start(connector.clone(), fatal_tx).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut fatal = None;
    while fatal.is_none() && Instant::now() < deadline {
        fatal = fatal_rx.try_recv().ok();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(fatal, Some(Error::UpstreamLost(_))));

    let deadline = Instant::now() + Duration::from_secs(2);
    while pump.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!pump.is_running());
    pump.stop();
}
