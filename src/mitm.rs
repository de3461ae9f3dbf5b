//! The MITM orchestrator.
//!
//! Owns the whole session: `configure` builds the attribute tree and
//! advertisement (live from the upstream device, from a snapshot, or
//! both, in which case the snapshot wins and the connection is kept for
//! live relaying), `start` brings up advertiser, mock server and pump,
//! `run` blocks until an interrupt or a fatal pump error, and `stop`
//! tears everything down in reverse order on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task;
use uuid::Uuid;

use crate::advertiser::Advertiser;
use crate::api::{AddressType, BDAddr, CharPropFlags, Connector};
use crate::config::{self, DeviceConfig};
use crate::gatt::AttributeTree;
use crate::mgmt::MgmtClient;
use crate::mock::MockServer;
use crate::pump::NotificationPump;
use crate::{Error, Result};

/// How long the configure step observes the upstream advertising.
const SCAN_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Configured,
    Running,
    Stopped,
}

pub struct Mitm {
    adapter: bluer::Adapter,
    advertiser: Advertiser,
    connector: Option<Arc<dyn Connector>>,
    tree: Option<AttributeTree>,
    address: Option<BDAddr>,
    address_type: Option<AddressType>,
    server: Option<MockServer>,
    pump: Option<NotificationPump>,
    fatal_rx: Option<UnboundedReceiver<Error>>,
    state: Lifecycle,
}

impl Mitm {
    pub fn new(adapter: bluer::Adapter, mgmt: MgmtClient) -> Self {
        let advertiser = Advertiser::new(adapter.clone(), mgmt);
        Mitm {
            adapter,
            advertiser,
            connector: None,
            tree: None,
            address: None,
            address_type: None,
            server: None,
            pump: None,
            fatal_rx: None,
            state: Lifecycle::Idle,
        }
    }

    /// Build the session. At least one of `connector` and `config` must be
    /// given; with both, the snapshot provides the tree and advertisement
    /// while the connector keeps serving live reads and writes.
    pub async fn configure(
        &mut self,
        connector: Option<Arc<dyn Connector>>,
        config: Option<DeviceConfig>,
        addrtype: Option<AddressType>,
    ) -> Result<()> {
        if self.state != Lifecycle::Idle {
            return Err(Error::Configuration(
                "configure is only valid before start".to_string(),
            ));
        }
        if connector.is_none() && config.is_none() {
            return Err(Error::Configuration(
                "either an upstream device or a device snapshot is required".to_string(),
            ));
        }

        let mut advertisement = None;
        let mut scan_response = None;
        let mut discovered = None;

        if let Some(connector) = &connector {
            let hint = addrtype
                .or_else(|| config.as_ref().and_then(|c| c.addrtype))
                .unwrap_or(AddressType::Random);

            // the advertisement can only be observed before connecting
            if config.is_none() {
                let scanner = connector.clone();
                let (adv, scanresp) =
                    blocking(move || scanner.scan_for(SCAN_WINDOW)).await?;
                advertisement = Some(adv);
                scan_response = Some(scanresp);
            }

            let target = connector.clone();
            let accepted = blocking(move || target.connect(hint)).await?;
            self.address = Some(connector.address());
            self.address_type = Some(accepted);

            // always walk the remote database: even when the snapshot wins
            // the exposed tree, the connector needs its handle map
            let walker = connector.clone();
            discovered = Some(blocking(move || walker.discover_services()).await?);
        }

        let tree = match &config {
            Some(config) => {
                if self.address.is_none() {
                    self.address = config.connectto;
                    self.address_type = config.addrtype;
                }
                config.tree()
            }
            None => discovered.ok_or_else(|| {
                Error::Configuration("no source for the attribute tree".to_string())
            })?,
        };
        let (advertisement, scan_response) = match &config {
            Some(config) => {
                let mut advertisement = config.advertisement_record();
                if let Some(name) = &config.advname {
                    advertisement.set_local_name(name);
                }
                (advertisement, config.scan_response_record())
            }
            None => (
                advertisement.unwrap_or_default(),
                scan_response.unwrap_or_default(),
            ),
        };

        info!(
            "session configured for {} ({} services)",
            self.address
                .map(|address| address.to_string())
                .unwrap_or_else(|| "<no upstream>".to_string()),
            tree.services().len(),
        );
        tree.log_summary();

        self.advertiser.merge_advertisement(&advertisement)?;
        self.advertiser.merge_scan_response(&scan_response)?;
        self.tree = Some(tree);
        self.connector = connector;
        self.state = Lifecycle::Configured;
        Ok(())
    }

    /// Override the advertised name (CLI `--advname`).
    pub fn set_adv_name(&mut self, name: &str) -> Result<()> {
        self.advertiser.set_local_name(name)
    }

    /// Override the advertised service UUIDs (CLI `--advserviceuuids`).
    pub fn set_adv_service_uuids(&mut self, uuids: &[Uuid]) -> Result<()> {
        self.advertiser.set_service_uuids(uuids)
    }

    /// Pin the advertising address after registration (CLI `--changemac`).
    pub fn set_pinned_address(&mut self, address: BDAddr) -> Result<()> {
        self.advertiser.set_pinned_address(Some(address))
    }

    /// Capture the session as a persistable snapshot, reading the current
    /// value of every readable characteristic while the upstream is still
    /// reachable.
    pub async fn snapshot(&self) -> Result<DeviceConfig> {
        let tree = self.tree.as_ref().ok_or_else(|| {
            Error::Configuration("configure the session before storing a snapshot".to_string())
        })?;

        let mut values: HashMap<u16, Vec<u8>> = HashMap::new();
        if let Some(connector) = &self.connector {
            for service in tree.services() {
                for characteristic in &service.characteristics {
                    if !characteristic.properties.contains(CharPropFlags::READ) {
                        continue;
                    }
                    let reader = connector.clone();
                    let handle = characteristic.handle;
                    match blocking(move || reader.read(handle)).await {
                        Ok(value) => {
                            values.insert(handle, value);
                        }
                        Err(err) => warn!(
                            "cannot capture value of {:#06x} for the snapshot: {}",
                            handle, err
                        ),
                    }
                }
            }
        }

        let mut services = config::tree_to_config(tree);
        for service in services.values_mut() {
            for characteristic in service.characteristics.values_mut() {
                if let Some(value) = values.get(&characteristic.handle) {
                    characteristic.value = Some(value.clone());
                }
            }
        }

        Ok(DeviceConfig {
            advname: self
                .advertiser
                .advertisement()
                .local_name()
                .map(str::to_string),
            connectto: self.address,
            addrtype: self.address_type,
            advertisement: config::record_to_section(self.advertiser.advertisement()),
            scanresponse: config::record_to_section(self.advertiser.scan_response()),
            services,
        })
    }

    /// Bring the session up: advertisement, GATT application, pump.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Configured => {}
            Lifecycle::Running => return Ok(()),
            _ => {
                return Err(Error::Configuration(
                    "start is only valid on a configured session".to_string(),
                ))
            }
        }
        let tree = self.tree.as_ref().ok_or_else(|| {
            Error::Configuration("no attribute tree configured".to_string())
        })?;

        self.advertiser.initialize().await?;
        self.advertiser.register().await?;

        let mut server = MockServer::new(self.adapter.clone(), tree, self.connector.clone());
        if let Err(err) = server.register().await {
            self.advertiser.unregister().await;
            return Err(err);
        }

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        if let Some(connector) = &self.connector {
            match NotificationPump::start(connector.clone(), fatal_tx) {
                Ok(pump) => self.pump = Some(pump),
                Err(err) => {
                    server.unregister().await;
                    self.advertiser.unregister().await;
                    return Err(err);
                }
            }
        }

        self.server = Some(server);
        self.fatal_rx = Some(fatal_rx);
        self.state = Lifecycle::Running;
        info!("MITM running");
        Ok(())
    }

    /// Block until an interrupt arrives or the pump reports a fatal
    /// upstream failure. The caller is expected to `stop` afterwards in
    /// either case.
    pub async fn run(&mut self) -> Result<()> {
        if self.state != Lifecycle::Running {
            return Err(Error::Configuration(
                "run is only valid on a started session".to_string(),
            ));
        }
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!("cannot listen for interrupts: {}", err);
                }
                info!("interrupt received, shutting down");
                Ok(())
            }
            err = fatal_error(&mut self.fatal_rx) => Err(err),
        }
    }

    /// Tear the session down in reverse bring-up order. Runs on every
    /// exit path; calling it twice is a no-op.
    pub async fn stop(&mut self) {
        if self.state == Lifecycle::Stopped {
            return;
        }
        if let Some(mut pump) = self.pump.take() {
            pump.stop();
        }
        if let Some(mut server) = self.server.take() {
            server.unregister().await;
        }
        self.advertiser.unregister().await;
        if let Some(connector) = self.connector.take() {
            let result = task::spawn_blocking(move || connector.disconnect()).await;
            if !matches!(result, Ok(Ok(()))) {
                warn!("upstream disconnect failed during shutdown");
            }
        }
        self.fatal_rx = None;
        self.state = Lifecycle::Stopped;
        info!("MITM stopped");
    }
}

/// Run a blocking connector call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| Error::Bluetooth(format!("worker task failed: {}", err)))?
}

/// Resolve once the pump pushes a fatal error; pends forever when no pump
/// is attached (snapshot-only sessions).
async fn fatal_error(rx: &mut Option<UnboundedReceiver<Error>>) -> Error {
    match rx {
        Some(rx) => rx
            .recv()
            .await
            .unwrap_or_else(|| Error::UpstreamLost("pump channel closed".to_string())),
        None => futures::future::pending().await,
    }
}
