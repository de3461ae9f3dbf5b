//! The local GATT server mirroring the upstream database.
//!
//! The filtered attribute tree is registered with BlueZ as a GATT
//! application; every characteristic's read, write and notify callbacks
//! go through a [`Relay`]. Handlers run on the orchestrator's runtime and
//! may block for a full upstream round trip, so the actual connector
//! calls are pushed onto blocking worker threads.

use std::sync::Arc;
use std::time::Duration;

use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicNotifier, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, ReqError, Service,
};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::timeout;

use crate::api::bleuuid::BleUuid;
use crate::api::{CharPropFlags, Connector, Sink};
use crate::gatt::AttributeTree;
use crate::relay::Relay;
use crate::{Error, Result};

/// How often an idle notify session checks whether the client stopped.
const NOTIFY_STOP_POLL: Duration = Duration::from_secs(1);

pub struct MockServer {
    adapter: bluer::Adapter,
    tree: AttributeTree,
    connector: Option<Arc<dyn Connector>>,
    service_changed_handle: Option<u16>,
    registration: Option<ApplicationHandle>,
    service_changed_sink: Option<Sink>,
}

impl MockServer {
    /// Prepare a server for the given tree. The GAP and GATT profile
    /// services are filtered out here; the upstream Service Changed
    /// handle is remembered from the unfiltered tree.
    pub fn new(
        adapter: bluer::Adapter,
        tree: &AttributeTree,
        connector: Option<Arc<dyn Connector>>,
    ) -> Self {
        MockServer {
            adapter,
            tree: tree.exposed(),
            connector,
            service_changed_handle: tree.service_changed_handle(),
            registration: None,
            service_changed_sink: None,
        }
    }

    /// The filtered tree this server exposes.
    pub fn tree(&self) -> &AttributeTree {
        &self.tree
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Register the application with the local controller. A second call
    /// while registered is a no-op.
    pub async fn register(&mut self) -> Result<()> {
        if self.registration.is_some() {
            debug!("GATT application already registered");
            return Ok(());
        }
        if self.tree.is_empty() {
            warn!("registering GATT application without any services");
        }
        info!(
            "registering GATT application with {} services / {} characteristics",
            self.tree.services().len(),
            self.tree.characteristic_count(),
        );
        let application = build_application(&self.tree, &self.connector);
        let registration = self
            .adapter
            .serve_gatt_application(application)
            .await
            .map_err(|err| Error::RegistrationFailed(err.to_string()))?;
        self.registration = Some(registration);

        self.watch_service_changed().await;
        Ok(())
    }

    /// Drop the registration and the Service Changed subscription. Errors
    /// on this path are logged only.
    pub async fn unregister(&mut self) {
        if let (Some(sink), Some(connector), Some(handle)) = (
            self.service_changed_sink.take(),
            self.connector.clone(),
            self.service_changed_handle,
        ) {
            let result =
                task::spawn_blocking(move || connector.unsubscribe(handle, &sink)).await;
            if !matches!(result, Ok(Ok(()))) {
                warn!("unable to drop the Service Changed subscription");
            }
        }
        if self.registration.take().is_some() {
            info!("GATT application unregistered");
        }
    }

    /// Subscribe upstream for Service Changed indications, when the real
    /// device has the characteristic. The local Generic Attribute service
    /// is owned by BlueZ (it is filtered from the exposed tree), so an
    /// upstream change is surfaced in the log for the operator; connected
    /// centrals keep talking to the snapshot taken at configure time.
    async fn watch_service_changed(&mut self) {
        let (Some(connector), Some(handle)) =
            (self.connector.clone(), self.service_changed_handle)
        else {
            return;
        };
        let sink = Sink::new(move |value| {
            warn!(
                "upstream database changed (Service Changed indication [{}]); \
                 restart to re-clone the attribute tree",
                hex::encode(value),
            );
        });
        let result = {
            let sink = sink.clone();
            task::spawn_blocking(move || connector.subscribe_indicate(handle, sink)).await
        };
        match result {
            Ok(Ok(())) => {
                info!("watching upstream Service Changed (handle {:#06x})", handle);
                self.service_changed_sink = Some(sink);
            }
            Ok(Err(err)) => warn!("cannot watch upstream Service Changed: {}", err),
            Err(err) => warn!("cannot watch upstream Service Changed: {}", err),
        }
    }
}

fn build_application(
    tree: &AttributeTree,
    connector: &Option<Arc<dyn Connector>>,
) -> Application {
    let mut services = Vec::new();
    for service_def in tree.services() {
        debug!(
            "mocking service {} [{}]",
            service_def.uuid.to_short_string(),
            service_def.name.as_deref().unwrap_or("-"),
        );
        let mut characteristics = Vec::new();
        for characteristic_def in &service_def.characteristics {
            let relay = Arc::new(Relay::new(connector.clone(), characteristic_def));
            characteristics.push(build_characteristic(relay));
        }
        services.push(Service {
            uuid: service_def.uuid,
            primary: service_def.primary,
            characteristics,
            ..Default::default()
        });
    }
    Application {
        services,
        ..Default::default()
    }
}

/// Wire one relay into the callback surfaces BlueZ will invoke. Only the
/// surfaces the characteristic's properties declare are attached; the
/// stack answers everything else with its own Not Supported / Not
/// Permitted failures, and the relay re-checks regardless.
fn build_characteristic(relay: Arc<Relay>) -> Characteristic {
    let properties = relay.properties();

    let read = properties.contains(CharPropFlags::READ).then(|| {
        let relay = relay.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |_req| {
                let relay = relay.clone();
                async move {
                    debug!("client read request for {}", relay.uuid().to_short_string());
                    task::spawn_blocking(move || relay.read())
                        .await
                        .map_err(|_| ReqError::Failed)?
                        .map_err(req_error)
                }
                .boxed()
            }),
            ..Default::default()
        }
    });

    let write = properties
        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
        .then(|| {
            let relay = relay.clone();
            CharacteristicWrite {
                write: properties.contains(CharPropFlags::WRITE),
                write_without_response: properties
                    .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                method: CharacteristicWriteMethod::Fun(Box::new(move |value, _req| {
                    let relay = relay.clone();
                    async move {
                        debug!(
                            "client write request for {}",
                            relay.uuid().to_short_string()
                        );
                        task::spawn_blocking(move || relay.write(&value))
                            .await
                            .map_err(|_| ReqError::Failed)?
                            .map_err(req_error)
                    }
                    .boxed()
                })),
                ..Default::default()
            }
        });

    let notify = properties
        .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        .then(|| {
            let relay = relay.clone();
            CharacteristicNotify {
                notify: properties.contains(CharPropFlags::NOTIFY),
                indicate: properties.contains(CharPropFlags::INDICATE),
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    let relay = relay.clone();
                    async move {
                        tokio::spawn(notify_session(relay, notifier));
                    }
                    .boxed()
                })),
                ..Default::default()
            }
        });

    Characteristic {
        uuid: relay.uuid(),
        broadcast: properties.contains(CharPropFlags::BROADCAST),
        read,
        write,
        notify,
        ..Default::default()
    }
}

/// One client subscription: subscribe upstream, forward payloads until
/// the client stops or the notifier dies, then unsubscribe upstream.
async fn notify_session(relay: Arc<Relay>, mut notifier: CharacteristicNotifier) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let sink = relay.notify_sink(move |value| {
        let _ = tx.send(value);
    });

    let subscribed = {
        let relay = relay.clone();
        let sink = sink.clone();
        task::spawn_blocking(move || relay.subscribe(sink)).await
    };
    match subscribed {
        Ok(Ok(())) => info!(
            "client subscribed to {} (upstream handle {:#06x})",
            relay.uuid().to_short_string(),
            relay.handle(),
        ),
        Ok(Err(err)) => {
            warn!(
                "upstream subscribe for {} failed: {}",
                relay.uuid().to_short_string(),
                err
            );
            return;
        }
        Err(err) => {
            warn!("upstream subscribe task failed: {}", err);
            return;
        }
    }

    loop {
        match timeout(NOTIFY_STOP_POLL, rx.recv()).await {
            Ok(Some(value)) => {
                if notifier.is_stopped() {
                    break;
                }
                if let Err(err) = notifier.notify(value).await {
                    debug!("notify session closed by client: {}", err);
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                if notifier.is_stopped() {
                    break;
                }
            }
        }
    }

    let unsubscribed = {
        let relay = relay.clone();
        task::spawn_blocking(move || relay.unsubscribe(&sink)).await
    };
    if !matches!(unsubscribed, Ok(Ok(()))) {
        warn!(
            "upstream unsubscribe for {} failed",
            relay.uuid().to_short_string()
        );
    }
    info!(
        "client unsubscribed from {} (upstream handle {:#06x})",
        relay.uuid().to_short_string(),
        relay.handle(),
    );
}

/// Map relay failures onto the error space BlueZ reports to the client.
/// An upstream timeout becomes a plain GATT failure so the central can
/// retry on its own schedule.
fn req_error(err: Error) -> ReqError {
    match err {
        Error::NotPermitted => ReqError::NotPermitted,
        Error::NotSupported => ReqError::NotSupported,
        Error::InvalidValueLength { .. } => ReqError::InvalidValueLength,
        Error::UpstreamTimeout => {
            warn!("upstream request timed out, failing the client operation");
            ReqError::Failed
        }
        other => {
            warn!("relay operation failed: {}", other);
            ReqError::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping() {
        assert!(matches!(
            req_error(Error::NotPermitted),
            ReqError::NotPermitted
        ));
        assert!(matches!(
            req_error(Error::NotSupported),
            ReqError::NotSupported
        ));
        assert!(matches!(
            req_error(Error::InvalidValueLength { got: 4, max: 2 }),
            ReqError::InvalidValueLength
        ));
        assert!(matches!(req_error(Error::UpstreamTimeout), ReqError::Failed));
        assert!(matches!(req_error(Error::NotConnected), ReqError::Failed));
    }
}
