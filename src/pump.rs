//! The notification pump.
//!
//! A dedicated worker thread that repeatedly asks the connector to poll
//! for pending upstream events, dispatching notifications to the
//! registered sinks. The first connector error stops the pump and is
//! reported to the orchestrator as fatal; the pump itself never panics
//! the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::api::Connector;
use crate::Error;

/// How long one poll round may block.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long `stop` waits for the worker before abandoning it.
const JOIN_GRACE: Duration = Duration::from_secs(3);

pub struct NotificationPump {
    run: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl NotificationPump {
    /// Start the worker. Fatal connector errors are pushed into `fatal`
    /// exactly once, right before the worker exits.
    pub fn start(
        connector: Arc<dyn Connector>,
        fatal: UnboundedSender<Error>,
    ) -> crate::Result<Self> {
        let run = Arc::new(AtomicBool::new(true));
        let run_flag = run.clone();
        let worker = thread::Builder::new()
            .name("notification-pump".to_string())
            .spawn(move || {
                info!("notification pump started");
                while run_flag.load(Ordering::SeqCst) {
                    if let Err(err) = connector.poll(POLL_INTERVAL) {
                        error!("notification pump stopping: {}", err);
                        let _ = fatal.send(err);
                        break;
                    }
                    // give lifecycle callers a chance at the connector mutex
                    thread::sleep(Duration::from_millis(1));
                }
                info!("notification pump stopped");
            })?;
        Ok(NotificationPump {
            run,
            worker: Some(worker),
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }

    /// Ask the worker to stop and join it with a bounded grace period. A
    /// worker stuck in a long upstream call is abandoned rather than
    /// joined. Calling `stop` twice is a no-op.
    pub fn stop(&mut self) {
        self.run.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return;
        };
        let deadline = Instant::now() + JOIN_GRACE;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                warn!("notification pump did not stop in time, abandoning it");
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if worker.join().is_err() {
            error!("notification pump thread panicked");
        }
    }
}

impl Drop for NotificationPump {
    fn drop(&mut self) {
        self.stop();
    }
}
