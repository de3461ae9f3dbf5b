//! Upstream connectors.
//!
//! The [`Connector`](crate::api::Connector) capability set is defined in
//! [`crate::api`]; this module holds the BlueZ-backed implementation and
//! the subscription table shared by every back-end.

pub mod bluez;

pub use self::bluez::BluezConnector;

use dashmap::DashMap;
use static_assertions::assert_impl_all;

use crate::api::{Connector, Sink};

assert_impl_all!(BluezConnector: Connector, Send, Sized, Sync);

/// The mapping from upstream handle to the sinks interested in its
/// notifications.
///
/// Subscribing an already-registered `(handle, sink)` pair and removing a
/// never-registered one are both no-ops, so callers can retry blindly.
/// Iteration order during dispatch is unspecified.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    sinks: DashMap<u16, Vec<Sink>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for a handle. Returns `false` when the pair was
    /// already present.
    pub fn subscribe(&self, handle: u16, sink: Sink) -> bool {
        let mut entry = self.sinks.entry(handle).or_default();
        if entry.iter().any(|existing| existing.same(&sink)) {
            return false;
        }
        entry.push(sink);
        true
    }

    /// Remove a sink registration. Returns whether the pair existed and
    /// how many sinks remain for the handle.
    pub fn unsubscribe(&self, handle: u16, sink: &Sink) -> (bool, usize) {
        match self.sinks.get_mut(&handle) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|existing| !existing.same(sink));
                (entry.len() < before, entry.len())
            }
            None => (false, 0),
        }
    }

    /// Number of sinks currently registered for a handle.
    pub fn count(&self, handle: u16) -> usize {
        self.sinks.get(&handle).map(|entry| entry.len()).unwrap_or(0)
    }

    /// Deliver one payload to every sink registered for the handle,
    /// returning how many sinks received it. The sink list is copied out
    /// first so a sink may subscribe or unsubscribe from within its own
    /// callback.
    pub fn dispatch(&self, handle: u16, value: &[u8]) -> usize {
        let targets: Vec<Sink> = match self.sinks.get(&handle) {
            Some(entry) => entry.clone(),
            None => return 0,
        };
        for sink in &targets {
            sink.emit(value);
        }
        targets.len()
    }

    pub fn clear(&self) {
        self.sinks.clear();
    }
}
