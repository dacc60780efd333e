//! ---
//! gw_section: "02-messaging-ipc-data-model"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Message bus abstraction used by the distributor."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::{MessagingError, Result};

/// Topic for informational service notices.
pub const SERVICE_TOPIC: &str = "BeeeOn/service";
/// Topic for failure notices.
pub const FAILURE_TOPIC: &str = "BeeeOn/failure";

/// Delivery guarantee requested from the broker (0, 1 or 2).
pub type QoS = u8;

/// Publish side of a topic-based message bus.
pub trait MessageBus: Send + Sync {
    /// Publish `payload` to `topic`.
    fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<()>;
    /// Human-readable bus name for logging.
    fn name(&self) -> &'static str;
}

/// A single recorded publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Destination topic.
    pub topic: String,
    /// Payload as sent.
    pub payload: String,
    /// Requested QoS.
    pub qos: QoS,
}

/// In-process bus that records every publish; useful for tests and for
/// running without a broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    log: Arc<Mutex<Vec<Published>>>,
    fail: Arc<Mutex<bool>>,
}

impl InMemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<Published> {
        self.log.lock().clone()
    }

    /// Publishes on `topic` so far.
    pub fn on_topic(&self, topic: &str) -> Vec<Published> {
        self.log
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Make subsequent publishes fail (simulates a broker outage).
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock() = failing;
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<()> {
        if *self.fail.lock() {
            return Err(MessagingError::Publish {
                topic: topic.to_owned(),
                reason: "broker unavailable".into(),
            });
        }
        self.log.lock().push(Published {
            topic: topic.to_owned(),
            payload: payload.to_owned(),
            qos,
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Bus that only traces what would be published; stands in when no broker
/// client is attached to the daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingBus;

impl MessageBus for TracingBus {
    fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<()> {
        debug!(topic, qos, bytes = payload.len(), "publish without broker");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}
