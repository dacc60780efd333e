//! ---
//! gw_section: "02-messaging-ipc-data-model"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Deduplicating fan-out of sensor readings to secondary sinks."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use adagw_common::{Cadence, DistributorConfig, Shutdown, TimedMutex};
use adagw_msg::{
    to_csv, CacheRecordEncoder, Correlation, CsvLayout, EnvelopeCodec, Message, RecordEncoder,
};
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, FAILURE_TOPIC, SERVICE_TOPIC};
use crate::pipe::GeekPipe;

const LOCK_BUDGET: Duration = Duration::from_secs(2);

/// Everything that makes two readings the same reading, minus the timestamp
/// (which is the history key).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Signature {
    euid: u64,
    device_type_id: u16,
    dev_version: i32,
    fw_version: String,
    protocol_version: String,
    tt_version: i64,
    values: Vec<(u16, u32, bool)>,
}

impl Signature {
    fn of(msg: &Message) -> Self {
        Self {
            euid: msg.device.euid,
            device_type_id: msg.device.device_type_id,
            dev_version: msg.device.version,
            fw_version: msg.fw_version.clone(),
            protocol_version: msg.protocol_version.clone(),
            tt_version: msg.tt_version,
            values: msg
                .device
                .values
                .iter()
                .map(|v| (v.module_id, v.value.to_bits(), v.available))
                .collect(),
        }
    }
}

/// Seen readings keyed by timestamp, forgotten in arrival order.
#[derive(Debug, Default)]
struct History {
    by_time: BTreeMap<i64, VecDeque<Signature>>,
    arrivals: VecDeque<i64>,
}

impl History {
    fn len(&self) -> usize {
        self.arrivals.len()
    }

    fn contains(&self, timestamp: i64, signature: &Signature) -> bool {
        self.by_time
            .get(&timestamp)
            .is_some_and(|seen| seen.contains(signature))
    }

    fn insert(&mut self, timestamp: i64, signature: Signature, limit: usize) {
        self.by_time.entry(timestamp).or_default().push_back(signature);
        self.arrivals.push_back(timestamp);
        while self.arrivals.len() > limit {
            let Some(expired) = self.arrivals.pop_front() else {
                break;
            };
            if let Entry::Occupied(mut seen) = self.by_time.entry(expired) {
                seen.get_mut().pop_front();
                if seen.get().is_empty() {
                    seen.remove();
                }
            }
        }
    }
}

/// Deduplicates freshly produced readings and publishes them to the bus and
/// the optional debug pipe.
pub struct MessageDistributor {
    config: DistributorConfig,
    bus: Arc<dyn MessageBus>,
    codec: Arc<dyn EnvelopeCodec>,
    tap: Option<GeekPipe>,
    history: TimedMutex<History>,
    pending: TimedMutex<VecDeque<Message>>,
}

impl MessageDistributor {
    /// Build a distributor; a failure to create the debug pipe disables it.
    pub fn new(
        config: DistributorConfig,
        bus: Arc<dyn MessageBus>,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Self {
        let tap = if config.geek_mode_enabled {
            match GeekPipe::create(&config.geek_mode_path) {
                Ok(pipe) => {
                    info!(path = %pipe.path().display(), "geek mode enabled");
                    Some(pipe)
                }
                Err(err) => {
                    warn!(error = %err, path = %config.geek_mode_path.display(), "geek pipe unavailable");
                    None
                }
            }
        } else {
            None
        };
        Self {
            config,
            bus,
            codec,
            tap,
            history: TimedMutex::new("distributor-history", History::default()),
            pending: TimedMutex::new("distributor-pending", VecDeque::new()),
        }
    }

    /// Encoder the cache uses for its backing file.
    pub fn record_encoder(&self) -> Arc<dyn RecordEncoder> {
        Arc::new(CacheRecordEncoder)
    }

    /// Queue a `data` message unless an identical reading with the same
    /// timestamp was already seen. Returns whether it was queued.
    pub fn add_message(&self, msg: &Message) -> bool {
        if !msg.is_data() {
            return false;
        }
        let signature = Signature::of(msg);
        {
            let Some(mut history) = self.history.lock_within(LOCK_BUDGET) else {
                return false;
            };
            if history.contains(msg.timestamp, &signature) {
                info!(euid = msg.device.euid, timestamp = msg.timestamp, "message already in history, dropped");
                return false;
            }
            history.insert(msg.timestamp, signature, self.config.history_limit);
            debug!(entries = history.len(), "history updated");
        }

        let Some(mut pending) = self.pending.lock_within(LOCK_BUDGET) else {
            return false;
        };
        pending.push_back(msg.clone());
        true
    }

    /// Messages waiting to be published.
    pub fn pending_len(&self) -> usize {
        self.pending.lock_within(LOCK_BUDGET).map_or(0, |q| q.len())
    }

    /// Publish the oldest pending message. Returns `false` when nothing was pending.
    pub fn publish_next(&self) -> bool {
        let Some(msg) = self
            .pending
            .lock_within(Duration::from_secs(1))
            .and_then(|mut q| q.pop_front())
        else {
            return false;
        };

        if let Some(tap) = &self.tap {
            if let Err(err) = tap.write(&to_csv(&msg, CsvLayout::Compact)) {
                warn!(error = %err, path = %tap.path().display(), "cannot write to geek pipe");
            }
        }
        self.publish_data(&msg);
        true
    }

    fn publish_data(&self, msg: &Message) {
        let topic = &self.config.data_topic;
        let qos = self.config.qos;
        self.publish(topic, &to_csv(msg, CsvLayout::Full), qos);
        self.publish(&format!("{topic}/csv"), &to_csv(msg, CsvLayout::Compact), qos);
        match self.codec.encode(msg, Correlation::NONE) {
            Ok(xml) => self.publish(&format!("{topic}/xml"), &xml, qos),
            Err(err) => warn!(error = %err, "cannot encode message for xml topic"),
        }
    }

    fn publish(&self, topic: &str, payload: &str, qos: u8) {
        match self.bus.publish(topic, payload, qos) {
            Ok(()) => debug!(bus = self.bus.name(), topic, qos, "published"),
            Err(err) => warn!(bus = self.bus.name(), topic, error = %err, "publish failed"),
        }
    }

    /// Announce a service notice.
    pub fn publish_info(&self, text: &str) {
        self.publish(SERVICE_TOPIC, text, self.config.qos);
    }

    /// Announce a failure notice.
    pub fn publish_error(&self, text: &str) {
        self.publish(FAILURE_TOPIC, text, self.config.qos);
    }

    /// Drain pending messages at the configured cadence until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        info!(cadence_ms = self.config.cadence.as_millis() as u64, "distributor running");
        let mut cadence = Cadence::new(self.config.cadence);
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = cadence.tick() => {
                    self.publish_next();
                }
            }
        }
        info!(left = self.pending_len(), "distributor stopped");
    }
}
