//! ---
//! gw_section: "01-core-functionality"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Aggregator wiring cache, link, distributor and device modules."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use adagw_common::{
    is_valid_timestamp, AppConfig, Cadence, Clock, GatewayConfig, LinkKind, Shutdown,
};
use adagw_messaging::{MessageBus, MessageDistributor};
use adagw_msg::{CmdParams, Command, EnvelopeCodec, GatewayIdentity, Message, XmlCodec};
use adagw_net::{connector_from_config, CommandRouter, CorrelatedLink, ServerLink, SynchronousLink};
use adagw_persistence::{CacheOptions, PriorityCache};
use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DeviceModule, Dispatch, Dispatcher};
use crate::monitor::TimeValidityMonitor;
use crate::parameters::{ParamOutcome, Parameters};

const CACHE_LOCK_BUDGET: Duration = Duration::from_secs(1);

/// Identity stamped on every message the gateway originates.
pub fn gateway_identity(config: &GatewayConfig) -> GatewayIdentity {
    GatewayIdentity {
        adapter_id: config.adapter_id.clone(),
        fw_version: config.fw_version.clone(),
        protocol_version: config.protocol_version.clone(),
    }
}

/// Loop timings and reported gateway type.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub drain_interval: Duration,
    pub monitor_poll: Duration,
    pub gateway_type: String,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_secs(2),
            monitor_poll: Duration::from_secs(1),
            gateway_type: "other".to_owned(),
        }
    }
}

impl AggregatorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            drain_interval: config.cache.drain_interval,
            gateway_type: config.gateway.gateway_type.clone(),
            ..Self::default()
        }
    }
}

/// Collaborators the aggregator is assembled from.
pub struct AggregatorParts {
    pub identity: GatewayIdentity,
    pub clock: Arc<dyn Clock>,
    pub cache: Arc<PriorityCache>,
    pub link: Arc<dyn ServerLink>,
    pub distributor: Option<Arc<MessageDistributor>>,
    pub settings: AggregatorSettings,
}

/// Result of [`AggregatorHandle::send_data`].
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub delivered: bool,
    /// Server answer; an error command when nothing was delivered.
    pub command: Command,
}

impl SendOutcome {
    fn failed() -> Self {
        Self {
            delivered: false,
            command: Command::error(),
        }
    }
}

struct Inner {
    identity: GatewayIdentity,
    clock: Arc<dyn Clock>,
    cache: Arc<PriorityCache>,
    link: Arc<dyn ServerLink>,
    distributor: Option<Arc<MessageDistributor>>,
    monitor: Arc<TimeValidityMonitor>,
    dispatcher: Dispatcher,
    parameters: Parameters,
    settings: AggregatorSettings,
}

/// Owns the delivery path: every message goes to the server link, falls
/// back to the priority cache and is mirrored to the distributor.
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    pub fn new(parts: AggregatorParts) -> Self {
        let monitor = Arc::new(
            TimeValidityMonitor::new(parts.clock.clone(), parts.cache.clone())
                .with_poll_interval(parts.settings.monitor_poll),
        );
        let parameters = Parameters::new(
            parts.identity.clone(),
            parts.settings.gateway_type.clone(),
            parts.clock.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                identity: parts.identity,
                clock: parts.clock,
                cache: parts.cache,
                link: parts.link,
                distributor: parts.distributor,
                monitor,
                dispatcher: Dispatcher::new(),
                parameters,
                settings: parts.settings,
            }),
        }
    }

    /// Assemble the whole core from configuration.
    ///
    /// Fails on an unusable TLS setup; the server does not need to be
    /// reachable.
    pub fn from_config(
        config: &AppConfig,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let identity = gateway_identity(&config.gateway);
        let codec: Arc<dyn EnvelopeCodec> = Arc::new(XmlCodec::new());
        let connector = connector_from_config(&config.server).with_context(|| {
            format!(
                "failed to prepare connection to {}:{}",
                config.server.host, config.server.port
            )
        })?;
        let link: Arc<dyn ServerLink> = match config.server.link {
            LinkKind::Synchronous => Arc::new(SynchronousLink::new(
                config.server.clone(),
                connector,
                codec.clone(),
                identity.clone(),
                clock.clone(),
            )),
            LinkKind::Correlated => Arc::new(CorrelatedLink::new(
                config.server.clone(),
                connector,
                codec.clone(),
                identity.clone(),
                clock.clone(),
            )),
        };

        let distributor = config.distributor.enabled.then(|| {
            Arc::new(MessageDistributor::new(
                config.distributor.clone(),
                bus,
                codec.clone(),
            ))
        });
        let mut cache = PriorityCache::new(CacheOptions::from_config(&config.cache), &identity);
        if let Some(distributor) = &distributor {
            cache = cache.with_encoder(distributor.record_encoder());
        }

        Ok(Self::new(AggregatorParts {
            identity,
            clock,
            cache: Arc::new(cache),
            link,
            distributor,
            settings: AggregatorSettings::from_config(config),
        }))
    }

    /// Non-owning handle for device modules and server links.
    pub fn handle(&self) -> AggregatorHandle {
        AggregatorHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn register_module(&self, module: Arc<dyn DeviceModule>) {
        self.inner.dispatcher.register(module);
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn parameters(&self) -> &Parameters {
        &self.inner.parameters
    }

    pub fn cache(&self) -> &Arc<PriorityCache> {
        &self.inner.cache
    }

    pub fn monitor(&self) -> &Arc<TimeValidityMonitor> {
        &self.inner.monitor
    }

    pub fn identity(&self) -> &GatewayIdentity {
        &self.inner.identity
    }

    pub async fn send_data(&self, msg: Message) -> SendOutcome {
        self.inner.send_data(msg).await
    }

    /// Spawn the link, the distributor and the cache drain loop.
    pub fn start(&self, shutdown: Shutdown) -> AggregatorTasks {
        let inner = &self.inner;
        let mut tasks = Vec::new();

        let router: Arc<dyn CommandRouter> = Arc::new(self.handle());
        tasks.push((
            "link",
            tokio::spawn(inner.link.clone().run(router, shutdown.clone())),
        ));
        if let Some(distributor) = &inner.distributor {
            tasks.push((
                "distributor",
                tokio::spawn(distributor.clone().run(shutdown.clone())),
            ));
        }
        tasks.push(("drain", tokio::spawn(drain_loop(inner.clone(), shutdown))));

        info!(
            link = inner.link.name(),
            adapter_id = %inner.identity.adapter_id,
            distributor = inner.distributor.is_some(),
            "aggregator started"
        );
        AggregatorTasks { tasks }
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("identity", &self.inner.identity)
            .field("link", &self.inner.link.name())
            .field("cache", &self.inner.cache)
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}

/// Running aggregator tasks.
#[derive(Debug)]
pub struct AggregatorTasks {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl AggregatorTasks {
    /// Wait for every task; call after the shutdown trigger fired.
    pub async fn join(self) {
        for (name, task) in self.tasks {
            if let Err(err) = task.await {
                error!(task = name, error = %err, "aggregator task join error");
            }
        }
        info!("aggregator stopped");
    }
}

impl Inner {
    async fn send_data(&self, mut msg: Message) -> SendOutcome {
        let mut outcome = SendOutcome::failed();
        let sendable = is_valid_timestamp(msg.timestamp);
        if sendable {
            match self.link.deliver(&msg).await {
                Ok(command) => {
                    outcome = SendOutcome {
                        delivered: true,
                        command,
                    }
                }
                Err(err) => warn!(link = self.link.name(), error = %err, "delivery failed"),
            }
        } else {
            msg.valid = false;
            msg.offset = self.monitor.offset();
        }

        if !outcome.delivered && msg.is_data() {
            if sendable {
                warn!(timestamp = msg.timestamp, euid = msg.device.euid, "message not delivered, cached");
            } else {
                warn!(timestamp = msg.timestamp, offset = msg.offset, "timestamp not valid, message cached");
            }
            if !self.cache.enqueue(msg.clone()) {
                error!(euid = msg.device.euid, "message lost, cache unavailable");
            }
        }

        if let Some(distributor) = &self.distributor {
            distributor.add_message(&msg);
        }
        outcome
    }

    /// Start a blackout monitor the first time the clock is seen invalid.
    fn watch_clock(&self, shutdown: &Shutdown) -> Option<JoinHandle<()>> {
        if self.clock.is_valid() || !self.monitor.begin_blackout() {
            return None;
        }
        let task = tokio::spawn(self.monitor.clone().run(shutdown.clone()));
        if !self.cache.is_empty() {
            if let Err(err) = self.cache.persist() {
                warn!(error = %err, "cache store at blackout start failed");
            }
        }
        Some(task)
    }

    fn store_on_shutdown(&self) {
        match self.cache.snapshot() {
            Some(entries) if entries.is_empty() => {
                if let Err(err) = self.cache.clear_backing_file() {
                    warn!(error = %err, "cannot remove cache file");
                }
            }
            Some(entries) => match self.cache.persist() {
                Ok(stored) => info!(stored, "cache stored on shutdown"),
                Err(err) => error!(error = %err, pending = entries.len(), "cache not stored on shutdown"),
            },
            None => error!("cache busy at shutdown, not stored"),
        }
    }
}

async fn drain_loop(inner: Arc<Inner>, mut shutdown: Shutdown) {
    match inner.cache.reload(inner.clock.as_ref()) {
        Ok(restored) => debug!(restored, "cache reload finished"),
        Err(err) => warn!(error = %err, path = %inner.cache.path().display(), "cache reload failed"),
    }

    let mut cadence = Cadence::new(inner.settings.drain_interval);
    let mut monitor_task: Option<JoinHandle<()>> = None;
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = cadence.tick() => {}
        }
        if let Some(task) = inner.watch_clock(&shutdown) {
            monitor_task = Some(task);
        }
        // A delivery in progress is not cancelled by shutdown: the message
        // is already out of the cache and is re-cached if it fails.
        if let Some(msg) = inner.cache.drain_tick(CACHE_LOCK_BUDGET) {
            debug!(euid = msg.device.euid, priority = ?msg.priority, "resending cached message");
            inner.send_data(msg).await;
        }
    }

    if let Some(task) = monitor_task {
        if let Err(err) = task.await {
            error!(error = %err, "time monitor join error");
        }
    }
    inner.store_on_shutdown();
}

/// Non-owning handle to the aggregator.
///
/// Device modules submit readings and parameter requests through it; server
/// links route pushed commands through its [`CommandRouter`] impl. Calls
/// after the aggregator is dropped fail quietly.
#[derive(Clone, Debug)]
pub struct AggregatorHandle {
    inner: Weak<Inner>,
}

impl AggregatorHandle {
    /// Deliver `msg`, caching sensor data the server did not take.
    pub async fn send_data(&self, msg: Message) -> SendOutcome {
        match self.inner.upgrade() {
            Some(inner) => inner.send_data(msg).await,
            None => {
                warn!("aggregator gone, message dropped");
                SendOutcome::failed()
            }
        }
    }

    /// Ask the server for a gateway parameter (ids 1000..=1999).
    ///
    /// Returns the server's parameter block, or `params` unchanged when the
    /// id is out of range or the server did not answer.
    pub async fn ask_server(&self, params: CmdParams) -> CmdParams {
        let Some(inner) = self.inner.upgrade() else {
            return params;
        };
        let Some(request) = inner.parameters.request(params.clone()) else {
            return params;
        };
        let outcome = inner.send_data(request).await;
        inner
            .parameters
            .answer(params, outcome.delivered, outcome.command)
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl CommandRouter for AggregatorHandle {
    fn route(&self, command: Command) {
        let Some(inner) = self.inner.upgrade() else {
            debug!("aggregator gone, command dropped");
            return;
        };
        info!(state = %command.state, euid = command.euid, "command from server");
        if inner.dispatcher.dispatch(&command) != Dispatch::Parameters {
            return;
        }
        if let ParamOutcome::Reply(reply) = inner.parameters.handle_command(&command) {
            tokio::spawn(async move {
                let outcome = inner.send_data(reply).await;
                debug!(delivered = outcome.delivered, "parameter reply sent");
            });
        }
    }
}
