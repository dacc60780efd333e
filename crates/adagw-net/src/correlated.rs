//! ---
//! gw_section: "04-networking-transport"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Full-duplex WebSocket link with request/response correlation."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adagw_common::{Clock, ServerConfig, Shutdown, TimedMutex};
use adagw_msg::{Command, Correlation, EnvelopeCodec, GatewayIdentity, Message};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::connector::{Connector, LinkStream};
use crate::framing::FRAME_DELIMITER;
use crate::link::{CommandRouter, ServerLink};
use crate::{LinkError, Result};

const LOCK_BUDGET: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<Box<dyn LinkStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Single WebSocket carrying both gateway requests and server pushes.
///
/// Every delivery is tagged with a fresh request id and waits for a frame
/// whose `response_id` matches. Server pushes carry a `request_id` and are
/// acknowledged before they are routed.
pub struct CorrelatedLink {
    server: ServerConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn EnvelopeCodec>,
    identity: GatewayIdentity,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    /// Request id to submission instant.
    pending: TimedMutex<HashMap<u64, Instant>>,
    responses: TimedMutex<HashMap<u64, Command>>,
    sink: AsyncMutex<Option<WsSink>>,
}

impl CorrelatedLink {
    /// Build the link; it is disconnected until `run` establishes the socket.
    pub fn new(
        server: ServerConfig,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn EnvelopeCodec>,
        identity: GatewayIdentity,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            server,
            connector,
            codec,
            identity,
            clock,
            next_id: AtomicU64::new(1),
            pending: TimedMutex::new("correlated-pending", HashMap::new()),
            responses: TimedMutex::new("correlated-responses", HashMap::new()),
            sink: AsyncMutex::new(None),
        }
    }

    fn url(&self) -> String {
        let scheme = if self.connector.is_secure() { "wss" } else { "ws" };
        let uri = self.server.uri.trim_start_matches('/');
        format!("{scheme}://{}/{uri}", self.connector.authority())
    }

    fn next_request_id(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock_within(LOCK_BUDGET).map_or(0, |p| p.len())
    }

    /// Whether the socket is currently established.
    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    fn register_pending(&self, id: u64) -> Result<()> {
        let mut pending = self
            .pending
            .lock_within(LOCK_BUDGET)
            .ok_or(LinkError::Timeout { operation: "register request" })?;
        pending.insert(id, Instant::now());
        Ok(())
    }

    /// Collect the response for `id`, clearing its pending entry when found.
    fn take_response(&self, id: u64) -> Option<Command> {
        let mut pending = self.pending.lock_within(LOCK_BUDGET)?;
        let command = self.responses.lock_within(LOCK_BUDGET)?.remove(&id)?;
        pending.remove(&id);
        Some(command)
    }

    fn revoke(&self, id: u64) {
        let Some(mut pending) = self.pending.lock_within(LOCK_BUDGET) else {
            return;
        };
        if let Some(created) = pending.remove(&id) {
            debug!(request_id = id, waited_ms = created.elapsed().as_millis() as u64, "request revoked");
        }
        if let Some(mut responses) = self.responses.lock_within(LOCK_BUDGET) {
            responses.remove(&id);
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut guard = timeout(self.server.timeout, self.sink.lock())
            .await
            .map_err(|_| LinkError::Timeout { operation: "acquire socket" })?;
        let sink = guard.as_mut().ok_or(LinkError::Disconnected)?;
        timeout(self.server.timeout, sink.send(WsMessage::Text(text)))
            .await
            .map_err(|_| LinkError::Timeout { operation: "send frame" })??;
        Ok(())
    }

    async fn connect(&self) -> Result<WsSource> {
        let stream = self.connector.connect().await?;
        let url = self.url();
        let (ws, _) = timeout(self.server.timeout, client_async(url.as_str(), stream))
            .await
            .map_err(|_| LinkError::Timeout { operation: "websocket handshake" })??;
        let (sink, source) = ws.split();
        *self.sink.lock().await = Some(sink);
        info!(url = %url, "websocket connected");

        let register = Message::registration(&self.identity, self.clock.unix_now());
        self.send_text(self.codec.encode(&register, Correlation::NONE)?).await?;
        Ok(source)
    }

    /// Classify one envelope: store a response, acknowledge and route a push,
    /// or drop anything else.
    async fn accept(&self, frame: &str, router: &dyn CommandRouter) {
        let inbound = self.codec.decode_lossy(frame);
        match inbound.correlation {
            Correlation { response_id: Some(id), .. } => self.store_response(id, inbound.command),
            Correlation { request_id: Some(id), .. } => {
                let ack = Message::ack(&self.identity, self.clock.unix_now());
                match self.codec.encode(&ack, Correlation::response(id)) {
                    Ok(envelope) => {
                        if let Err(err) = self.send_text(envelope).await {
                            warn!(request_id = id, error = %err, "acknowledgement not sent");
                        }
                    }
                    Err(err) => warn!(request_id = id, error = %err, "cannot encode acknowledgement"),
                }
                router.route(inbound.command);
            }
            _ => warn!("received message with neither response_id nor request_id"),
        }
    }

    fn store_response(&self, id: u64, command: Command) {
        let Some(pending) = self.pending.lock_within(LOCK_BUDGET) else {
            return;
        };
        if !pending.contains_key(&id) {
            debug!(response_id = id, "response for unknown or expired request dropped");
            return;
        }
        if let Some(mut responses) = self.responses.lock_within(LOCK_BUDGET) {
            responses.insert(id, command);
            debug!(response_id = id, total = responses.len(), "response stored");
        }
    }

    async fn receive(
        &self,
        source: &mut WsSource,
        router: &dyn CommandRouter,
        shutdown: &mut Shutdown,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = shutdown.triggered() => return Ok(()),
                next = source.next() => next,
            };
            let payload = match next {
                None | Some(Ok(WsMessage::Close(_))) => return Err(LinkError::Disconnected),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                Some(Ok(_)) => continue,
            };
            // One WebSocket message may hold several delimited envelopes.
            for frame in payload
                .split(char::from(FRAME_DELIMITER))
                .filter(|f| !f.trim().is_empty())
            {
                self.accept(frame, router).await;
            }
        }
    }
}

#[async_trait]
impl ServerLink for CorrelatedLink {
    fn name(&self) -> &'static str {
        "correlated"
    }

    async fn deliver(&self, msg: &Message) -> Result<Command> {
        let id = self.next_request_id();
        let envelope = self.codec.encode(msg, Correlation::request(id))?;
        self.register_pending(id)?;
        if let Err(err) = self.send_text(envelope).await {
            self.revoke(id);
            return Err(err);
        }

        for _ in 0..self.server.response_attempts {
            sleep(self.server.response_poll_interval).await;
            if let Some(command) = self.take_response(id) {
                return Ok(command);
            }
        }
        // A response may have landed after the last poll.
        if let Some(command) = self.take_response(id) {
            return Ok(command);
        }
        self.revoke(id);
        Err(LinkError::NoResponse { request_id: id })
    }

    async fn run(self: Arc<Self>, router: Arc<dyn CommandRouter>, mut shutdown: Shutdown) {
        info!(url = %self.url(), "correlated link starting");
        while !shutdown.is_triggered() {
            match self.connect().await {
                Ok(mut source) => match self.receive(&mut source, router.as_ref(), &mut shutdown).await {
                    Ok(()) => {}
                    Err(err) => warn!(error = %err, "websocket connection lost"),
                },
                Err(err) => warn!(error = %err, "cannot connect websocket"),
            }
            if let Some(mut sink) = self.sink.lock().await.take() {
                let _ = sink.close().await;
            }
            if shutdown.is_triggered() {
                break;
            }
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = sleep(self.server.reconnect_delay) => {}
            }
        }
        info!("correlated link stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::TcpConnector;
    use adagw_common::ManualClock;
    use adagw_msg::XmlCodec;

    fn link() -> CorrelatedLink {
        CorrelatedLink::new(
            ServerConfig::default(),
            Arc::new(TcpConnector::new("localhost:9092", Duration::from_secs(1))),
            Arc::new(XmlCodec::new()),
            GatewayIdentity {
                adapter_id: "0x1".into(),
                fw_version: "1".into(),
                protocol_version: "1.1".into(),
            },
            Arc::new(ManualClock::new(1_700_000_000)),
        )
    }

    #[test]
    fn request_ids_skip_zero() {
        let link = link();
        assert_eq!(link.next_request_id(), 1);
        link.next_id.store(u64::MAX, Ordering::Relaxed);
        assert_eq!(link.next_request_id(), u64::MAX);
        assert_eq!(link.next_request_id(), 1);
    }

    #[test]
    fn url_joins_uri() {
        assert_eq!(link().url(), "ws://localhost:9092/");
    }

    #[test]
    fn stale_response_leaves_state_untouched() {
        let link = link();
        link.store_response(7, Command::error());
        assert!(link.take_response(7).is_none());
        assert_eq!(link.pending_requests(), 0);

        link.register_pending(8).unwrap();
        link.store_response(8, Command::error());
        assert!(link.take_response(8).is_some());
        assert_eq!(link.pending_requests(), 0);
    }

    #[tokio::test]
    async fn deliver_fails_fast_while_disconnected() {
        let link = link();
        let err = link.deliver(&Message::default()).await.unwrap_err();
        assert!(matches!(err, LinkError::Disconnected));
        assert_eq!(link.pending_requests(), 0);
    }
}
