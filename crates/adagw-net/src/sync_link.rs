//! ---
//! gw_section: "04-networking-transport"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Request/response link with a dedicated receive connection."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::sync::Arc;

use adagw_common::{Clock, ServerConfig, Shutdown};
use adagw_msg::{Command, Correlation, EnvelopeCodec, GatewayIdentity, Message};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::connector::{Connector, LinkStream};
use crate::framing::{read_frame, write_frame, FrameSplitter};
use crate::link::{CommandRouter, ServerLink};
use crate::{LinkError, Result};

const READ_CHUNK: usize = 4096;

/// One connection per delivery plus a long-lived connection for server pushes.
///
/// Received frames go through a bounded queue to a worker that decodes and
/// routes them, so slow command handling never stalls the socket.
pub struct SynchronousLink {
    server: ServerConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn EnvelopeCodec>,
    identity: GatewayIdentity,
    clock: Arc<dyn Clock>,
}

impl SynchronousLink {
    /// Build the link; nothing connects until `deliver` or `run` is called.
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
        }
    }

    /// Connect and register; bytes received after the registration reply
    /// stay in the returned splitter.
    async fn open_receiver(&self) -> Result<(Box<dyn LinkStream>, FrameSplitter)> {
        let mut stream = self.connector.connect().await?;
        let register = Message::registration(&self.identity, self.clock.unix_now());
        let envelope = self.codec.encode(&register, Correlation::NONE)?;
        write_frame(&mut stream, &envelope, self.server.timeout).await?;
        let mut splitter = FrameSplitter::new();
        let reply = read_frame(&mut stream, &mut splitter, self.server.timeout).await?;
        debug!(reply = %reply, "registration answered");
        Ok((stream, splitter))
    }

    /// Read frames until the connection fails or shutdown is requested.
    async fn pump(
        &self,
        stream: &mut Box<dyn LinkStream>,
        splitter: &mut FrameSplitter,
        queue: &mpsc::Sender<String>,
        shutdown: &mut Shutdown,
    ) -> Result<()> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            while let Some(frame) = splitter.next_frame() {
                debug!(frame = %frame, "incoming message");
                match queue.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!("receive queue full, frame dropped"),
                    Err(TrySendError::Closed(_)) => return Err(LinkError::Disconnected),
                }
            }
            let read = tokio::select! {
                _ = shutdown.triggered() => return Ok(()),
                read = timeout(self.server.receive_timeout, stream.read(&mut buf)) => read,
            };
            // A receive timeout only gives the shutdown check a chance to run.
            let n = match read {
                Err(_) => continue,
                Ok(result) => result?,
            };
            if n == 0 {
                return Err(LinkError::Disconnected);
            }
            splitter.extend(&buf[..n])?;
        }
    }
}

async fn route_frames(
    mut queue: mpsc::Receiver<String>,
    codec: Arc<dyn EnvelopeCodec>,
    router: Arc<dyn CommandRouter>,
) {
    while let Some(frame) = queue.recv().await {
        let inbound = codec.decode_lossy(&frame);
        router.route(inbound.command);
    }
}

#[async_trait]
impl ServerLink for SynchronousLink {
    fn name(&self) -> &'static str {
        "synchronous"
    }

    async fn deliver(&self, msg: &Message) -> Result<Command> {
        let envelope = self.codec.encode(msg, Correlation::NONE)?;
        let mut stream = self.connector.connect().await?;
        write_frame(&mut stream, &envelope, self.server.timeout).await?;
        let reply = read_frame(&mut stream, &mut FrameSplitter::new(), self.server.timeout).await?;
        Ok(self.codec.decode_lossy(&reply).command)
    }

    async fn run(self: Arc<Self>, router: Arc<dyn CommandRouter>, mut shutdown: Shutdown) {
        info!(server = %self.connector.authority(), "synchronous link receive loop starting");
        let (tx, rx) = mpsc::channel(self.server.receive_queue_capacity.max(1));
        let worker = tokio::spawn(route_frames(rx, self.codec.clone(), router));

        while !shutdown.is_triggered() {
            match self.open_receiver().await {
                Ok((mut stream, mut splitter)) => {
                    info!(server = %self.connector.authority(), "receive connection established");
                    match self.pump(&mut stream, &mut splitter, &tx, &mut shutdown).await {
                        Ok(()) => break,
                        Err(err) => warn!(error = %err, "receive connection lost"),
                    }
                }
                Err(err) => warn!(error = %err, "cannot open receive connection"),
            }
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = sleep(self.server.reconnect_delay) => {}
            }
        }

        drop(tx);
        if let Err(err) = worker.await {
            warn!(error = %err, "receive worker ended abnormally");
        }
        info!("synchronous link stopped");
    }
}
