//! ---
//! gw_section: "04-networking-transport"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Contract shared by the server links."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::sync::Arc;

use adagw_common::Shutdown;
use adagw_msg::{Command, Message};
use async_trait::async_trait;

use crate::Result;

/// Receives commands pushed by the server.
pub trait CommandRouter: Send + Sync {
    /// Hand `command` to whoever owns its target device.
    fn route(&self, command: Command);
}

/// Bidirectional connection to the gateway server.
///
/// `deliver` may be called from any task while `run` is active. A failed
/// delivery always surfaces as `Err` so the caller can cache the message.
#[async_trait]
pub trait ServerLink: Send + Sync {
    /// Human-readable link name for logging.
    fn name(&self) -> &'static str;

    /// Send `msg` and wait for the server's answer.
    async fn deliver(&self, msg: &Message) -> Result<Command>;

    /// Own the long-lived connection until shutdown, routing server pushes.
    async fn run(self: Arc<Self>, router: Arc<dyn CommandRouter>, shutdown: Shutdown);
}
