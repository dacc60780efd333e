//! ---
//! gw_section: "04-networking-transport"
//! gw_subsection: "tests"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Shared fixtures for the link integration tests."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use adagw_common::{ManualClock, ServerConfig};
use adagw_msg::{Command, DeviceReading, GatewayIdentity, Message, ModuleValue};
use adagw_net::{CommandRouter, TcpConnector};
use parking_lot::Mutex;

pub fn identity() -> GatewayIdentity {
    GatewayIdentity {
        adapter_id: "0x42".into(),
        fw_version: "1.0".into(),
        protocol_version: "1.1".into(),
    }
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(1_700_000_000))
}

pub fn server_config() -> ServerConfig {
    let mut server = ServerConfig::default();
    server.tls.enabled = false;
    server.timeout = Duration::from_secs(2);
    server.receive_timeout = Duration::from_millis(100);
    server.reconnect_delay = Duration::from_millis(50);
    server.response_poll_interval = Duration::from_millis(20);
    server.response_attempts = 100;
    server
}

pub fn connector(addr: SocketAddr) -> Arc<TcpConnector> {
    Arc::new(TcpConnector::new(addr.to_string(), Duration::from_secs(2)))
}

pub fn reading() -> Message {
    Message::data(
        &identity(),
        1_700_000_000,
        DeviceReading {
            euid: 0x55,
            device_type_id: 2,
            version: 1,
            name: None,
            values: vec![ModuleValue::new(1, 22.5)],
        },
    )
}

/// Router that records every command.
#[derive(Default)]
pub struct Recorder {
    commands: Mutex<Vec<Command>>,
}

impl Recorder {
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.commands.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("commands routed in time");
    }
}

impl CommandRouter for Recorder {
    fn route(&self, command: Command) {
        self.commands.lock().push(command);
    }
}

/// Numeric value of `name="..."` in an envelope.
pub fn attribute(xml: &str, name: &str) -> u64 {
    let key = format!("{name}=\"");
    let start = xml.find(&key).expect("attribute present") + key.len();
    let end = start + xml[start..].find('"').expect("attribute closed");
    xml[start..end].parse().expect("numeric attribute")
}
