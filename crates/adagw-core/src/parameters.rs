//! ---
//! gw_section: "01-core-functionality"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Parameter exchange between gateway and server."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::net::Ipv4Addr;
use std::sync::Arc;

use adagw_common::Clock;
use adagw_msg::{CmdParams, Command, CommandState, GatewayIdentity, Message, MessageState, Priority};
use nix::net::if_::InterfaceFlags;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

/// Oldest server protocol that speaks parameters.
const MIN_PROTOCOL: f32 = 1.1;

/// Gateway-initiated parameter ids.
pub const GATEWAY_PARAMS: std::ops::RangeInclusive<i32> = 1000..=1999;

pub const PARAM_PING: i32 = 1000;
pub const PARAM_DEVICE_NAME: i32 = 1001;
pub const PARAM_DEVICE_ROOM: i32 = 1002;
pub const PARAM_ALL_DEVICES: i32 = 1003;
pub const PARAM_DEVICE_CREDENTIALS: i32 = 1004;
pub const PARAM_LAST_VALUE: i32 = 1005;

pub const SERVER_PING: i32 = 2000;
pub const SERVER_LOCAL_IPS: i32 = 2001;
pub const SERVER_GATEWAY_TYPE: i32 = 2002;

/// What a server parameter command amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamOutcome {
    /// Answer to send back through the aggregator.
    Reply(Message),
    /// Information consumed locally.
    Handled,
    /// Parameter id or state this gateway does not serve.
    Unsupported,
    /// Server protocol too old.
    Rejected,
}

/// Serves `getparameters` requests from the server, consumes its
/// `parameters` pushes and builds the gateway's own requests.
#[derive(Debug)]
pub struct Parameters {
    identity: GatewayIdentity,
    gateway_type: String,
    clock: Arc<dyn Clock>,
    /// `(euid, name)` pairs last announced by the server.
    devices: RwLock<Vec<(String, String)>>,
}

impl Parameters {
    pub fn new(identity: GatewayIdentity, gateway_type: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            identity,
            gateway_type: gateway_type.into(),
            clock,
            devices: RwLock::new(Vec::new()),
        }
    }

    pub fn known_devices(&self) -> Vec<(String, String)> {
        self.devices.read().clone()
    }

    /// Handle a `getparameters` or `parameters` command from the server.
    pub fn handle_command(&self, command: &Command) -> ParamOutcome {
        if command.protocol_number() < MIN_PROTOCOL {
            warn!(protocol = %command.protocol_version, "parameter command from pre-1.1 server ignored");
            return ParamOutcome::Rejected;
        }
        match command.state {
            CommandState::GetParameters => self.answer_request(&command.params),
            CommandState::Parameters => self.consume_push(&command.params),
            _ => ParamOutcome::Unsupported,
        }
    }

    fn answer_request(&self, request: &CmdParams) -> ParamOutcome {
        let mut params = request.clone();
        match request.param_id {
            SERVER_PING => {
                debug!("server ping");
                params.values.push((String::new(), String::new()));
            }
            SERVER_LOCAL_IPS => match local_ipv4_addresses() {
                Ok(addresses) => {
                    info!(count = addresses.len(), "reporting local addresses");
                    params
                        .values
                        .extend(addresses.into_iter().map(|ip| (ip, String::new())));
                }
                Err(err) => warn!(error = %err, "cannot list network interfaces"),
            },
            SERVER_GATEWAY_TYPE => {
                params.values.push((self.gateway_type.clone(), String::new()));
            }
            other => {
                warn!(param_id = other, "unsupported getparameters request");
                return ParamOutcome::Unsupported;
            }
        }
        ParamOutcome::Reply(self.message(MessageState::Parameters, params))
    }

    fn consume_push(&self, params: &CmdParams) -> ParamOutcome {
        match params.param_id {
            PARAM_PING => info!("server ping"),
            PARAM_DEVICE_NAME | PARAM_DEVICE_ROOM | PARAM_DEVICE_CREDENTIALS => log_values(params),
            PARAM_ALL_DEVICES => {
                log_values(params);
                *self.devices.write() = params.values.clone();
                info!(devices = params.values.len(), "device list refreshed");
            }
            other => {
                warn!(param_id = other, "unsupported parameters push");
                return ParamOutcome::Unsupported;
            }
        }
        ParamOutcome::Handled
    }

    /// Build a gateway request, `None` when `params.param_id` is outside 1000..=1999.
    pub fn request(&self, params: CmdParams) -> Option<Message> {
        if !GATEWAY_PARAMS.contains(&params.param_id) {
            error!(param_id = params.param_id, "gateway request with wrong param_id");
            return None;
        }
        info!(param_id = params.param_id, "asking the server");
        Some(self.message(MessageState::GetParameters, params))
    }

    /// Interpret the server answer to [`Parameters::request`]; the original
    /// request comes back unchanged on failure.
    pub fn answer(&self, request: CmdParams, delivered: bool, reply: Command) -> CmdParams {
        if delivered && reply.state == CommandState::Parameters {
            log_values(&reply.params);
            return reply.params;
        }
        info!(param_id = request.param_id, "server did not answer the request");
        request
    }

    fn message(&self, state: MessageState, params: CmdParams) -> Message {
        Message {
            state,
            priority: Priority::Param,
            timestamp: self.clock.unix_now(),
            params,
            ..Message::from_identity(&self.identity)
        }
    }
}

fn log_values(params: &CmdParams) {
    info!(param_id = params.param_id, euid = params.euid, "parameters from server");
    for (value, device) in &params.values {
        debug!(value = %value, device = %device, "parameter value");
    }
}

/// IPv4 addresses of the interfaces that are up, loopback excluded, each once.
pub fn local_ipv4_addresses() -> nix::Result<Vec<String>> {
    let mut addresses: Vec<String> = Vec::new();
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            continue;
        }
        let Some(ip) = ifaddr
            .address
            .as_ref()
            .and_then(|addr| addr.as_sockaddr_in())
            .map(|sin| Ipv4Addr::from(sin.ip()))
        else {
            continue;
        };
        if ip.is_loopback() {
            continue;
        }
        let ip = ip.to_string();
        if !addresses.contains(&ip) {
            addresses.push(ip);
        }
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adagw_common::ManualClock;

    fn parameters() -> Parameters {
        Parameters::new(
            GatewayIdentity {
                adapter_id: "0x20".into(),
                fw_version: "1.0".into(),
                protocol_version: "1.1".into(),
            },
            "rpi",
            Arc::new(ManualClock::new(1_700_000_000)),
        )
    }

    fn command(state: CommandState, param_id: i32) -> Command {
        Command {
            protocol_version: "1.1".into(),
            state,
            params: CmdParams {
                param_id,
                ..CmdParams::default()
            },
            ..Command::default()
        }
    }

    #[test]
    fn gateway_type_request_is_answered() {
        let ParamOutcome::Reply(reply) =
            parameters().handle_command(&command(CommandState::GetParameters, SERVER_GATEWAY_TYPE))
        else {
            panic!("expected a reply");
        };
        assert_eq!(reply.state, MessageState::Parameters);
        assert_eq!(reply.priority, Priority::Param);
        assert_eq!(reply.timestamp, 1_700_000_000);
        assert_eq!(reply.params.param_id, SERVER_GATEWAY_TYPE);
        assert_eq!(reply.params.values, vec![("rpi".to_owned(), String::new())]);
    }

    #[test]
    fn ping_gets_an_empty_value() {
        let ParamOutcome::Reply(reply) =
            parameters().handle_command(&command(CommandState::GetParameters, SERVER_PING))
        else {
            panic!("expected a reply");
        };
        assert_eq!(reply.params.values, vec![(String::new(), String::new())]);
    }

    #[test]
    fn old_protocol_is_rejected() {
        let mut old = command(CommandState::GetParameters, SERVER_PING);
        old.protocol_version = "1.0".into();
        assert_eq!(parameters().handle_command(&old), ParamOutcome::Rejected);
        old.protocol_version.clear();
        assert_eq!(parameters().handle_command(&old), ParamOutcome::Rejected);
    }

    #[test]
    fn unknown_ids_are_unsupported() {
        let params = parameters();
        assert_eq!(
            params.handle_command(&command(CommandState::GetParameters, 2999)),
            ParamOutcome::Unsupported
        );
        assert_eq!(
            params.handle_command(&command(CommandState::Parameters, 1500)),
            ParamOutcome::Unsupported
        );
    }

    #[test]
    fn device_list_push_replaces_known_devices() {
        let params = parameters();
        let mut push = command(CommandState::Parameters, PARAM_ALL_DEVICES);
        push.params.values = vec![("0x1".into(), "kitchen".into()), ("0x2".into(), "hall".into())];
        assert_eq!(params.handle_command(&push), ParamOutcome::Handled);
        assert_eq!(params.known_devices().len(), 2);

        push.params.values = vec![("0x3".into(), "attic".into())];
        params.handle_command(&push);
        assert_eq!(params.known_devices(), vec![("0x3".to_owned(), "attic".to_owned())]);
    }

    #[test]
    fn requests_outside_gateway_range_are_refused() {
        let params = parameters();
        let request = CmdParams {
            param_id: 2001,
            ..CmdParams::default()
        };
        assert!(params.request(request).is_none());

        let request = CmdParams {
            param_id: PARAM_DEVICE_NAME,
            euid: 0x55,
            ..CmdParams::default()
        };
        let msg = params.request(request.clone()).expect("valid id");
        assert_eq!(msg.state, MessageState::GetParameters);
        assert_eq!(msg.params, request);
    }

    #[test]
    fn failed_answer_returns_request() {
        let params = parameters();
        let request = CmdParams {
            param_id: PARAM_LAST_VALUE,
            ..CmdParams::default()
        };
        let mut reply = command(CommandState::Parameters, PARAM_LAST_VALUE);
        reply.params.values = vec![("21.5".into(), String::new())];

        assert_eq!(params.answer(request.clone(), false, reply.clone()), request);
        assert_eq!(params.answer(request.clone(), true, Command::error()), request);
        assert_eq!(params.answer(request, true, reply.clone()), reply.params);
    }

    #[test]
    fn local_addresses_exclude_loopback() {
        let addresses = local_ipv4_addresses().unwrap();
        assert!(addresses.iter().all(|ip| !ip.starts_with("127.")));
        let unique: std::collections::BTreeSet<_> = addresses.iter().collect();
        assert_eq!(unique.len(), addresses.len());
    }
}
