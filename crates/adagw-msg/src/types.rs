//! ---
//! gw_section: "02-messaging-ipc-data-model"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Message model shared by device modules, cache and server links."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CodecError;

/// 64-bit globally unique end-device identifier.
pub type Euid = u64;

/// Delivery priority; higher ranks leave the cache first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Replayed historical readings.
    History,
    /// Regular sensor data.
    #[default]
    Sensor,
    /// Parameter exchange with the server.
    Param,
    /// Actuator state reports.
    Actuator,
    /// Gateway registration.
    Registration,
}

impl Priority {
    /// Numeric rank used on the wire and in the cache file.
    pub fn rank(self) -> u8 {
        match self {
            Priority::History => 0,
            Priority::Sensor => 1,
            Priority::Param => 2,
            Priority::Actuator => 3,
            Priority::Registration => 6,
        }
    }

    /// Inverse of [`Priority::rank`].
    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Priority::History),
            1 => Some(Priority::Sensor),
            2 => Some(Priority::Param),
            3 => Some(Priority::Actuator),
            6 => Some(Priority::Registration),
            _ => None,
        }
    }
}

/// State carried by a gateway-to-server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Sensor readings.
    #[default]
    Data,
    /// Gateway announces itself after (re)connecting.
    Register,
    /// Gateway asks the server for a parameter.
    GetParameters,
    /// Parameter payload (request answer or server reply).
    Parameters,
    /// Acknowledgement of an unsolicited server push.
    Ack,
    /// Error report.
    Error,
}

impl MessageState {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageState::Data => "data",
            MessageState::Register => "register",
            MessageState::GetParameters => "getparameters",
            MessageState::Parameters => "parameters",
            MessageState::Ack => "ack",
            MessageState::Error => "error",
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageState {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(MessageState::Data),
            "register" => Ok(MessageState::Register),
            "getparameters" => Ok(MessageState::GetParameters),
            "parameters" => Ok(MessageState::Parameters),
            "ack" => Ok(MessageState::Ack),
            "error" => Ok(MessageState::Error),
            other => Err(CodecError::UnknownState(other.to_owned())),
        }
    }
}

/// Single module reading reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleValue {
    /// Module identifier within the device type.
    pub module_id: u16,
    /// Measured or reported value.
    pub value: f32,
    /// `false` when the module could not be read.
    pub available: bool,
}

impl ModuleValue {
    /// Reading from an available module.
    pub fn new(module_id: u16, value: f32) -> Self {
        Self {
            module_id,
            value,
            available: true,
        }
    }

    /// Placeholder for a module that did not answer.
    pub fn unavailable(module_id: u16) -> Self {
        Self {
            module_id,
            value: 0.0,
            available: false,
        }
    }
}

/// Readings of one end device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    /// End-device identifier.
    pub euid: Euid,
    /// Entry in the device type table.
    pub device_type_id: u16,
    /// Device firmware revision.
    pub version: i32,
    /// Optional human label forwarded to the server.
    #[serde(default)]
    pub name: Option<String>,
    /// Ordered module readings.
    #[serde(default)]
    pub values: Vec<ModuleValue>,
}

impl DeviceReading {
    /// Number of module readings, reported as `pairs` in flat records.
    pub fn pairs(&self) -> usize {
        self.values.len()
    }
}

/// Parameter block exchanged in `getparameters` / `parameters` messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdParams {
    /// Parameter identifier (1000..=1999 gateway requests, 2000.. server requests).
    pub param_id: i32,
    /// Device the parameter refers to, `0` when not device specific.
    pub euid: Euid,
    /// Module the parameter refers to.
    #[serde(default)]
    pub module_id: Option<u32>,
    /// `(value, device_id)` pairs.
    #[serde(default)]
    pub values: Vec<(String, String)>,
}

/// Identity the gateway stamps on every message it originates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayIdentity {
    /// Adapter identifier as configured (decimal or `0x` hex).
    pub adapter_id: String,
    /// Gateway firmware version.
    pub fw_version: String,
    /// Server protocol version spoken by the gateway.
    pub protocol_version: String,
}

/// Gateway-to-server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server protocol version.
    pub protocol_version: String,
    /// Message state.
    pub state: MessageState,
    /// Originating gateway.
    pub adapter_id: String,
    /// Gateway firmware version.
    pub fw_version: String,
    /// Seconds since the Unix epoch; meaningless while `valid` is `false`.
    pub timestamp: i64,
    /// Seconds into the clock blackout at which the message was produced.
    pub offset: i64,
    /// `false` while `timestamp` is not a real wall-clock time.
    pub valid: bool,
    /// Delivery priority, fixed once the message is cached.
    pub priority: Priority,
    /// Device payload for `data` messages.
    pub device: DeviceReading,
    /// Device type table version.
    pub tt_version: i64,
    /// Parameter payload for parameter exchanges.
    #[serde(default)]
    pub params: CmdParams,
    /// Attach debug metadata to the envelope.
    #[serde(default)]
    pub debug: bool,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            protocol_version: String::new(),
            state: MessageState::Data,
            adapter_id: String::new(),
            fw_version: String::new(),
            timestamp: 0,
            offset: 0,
            valid: true,
            priority: Priority::Sensor,
            device: DeviceReading::default(),
            tt_version: 0,
            params: CmdParams::default(),
            debug: false,
        }
    }
}

impl Message {
    /// Empty `data` message carrying the gateway identity.
    pub fn from_identity(identity: &GatewayIdentity) -> Self {
        Self {
            protocol_version: identity.protocol_version.clone(),
            adapter_id: identity.adapter_id.clone(),
            fw_version: identity.fw_version.clone(),
            ..Self::default()
        }
    }

    /// Registration announcement sent on every (re)connect.
    pub fn registration(identity: &GatewayIdentity, timestamp: i64) -> Self {
        Self {
            state: MessageState::Register,
            priority: Priority::Registration,
            timestamp,
            ..Self::from_identity(identity)
        }
    }

    /// Acknowledgement for an unsolicited server push.
    pub fn ack(identity: &GatewayIdentity, timestamp: i64) -> Self {
        Self {
            state: MessageState::Ack,
            timestamp,
            ..Self::from_identity(identity)
        }
    }

    /// Sensor reading for `device`.
    pub fn data(identity: &GatewayIdentity, timestamp: i64, device: DeviceReading) -> Self {
        Self {
            timestamp,
            device,
            ..Self::from_identity(identity)
        }
    }

    /// Builder-style priority override.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether this message carries sensor data.
    pub fn is_data(&self) -> bool {
        self.state == MessageState::Data
    }
}

/// State carried by a server-to-gateway command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    /// Set actuator values.
    Set,
    /// Update device configuration.
    Update,
    /// Enter pairing mode.
    Listen,
    /// Remove a device.
    Clean,
    /// Reset a device.
    Reset,
    /// Server asks the gateway for a parameter.
    GetParameters,
    /// Server supplies a parameter.
    Parameters,
    /// Acknowledgement of a gateway request.
    Ack,
    /// Malformed or failed command.
    #[default]
    Error,
    /// State not known to this gateway.
    Unknown(String),
}

impl CommandState {
    /// Wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            CommandState::Set => "set",
            CommandState::Update => "update",
            CommandState::Listen => "listen",
            CommandState::Clean => "clean",
            CommandState::Reset => "reset",
            CommandState::GetParameters => "getparameters",
            CommandState::Parameters => "parameters",
            CommandState::Ack => "ack",
            CommandState::Error => "error",
            CommandState::Unknown(other) => other,
        }
    }

    /// `getparameters` or `parameters`.
    pub fn is_parameter_exchange(&self) -> bool {
        matches!(self, CommandState::GetParameters | CommandState::Parameters)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for CommandState {
    fn from(value: &str) -> Self {
        match value {
            "set" => CommandState::Set,
            "update" => CommandState::Update,
            "listen" => CommandState::Listen,
            "clean" => CommandState::Clean,
            "reset" => CommandState::Reset,
            "getparameters" => CommandState::GetParameters,
            "parameters" => CommandState::Parameters,
            "ack" => CommandState::Ack,
            "error" => CommandState::Error,
            other => CommandState::Unknown(other.to_owned()),
        }
    }
}

/// Server-to-gateway instruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Server protocol version.
    pub protocol_version: String,
    /// Command state.
    pub state: CommandState,
    /// Target device.
    pub euid: Euid,
    /// Target device type.
    pub device_type_id: u16,
    /// Server timestamp.
    pub time: i64,
    /// `(module_id, value)` pairs to apply.
    #[serde(default)]
    pub values: Vec<(u16, f32)>,
    /// Parameter payload.
    #[serde(default)]
    pub params: CmdParams,
}

impl Command {
    /// Command representing an undecodable frame.
    pub fn error() -> Self {
        Self::default()
    }

    /// Protocol version as a number, `0.0` when missing or malformed.
    pub fn protocol_number(&self) -> f32 {
        self.protocol_version.trim().parse().unwrap_or(0.0)
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal unsigned number.
pub fn parse_number(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ranks_order_like_variants() {
        let all = [
            Priority::History,
            Priority::Sensor,
            Priority::Param,
            Priority::Actuator,
            Priority::Registration,
        ];
        for pair in all.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].rank() < pair[1].rank());
        }
        for p in all {
            assert_eq!(Priority::from_rank(p.rank()), Some(p));
        }
        assert_eq!(Priority::from_rank(4), None);
    }

    #[test]
    fn unknown_command_state_is_preserved() {
        assert_eq!(CommandState::from("listen"), CommandState::Listen);
        let odd = CommandState::from("reboot");
        assert_eq!(odd.as_str(), "reboot");
        assert!(CommandState::from("parameters").is_parameter_exchange());
    }

    #[test]
    fn message_state_rejects_unknown() {
        assert_eq!("data".parse::<MessageState>().unwrap(), MessageState::Data);
        assert!("bogus".parse::<MessageState>().is_err());
    }

    #[test]
    fn numbers_accept_hex_and_decimal() {
        assert_eq!(parse_number("0x1F"), Some(31));
        assert_eq!(parse_number(" 42 "), Some(42));
        assert_eq!(parse_number("0xZZ"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn protocol_number_defaults_to_zero() {
        let mut cmd = Command::error();
        assert_eq!(cmd.protocol_number(), 0.0);
        cmd.protocol_version = "1.1".into();
        assert!(cmd.protocol_number() >= 1.1);
    }
}
