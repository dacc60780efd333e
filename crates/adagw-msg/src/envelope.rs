//! ---
//! gw_section: "02-messaging-ipc-data-model"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Server envelope codec shared by both server links."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::fmt::Debug;
use std::io::Cursor;

use quick_xml::events::attributes::Attributes;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, warn};

use crate::types::{parse_number, CmdParams, Command, CommandState, DeviceReading, Message, MessageState};
use crate::{CodecError, Result};

const OUTBOUND_ROOT: &str = "adapter_server";

/// Request/response ids carried by Correlated Link envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Correlation {
    /// Id of a request that expects a response.
    pub request_id: Option<u64>,
    /// Id of the request this envelope answers.
    pub response_id: Option<u64>,
}

impl Correlation {
    /// No correlation ids (Synchronous Link).
    pub const NONE: Correlation = Correlation {
        request_id: None,
        response_id: None,
    };

    /// Envelope that expects a response matched by `id`.
    pub fn request(id: u64) -> Self {
        Self {
            request_id: Some(id),
            response_id: None,
        }
    }

    /// Envelope answering request `id`.
    pub fn response(id: u64) -> Self {
        Self {
            request_id: None,
            response_id: Some(id),
        }
    }
}

/// Decoded server frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inbound {
    /// Decoded command.
    pub command: Command,
    /// Correlation ids found on the envelope.
    pub correlation: Correlation,
}

/// Encoder/decoder for the server protocol envelope.
pub trait EnvelopeCodec: Send + Sync + Debug {
    /// Serialise `msg` tagged with `correlation`.
    fn encode(&self, msg: &Message, correlation: Correlation) -> Result<String>;

    /// Parse a single server frame.
    fn decode(&self, frame: &str) -> Result<Inbound>;

    /// Parse a frame, mapping malformed input to a command in the `error` state.
    fn decode_lossy(&self, frame: &str) -> Inbound {
        self.decode(frame).unwrap_or_else(|err| {
            warn!(error = %err, "invalid format of incoming message");
            Inbound {
                command: Command::error(),
                correlation: Correlation::NONE,
            }
        })
    }
}

/// XML envelope used by the gateway server protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlCodec;

impl XmlCodec {
    /// Construct the codec.
    pub fn new() -> Self {
        Self
    }
}

fn xml_err(err: impl std::fmt::Display) -> CodecError {
    CodecError::Xml(err.to_string())
}

fn emit(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<()> {
    writer.write_event(event).map_err(xml_err)
}

fn hex_byte(value: impl Into<u64>) -> String {
    format!("{:#04x}", value.into())
}

fn write_device(writer: &mut Writer<Cursor<Vec<u8>>>, device: &DeviceReading) -> Result<()> {
    let euid = format!("{:#x}", device.euid);
    let device_id = hex_byte(device.device_type_id);
    let mut start = BytesStart::new("device");
    start.push_attribute(("euid", euid.as_str()));
    start.push_attribute(("device_id", device_id.as_str()));
    if let Some(name) = device.name.as_deref().filter(|n| !n.is_empty()) {
        start.push_attribute(("name", name));
    }
    emit(writer, Event::Start(start))?;

    if !device.values.is_empty() {
        let count = device.values.len().to_string();
        let mut values = BytesStart::new("values");
        values.push_attribute(("count", count.as_str()));
        emit(writer, Event::Start(values))?;
        for item in &device.values {
            let module_id = hex_byte(item.module_id);
            let mut value = BytesStart::new("value");
            value.push_attribute(("module_id", module_id.as_str()));
            if !item.available {
                value.push_attribute(("status", "unavailable"));
            }
            emit(writer, Event::Start(value))?;
            let text = item.value.to_string();
            emit(writer, Event::Text(BytesText::new(&text)))?;
            emit(writer, Event::End(BytesEnd::new("value")))?;
        }
        emit(writer, Event::End(BytesEnd::new("values")))?;
    }

    emit(writer, Event::End(BytesEnd::new("device")))
}

fn write_parameter(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    params: &CmdParams,
    state: MessageState,
) -> Result<()> {
    let param_id = params.param_id.to_string();
    let euid = format!("{:#x}", params.euid);
    let module_id = params.module_id.map(|m| format!("{m:#x}"));

    let mut start = BytesStart::new("parameter");
    start.push_attribute(("param_id", param_id.as_str()));
    if params.euid > 0 {
        start.push_attribute(("euid", euid.as_str()));
    }
    if let Some(module_id) = module_id.as_deref() {
        start.push_attribute(("module_id", module_id));
    }
    emit(writer, Event::Start(start))?;
    if state == MessageState::Parameters {
        for (value, _) in &params.values {
            emit(writer, Event::Start(BytesStart::new("value")))?;
            emit(writer, Event::Text(BytesText::new(value)))?;
            emit(writer, Event::End(BytesEnd::new("value")))?;
        }
    }
    emit(writer, Event::End(BytesEnd::new("parameter")))
}

impl EnvelopeCodec for XmlCodec {
    fn encode(&self, msg: &Message, correlation: Correlation) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        emit(
            &mut writer,
            Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
        )?;

        let time = msg.timestamp.to_string();
        let request_id = correlation.request_id.map(|id| id.to_string());
        let response_id = correlation.response_id.map(|id| id.to_string());
        let mut root = BytesStart::new(OUTBOUND_ROOT);
        root.push_attribute(("adapter_id", msg.adapter_id.as_str()));
        root.push_attribute(("state", msg.state.as_str()));
        root.push_attribute(("protocol_version", msg.protocol_version.as_str()));
        root.push_attribute(("fw_version", msg.fw_version.as_str()));
        root.push_attribute(("time", time.as_str()));
        if let Some(id) = request_id.as_deref() {
            root.push_attribute(("request_id", id));
        }
        if let Some(id) = response_id.as_deref() {
            root.push_attribute(("response_id", id));
        }
        emit(&mut writer, Event::Start(root))?;

        match msg.state {
            MessageState::Register => emit(&mut writer, Event::Text(BytesText::new(" ")))?,
            MessageState::Ack => {}
            MessageState::GetParameters | MessageState::Parameters => {
                write_parameter(&mut writer, &msg.params, msg.state)?
            }
            MessageState::Data | MessageState::Error => write_device(&mut writer, &msg.device)?,
        }

        emit(&mut writer, Event::End(BytesEnd::new(OUTBOUND_ROOT)))?;
        String::from_utf8(writer.into_inner().into_inner()).map_err(xml_err)
    }

    fn decode(&self, frame: &str) -> Result<Inbound> {
        let mut reader = Reader::from_str(frame);
        reader.trim_text(true);

        let mut inbound = Inbound::default();
        let mut seen_root = false;
        let mut open_value: Option<OpenValue> = None;

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(element) => {
                    open_value = start_element(&mut inbound, &mut seen_root, &element)?;
                }
                Event::Empty(element) => {
                    if let Some(value) = start_element(&mut inbound, &mut seen_root, &element)? {
                        value.finish(&mut inbound.command);
                    }
                }
                Event::Text(text) => {
                    if let Some(value) = open_value.as_mut() {
                        value.text.push_str(&text.unescape().map_err(xml_err)?);
                    }
                }
                Event::End(element) => {
                    if element.name().as_ref() == b"value" {
                        if let Some(value) = open_value.take() {
                            value.finish(&mut inbound.command);
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(CodecError::MissingRoot);
        }
        Ok(inbound)
    }
}

/// `<value>` element whose text has not been read yet.
struct OpenValue {
    module_id: Option<u16>,
    device_id: String,
    text: String,
}

impl OpenValue {
    fn finish(self, command: &mut Command) {
        if command.state.is_parameter_exchange() {
            if let Some(module_id) = self.module_id {
                command.params.module_id = Some(u32::from(module_id));
            }
            if !self.text.is_empty() || !self.device_id.is_empty() {
                command.params.values.push((self.text, self.device_id));
            }
            return;
        }
        let Some(module_id) = self.module_id else {
            debug!(text = %self.text, "value without module_id ignored");
            return;
        };
        let value = self.text.trim().parse::<f32>().unwrap_or_else(|_| {
            warn!(module_id, text = %self.text, "non-numeric module value, using 0");
            0.0
        });
        command.values.push((module_id, value));
    }
}

fn start_element(
    inbound: &mut Inbound,
    seen_root: &mut bool,
    element: &BytesStart<'_>,
) -> Result<Option<OpenValue>> {
    match element.name().as_ref() {
        b"server_adapter" => {
            *seen_root = true;
            read_root(inbound, element.attributes())?;
            Ok(None)
        }
        b"value" => {
            let mut value = OpenValue {
                module_id: None,
                device_id: String::new(),
                text: String::new(),
            };
            for attr in element.attributes() {
                let attr = attr.map_err(xml_err)?;
                let raw = attr.unescape_value().map_err(xml_err)?;
                match attr.key.as_ref() {
                    b"module_id" => {
                        value.module_id = parse_number(&raw).and_then(|n| u16::try_from(n).ok())
                    }
                    b"device_id" => value.device_id = raw.into_owned(),
                    _ => {}
                }
            }
            Ok(Some(value))
        }
        b"parameter" => {
            for attr in element.attributes() {
                let attr = attr.map_err(xml_err)?;
                let raw = attr.unescape_value().map_err(xml_err)?;
                match attr.key.as_ref() {
                    b"param_id" | b"id" => {
                        inbound.command.params.param_id = raw.trim().parse().unwrap_or_default()
                    }
                    b"euid" => inbound.command.params.euid = parse_number(&raw).unwrap_or_default(),
                    _ => {}
                }
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

fn read_root(inbound: &mut Inbound, attributes: Attributes<'_>) -> Result<()> {
    let command = &mut inbound.command;
    for attr in attributes {
        let attr = attr.map_err(xml_err)?;
        let raw = attr.unescape_value().map_err(xml_err)?;
        match attr.key.as_ref() {
            b"protocol_version" => command.protocol_version = raw.into_owned(),
            b"state" => command.state = CommandState::from(&*raw),
            b"euid" | b"id" => command.euid = parse_number(&raw).unwrap_or_default(),
            b"device_id" => {
                command.device_type_id = parse_number(&raw)
                    .and_then(|n| u16::try_from(n).ok())
                    .unwrap_or_default()
            }
            b"time" => command.time = raw.trim().parse().unwrap_or_default(),
            b"request_id" => inbound.correlation.request_id = parse_number(&raw).filter(|id| *id != 0),
            b"response_id" => {
                inbound.correlation.response_id = parse_number(&raw).filter(|id| *id != 0)
            }
            other => {
                debug!(attribute = %String::from_utf8_lossy(other), "unknown server_adapter attribute")
            }
        }
    }
    Ok(())
}
