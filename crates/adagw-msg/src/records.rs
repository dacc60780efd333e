//! ---
//! gw_section: "02-messaging-ipc-data-model"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Flat semicolon records used by the cache file, bus topics and debug pipe."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::fmt::Write as _;
use std::io::BufRead;

use tracing::debug;

use crate::types::{parse_number, Message, ModuleValue, Priority};
use crate::{CodecError, Result};

/// Field selection for [`to_csv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvLayout {
    /// `time`, `euid`, `device_id`, `pairs`.
    Compact,
    /// Compact plus state, versions and validity.
    Full,
    /// Full plus priority and module availability, as written to the cache file.
    Cache,
}

/// Render `msg` as a header line followed by one line per module value.
pub fn to_csv(msg: &Message, layout: CsvLayout) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "time;{};euid;{};device_id;{};",
        msg.timestamp, msg.device.euid, msg.device.device_type_id
    );
    if layout != CsvLayout::Compact {
        let _ = write!(
            out,
            "state;{};fw_version;{};protocol_version;{};dev_version;{};tt_version;{};valid;{};",
            msg.state,
            msg.fw_version,
            msg.protocol_version,
            msg.device.version,
            msg.tt_version,
            if msg.valid { "yes" } else { "no" }
        );
    }
    if layout == CsvLayout::Cache {
        let _ = write!(out, "priority;{};", msg.priority.rank());
    }
    let _ = writeln!(out, "pairs;{}", msg.device.pairs());

    for item in &msg.device.values {
        let _ = write!(out, "module_id;{:#04x};value;{}", item.module_id, item.value);
        if layout == CsvLayout::Cache && !item.available {
            out.push_str(";status;unavailable");
        }
        out.push('\n');
    }
    out
}

/// Human-readable multi-line dump.
pub fn to_plain_text(msg: &Message) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "time:{}", msg.timestamp);
    let _ = writeln!(out, "euid:{}", msg.device.euid);
    let _ = writeln!(out, "device_id:{}", msg.device.device_type_id);
    let _ = writeln!(out, "state:{}", msg.state);
    let _ = writeln!(out, "fw_version:{}", msg.fw_version);
    let _ = writeln!(out, "protocol_version:{}", msg.protocol_version);
    let _ = writeln!(out, "dev_version:{}", msg.device.version);
    out.push_str("sensor_values:\n");
    for item in &msg.device.values {
        let _ = writeln!(out, "\tmodule_id:{:#04x}, value:{}", item.module_id, item.value);
    }
    out
}

/// Serialises messages into the cache file format.
pub trait RecordEncoder: Send + Sync {
    /// One complete record (header plus module lines).
    fn encode_record(&self, msg: &Message) -> String;
}

/// Encoder for [`CsvLayout::Cache`] records.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheRecordEncoder;

impl RecordEncoder for CacheRecordEncoder {
    fn encode_record(&self, msg: &Message) -> String {
        to_csv(msg, CsvLayout::Cache)
    }
}

/// Upper bound on `pairs` in a cache record header.
pub const MAX_RECORD_PAIRS: usize = 256;

/// Streaming reader of cache-format records.
///
/// Every record starts from a clone of the template so fields the file does
/// not carry (adapter id) are filled in. A header needs `time` and `euid`;
/// `pairs` defaults to 0. Module lines are read up to `pairs` and never past
/// the next header, so one damaged record cannot swallow the following ones.
/// Malformed records yield an error and the reader moves on.
pub struct RecordDecoder<R> {
    lines: std::io::Lines<R>,
    line_no: usize,
    lookahead: Option<String>,
    template: Message,
}

impl<R: BufRead> RecordDecoder<R> {
    /// Wrap `reader`, starting each record from `template`.
    pub fn new(reader: R, template: Message) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            lookahead: None,
            template,
        }
    }

    fn next_line(&mut self) -> Option<Result<String>> {
        if let Some(line) = self.lookahead.take() {
            self.line_no += 1;
            return Some(Ok(line));
        }
        let line = self.lines.next()?;
        self.line_no += 1;
        Some(line.map_err(CodecError::from))
    }

    fn push_back(&mut self, line: String) {
        self.line_no -= 1;
        self.lookahead = Some(line);
    }

    fn record_error(&self, line: usize, reason: impl Into<String>) -> CodecError {
        CodecError::Record {
            line,
            reason: reason.into(),
        }
    }

    fn read_record(&mut self, header: &str) -> Result<Message> {
        let header_line = self.line_no;
        let mut msg = self.template.clone();
        msg.device.values.clear();
        let mut pairs = 0usize;
        let mut has_time = false;
        let mut has_euid = false;
        let mut header_error = None;

        if is_module_line(header) {
            header_error = Some("module line without a record header".to_owned());
        } else {
            for (key, value) in tokens(header) {
                let Some(value) = value else {
                    header_error = Some(format!("field '{key}' has no value"));
                    break;
                };
                let parsed = match key {
                    "time" => value
                        .parse()
                        .map(|v| {
                            msg.timestamp = v;
                            has_time = true;
                        })
                        .is_ok(),
                    "euid" => parse_number(value)
                        .map(|v| {
                            msg.device.euid = v;
                            has_euid = true;
                        })
                        .is_some(),
                    "device_id" => parse_number(value)
                        .and_then(|v| u16::try_from(v).ok())
                        .map(|v| msg.device.device_type_id = v)
                        .is_some(),
                    "dev_version" => value.parse().map(|v| msg.device.version = v).is_ok(),
                    "valid" => {
                        msg.valid = value == "yes";
                        true
                    }
                    "state" => value.parse().map(|v| msg.state = v).is_ok(),
                    "fw_version" => {
                        msg.fw_version = value.to_owned();
                        true
                    }
                    "protocol_version" => {
                        msg.protocol_version = value.to_owned();
                        true
                    }
                    "pairs" => value
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n <= MAX_RECORD_PAIRS)
                        .map(|n| pairs = n)
                        .is_some(),
                    "tt_version" => value.parse().map(|v| msg.tt_version = v).is_ok(),
                    "priority" => value
                        .parse::<u8>()
                        .ok()
                        .and_then(Priority::from_rank)
                        .map(|p| msg.priority = p)
                        .is_some(),
                    unknown => {
                        debug!(line = self.line_no, field = unknown, "unknown cache record field ignored");
                        true
                    }
                };
                if !parsed && header_error.is_none() {
                    header_error = Some(format!("invalid value '{value}' for field '{key}'"));
                }
            }
            if header_error.is_none() {
                if !has_time {
                    header_error = Some("header without 'time'".to_owned());
                } else if !has_euid {
                    header_error = Some("header without 'euid'".to_owned());
                }
            }
        }

        // A rejected header takes the module lines that follow it with it.
        let wanted = if header_error.is_some() { usize::MAX } else { pairs };
        let mut read = 0usize;
        let mut module_error = None;
        while read < wanted {
            let line = match self.next_line() {
                Some(line) => line?,
                None => break,
            };
            if !is_module_line(&line) {
                self.push_back(line);
                break;
            }
            read += 1;
            match parse_module_line(&line) {
                Ok(item) => msg.device.values.push(item),
                Err(reason) => {
                    if module_error.is_none() {
                        module_error = Some(self.record_error(self.line_no, reason));
                    }
                }
            }
        }

        if let Some(reason) = header_error {
            return Err(self.record_error(header_line, reason));
        }
        if let Some(err) = module_error {
            return Err(err);
        }
        if read < pairs {
            return Err(self.record_error(
                header_line,
                format!("expected {pairs} module lines, found {read}"),
            ));
        }
        Ok(msg)
    }
}

impl<R: BufRead> Iterator for RecordDecoder<R> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.next_line()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err)),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(self.read_record(&line));
        }
    }
}

fn is_module_line(line: &str) -> bool {
    tokens(line).next().is_some_and(|(key, _)| key == "module_id")
}

/// Split `a;1;b;2` into `(key, value)` pairs, skipping empty tokens.
fn tokens(line: &str) -> impl Iterator<Item = (&str, Option<&str>)> {
    let mut parts = line.split(';').map(str::trim).filter(|t| !t.is_empty());
    std::iter::from_fn(move || {
        let key = parts.next()?;
        Some((key, parts.next()))
    })
}

fn parse_module_line(line: &str) -> std::result::Result<ModuleValue, String> {
    let mut module_id = None;
    let mut value = None;
    let mut available = true;
    for (key, raw) in tokens(line) {
        let raw = raw.ok_or_else(|| format!("module field '{key}' has no value"))?;
        match key {
            "module_id" => {
                module_id = Some(
                    parse_number(raw)
                        .and_then(|v| u16::try_from(v).ok())
                        .ok_or_else(|| format!("invalid module_id '{raw}'"))?,
                )
            }
            "value" => {
                value = Some(
                    raw.parse::<f32>()
                        .map_err(|_| format!("invalid module value '{raw}'"))?,
                )
            }
            "status" => available = raw != "unavailable",
            unknown => debug!(field = unknown, "unknown module field ignored"),
        }
    }
    let module_id = module_id.ok_or("module line without module_id")?;
    Ok(ModuleValue {
        module_id,
        value: value.unwrap_or_default(),
        available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceReading, GatewayIdentity, MessageState};
    use std::io::Cursor;

    fn sample() -> Message {
        let identity = GatewayIdentity {
            adapter_id: "0x9".into(),
            fw_version: "2.1".into(),
            protocol_version: "1.1".into(),
        };
        let mut msg = Message::data(
            &identity,
            1_700_000_000,
            DeviceReading {
                euid: 0xAB,
                device_type_id: 2,
                version: 4,
                name: None,
                values: vec![ModuleValue::new(1, 20.25), ModuleValue::unavailable(3)],
            },
        );
        msg.tt_version = 7;
        msg
    }

    #[test]
    fn compact_and_full_layouts() {
        let msg = sample();
        let compact = to_csv(&msg, CsvLayout::Compact);
        assert_eq!(
            compact,
            "time;1700000000;euid;171;device_id;2;pairs;2\nmodule_id;0x01;value;20.25\nmodule_id;0x03;value;0\n"
        );
        let full = to_csv(&msg, CsvLayout::Full);
        assert!(full.starts_with(
            "time;1700000000;euid;171;device_id;2;state;data;fw_version;2.1;protocol_version;1.1;dev_version;4;tt_version;7;valid;yes;pairs;2\n"
        ));
        assert!(!full.contains("priority"));
    }

    #[test]
    fn cache_records_decode_back() {
        let mut first = sample().with_priority(Priority::Actuator);
        first.valid = false;
        let second = sample();
        let file = format!(
            "{}\n{}",
            CacheRecordEncoder.encode_record(&first),
            CacheRecordEncoder.encode_record(&second)
        );

        let template = Message {
            adapter_id: "0x9".into(),
            ..Message::default()
        };
        let decoded: Vec<_> = RecordDecoder::new(Cursor::new(file), template)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn malformed_records_are_skipped() {
        let file = "\
time;abc;euid;1;pairs;1
module_id;0x01;value;1.0
time;1700000001;euid;2;state;data;pairs;1;color;blue
module_id;0x02;value;2.5
time;1700000002;euid;3;pairs;1
module_id;0x03;value;nan-ish
time;1700000003;euid;4;pairs;2
module_id;0x04;value;4
";
        let results: Vec<_> = RecordDecoder::new(Cursor::new(file), Message::default()).collect();
        assert_eq!(results.len(), 4);
        assert!(matches!(results[0], Err(CodecError::Record { line: 1, .. })));
        let ok = results[1].as_ref().unwrap();
        assert_eq!(ok.device.euid, 2);
        assert_eq!(ok.state, MessageState::Data);
        assert_eq!(ok.device.values, vec![ModuleValue::new(2, 2.5)]);
        assert!(matches!(results[2], Err(CodecError::Record { line: 6, .. })));
        assert!(matches!(results[3], Err(CodecError::Record { line: 7, .. })));
    }

    #[test]
    fn stray_module_lines_never_become_records() {
        let file = "\
time;1700000000;euid;16;device_id;1
module_id;0x01;value;5
module_id;0x02;value;6
device_id;4;pairs;0
time;1700000005;euid;17;pairs;1
module_id;0x03;value;7
";
        let results: Vec<_> = RecordDecoder::new(Cursor::new(file), Message::default()).collect();
        assert_eq!(results.len(), 4);
        let first = results[0].as_ref().unwrap();
        assert_eq!((first.timestamp, first.device.euid), (1_700_000_000, 16));
        assert!(first.device.values.is_empty());
        assert!(matches!(results[1], Err(CodecError::Record { line: 2, .. })));
        assert!(matches!(results[2], Err(CodecError::Record { line: 4, .. })));
        let last = results[3].as_ref().unwrap();
        assert_eq!(last.device.euid, 17);
        assert_eq!(last.device.values, vec![ModuleValue::new(3, 7.0)]);
    }

    #[test]
    fn oversized_pairs_do_not_swallow_next_record() {
        let file = "\
time;1700000000;euid;1;pairs;4000000000
module_id;0x01;value;1
time;1700000001;euid;2;pairs;900
module_id;0x01;value;1
time;1700000002;euid;3;pairs;1
module_id;0x05;value;5
";
        let results: Vec<_> = RecordDecoder::new(Cursor::new(file), Message::default()).collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_err());
        assert!(matches!(results[1], Err(CodecError::Record { line: 3, .. })));
        let ok = results[2].as_ref().unwrap();
        assert_eq!(ok.device.euid, 3);
        assert_eq!(ok.device.values, vec![ModuleValue::new(5, 5.0)]);
    }

    #[test]
    fn plain_text_lists_modules() {
        let text = to_plain_text(&sample());
        assert!(text.contains("euid:171\n"));
        assert!(text.contains("\tmodule_id:0x01, value:20.25\n"));
    }
}
