//! ---
//! gw_section: "02-messaging-ipc-data-model"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Message model, server envelope codec and flat record formats."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
//! Messages travel from device modules to the server, commands travel back.
//! Both sides of the server protocol share the envelope codec defined here.
#![warn(missing_docs)]

pub mod envelope;
pub mod records;
pub mod types;

/// Shared result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Failures while encoding or decoding gateway messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The XML reader or writer rejected the document.
    #[error("xml error: {0}")]
    Xml(String),
    /// No `server_adapter` root element was found.
    #[error("envelope has no server_adapter root")]
    MissingRoot,
    /// A message state outside the known set.
    #[error("unknown message state '{0}'")]
    UnknownState(String),
    /// A flat record could not be parsed.
    #[error("malformed record at line {line}: {reason}")]
    Record {
        /// Line where the problem was detected.
        line: usize,
        /// Human readable cause.
        reason: String,
    },
    /// Wrapper for IO errors while streaming records.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub use envelope::{Correlation, EnvelopeCodec, Inbound, XmlCodec};
pub use records::{
    to_csv, to_plain_text, CacheRecordEncoder, CsvLayout, RecordDecoder, RecordEncoder,
    MAX_RECORD_PAIRS,
};
pub use types::{
    parse_number, CmdParams, Command, CommandState, DeviceReading, Euid, GatewayIdentity, Message,
    MessageState, ModuleValue, Priority,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_error_mentions_line() {
        let err = CodecError::Record {
            line: 3,
            reason: "bad value".into(),
        };
        assert_eq!(format!("{err}"), "malformed record at line 3: bad value");
    }
}
