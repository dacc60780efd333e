//! ---
//! gw_section: "04-networking-transport"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Server links, connectors and framing."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
//! Transports between the gateway and its server.
//!
//! Two [`ServerLink`] implementations share one connector and one envelope
//! codec: [`SynchronousLink`] opens a connection per delivery and keeps a
//! separate receive connection, [`CorrelatedLink`] multiplexes requests and
//! server pushes over a single WebSocket matched by request id.
#![warn(missing_docs)]

pub mod connector;
pub mod correlated;
pub mod framing;
pub mod link;
pub mod sync_link;

/// Result alias used by the links.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Transport failures. All of them are retriable except [`LinkError::Tls`]
/// raised while building a connector.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Socket level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A bounded wait expired.
    #[error("timed out during {operation}")]
    Timeout {
        /// Operation that did not finish in time.
        operation: &'static str,
    },
    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),
    /// WebSocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Outbound envelope could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] adagw_msg::CodecError),
    /// The link currently has no connection to the server.
    #[error("not connected to server")]
    Disconnected,
    /// The peer sent more than the frame limit without a delimiter.
    #[error("frame exceeds {limit} bytes without a delimiter")]
    FrameTooLarge {
        /// Limit that was exceeded.
        limit: usize,
    },
    /// The server never answered a correlated request.
    #[error("no response for request {request_id}")]
    NoResponse {
        /// Request that was revoked.
        request_id: u64,
    },
}

pub use connector::{connector_from_config, Connector, LinkStream, TcpConnector, TlsConnector};
pub use correlated::CorrelatedLink;
pub use framing::{read_frame, write_frame, FrameSplitter, FRAME_DELIMITER, MAX_FRAME_LEN};
pub use link::{CommandRouter, ServerLink};
pub use sync_link::SynchronousLink;
