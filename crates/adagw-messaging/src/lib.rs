//! ---
//! gw_section: "02-messaging-ipc-data-model"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Message distributor, bus abstraction and debug pipe."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
//! Secondary sinks for gateway readings.
//!
//! Nothing here affects delivery to the server: every sink is best effort and
//! failures are only logged.
#![warn(missing_docs)]

pub mod bus;
pub mod distributor;
pub mod pipe;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Failures of the secondary sinks.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The bus client refused or failed a publish.
    #[error("publish to '{topic}' failed: {reason}")]
    Publish {
        /// Destination topic.
        topic: String,
        /// Client supplied cause.
        reason: String,
    },
    /// Wrapper for IO errors on the named pipe.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Named pipe could not be created.
    #[error("pipe error: {0}")]
    Pipe(#[from] nix::Error),
}

pub use bus::{
    InMemoryBus, MessageBus, Published, QoS, TracingBus, FAILURE_TOPIC, SERVICE_TOPIC,
};
pub use distributor::MessageDistributor;
pub use pipe::GeekPipe;
