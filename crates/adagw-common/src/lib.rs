//! ---
//! gw_section: "01-core-functionality"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Shared primitives and utilities for the gateway runtime."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
//! Core shared primitives for the adapter gateway workspace.
//! This crate exposes configuration loading, tracing setup, clocks,
//! shutdown signalling and bounded-wait locking used across the workspace.

pub mod config;
pub mod logging;
pub mod shutdown;
pub mod sync;
pub mod time;

pub use config::{
    AppConfig, CacheConfig, DistributorConfig, GatewayConfig, KeepaliveConfig, LinkKind,
    LoadedAppConfig, LoggingConfig, ServerConfig, TlsSettings,
};
pub use logging::{init_tracing, LogFormat};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use sync::TimedMutex;
pub use time::{is_valid_timestamp, Cadence, Clock, ManualClock, SystemClock, EPOCH_FLOOR};
