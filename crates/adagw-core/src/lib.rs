//! ---
//! gw_section: "01-core-functionality"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Aggregator, dispatch and clock blackout handling."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
//! Composition root of the adapter gateway.
//!
//! The [`Aggregator`] owns the priority cache, the server link and the
//! distributor. Device modules talk back to it through a non-owning
//! [`AggregatorHandle`], and server pushes reach them through the
//! [`Dispatcher`].

pub mod aggregator;
pub mod dispatcher;
pub mod monitor;
pub mod parameters;

pub use aggregator::{
    gateway_identity, Aggregator, AggregatorHandle, AggregatorParts, AggregatorSettings,
    AggregatorTasks, SendOutcome,
};
pub use dispatcher::{route_command, DeviceModule, Dispatch, Dispatcher, ModuleKind};
pub use monitor::{MonitorState, TimeValidityMonitor};
pub use parameters::{local_ipv4_addresses, ParamOutcome, Parameters};
