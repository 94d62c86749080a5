//! FleetLink device agent
//!
//! Edge agent keeping a device attached to its fleet controller:
//! - Periodic heartbeats with workload, execution and hardware state
//! - Content-addressed ledger of dispatched execution artifacts
//! - Ordered drain of every subsystem before a graceful reboot
//! - Device configuration fan-out to the subsystems that react to it

pub mod config;
pub mod directives;
pub mod dispatcher;
pub mod execution;
pub mod hardware;
pub mod heartbeat;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod os;
pub mod ports;
pub mod transport;
