//! # bar-node: BAR node composition and diagnostics RPC.
//!
//! Wires the peer-admission subsystem into a running node:
//! - [`node::BarNode`]: controller, coordinators, transport and chain, with
//!   background tasks sharing one shutdown signal
//! - [`rpc`]: JSON-RPC server exposing peer lists and selection
//! - [`config::NodeConfig`]: node configuration

pub mod config;
pub mod node;
pub mod rpc;

pub use config::NodeConfig;
pub use node::BarNode;
pub use rpc::start_rpc_server;
