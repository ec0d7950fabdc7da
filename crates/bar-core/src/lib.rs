//! # bar-core
//! Foundation types and traits for the BAR ("Blockchain Attack Resilient")
//! peer-admission layer.
//!
//! Nothing in this crate talks to the network. It defines the peer and
//! reputation records, the error taxonomy, protocol-wide defaults, and the
//! seams to the collaborators that live outside the subsystem: the
//! pub/sub [`traits::Transport`] and the blockchain
//! ([`traits::ChainState`] / [`traits::BlockSink`]).

pub mod chain;
pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
