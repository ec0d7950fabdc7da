//! Multi-node and adversarial test suite for the BAR peer-admission layer.
//!
//! Integration tests in `tests/` run several nodes over an in-memory hub and
//! attack the protocols from a hostile peer's point of view. Shared fixtures
//! live in [`helpers`].

pub mod helpers;
