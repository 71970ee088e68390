//! # quay-tests
//!
//! Integration tests for the quay p2p host:
//! - end-to-end host scenarios (echo streams, connection reuse, redial)
//! - dial failure and timeout behavior
//! - registry bookkeeping and lifecycle invariants

pub mod harness;


#[cfg(test)]
mod host_tests;

pub use harness::*;
