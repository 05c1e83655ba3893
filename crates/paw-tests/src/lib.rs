//! # paw-tests
//!
//! Integration tests for the PAW P2P core.
//!
//! This crate provides:
//! - A loopback harness for spinning up nodes, fake seeds and dead endpoints
//! - Scenario tests driving several managers against each other
//! - Wire-level tests speaking the protocol from a raw socket
//! - Property-based tests for codec, backoff and peer-table invariants

pub mod harness;


#[cfg(test)]
mod protocol_tests;


pub use harness::*;
