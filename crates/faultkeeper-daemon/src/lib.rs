//! faultkeeper-daemon - long-running reconciliation daemon
//!
//! Wires the core engine to the process environment: CLI arguments,
//! configuration loading, tracing, OS signals, and the health endpoint.

pub mod cli;
pub mod health;
