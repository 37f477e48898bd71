//! faultkeeper-core - reconciliation engine for chaos-testing proxies
//!
//! This library keeps a catalog of Toxiproxy-managed proxies converged with
//! the fault-injection state an external test harness records in a shared
//! `SQLite` control database, and tears the proxies down once the harness's
//! work counter reaches its configured target.
//!
//! # Modules
//!
//! - [`catalog`]: the immutable proxy catalog (name, listen, upstream)
//! - [`config`]: TOML configuration with defaults and validation
//! - [`retry`]: bounded exponential-backoff executor for external calls
//! - [`store`]: control-store adapter (state row, change events, trigger)
//! - [`gateway`]: Toxiproxy HTTP client and idempotent convergence ops
//! - [`engine`]: the poll-loop state machine tying the above together
//!
//! # Runtime Requirements
//!
//! The engine and the async store wrappers require a tokio runtime; `SQLite`
//! access is funneled through `tokio::task::spawn_blocking` so the control
//! loop never blocks the runtime on database I/O.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod retry;
pub mod store;

pub use catalog::{ProxyCatalog, ProxySpec};
pub use config::FaultkeeperConfig;
pub use engine::{CompletionReason, Reconciler, ReconcilerConfig};
pub use gateway::{FaultInjector, GatewayError, ProxyApi, ToxiproxyClient};
pub use retry::{RetryExhausted, RetryPolicy};
pub use store::{ChangeEvent, ControlStore, StoreError};
