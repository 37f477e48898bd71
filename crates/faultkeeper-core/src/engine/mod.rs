//! Reconciliation engine: the poll loop that converges proxy state.
//!
//! One tick of the loop: check for a shutdown request, read the control
//! row, stop if the work counter reached its target, then drain and apply
//! pending change events in order. Teardown (deleting every catalog proxy)
//! runs exactly once on the way out, whatever the exit path.
//!
//! Ordering is the core invariant: events are applied oldest first, an
//! event is acknowledged only after its convergence action succeeded, and
//! a failed event stops the batch so later transitions never overtake it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::catalog::ProxyCatalog;
use crate::gateway::FaultInjector;
use crate::retry::{RetryExhausted, RetryPolicy};
use crate::store::{ChangeEvent, ChangeKind, ControlStore, StoreError};

/// Why the engine stopped cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The work counter reached the configured target.
    TargetReached,

    /// A shutdown was requested via the shutdown handle.
    ShutdownRequested,
}

/// Fatal engine errors. Teardown has already run when one of these
/// surfaces.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A catalog proxy could not be created at startup.
    #[error("startup failed: {0}")]
    Startup(#[source] RetryExhausted<crate::gateway::GatewayError>),

    /// Schema initialization or the control-row read stayed broken
    /// through all retries.
    #[error("control store failed: {0}")]
    Store(#[source] RetryExhausted<StoreError>),

    /// Too many change events failed in a row.
    #[error("aborting after {failures} consecutive event failures")]
    FailureLimit {
        /// Number of consecutive failed events.
        failures: u32,
    },
}

/// Tuning knobs for the poll loop.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Delay between loop ticks.
    pub poll_interval: Duration,

    /// Consecutive event failures tolerated before the engine aborts.
    pub max_consecutive_failures: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_consecutive_failures: 5,
        }
    }
}

impl ReconcilerConfig {
    /// Sets the delay between loop ticks.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the consecutive-failure budget.
    #[must_use]
    pub const fn with_max_consecutive_failures(mut self, limit: u32) -> Self {
        self.max_consecutive_failures = limit;
        self
    }
}

/// The reconciliation engine.
///
/// Owns the control-store handle and the proxy injector; [`Self::run`]
/// consumes the engine and drives it to one of the exits described on
/// [`CompletionReason`] and [`EngineError`].
pub struct Reconciler {
    store: ControlStore,
    injector: FaultInjector,
    catalog: ProxyCatalog,
    retry: RetryPolicy,
    config: ReconcilerConfig,
    shutdown: Arc<AtomicBool>,
    consecutive_failures: u32,
}

impl Reconciler {
    /// Assembles an engine from its parts.
    #[must_use]
    pub fn new(
        store: ControlStore,
        injector: FaultInjector,
        catalog: ProxyCatalog,
        retry: RetryPolicy,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            injector,
            catalog,
            retry,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            consecutive_failures: 0,
        }
    }

    /// Handle for requesting shutdown from another task (signal handler).
    ///
    /// Storing `true` makes the loop exit at the next tick boundary;
    /// teardown still runs.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs the engine to completion.
    ///
    /// Startup creates every catalog proxy (absence of a conflict error
    /// means created, a conflict means it already existed). The loop then
    /// polls until the work target is reached, shutdown is requested, or a
    /// fatal error occurs. All paths tear the catalog down exactly once
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when startup, the control store, or the
    /// consecutive-failure budget fails; see the variants.
    pub async fn run(mut self) -> Result<CompletionReason, EngineError> {
        let outcome = self.run_inner().await;

        // Teardown is unconditional and runs exactly once: clean exits
        // leave no proxies behind, fatal exits fail safe with traffic
        // flowing directly again.
        info!(proxies = self.catalog.len(), "tearing down proxy catalog");
        self.injector.delete_all(&self.catalog).await;

        match &outcome {
            Ok(reason) => info!(?reason, "reconciliation finished"),
            Err(e) => error!(error = %e, "reconciliation aborted"),
        }
        outcome
    }

    async fn run_inner(&mut self) -> Result<CompletionReason, EngineError> {
        self.start().await?;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested");
                return Ok(CompletionReason::ShutdownRequested);
            }

            let store = &self.store;
            let state = self
                .retry
                .execute("read_state", || async move { store.read_state_async().await })
                .await
                .map_err(EngineError::Store)?;

            // Completion takes precedence over pending events: once the
            // harness is done, remaining transitions are moot because
            // teardown removes the proxies they would have converged.
            if state.count >= state.target {
                info!(
                    count = state.count,
                    target = state.target,
                    "work target reached"
                );
                return Ok(CompletionReason::TargetReached);
            }

            self.process_events().await?;

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Initializes the store schema and creates every catalog proxy.
    async fn start(&self) -> Result<(), EngineError> {
        self.retry
            .execute("initialize_store", || async move {
                let store = self.store.clone();
                tokio::task::spawn_blocking(move || store.initialize())
                    .await
                    .map_err(|e| StoreError::Task(e.to_string()))?
            })
            .await
            .map_err(EngineError::Store)?;

        for spec in &self.catalog {
            self.injector
                .ensure_created(spec)
                .await
                .map_err(EngineError::Startup)?;
        }
        info!(proxies = self.catalog.len(), "proxy catalog ready");
        Ok(())
    }

    /// Drains pending events and applies them oldest first.
    ///
    /// Every steady-state failure here — drain, application, or
    /// acknowledgement — counts against the consecutive-failure budget
    /// rather than aborting outright: the tick ends, the next tick
    /// retries, and only a spent budget is fatal. A fully successful
    /// tick resets the counter. A failed event is left unacknowledged
    /// and stops the batch so later transitions never overtake it.
    async fn process_events(&mut self) -> Result<(), EngineError> {
        let store = &self.store;
        let events = match self
            .retry
            .execute("drain_events", || async move { store.drain_events_async().await })
            .await
        {
            Ok(events) => events,
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    consecutive = self.consecutive_failures,
                    error = %e,
                    "event drain failed; will retry next tick"
                );
                return self.check_failure_budget();
            },
        };

        for event in events {
            if let Err(e) = self.apply(&event).await {
                self.consecutive_failures += 1;
                warn!(
                    event_id = event.id,
                    consecutive = self.consecutive_failures,
                    error = %e,
                    "event failed; will retry next tick"
                );
                // Later events must not overtake this one.
                return self.check_failure_budget();
            }

            let store = &self.store;
            let id = event.id;
            if let Err(e) = self
                .retry
                .execute("acknowledge_event", || async move {
                    store.acknowledge_event_async(id).await
                })
                .await
            {
                self.consecutive_failures += 1;
                warn!(
                    event_id = event.id,
                    consecutive = self.consecutive_failures,
                    error = %e,
                    "acknowledgement failed; event will be redelivered"
                );
                return self.check_failure_budget();
            }
        }

        self.consecutive_failures = 0;
        Ok(())
    }

    /// Fatal once the consecutive-failure budget is spent.
    fn check_failure_budget(&self) -> Result<(), EngineError> {
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            return Err(EngineError::FailureLimit {
                failures: self.consecutive_failures,
            });
        }
        Ok(())
    }

    /// Converges every catalog proxy to the state the event describes.
    ///
    /// Per-proxy failures do not stop the pass (the remaining proxies
    /// still converge) but the event as a whole fails so it is retried;
    /// the operations are idempotent, so re-converging an already-correct
    /// proxy on that retry is harmless.
    async fn apply(
        &self,
        event: &ChangeEvent,
    ) -> Result<(), RetryExhausted<crate::gateway::GatewayError>> {
        let inject = event.new_value != 0;
        info!(
            event_id = event.id,
            kind = event.kind.as_str(),
            inject,
            "applying change event"
        );

        let mut first_error = None;
        for spec in &self.catalog {
            let result = match event.kind {
                ChangeKind::InjectChanged => {
                    if inject {
                        self.injector.inject_one_toxic(&spec.name).await
                    } else {
                        self.injector.remove_all_toxics(&spec.name).await
                    }
                },
            };
            if let Err(e) = result {
                warn!(proxy = %spec.name, error = %e, "proxy failed to converge");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("catalog", &self.catalog.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
