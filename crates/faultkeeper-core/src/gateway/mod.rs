//! Proxy/toxic gateway: idempotent convergence operations over the
//! external fault-injection engine.
//!
//! The engine (Toxiproxy or compatible) owns live proxy/toxic state; this
//! module never caches it beyond a point-in-time probe. Every operation
//! degrades gracefully to "already in the desired state": conflict and
//! not-found responses are part of normal operation, because the loop may
//! re-run the same convergence action after a crash or a retried call —
//! the transport gives no exactly-once guarantee.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{ProxyCatalog, ProxySpec};
use crate::retry::{RetryExhausted, RetryPolicy};

mod http;

pub use http::ToxiproxyClient;

/// Toxic attached to the upstream direction.
pub const TOXIC_TIMEOUT_UP: &str = "toxic_timeout_up";

/// Toxic attached to the downstream direction.
pub const TOXIC_TIMEOUT_DOWN: &str = "toxic_timeout_down";

/// The managed toxic names, in removal order.
pub const MANAGED_TOXICS: [&str; 2] = [TOXIC_TIMEOUT_UP, TOXIC_TIMEOUT_DOWN];

/// Fixed timeout attribute applied to every injected toxic, in ms.
pub const TOXIC_TIMEOUT_MS: u64 = 4000;

/// Errors from the proxy engine API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The engine answered with a non-success status.
    #[error("proxy engine returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },

    /// The engine could not be reached.
    #[error("proxy engine unreachable: {0}")]
    Network(String),

    /// The configured engine URL is unusable.
    #[error("invalid proxy engine URL: {0}")]
    InvalidUrl(String),
}

impl GatewayError {
    /// Whether this is a "resource already exists" response.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Api { status: 409, .. })
    }

    /// Whether this is a "resource does not exist" response.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

/// Direction a timeout toxic is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToxicDirection {
    /// Applied to traffic flowing toward the upstream service.
    Upstream,
    /// Applied to traffic flowing back toward the client.
    Downstream,
}

impl ToxicDirection {
    /// The managed toxic name for this direction.
    #[must_use]
    pub const fn toxic_name(self) -> &'static str {
        match self {
            Self::Upstream => TOXIC_TIMEOUT_UP,
            Self::Downstream => TOXIC_TIMEOUT_DOWN,
        }
    }

    /// The stream tag the engine API expects.
    #[must_use]
    pub const fn stream(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Downstream => "downstream",
        }
    }
}

/// Low-level proxy engine API, one method per wire operation.
///
/// Implemented by [`ToxiproxyClient`] for the real engine and by mocks in
/// tests. Conflict and not-found responses surface as typed errors; the
/// idempotency policy lives one layer up in [`FaultInjector`].
#[async_trait]
pub trait ProxyApi: Send + Sync {
    /// Creates a proxy. A 409 means it already exists.
    async fn create_proxy(&self, spec: &ProxySpec) -> Result<(), GatewayError>;

    /// Probes whether a named toxic exists on a proxy.
    async fn has_toxic(&self, proxy: &str, toxic: &str) -> Result<bool, GatewayError>;

    /// Adds a timeout toxic in the given direction.
    async fn add_toxic(&self, proxy: &str, direction: ToxicDirection) -> Result<(), GatewayError>;

    /// Removes a named toxic. A 404 means it was already absent.
    async fn remove_toxic(&self, proxy: &str, toxic: &str) -> Result<(), GatewayError>;

    /// Deletes a proxy. A 404 means it was already gone.
    async fn delete_proxy(&self, proxy: &str) -> Result<(), GatewayError>;
}

/// Source of the coin flip that picks the toxic direction.
///
/// Injected rather than hidden behind a global generator so tests can
/// force either branch deterministically.
pub trait ToxicPicker: Send + Sync {
    /// Picks the direction for the next injected toxic.
    fn pick(&self) -> ToxicDirection;
}

/// Production picker: unbiased coin flip.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomPicker;

impl ToxicPicker for RandomPicker {
    fn pick(&self) -> ToxicDirection {
        if rand::thread_rng().gen_bool(0.5) {
            ToxicDirection::Upstream
        } else {
            ToxicDirection::Downstream
        }
    }
}

/// Idempotent convergence operations over a [`ProxyApi`].
///
/// Every call site is wrapped by the shared retry policy; every operation
/// treats "already in the desired state" as success.
pub struct FaultInjector {
    api: Arc<dyn ProxyApi>,
    retry: RetryPolicy,
    picker: Arc<dyn ToxicPicker>,
}

impl FaultInjector {
    /// Creates an injector with the production coin-flip picker.
    #[must_use]
    pub fn new(api: Arc<dyn ProxyApi>, retry: RetryPolicy) -> Self {
        Self::with_picker(api, retry, Arc::new(RandomPicker))
    }

    /// Creates an injector with an explicit picker (used by tests).
    #[must_use]
    pub fn with_picker(
        api: Arc<dyn ProxyApi>,
        retry: RetryPolicy,
        picker: Arc<dyn ToxicPicker>,
    ) -> Self {
        Self { api, retry, picker }
    }

    /// Creates the proxy if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns the exhausted-retry error when the engine keeps failing
    /// with something other than "already exists".
    pub async fn ensure_created(
        &self,
        spec: &ProxySpec,
    ) -> Result<(), RetryExhausted<GatewayError>> {
        self.retry
            .execute("create_proxy", || async move {
                match self.api.create_proxy(spec).await {
                    Ok(()) => {
                        info!(proxy = %spec.name, listen = %spec.listen, "proxy created");
                        Ok(())
                    },
                    Err(e) if e.is_conflict() => {
                        debug!(proxy = %spec.name, "proxy already exists");
                        Ok(())
                    },
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Whether any managed toxic is currently active on the proxy.
    ///
    /// # Errors
    ///
    /// Returns the exhausted-retry error when the probe keeps failing.
    pub async fn has_any_toxic(&self, proxy: &str) -> Result<bool, RetryExhausted<GatewayError>> {
        for toxic in MANAGED_TOXICS {
            let present = self
                .retry
                .execute("get_toxic", || async move {
                    self.api.has_toxic(proxy, toxic).await
                })
                .await?;
            if present {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Removes every managed toxic from the proxy; absence is success.
    ///
    /// Attempts all names even when one fails (collect-and-continue),
    /// logging each failure, and reports the first error only after the
    /// full pass.
    ///
    /// # Errors
    ///
    /// Returns the first exhausted-retry error encountered during the
    /// pass, after all names were attempted.
    pub async fn remove_all_toxics(
        &self,
        proxy: &str,
    ) -> Result<(), RetryExhausted<GatewayError>> {
        let mut first_error = None;

        for toxic in MANAGED_TOXICS {
            let result = self
                .retry
                .execute("remove_toxic", || async move {
                    match self.api.remove_toxic(proxy, toxic).await {
                        Ok(()) => {
                            info!(proxy, toxic, "toxic removed");
                            Ok(())
                        },
                        Err(e) if e.is_not_found() => {
                            debug!(proxy, toxic, "toxic already absent");
                            Ok(())
                        },
                        Err(e) => Err(e),
                    }
                })
                .await;

            if let Err(e) = result {
                warn!(proxy, toxic, error = %e, "failed to remove toxic");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Ensures exactly one managed toxic is active on the proxy.
    ///
    /// A proxy that already carries a managed toxic is left untouched
    /// (logged no-op), so calling this twice is identical to calling it
    /// once. Otherwise any stale toxic is cleared and one direction is
    /// added per the injected coin flip, with the fixed timeout attribute.
    ///
    /// # Errors
    ///
    /// Returns the exhausted-retry error when the probe, the clear, or
    /// the add keeps failing.
    pub async fn inject_one_toxic(
        &self,
        proxy: &str,
    ) -> Result<(), RetryExhausted<GatewayError>> {
        if self.has_any_toxic(proxy).await? {
            info!(proxy, "toxic already active; inject is a no-op");
            return Ok(());
        }

        self.remove_all_toxics(proxy).await?;

        let direction = self.picker.pick();
        self.retry
            .execute("add_toxic", || async move {
                match self.api.add_toxic(proxy, direction).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_conflict() => {
                        debug!(proxy, toxic = direction.toxic_name(), "toxic already present");
                        Ok(())
                    },
                    Err(e) => Err(e),
                }
            })
            .await?;

        info!(
            proxy,
            toxic = direction.toxic_name(),
            timeout_ms = TOXIC_TIMEOUT_MS,
            "timeout toxic injected"
        );
        Ok(())
    }

    /// Best-effort deletion of every catalog proxy.
    ///
    /// Per-proxy failures are logged and never abort the remaining
    /// deletions; a proxy that is already gone counts as deleted.
    pub async fn delete_all(&self, catalog: &ProxyCatalog) {
        for spec in catalog {
            let result = self
                .retry
                .execute("delete_proxy", || async move {
                    match self.api.delete_proxy(&spec.name).await {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_not_found() => {
                            debug!(proxy = %spec.name, "proxy already deleted");
                            Ok(())
                        },
                        Err(e) => Err(e),
                    }
                })
                .await;

            match result {
                Ok(()) => info!(proxy = %spec.name, "proxy deleted"),
                Err(e) => warn!(proxy = %spec.name, error = %e, "failed to delete proxy"),
            }
        }
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
