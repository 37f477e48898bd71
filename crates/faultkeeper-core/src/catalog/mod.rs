//! Proxy catalog: the fixed set of named proxies under management.
//!
//! The catalog is read-only after construction. Each entry maps a proxy
//! name to the listen address the proxy engine binds and the upstream
//! service it forwards to.

use serde::{Deserialize, Serialize};

/// A single managed proxy definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpec {
    /// Proxy name, unique within the catalog.
    pub name: String,

    /// Address the proxy engine listens on (e.g. `0.0.0.0:6000`).
    pub listen: String,

    /// Upstream address traffic is forwarded to (e.g. `search_tool:5000`).
    pub upstream: String,
}

impl ProxySpec {
    /// Creates a new proxy spec.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        listen: impl Into<String>,
        upstream: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            listen: listen.into(),
            upstream: upstream.into(),
        }
    }
}

/// The catalog of proxies this process manages.
///
/// Immutable for the process lifetime; the engine iterates it for startup
/// creation, per-event convergence, and final deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCatalog {
    specs: Vec<ProxySpec>,
}

impl ProxyCatalog {
    /// Creates a catalog from explicit entries.
    #[must_use]
    pub fn new(specs: Vec<ProxySpec>) -> Self {
        Self { specs }
    }

    /// Iterates the catalog entries in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, ProxySpec> {
        self.specs.iter()
    }

    /// Number of managed proxies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl Default for ProxyCatalog {
    /// The reference catalog: one proxy per tool service in the standard
    /// chaos-testing deployment.
    fn default() -> Self {
        Self::new(vec![
            ProxySpec::new("search_proxy", "0.0.0.0:6000", "search_tool:5000"),
            ProxySpec::new("weather_proxy", "0.0.0.0:6001", "weather_tool:5001"),
            ProxySpec::new("movie_proxy", "0.0.0.0:6002", "movie_tool:5002"),
            ProxySpec::new("calendar_proxy", "0.0.0.0:6003", "calendar_tool:5003"),
            ProxySpec::new("calculator_proxy", "0.0.0.0:6004", "calculator_tool:5004"),
            ProxySpec::new("message_proxy", "0.0.0.0:6005", "message_tool:5005"),
            ProxySpec::new("translator_proxy", "0.0.0.0:6006", "translator_tool:5006"),
        ])
    }
}

impl<'a> IntoIterator for &'a ProxyCatalog {
    type Item = &'a ProxySpec;
    type IntoIter = std::slice::Iter<'a, ProxySpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl From<Vec<ProxySpec>> for ProxyCatalog {
    fn from(specs: Vec<ProxySpec>) -> Self {
        Self::new(specs)
    }
}
