//! Service address resolution for external-service branches.
//!
//! A `resource_id` is either a full URL or a logical service name that some
//! backend (static map, DNS, Consul, ...) can turn into one. Implementations
//! are pluggable behind [`ServiceAddressResolver`]; the built-in
//! [`StaticResolver`] covers the full-URL and configured-route cases and
//! keeps a short negative cache so a missing service does not hammer the
//! lookup path during phase-2 retries.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use lodestar_core::{CoreError, CoreResult};

/// Turns a resource id into a base URL.
#[async_trait]
pub trait ServiceAddressResolver: Send + Sync {
    async fn resolve(&self, resource_id: &str) -> CoreResult<String>;
}

/// Resolver over a configured route table.
pub struct StaticResolver {
    routes: DashMap<String, String>,
    failures: DashMap<String, Instant>,
    failure_ttl: Duration,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            failures: DashMap::new(),
            failure_ttl: Duration::from_secs(30),
        }
    }

    pub fn with_failure_ttl(mut self, ttl: Duration) -> Self {
        self.failure_ttl = ttl;
        self
    }

    /// Map a logical service name to its base URL.
    pub fn add_route(&self, resource_id: impl Into<String>, url: impl Into<String>) {
        self.routes.insert(resource_id.into(), normalize_url(url.into()));
    }

    fn recently_failed(&self, resource_id: &str) -> bool {
        match self.failures.get(resource_id) {
            Some(at) => at.elapsed() < self.failure_ttl,
            None => false,
        }
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceAddressResolver for StaticResolver {
    async fn resolve(&self, resource_id: &str) -> CoreResult<String> {
        if is_full_url(resource_id) {
            return Ok(normalize_url(resource_id.to_string()));
        }
        if let Some(url) = self.routes.get(resource_id) {
            debug!(resource_id, url = %url.value(), "service address resolved");
            return Ok(url.value().clone());
        }
        if self.recently_failed(resource_id) {
            return Err(CoreError::ServiceNotResolvable(format!("{resource_id} (cached failure)")));
        }
        self.failures.insert(resource_id.to_string(), Instant::now());
        warn!(resource_id, "service address not resolvable");
        Err(CoreError::ServiceNotResolvable(resource_id.to_string()))
    }
}

fn is_full_url(candidate: &str) -> bool {
    candidate.starts_with("http://") || candidate.starts_with("https://")
}

/// Add a scheme when missing and strip a trailing slash.
fn normalize_url(mut url: String) -> String {
    if !is_full_url(&url) {
        url = format!("http://{url}");
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}
