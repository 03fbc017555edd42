//! Upstream health model
//!
//! Each worker keeps one piece of shared mutable state: a registry mapping
//! route paths to their runtime upstream lists. Request handlers read it to
//! pick candidates and flip upstreams to unhealthy on failure; the recovery
//! receiver flips them back when a probe succeeds.
//!
//! Races here are benign by design: a handler that read `Healthy` may still
//! attempt a request while another handler flips the flag, and several
//! failing requests may each mark the same upstream — the end state is the
//! same. The `RwLock` gives recovery writes a happens-before edge to later
//! selector reads.

pub mod probe;

use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::{Config, UpstreamConfig};

/// Health flag for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// A configured upstream plus its runtime health.
#[derive(Debug, Clone)]
pub struct RuntimeUpstream {
    pub config: UpstreamConfig,
    pub status: HealthStatus,
    /// Unix ms of the last observed failure; 0 when never failed.
    pub last_failure: i64,
    /// Unix ms of the last probe dispatch, for throttling.
    last_probe: i64,
}

impl RuntimeUpstream {
    pub fn healthy(config: UpstreamConfig) -> Self {
        Self {
            config,
            status: HealthStatus::Healthy,
            last_failure: 0,
            last_probe: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Per-worker registry of runtime upstreams for failover-enabled routes.
///
/// Routes without failover never enter the registry; the pipeline hands them
/// a transient healthy-labeled copy of their static upstreams instead, so
/// their failures are forgotten at the end of the request.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    routes: RwLock<HashMap<String, Vec<RuntimeUpstream>>>,
}

impl HealthRegistry {
    /// Build the registry from the config document: one entry per route with
    /// failover enabled, every upstream healthy.
    pub fn initialize(config: &Config) -> Self {
        let mut routes = HashMap::new();
        for route in &config.routes {
            if route.failover.enabled {
                let upstreams = route
                    .upstreams
                    .iter()
                    .cloned()
                    .map(RuntimeUpstream::healthy)
                    .collect();
                routes.insert(route.path.clone(), upstreams);
            }
        }
        Self {
            routes: RwLock::new(routes),
        }
    }

    /// Whether this route tracks health across requests.
    pub fn tracks(&self, route_path: &str) -> bool {
        self.routes
            .read()
            .map(|routes| routes.contains_key(route_path))
            .unwrap_or(false)
    }

    /// Clone the current upstream list for a route, or `None` if the route
    /// is not tracked.
    pub fn snapshot(&self, route_path: &str) -> Option<Vec<RuntimeUpstream>> {
        self.routes
            .read()
            .ok()
            .and_then(|routes| routes.get(route_path).cloned())
    }

    /// Flip an upstream to unhealthy and stamp the failure time.
    pub fn mark_unhealthy(&self, route_path: &str, target: &str) {
        let Ok(mut routes) = self.routes.write() else {
            return;
        };
        if let Some(upstreams) = routes.get_mut(route_path) {
            for upstream in upstreams.iter_mut() {
                if upstream.config.target == target {
                    upstream.status = HealthStatus::Unhealthy;
                    upstream.last_failure = chrono::Utc::now().timestamp_millis();
                    tracing::warn!(route = %route_path, target = %target, "upstream marked unhealthy");
                }
            }
        }
    }

    /// Flip the first matching unhealthy upstream across all routes back to
    /// healthy. Called by the recovery receiver when a probe succeeds.
    pub fn mark_recovered(&self, target: &str) {
        let Ok(mut routes) = self.routes.write() else {
            return;
        };
        for (route_path, upstreams) in routes.iter_mut() {
            for upstream in upstreams.iter_mut() {
                if upstream.config.target == target && !upstream.is_healthy() {
                    upstream.status = HealthStatus::Healthy;
                    tracing::info!(route = %route_path, target = %target, "upstream recovered");
                    return;
                }
            }
        }
    }

    /// Whether a probe for this target is due, and if so stamp the dispatch
    /// time so the next caller within the interval gets `false`.
    pub fn claim_probe(&self, route_path: &str, target: &str, interval_seconds: u64) -> bool {
        let Ok(mut routes) = self.routes.write() else {
            return false;
        };
        let Some(upstreams) = routes.get_mut(route_path) else {
            return false;
        };
        let now = chrono::Utc::now().timestamp_millis();
        for upstream in upstreams.iter_mut() {
            if upstream.config.target == target {
                if now - upstream.last_probe >= (interval_seconds.max(1) as i64) * 1000 {
                    upstream.last_probe = now;
                    return true;
                }
                return false;
            }
        }
        false
    }
}
