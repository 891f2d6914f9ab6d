//! Health and readiness reporting
//!
//! Reports the credential watcher and the cluster cache. The client is
//! ready once the cache has been filled from the management cluster.

use crate::cache::ClusterClientCache;
use crate::credentials::{WatcherStatus, WatcherStatusHandle};
use serde::{Deserialize, Serialize};
use std::time::Instant;

const CREDENTIAL_WATCHER: &str = "credential_watcher";
const CLUSTER_CACHE: &str = "cluster_cache";

/// Overall system health status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Functional but not fully up to date
    Degraded,
    Unhealthy,
}

/// Individual component health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: i64,
    pub components: Vec<ComponentHealth>,
}

/// Liveness probe response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub reason: Option<String>,
    pub timestamp: i64,
}

/// Readiness probe response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub reason: Option<String>,
    pub timestamp: i64,
}

/// Health checker for the client's components
#[derive(Debug, Clone)]
pub struct HealthChecker {
    start_time: Instant,
    version: String,
}

impl HealthChecker {
    pub fn new(version: &str) -> Self {
        Self {
            start_time: Instant::now(),
            version: version.to_string(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Not alive once the credential watcher has failed
    pub fn liveness(&self, components: &[ComponentHealth]) -> LivenessResponse {
        let reason = components
            .iter()
            .find(|c| c.name == CREDENTIAL_WATCHER && c.status == HealthStatus::Unhealthy)
            .map(|c| {
                c.message
                    .clone()
                    .unwrap_or_else(|| "Credential watcher failed".to_string())
            });

        LivenessResponse {
            alive: reason.is_none(),
            reason,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Map the watcher state onto a component status
    pub fn check_credential_watcher(&self, status: &WatcherStatusHandle) -> ComponentHealth {
        let current = status.current();
        let (health, message) = match current {
            WatcherStatus::Starting => (HealthStatus::Degraded, "Waiting for initial sync"),
            WatcherStatus::Synced => (HealthStatus::Healthy, "Synced"),
            WatcherStatus::Stopped => (HealthStatus::Degraded, "Stopped"),
            WatcherStatus::Terminated => {
                (HealthStatus::Unhealthy, "Watch terminated, cluster cache is stale")
            }
        };

        ComponentHealth {
            name: CREDENTIAL_WATCHER.to_string(),
            status: health,
            message: Some(message.to_string()),
        }
    }

    pub fn check_cluster_cache(&self, cache: &ClusterClientCache) -> ComponentHealth {
        ComponentHealth {
            name: CLUSTER_CACHE.to_string(),
            status: HealthStatus::Healthy,
            message: Some(format!("{} cluster(s) known", cache.len())),
        }
    }

    fn aggregate_status(components: &[ComponentHealth]) -> HealthStatus {
        if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Build complete health response
    pub fn build_response(&self, components: Vec<ComponentHealth>) -> HealthResponse {
        HealthResponse {
            status: Self::aggregate_status(&components),
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            timestamp: chrono::Utc::now().timestamp(),
            components,
        }
    }

    /// Ready once the credential watcher is synced
    pub fn readiness(&self, components: &[ComponentHealth]) -> ReadinessResponse {
        let watcher = components.iter().find(|c| c.name == CREDENTIAL_WATCHER);

        let reason = match watcher {
            Some(c) if c.status == HealthStatus::Healthy => None,
            Some(c) => Some(c.message.clone().unwrap_or_else(|| "Credential watcher not ready".to_string())),
            None => Some("Credential watcher not running".to_string()),
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}
