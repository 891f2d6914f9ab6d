//! Cluster client cache
//!
//! Concurrency-safe mapping from cluster id to connection config, with
//! lazily built `kube::Client` handles. Only the credential watcher writes
//! to it; everything else reads through `get`, `client_for` and `snapshot`.
//!
//! The map sits behind a single mutex that is held for map operations only,
//! never across an `.await` or a network call.

use crate::error::{McError, McResult};
use chrono::{DateTime, Utc};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use mcclient_common::{ClusterId, ClusterSummary};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Connection parameters for one target cluster.
///
/// Immutable once built. New credentials produce a new value that replaces
/// the old one in the cache; holders of the old `Arc` keep a valid config.
#[derive(Clone)]
pub struct ClusterConfig {
    id: ClusterId,
    api_server: String,
    context: Option<String>,
    kube: Config,
    observed_at: DateTime<Utc>,
}

impl ClusterConfig {
    /// Wrap an already resolved kube config
    pub fn new(id: ClusterId, config: Config) -> Self {
        Self {
            id,
            api_server: config.cluster_url.to_string(),
            context: None,
            kube: config,
            observed_at: Utc::now(),
        }
    }

    /// Build a config from kubeconfig YAML with an optional context
    pub async fn from_kubeconfig(
        id: ClusterId,
        kubeconfig_yaml: &str,
        context: Option<&str>,
    ) -> McResult<Self> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml).map_err(|e| McError::Config {
            cluster: id.to_string(),
            reason: format!("Failed to parse kubeconfig: {}", e),
        })?;

        let context = context
            .map(String::from)
            .or_else(|| kubeconfig.current_context.clone());

        let config = Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: context.clone(),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| McError::Config {
            cluster: id.to_string(),
            reason: format!("Failed to create config: {}", e),
        })?;

        Ok(Self {
            context,
            ..Self::new(id, config)
        })
    }

    pub fn id(&self) -> &ClusterId {
        &self.id
    }

    /// API server URL
    pub fn api_server(&self) -> &str {
        &self.api_server
    }

    /// Kubeconfig context the config was resolved from
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn kube_config(&self) -> &Config {
        &self.kube
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Construct a new client handle for this cluster
    pub fn build_client(&self) -> McResult<Client> {
        Client::try_from(self.kube.clone()).map_err(|e| McError::Config {
            cluster: self.id.to_string(),
            reason: format!("Failed to create client: {}", e),
        })
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("id", &self.id)
            .field("api_server", &self.api_server)
            .field("context", &self.context)
            .field("observed_at", &self.observed_at)
            .finish()
    }
}

struct CacheEntry {
    config: Arc<ClusterConfig>,
    client: Option<Client>,
}

/// Shared cluster id → connection config map
#[derive(Clone, Default)]
pub struct ClusterClientCache {
    inner: Arc<Mutex<HashMap<ClusterId, CacheEntry>>>,
}

impl ClusterClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the config for a cluster.
    ///
    /// Replacing drops the memoized client; the previous config is returned.
    pub fn put(&self, config: ClusterConfig) -> Option<Arc<ClusterConfig>> {
        let id = config.id.clone();
        let entry = CacheEntry {
            config: Arc::new(config),
            client: None,
        };

        let previous = self.inner.lock().insert(id.clone(), entry);
        tracing::debug!(cluster = %id, replaced = previous.is_some(), "Cluster config stored");
        previous.map(|e| e.config)
    }

    /// Remove a cluster. Configs and clients already handed out stay usable.
    pub fn remove(&self, id: &str) -> Option<Arc<ClusterConfig>> {
        let removed = self.inner.lock().remove(id);
        if removed.is_some() {
            tracing::debug!(cluster = %id, "Cluster config removed");
        }
        removed.map(|e| e.config)
    }

    /// Look up the config for a cluster
    pub fn get(&self, id: &str) -> McResult<Arc<ClusterConfig>> {
        self.inner
            .lock()
            .get(id)
            .map(|e| e.config.clone())
            .ok_or_else(|| McError::UnknownCluster(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// Client for a cluster, built on first use and memoized
    pub fn client_for(&self, id: &str) -> McResult<Client> {
        let config = {
            let map = self.inner.lock();
            let entry = map
                .get(id)
                .ok_or_else(|| McError::UnknownCluster(id.to_string()))?;
            if let Some(client) = &entry.client {
                return Ok(client.clone());
            }
            entry.config.clone()
        };

        self.client_for_config(&config)
    }

    /// Client for a config taken from a snapshot.
    ///
    /// The client is memoized only while the cache still holds this exact
    /// config; otherwise it is built for the caller alone.
    pub fn client_for_config(&self, config: &Arc<ClusterConfig>) -> McResult<Client> {
        if let Some(client) = self.memoized(config) {
            return Ok(client);
        }

        let client = config.build_client()?;

        let mut map = self.inner.lock();
        match map.get_mut(config.id.as_str()) {
            Some(entry) if Arc::ptr_eq(&entry.config, config) => {
                Ok(entry.client.get_or_insert(client).clone())
            }
            _ => Ok(client),
        }
    }

    fn memoized(&self, config: &Arc<ClusterConfig>) -> Option<Client> {
        let map = self.inner.lock();
        map.get(config.id.as_str())
            .filter(|entry| Arc::ptr_eq(&entry.config, config))
            .and_then(|entry| entry.client.clone())
    }

    /// Point-in-time copy of every known cluster, sorted by id
    pub fn snapshot(&self) -> Vec<(ClusterId, Arc<ClusterConfig>)> {
        let mut clusters: Vec<_> = {
            let map = self.inner.lock();
            map.iter()
                .map(|(id, entry)| (id.clone(), entry.config.clone()))
                .collect()
        };
        clusters.sort_by(|a, b| a.0.cmp(&b.0));
        clusters
    }

    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.snapshot().into_iter().map(|(id, _)| id).collect()
    }

    /// Drop every cluster not in `keep`, returning the removed ids
    pub fn retain(&self, keep: &HashSet<ClusterId>) -> Vec<ClusterId> {
        let mut map = self.inner.lock();
        let stale: Vec<ClusterId> = map.keys().filter(|id| !keep.contains(*id)).cloned().collect();
        for id in &stale {
            map.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Summaries of all known clusters for operator output
    pub fn summaries(&self) -> Vec<ClusterSummary> {
        let mut summaries: Vec<_> = {
            let map = self.inner.lock();
            map.values()
                .map(|entry| ClusterSummary {
                    id: entry.config.id.clone(),
                    api_server: entry.config.api_server.clone(),
                    context: entry.config.context.clone(),
                    client_ready: entry.client.is_some(),
                    observed_at: entry.config.observed_at,
                })
                .collect()
        };
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

impl std::fmt::Debug for ClusterClientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClientCache")
            .field("clusters", &self.cluster_ids())
            .finish()
    }
}
