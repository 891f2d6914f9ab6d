//! Multi-cluster Kubernetes client
//!
//! Keeps a live map of target-cluster credentials read from ConfigMaps in a
//! management cluster and offers list/watch across every known cluster as
//! if it were one:
//! - Cluster client cache keyed by cluster id
//! - Credential watcher mirroring the management cluster into the cache
//! - Per-cluster list/watch over kube-rs
//! - Cross-cluster aggregate list (fail-closed) and fan-in watch

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod health;
pub mod listwatch;
pub mod logging;
pub mod shutdown;

pub use aggregate::{
    AggregateEvent, AggregateList, AggregateSettings, AggregateWatch, CacheListWatchProvider,
    ClusterEvent, ClusterObject, CrossClusterListWatch, ListWatchProvider, PartialList,
    ResourceVersions, WatchFailure, WatchReport,
};
pub use cache::{ClusterClientCache, ClusterConfig};
pub use config::McConfig;
pub use credentials::{CredentialSettings, CredentialWatcher, WatcherStatus, WatcherStatusHandle};
pub use error::{AggregateListFailure, McError, McResult};
pub use listwatch::{ClusterList, ClusterListWatch, ListWatch, ResourceDescriptor};
pub use mcclient_common::{ClusterId, ClusterSummary, WatchTaskState};

use health::{HealthChecker, HealthResponse, LivenessResponse, ReadinessResponse};
use kube::api::DynamicObject;
use kube::Client;
use serde::de::DeserializeOwned;
use shutdown::TaskShutdown;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Entry point: cluster lookup plus cross-cluster list/watch
pub struct MultiClusterClient {
    cache: ClusterClientCache,
    settings: AggregateSettings,
    status: Option<WatcherStatusHandle>,
    token: CancellationToken,
    tasks: TaskShutdown,
    health: HealthChecker,
}

impl MultiClusterClient {
    /// Connect to the management cluster described by `config` and wait
    /// for the first full credential list
    pub async fn connect(config: &McConfig, token: &CancellationToken) -> McResult<Self> {
        config.validate()?;

        let management = &config.management;
        let client = credentials::management_client(
            management.kubeconfig.as_deref(),
            management.context.as_deref(),
        )
        .await?;

        Self::new(
            client,
            management.credentials.clone(),
            config.aggregate,
            management.sync_timeout(),
            token,
        )
        .await
    }

    /// Start watching credentials through an existing management client
    pub async fn new(
        management: Client,
        credentials: CredentialSettings,
        settings: AggregateSettings,
        sync_timeout: Duration,
        token: &CancellationToken,
    ) -> McResult<Self> {
        let token = token.child_token();
        let cache = ClusterClientCache::new();

        let watcher = CredentialWatcher::new(management, cache.clone(), credentials);
        let status = watcher.status();
        let run = watcher.run(token.clone());

        Self::start(cache, settings, status, token, sync_timeout, run).await
    }

    /// Spawn `run` as the credential watcher task and wait for its first sync
    async fn start<F>(
        cache: ClusterClientCache,
        settings: AggregateSettings,
        status: WatcherStatusHandle,
        token: CancellationToken,
        sync_timeout: Duration,
        run: F,
    ) -> McResult<Self>
    where
        F: Future<Output = McResult<()>> + Send + 'static,
    {
        let mut tasks = TaskShutdown::new();
        tasks.register(
            "credential-watcher",
            tokio::spawn(async move {
                if let Err(e) = run.await {
                    debug!(error = %e, "Credential watcher exited");
                }
            }),
        );

        let mut client = Self {
            cache,
            settings,
            status: Some(status.clone()),
            token,
            tasks,
            health: HealthChecker::new(env!("CARGO_PKG_VERSION")),
        };

        let synced = match tokio::time::timeout(sync_timeout, status.wait_synced()).await {
            Ok(result) => result,
            Err(_) => Err(McError::SyncTimeout(sync_timeout)),
        };

        if let Err(e) = synced {
            client.stop(Duration::from_secs(5)).await;
            return Err(e);
        }

        info!(clusters = client.cache.len(), "Multi-cluster client ready");
        Ok(client)
    }

    /// Client over a cache that is filled by other means
    pub fn from_cache(cache: ClusterClientCache, settings: AggregateSettings) -> Self {
        Self {
            cache,
            settings,
            status: None,
            token: CancellationToken::new(),
            tasks: TaskShutdown::new(),
            health: HealthChecker::new(env!("CARGO_PKG_VERSION")),
        }
    }

    /// Connection config for one cluster
    pub fn config_for_cluster(&self, id: &str) -> McResult<Arc<ClusterConfig>> {
        self.cache.get(id).inspect_err(|_| {
            debug!(cluster = %id, "Lookup of unknown cluster");
        })
    }

    /// Client for one cluster, built on first use
    pub fn client_for_cluster(&self, id: &str) -> McResult<Client> {
        self.cache.client_for(id).inspect_err(|e| {
            debug!(cluster = %id, error = %e, "No client for cluster");
        })
    }

    /// Every known cluster, sorted by id
    pub fn clusters(&self) -> Vec<ClusterSummary> {
        self.cache.summaries()
    }

    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.cache.cluster_ids()
    }

    pub fn cache(&self) -> &ClusterClientCache {
        &self.cache
    }

    pub fn settings(&self) -> &AggregateSettings {
        &self.settings
    }

    /// List/watch `resource` across every cluster known at call time
    pub fn cross_cluster_list_watch(
        &self,
        resource: &ResourceDescriptor,
    ) -> CrossClusterListWatch<CacheListWatchProvider<DynamicObject>> {
        let provider = CacheListWatchProvider::for_resource(self.cache.clone(), resource.clone());
        CrossClusterListWatch::new(provider, self.settings)
    }

    /// Typed cross-cluster list/watch; `make` scopes each cluster's `Api`
    pub fn cross_cluster_list_watch_with<K, F>(
        &self,
        make: F,
    ) -> CrossClusterListWatch<CacheListWatchProvider<K>>
    where
        K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
        F: Fn(Client) -> ClusterListWatch<K> + Send + Sync + 'static,
    {
        let provider = CacheListWatchProvider::new(self.cache.clone(), make);
        CrossClusterListWatch::new(provider, self.settings)
    }

    /// Token cancelled when this client shuts down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Credential watcher state, if this client runs one
    pub fn watcher_status(&self) -> Option<WatcherStatus> {
        self.status.as_ref().map(WatcherStatusHandle::current)
    }

    /// Resolve once the credential watch has terminated on its own.
    ///
    /// The cluster set is stale from then on. Never resolves for a client
    /// without a credential watcher, or after a requested shutdown.
    pub async fn watcher_terminated(&self) {
        match &self.status {
            Some(status) => status.wait_terminated().await,
            None => std::future::pending().await,
        }
    }

    pub fn health(&self) -> HealthResponse {
        self.health.build_response(self.components())
    }

    pub fn liveness(&self) -> LivenessResponse {
        self.health.liveness(&self.components())
    }

    pub fn readiness(&self) -> ReadinessResponse {
        let components = self.components();
        match self.status {
            Some(_) => self.health.readiness(&components),
            None => ReadinessResponse {
                ready: true,
                reason: None,
                timestamp: chrono::Utc::now().timestamp(),
            },
        }
    }

    fn components(&self) -> Vec<health::ComponentHealth> {
        let mut components = Vec::new();
        if let Some(status) = &self.status {
            components.push(self.health.check_credential_watcher(status));
        }
        components.push(self.health.check_cluster_cache(&self.cache));
        components
    }

    /// Stop the credential watcher and every watch started from this client
    pub async fn shutdown(mut self, timeout: Duration) {
        self.stop(timeout).await;
        info!("Multi-cluster client stopped");
    }

    async fn stop(&mut self, timeout: Duration) {
        self.token.cancel();
        self.tasks.join_all(timeout).await;
    }
}

impl Drop for MultiClusterClient {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for MultiClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiClusterClient")
            .field("clusters", &self.cache.cluster_ids())
            .field("watcher", &self.watcher_status())
            .finish()
    }
}
