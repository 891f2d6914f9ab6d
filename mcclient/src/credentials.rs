//! Cluster credential watcher
//!
//! Watches ConfigMaps in the management cluster, each holding the
//! kubeconfig of one target cluster, and mirrors them into the
//! `ClusterClientCache`.

use crate::cache::{ClusterClientCache, ClusterConfig};
use crate::error::{McError, McResult};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Client, Config};
use mcclient_common::ClusterId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_NAME_PREFIX: &str = "cluster";
pub const DEFAULT_CONFIG_KEY: &str = "raw_config";
pub const DEFAULT_CONTEXT_KEY: &str = "context";

/// Where and how credential records are stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSettings {
    /// Namespace holding the credential ConfigMaps
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Only ConfigMaps whose name starts with this are considered
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Data key holding the kubeconfig YAML
    #[serde(default = "default_config_key")]
    pub config_key: String,
    /// Optional data key selecting a kubeconfig context
    #[serde(default = "default_context_key")]
    pub context_key: String,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_name_prefix() -> String {
    DEFAULT_NAME_PREFIX.to_string()
}

fn default_config_key() -> String {
    DEFAULT_CONFIG_KEY.to_string()
}

fn default_context_key() -> String {
    DEFAULT_CONTEXT_KEY.to_string()
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            name_prefix: default_name_prefix(),
            config_key: default_config_key(),
            context_key: default_context_key(),
        }
    }
}

/// Name and data of one credential ConfigMap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialRecord {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

impl CredentialRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

impl From<ConfigMap> for CredentialRecord {
    fn from(cm: ConfigMap) -> Self {
        Self {
            name: cm.metadata.name.unwrap_or_default(),
            data: cm.data.unwrap_or_default(),
        }
    }
}

/// Credential change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialEvent {
    /// Record added or updated
    Applied(CredentialRecord),
    Deleted(CredentialRecord),
    /// A full re-list is starting
    ResyncStarted,
    /// Record seen during a re-list
    ResyncApplied(CredentialRecord),
    /// Re-list finished; anything not seen is gone
    ResyncDone,
}

impl From<watcher::Event<ConfigMap>> for CredentialEvent {
    fn from(event: watcher::Event<ConfigMap>) -> Self {
        match event {
            watcher::Event::Apply(cm) => Self::Applied(cm.into()),
            watcher::Event::Delete(cm) => Self::Deleted(cm.into()),
            watcher::Event::Init => Self::ResyncStarted,
            watcher::Event::InitApply(cm) => Self::ResyncApplied(cm.into()),
            watcher::Event::InitDone => Self::ResyncDone,
        }
    }
}

/// Applies credential events to the cache, one at a time and in order
pub struct CredentialSync {
    cache: ClusterClientCache,
    settings: CredentialSettings,
    resync: Option<HashSet<ClusterId>>,
}

impl CredentialSync {
    pub fn new(cache: ClusterClientCache, settings: CredentialSettings) -> Self {
        Self {
            cache,
            settings,
            resync: None,
        }
    }

    /// Apply one event. Returns true when a full re-list completed.
    pub async fn handle(&mut self, event: CredentialEvent) -> bool {
        match event {
            CredentialEvent::Applied(record) => {
                self.apply(record).await;
                false
            }
            CredentialEvent::Deleted(record) => {
                self.delete(&record);
                false
            }
            CredentialEvent::ResyncStarted => {
                debug!("Credential resync started");
                self.resync = Some(HashSet::new());
                false
            }
            CredentialEvent::ResyncApplied(record) => {
                if let Some(id) = self.apply(record).await {
                    self.resync.get_or_insert_with(HashSet::new).insert(id);
                }
                false
            }
            CredentialEvent::ResyncDone => {
                let seen = self.resync.take().unwrap_or_default();
                let removed = self.cache.retain(&seen);
                for id in &removed {
                    info!(cluster = %id, "Cluster removed after resync");
                }
                info!(clusters = self.cache.len(), "Credential resync complete");
                true
            }
        }
    }

    /// Cluster id for a record name, if the record is a credential record
    fn cluster_id(&self, name: &str) -> Option<ClusterId> {
        if !name.starts_with(&self.settings.name_prefix) {
            debug!(name = %name, "Ignoring ConfigMap without cluster prefix");
            return None;
        }

        match ClusterId::new(name) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(name = %name, error = %e, "Ignoring ConfigMap with invalid cluster id");
                None
            }
        }
    }

    /// Store the record's config. Returns the id whenever the record
    /// belongs to a cluster, even if its payload was rejected.
    async fn apply(&self, record: CredentialRecord) -> Option<ClusterId> {
        let id = self.cluster_id(&record.name)?;

        let Some(kubeconfig) = record.data.get(&self.settings.config_key) else {
            warn!(
                cluster = %id,
                key = %self.settings.config_key,
                "Credential record has no kubeconfig, keeping previous config"
            );
            return Some(id);
        };
        let context = record.data.get(&self.settings.context_key).map(String::as_str);

        match ClusterConfig::from_kubeconfig(id.clone(), kubeconfig, context).await {
            Ok(config) => {
                let api_server = config.api_server().to_string();
                let replaced = self.cache.put(config).is_some();
                info!(
                    cluster = %id,
                    api_server = %api_server,
                    replaced = replaced,
                    "Cluster credentials applied"
                );
            }
            Err(e) => {
                warn!(cluster = %id, error = %e, "Invalid cluster credentials, keeping previous config");
            }
        }

        Some(id)
    }

    fn delete(&self, record: &CredentialRecord) {
        let Some(id) = self.cluster_id(&record.name) else {
            return;
        };

        if self.cache.remove(id.as_str()).is_some() {
            info!(cluster = %id, "Cluster credentials removed");
        }
    }
}

/// State of the credential watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherStatus {
    /// Waiting for the first full list
    Starting,
    /// Cache reflects the management cluster
    Synced,
    /// Stopped on request
    Stopped,
    /// Subscription ended; the cache is stale
    Terminated,
}

impl std::fmt::Display for WatcherStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Synced => write!(f, "synced"),
            Self::Stopped => write!(f, "stopped"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Read side of the watcher status
#[derive(Debug, Clone)]
pub struct WatcherStatusHandle(watch::Receiver<WatcherStatus>);

impl WatcherStatusHandle {
    pub fn current(&self) -> WatcherStatus {
        *self.0.borrow()
    }

    /// Resolve once the cache has been filled from a full list
    pub async fn wait_synced(&self) -> McResult<()> {
        let mut rx = self.0.clone();
        let status = rx
            .wait_for(|s| *s != WatcherStatus::Starting)
            .await
            .map(|s| *s)
            .unwrap_or_else(|_| self.current());

        match status {
            WatcherStatus::Synced => Ok(()),
            _ => Err(McError::CredentialWatchTerminated),
        }
    }

    /// Resolve once the subscription has ended on its own.
    ///
    /// Never resolves if the watcher is stopped on request instead.
    pub async fn wait_terminated(&self) {
        let mut rx = self.0.clone();
        if rx.wait_for(|s| *s == WatcherStatus::Terminated).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Keeps the cluster cache in line with the management cluster
pub struct CredentialWatcher {
    client: Client,
    cache: ClusterClientCache,
    settings: CredentialSettings,
    status: watch::Sender<WatcherStatus>,
}

impl CredentialWatcher {
    pub fn new(client: Client, cache: ClusterClientCache, settings: CredentialSettings) -> Self {
        let (status, _) = watch::channel(WatcherStatus::Starting);
        Self {
            client,
            cache,
            settings,
            status,
        }
    }

    pub fn status(&self) -> WatcherStatusHandle {
        WatcherStatusHandle(self.status.subscribe())
    }

    /// Watch until cancelled.
    ///
    /// Transient errors are retried with backoff. Returns
    /// `CredentialWatchTerminated` if the subscription ends on its own.
    pub async fn run(self, token: CancellationToken) -> McResult<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.settings.namespace);
        let stream = watcher(api, watcher::Config::default()).default_backoff();

        info!(
            namespace = %self.settings.namespace,
            prefix = %self.settings.name_prefix,
            "Watching cluster credentials"
        );
        self.drive(stream, token).await
    }

    fn mark_synced(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == WatcherStatus::Starting {
                *status = WatcherStatus::Synced;
                true
            } else {
                false
            }
        })
    }

    pub(crate) async fn drive<S>(self, stream: S, token: CancellationToken) -> McResult<()>
    where
        S: Stream<Item = Result<watcher::Event<ConfigMap>, watcher::Error>>,
    {
        let mut sync = CredentialSync::new(self.cache.clone(), self.settings.clone());
        let mut stream = std::pin::pin!(stream);

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Credential watcher stopped");
                    self.status.send_replace(WatcherStatus::Stopped);
                    return Ok(());
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    let resynced = sync.handle(event.into()).await;
                    if resynced && self.mark_synced() {
                        info!(clusters = self.cache.len(), "Cluster cache synced");
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Credential watch error, retrying");
                }
                None => {
                    error!("Credential watch terminated; cluster cache is no longer updated");
                    self.status.send_replace(WatcherStatus::Terminated);
                    return Err(McError::CredentialWatchTerminated);
                }
            }
        }
    }
}

/// Client for the management cluster.
///
/// Uses the given kubeconfig file, or the default kubeconfig and
/// in-cluster environment when none is given.
pub async fn management_client(kubeconfig: Option<&Path>, context: Option<&str>) -> McResult<Client> {
    let options = KubeConfigOptions {
        context: context.map(String::from),
        ..Default::default()
    };

    let config = match (kubeconfig, context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                McError::InvalidKubeconfig(format!("Failed to read {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| McError::InvalidKubeconfig(format!("Failed to create config: {}", e)))?
        }
        (None, Some(_)) => Config::from_kubeconfig(&options)
            .await
            .map_err(|e| McError::InvalidKubeconfig(format!("Failed to create config: {}", e)))?,
        (None, None) => Config::infer()
            .await
            .map_err(|e| McError::InvalidKubeconfig(format!("Failed to infer config: {}", e)))?,
    };

    debug!(api_server = %config.cluster_url, "Management cluster client configured");
    Ok(Client::try_from(config)?)
}
