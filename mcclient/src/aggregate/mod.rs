//! Cross-cluster aggregation
//!
//! Composes one `ListWatch` per known cluster into a single list/watch
//! source whose items and events carry the cluster they came from.

mod list;
mod watch;

pub use list::{AggregateList, ClusterObject, PartialList, ResourceVersions};
pub use watch::{AggregateEvent, AggregateWatch, ClusterEvent, WatchFailure, WatchReport};

use crate::cache::ClusterClientCache;
use crate::error::McResult;
use crate::listwatch::{ClusterListWatch, ListWatch, ResourceDescriptor};
use kube::api::{DynamicObject, ListParams, WatchParams};
use kube::{Client, Resource};
use mcclient_common::ClusterId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default number of clusters listed at the same time
pub const DEFAULT_LIST_CONCURRENCY: usize = 16;

/// Default capacity of the combined watch channel
pub const DEFAULT_WATCH_CHANNEL_CAPACITY: usize = 128;

/// Tuning for aggregate list and watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSettings {
    /// Upper bound on concurrent per-cluster list calls
    #[serde(default = "default_list_concurrency")]
    pub list_concurrency: usize,
    /// Events buffered between producers and the consumer
    #[serde(default = "default_watch_channel_capacity")]
    pub watch_channel_capacity: usize,
}

fn default_list_concurrency() -> usize {
    DEFAULT_LIST_CONCURRENCY
}

fn default_watch_channel_capacity() -> usize {
    DEFAULT_WATCH_CHANNEL_CAPACITY
}

impl Default for AggregateSettings {
    fn default() -> Self {
        Self {
            list_concurrency: DEFAULT_LIST_CONCURRENCY,
            watch_channel_capacity: DEFAULT_WATCH_CHANNEL_CAPACITY,
        }
    }
}

/// Source of per-cluster list/watch values.
///
/// Called once per aggregate list or watch; the returned set is the
/// cluster snapshot that invocation works on.
pub trait ListWatchProvider: Send + Sync {
    type ListWatch: ListWatch + 'static;

    /// Every known cluster with its list/watch, or the reason it is unusable
    fn list_watchers(&self) -> Vec<(ClusterId, McResult<Self::ListWatch>)>;
}

/// Fixed set of clusters
impl<L> ListWatchProvider for BTreeMap<ClusterId, L>
where
    L: ListWatch + Clone + 'static,
{
    type ListWatch = L;

    fn list_watchers(&self) -> Vec<(ClusterId, McResult<L>)> {
        self.iter()
            .map(|(id, lw)| (id.clone(), Ok(lw.clone())))
            .collect()
    }
}

type MakeListWatch<K> = dyn Fn(Client) -> ClusterListWatch<K> + Send + Sync;

/// Builds list/watch values from the cluster client cache
pub struct CacheListWatchProvider<K> {
    cache: ClusterClientCache,
    make: Arc<MakeListWatch<K>>,
}

impl CacheListWatchProvider<DynamicObject> {
    /// Untyped provider for a resource described at runtime
    pub fn for_resource(cache: ClusterClientCache, resource: ResourceDescriptor) -> Self {
        Self::new(cache, move |client| {
            ClusterListWatch::for_resource(client, &resource)
        })
    }
}

impl<K> CacheListWatchProvider<K> {
    pub fn new<F>(cache: ClusterClientCache, make: F) -> Self
    where
        F: Fn(Client) -> ClusterListWatch<K> + Send + Sync + 'static,
    {
        Self {
            cache,
            make: Arc::new(make),
        }
    }

    pub fn cache(&self) -> &ClusterClientCache {
        &self.cache
    }
}

impl<K> Clone for CacheListWatchProvider<K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            make: self.make.clone(),
        }
    }
}

impl<K> ListWatchProvider for CacheListWatchProvider<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    type ListWatch = ClusterListWatch<K>;

    fn list_watchers(&self) -> Vec<(ClusterId, McResult<ClusterListWatch<K>>)> {
        self.cache
            .snapshot()
            .into_iter()
            .map(|(id, config)| {
                let lw = self.cache.client_for_config(&config).map(|c| (self.make)(c));
                (id, lw)
            })
            .collect()
    }
}

/// Object type produced by a provider
pub type ProviderObject<P> = <<P as ListWatchProvider>::ListWatch as ListWatch>::Object;

/// One list/watch source spanning every cluster the provider knows
pub struct CrossClusterListWatch<P> {
    provider: P,
    settings: AggregateSettings,
}

impl<P: ListWatchProvider> CrossClusterListWatch<P> {
    pub fn new(provider: P, settings: AggregateSettings) -> Self {
        Self { provider, settings }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn settings(&self) -> &AggregateSettings {
        &self.settings
    }

    /// List every cluster and concatenate the results.
    ///
    /// Fails if any cluster fails, naming every failed cluster.
    pub async fn list(&self, params: &ListParams) -> McResult<AggregateList<ProviderObject<P>>> {
        let partial = self.list_best_effort(params).await;
        if !partial.is_complete() {
            tracing::warn!(failed = partial.failures.len(), "Aggregate list failed");
        }
        partial.into_result()
    }

    /// List every cluster, keeping whatever succeeded
    pub async fn list_best_effort(&self, params: &ListParams) -> PartialList<ProviderObject<P>> {
        let listers = sorted(self.provider.list_watchers());
        list::list_clusters(listers, params, self.settings.list_concurrency).await
    }

    /// Watch every cluster through one combined event stream.
    ///
    /// Each cluster resumes from its entry in `versions` ("0" when absent).
    /// Cancelling `token` tears down every per-cluster watch.
    pub fn watch(
        &self,
        params: &WatchParams,
        versions: &ResourceVersions,
        token: &CancellationToken,
    ) -> AggregateWatch<ProviderObject<P>> {
        let watchers = sorted(self.provider.list_watchers());
        watch::spawn(
            watchers,
            params.clone(),
            versions,
            token,
            self.settings.watch_channel_capacity,
        )
    }
}

fn sorted<T>(mut clusters: Vec<(ClusterId, T)>) -> Vec<(ClusterId, T)> {
    clusters.sort_by(|a, b| a.0.cmp(&b.0));
    clusters
}
