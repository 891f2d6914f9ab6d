use crate::error::{AggregateListFailure, McError, McResult};
use crate::listwatch::{ClusterList, ListWatch};
use futures::stream::{self, StreamExt};
use kube::api::ListParams;
use mcclient_common::ClusterId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An object and the cluster it was listed from
#[derive(Debug, Clone, Serialize)]
pub struct ClusterObject<K> {
    pub cluster: ClusterId,
    pub object: K,
}

/// Per-cluster resource versions of an aggregate list.
///
/// A single resource version means nothing across clusters, so each
/// cluster resumes its watch from its own entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersions(BTreeMap<ClusterId, String>);

impl ResourceVersions {
    /// Version used for clusters without a recorded entry
    pub const ANY: &'static str = "0";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cluster: ClusterId, version: impl Into<String>) {
        self.0.insert(cluster, version.into());
    }

    pub fn get(&self, cluster: &str) -> Option<&str> {
        self.0.get(cluster).map(String::as_str)
    }

    /// Where a watch on `cluster` should start
    pub fn start_version(&self, cluster: &str) -> &str {
        self.get(cluster).unwrap_or(Self::ANY)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClusterId, &str)> {
        self.0.iter().map(|(id, v)| (id, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Items from every cluster, grouped by cluster in id order
#[derive(Debug, Clone)]
pub struct AggregateList<K> {
    pub items: Vec<ClusterObject<K>>,
    pub resource_versions: ResourceVersions,
}

impl<K> Default for AggregateList<K> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            resource_versions: ResourceVersions::default(),
        }
    }
}

impl<K> AggregateList<K> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn objects(&self) -> impl Iterator<Item = &K> {
        self.items.iter().map(|item| &item.object)
    }

    /// Drop the cluster tags
    pub fn into_objects(self) -> Vec<K> {
        self.items.into_iter().map(|item| item.object).collect()
    }

    fn extend(&mut self, cluster: &ClusterId, list: ClusterList<K>) {
        if let Some(version) = list.resource_version {
            self.resource_versions.insert(cluster.clone(), version);
        }
        self.items
            .extend(list.items.into_iter().map(|object| ClusterObject {
                cluster: cluster.clone(),
                object,
            }));
    }
}

/// Result of a best-effort list: what succeeded plus what failed
#[derive(Debug)]
pub struct PartialList<K> {
    pub list: AggregateList<K>,
    pub failures: Vec<(ClusterId, McError)>,
}

impl<K> PartialList<K> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fail-closed view of this result
    pub fn into_result(self) -> McResult<AggregateList<K>> {
        if self.failures.is_empty() {
            Ok(self.list)
        } else {
            Err(AggregateListFailure {
                failures: self.failures,
            }
            .into())
        }
    }
}

/// List each cluster with at most `concurrency` calls in flight.
///
/// Results come back in the order of `listers`.
pub(super) async fn list_clusters<L: ListWatch>(
    listers: Vec<(ClusterId, McResult<L>)>,
    params: &ListParams,
    concurrency: usize,
) -> PartialList<L::Object> {
    let results: Vec<_> = stream::iter(listers)
        .map(|(cluster, lw)| async move {
            let result = match lw {
                Ok(lw) => lw.list(params).await.map_err(|source| McError::Transport {
                    cluster: cluster.clone(),
                    source,
                }),
                Err(e) => Err(e),
            };
            (cluster, result)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut partial = PartialList {
        list: AggregateList::default(),
        failures: Vec::new(),
    };

    for (cluster, result) in results {
        match result {
            Ok(list) => {
                tracing::debug!(cluster = %cluster, items = list.items.len(), "Cluster listed");
                partial.list.extend(&cluster, list);
            }
            Err(e) => {
                tracing::warn!(cluster = %cluster, error = %e, "Cluster list failed");
                partial.failures.push((cluster, e));
            }
        }
    }

    partial
}

#[cfg(test)]
mod tests {
    use super::super::fake::*;
    use super::super::{AggregateSettings, CrossClusterListWatch};
    use super::*;
    use std::sync::Arc;

    fn tagged(list: &AggregateList<k8s_openapi::api::core::v1::ConfigMap>) -> Vec<(String, String)> {
        list.items
            .iter()
            .map(|item| (item.cluster.to_string(), name_of(&item.object).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_list_concatenates_in_cluster_order() {
        let provider = clusters(vec![
            ("cluster-b", Arc::new(FakeCluster::new(&["z"]).with_resource_version("7"))),
            ("cluster-a", Arc::new(FakeCluster::new(&["x", "y"]).with_resource_version("42"))),
        ]);
        let aggregate = CrossClusterListWatch::new(provider, AggregateSettings::default());

        let list = aggregate.list(&ListParams::default()).await.unwrap();

        assert_eq!(
            tagged(&list),
            vec![
                ("cluster-a".to_string(), "x".to_string()),
                ("cluster-a".to_string(), "y".to_string()),
                ("cluster-b".to_string(), "z".to_string()),
            ]
        );
        assert_eq!(list.resource_versions.get("cluster-a"), Some("42"));
        assert_eq!(list.resource_versions.get("cluster-b"), Some("7"));
    }

    #[tokio::test]
    async fn test_list_fails_closed() {
        let provider = clusters(vec![
            ("cluster-a", Arc::new(FakeCluster::new(&["x", "y"]))),
            ("cluster-b", Arc::new(FakeCluster::new(&["z"]).failing_list("connection refused"))),
        ]);
        let aggregate = CrossClusterListWatch::new(provider, AggregateSettings::default());

        let err = aggregate.list(&ListParams::default()).await.unwrap_err();

        match err {
            McError::AggregateList(failure) => {
                assert_eq!(failure.failed_clusters(), vec![&id("cluster-b")]);
                assert!(matches!(
                    failure.failures[0].1,
                    McError::Transport { ref cluster, .. } if cluster.as_str() == "cluster-b"
                ));
                assert!(failure.to_string().contains("cluster-b"));
            }
            other => panic!("expected aggregate list failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unavailable_cluster_fails_list() {
        let provider = PartiallyUnavailable {
            clusters: clusters(vec![("cluster-a", Arc::new(FakeCluster::new(&["x"])))]),
            unavailable: vec![id("cluster-c")],
        };
        let aggregate = CrossClusterListWatch::new(provider, AggregateSettings::default());

        let err = aggregate.list(&ListParams::default()).await.unwrap_err();
        assert!(matches!(err, McError::AggregateList(ref f) if f.contains("cluster-c")));
    }

    #[tokio::test]
    async fn test_best_effort_keeps_successes() {
        let provider = clusters(vec![
            ("cluster-a", Arc::new(FakeCluster::new(&["x", "y"]))),
            ("cluster-b", Arc::new(FakeCluster::new(&["z"]).failing_list("timeout"))),
            ("cluster-c", Arc::new(FakeCluster::new(&["w"]))),
        ]);
        let aggregate = CrossClusterListWatch::new(provider, AggregateSettings::default());

        let partial = aggregate.list_best_effort(&ListParams::default()).await;

        assert!(!partial.is_complete());
        assert_eq!(partial.failures.len(), 1);
        assert_eq!(partial.failures[0].0, id("cluster-b"));
        let names: Vec<_> = partial.list.objects().map(|cm| name_of(cm).to_string()).collect();
        assert_eq!(names, vec!["x", "y", "w"]);

        assert!(partial.into_result().is_err());
    }

    #[tokio::test]
    async fn test_serial_list_keeps_order() {
        let provider = clusters(vec![
            ("cluster-c", Arc::new(FakeCluster::new(&["c1"]))),
            ("cluster-a", Arc::new(FakeCluster::new(&["a1", "a2"]))),
            ("cluster-b", Arc::new(FakeCluster::new(&[]))),
        ]);
        let settings = AggregateSettings {
            list_concurrency: 1,
            ..Default::default()
        };
        let aggregate = CrossClusterListWatch::new(provider, settings);

        let list = aggregate.list(&ListParams::default()).await.unwrap();
        let names: Vec<_> = list.into_objects().iter().map(|cm| name_of(cm).to_string()).collect();
        assert_eq!(names, vec!["a1", "a2", "c1"]);
    }

    #[tokio::test]
    async fn test_no_clusters_lists_empty() {
        let provider = clusters(vec![]);
        let aggregate = CrossClusterListWatch::new(provider, AggregateSettings::default());

        let list = aggregate.list(&ListParams::default()).await.unwrap();
        assert!(list.is_empty());
        assert!(list.resource_versions.is_empty());
    }

    #[test]
    fn test_resource_versions_default_to_any() {
        let mut versions = ResourceVersions::new();
        versions.insert(id("cluster-a"), "42");

        assert_eq!(versions.start_version("cluster-a"), "42");
        assert_eq!(versions.start_version("cluster-b"), "0");

        let json = serde_json::to_string(&versions).unwrap();
        assert_eq!(json, r#"{"cluster-a":"42"}"#);
    }
}
