//! Per-cluster list/watch
//!
//! Adapts a kube-rs `Api` for one cluster and one resource into the
//! `ListWatch` capability the cross-cluster aggregator composes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, WatchParams};
use kube::core::WatchEvent;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// Stream of raw watch events from one cluster
pub type WatchStream<K> = BoxStream<'static, kube::Result<WatchEvent<K>>>;

/// Result of listing one cluster
#[derive(Debug, Clone)]
pub struct ClusterList<K> {
    /// Resource version the list was served at
    pub resource_version: Option<String>,
    pub items: Vec<K>,
}

impl<K> ClusterList<K> {
    pub fn new(items: Vec<K>) -> Self {
        Self {
            resource_version: None,
            items,
        }
    }

    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }
}

/// List and watch capability scoped to one cluster and one resource type.
///
/// Errors are returned as-is; attributing them to a cluster is the caller's job.
#[async_trait]
pub trait ListWatch: Send + Sync {
    type Object: Clone + Send + Sync + 'static;

    /// One synchronous list call against the cluster
    async fn list(&self, params: &ListParams) -> kube::Result<ClusterList<Self::Object>>;

    /// Open a watch starting after `resource_version`.
    ///
    /// Dropping the returned stream closes the subscription.
    async fn watch(
        &self,
        params: &WatchParams,
        resource_version: &str,
    ) -> kube::Result<WatchStream<Self::Object>>;
}

#[async_trait]
impl<L> ListWatch for Arc<L>
where
    L: ListWatch + ?Sized,
{
    type Object = L::Object;

    async fn list(&self, params: &ListParams) -> kube::Result<ClusterList<Self::Object>> {
        (**self).list(params).await
    }

    async fn watch(
        &self,
        params: &WatchParams,
        resource_version: &str,
    ) -> kube::Result<WatchStream<Self::Object>> {
        (**self).watch(params, resource_version).await
    }
}

/// Resource to list and watch across clusters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name used in URLs
    pub plural: String,
    /// Namespace to scope to (None for all namespaces or cluster-scoped)
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub field_selector: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            namespace: None,
            field_selector: None,
            label_selector: None,
        }
    }

    pub fn namespaced(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_field_selector(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk(), &self.plural)
    }
}

impl std::fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

/// List/watch against one cluster through a kube-rs `Api`
pub struct ClusterListWatch<K> {
    api: Api<K>,
    field_selector: Option<String>,
    label_selector: Option<String>,
}

impl ClusterListWatch<DynamicObject> {
    /// Untyped list/watch for any resource described at runtime
    pub fn for_resource(client: Client, resource: &ResourceDescriptor) -> Self {
        let api_resource = resource.api_resource();
        let api = match &resource.namespace {
            Some(ns) => Api::namespaced_with(client, ns, &api_resource),
            None => Api::all_with(client, &api_resource),
        };

        Self {
            api,
            field_selector: resource.field_selector.clone(),
            label_selector: resource.label_selector.clone(),
        }
    }
}

impl<K> ClusterListWatch<K> {
    /// Typed list/watch over an existing `Api`
    pub fn from_api(api: Api<K>) -> Self {
        Self {
            api,
            field_selector: None,
            label_selector: None,
        }
    }

    pub fn with_field_selector(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    fn list_params(&self, params: &ListParams) -> ListParams {
        let mut params = params.clone();
        if let Some(selector) = &self.field_selector {
            params.field_selector = Some(selector.clone());
        }
        if let Some(selector) = &self.label_selector {
            params.label_selector = Some(selector.clone());
        }
        params
    }

    fn watch_params(&self, params: &WatchParams) -> WatchParams {
        let mut params = params.clone();
        if let Some(selector) = &self.field_selector {
            params.field_selector = Some(selector.clone());
        }
        if let Some(selector) = &self.label_selector {
            params.label_selector = Some(selector.clone());
        }
        params
    }
}

#[async_trait]
impl<K> ListWatch for ClusterListWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    type Object = K;

    async fn list(&self, params: &ListParams) -> kube::Result<ClusterList<K>> {
        let list = self.api.list(&self.list_params(params)).await?;

        Ok(ClusterList {
            resource_version: list.metadata.resource_version,
            items: list.items,
        })
    }

    async fn watch(
        &self,
        params: &WatchParams,
        resource_version: &str,
    ) -> kube::Result<WatchStream<K>> {
        let stream = self
            .api
            .watch(&self.watch_params(params), resource_version)
            .await?;

        Ok(stream.boxed())
    }
}
