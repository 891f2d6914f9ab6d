//! Common test utilities and helpers
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject, ListParams, WatchParams};
use kube::core::{ErrorResponse, WatchEvent};
use kube::{Client, Config};
use mcclient::listwatch::WatchStream;
use mcclient::{
    ClusterClientCache, ClusterConfig, ClusterId, ClusterList, ListWatch, ResourceDescriptor,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Nothing listens here; requests fail with connection refused
pub const UNREACHABLE_SERVER: &str = "http://127.0.0.1:1";

pub type SharedListWatch = Arc<dyn ListWatch<Object = DynamicObject>>;
pub type EventSender = mpsc::Sender<kube::Result<WatchEvent<DynamicObject>>>;

pub fn id(s: &str) -> ClusterId {
    ClusterId::new(s).unwrap()
}

pub fn deployments() -> ResourceDescriptor {
    ResourceDescriptor::new("apps", "v1", "Deployment", "deployments")
}

pub fn deployment(name: &str) -> DynamicObject {
    let resource: ApiResource = deployments().api_resource();
    DynamicObject::new(name, &resource).within("default")
}

pub fn gone(message: &str) -> ErrorResponse {
    ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "Expired".to_string(),
        code: 410,
    }
}

/// Cluster config pointing at a server that refuses connections
pub fn unreachable_config(name: &str) -> ClusterConfig {
    let uri = UNREACHABLE_SERVER.parse().unwrap();
    ClusterConfig::new(id(name), Config::new(uri))
}

/// Cache holding one unreachable entry per name
pub fn unreachable_cache(names: &[&str]) -> ClusterClientCache {
    let cache = ClusterClientCache::new();
    for name in names {
        cache.put(unreachable_config(name));
    }
    cache
}

pub fn unreachable_client() -> Client {
    Client::try_from(Config::new(UNREACHABLE_SERVER.parse().unwrap())).unwrap()
}

/// In-memory cluster serving deployments, with a watch fed by a channel
#[derive(Default)]
pub struct MemoryCluster {
    items: Vec<DynamicObject>,
    resource_version: Option<String>,
    events: Mutex<Option<mpsc::Receiver<kube::Result<WatchEvent<DynamicObject>>>>>,
    watched_from: Mutex<Option<String>>,
}

impl MemoryCluster {
    pub fn new(names: &[&str], resource_version: &str) -> Self {
        Self {
            items: names.iter().map(|n| deployment(n)).collect(),
            resource_version: Some(resource_version.to_string()),
            ..Default::default()
        }
    }

    pub fn streaming(self) -> (Arc<Self>, EventSender) {
        let (tx, rx) = mpsc::channel(16);
        *self.events.lock() = Some(rx);
        (Arc::new(self), tx)
    }

    pub fn watched_from(&self) -> Option<String> {
        self.watched_from.lock().clone()
    }
}

#[async_trait]
impl ListWatch for MemoryCluster {
    type Object = DynamicObject;

    async fn list(&self, _params: &ListParams) -> kube::Result<ClusterList<DynamicObject>> {
        Ok(ClusterList {
            resource_version: self.resource_version.clone(),
            items: self.items.clone(),
        })
    }

    async fn watch(
        &self,
        _params: &WatchParams,
        resource_version: &str,
    ) -> kube::Result<WatchStream<DynamicObject>> {
        *self.watched_from.lock() = Some(resource_version.to_string());

        let rx = self
            .events
            .lock()
            .take()
            .ok_or_else(|| kube::Error::Api(gone("watch already consumed")))?;

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}

pub fn fleet(entries: Vec<(&str, SharedListWatch)>) -> BTreeMap<ClusterId, SharedListWatch> {
    entries.into_iter().map(|(name, lw)| (id(name), lw)).collect()
}
