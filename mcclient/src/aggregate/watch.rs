use super::list::ResourceVersions;
use crate::error::McResult;
use crate::listwatch::ListWatch;
use futures::{Stream, StreamExt};
use kube::api::WatchParams;
use kube::core::{ErrorResponse, WatchEvent};
use mcclient_common::{ClusterId, WatchEventType, WatchTaskState};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a cluster's watch ended
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchFailure {
    /// The cluster ended the stream
    #[error("watch stream closed by the cluster")]
    StreamClosed,

    /// The server sent an error status
    #[error("watch error status: {0}")]
    Status(ErrorResponse),

    #[error("watch transport error: {0}")]
    Transport(Arc<kube::Error>),

    /// No list/watch could be built for the cluster
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

impl From<kube::Error> for WatchFailure {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(status) => Self::Status(status),
            other => Self::Transport(Arc::new(other)),
        }
    }
}

/// One cluster's watch notification
#[derive(Debug, Clone)]
pub enum ClusterEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    Bookmark { resource_version: String },
    /// Terminal; nothing follows for this cluster
    Error(WatchFailure),
}

impl<K> ClusterEvent<K> {
    pub fn event_type(&self) -> WatchEventType {
        match self {
            Self::Added(_) => WatchEventType::Added,
            Self::Modified(_) => WatchEventType::Modified,
            Self::Deleted(_) => WatchEventType::Deleted,
            Self::Bookmark { .. } => WatchEventType::Bookmark,
            Self::Error(_) => WatchEventType::Error,
        }
    }

    pub fn object(&self) -> Option<&K> {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl<K> From<WatchEvent<K>> for ClusterEvent<K> {
    fn from(event: WatchEvent<K>) -> Self {
        match event {
            WatchEvent::Added(obj) => Self::Added(obj),
            WatchEvent::Modified(obj) => Self::Modified(obj),
            WatchEvent::Deleted(obj) => Self::Deleted(obj),
            WatchEvent::Bookmark(bookmark) => Self::Bookmark {
                resource_version: bookmark.metadata.resource_version,
            },
            WatchEvent::Error(status) => Self::Error(WatchFailure::Status(status)),
        }
    }
}

/// A watch event tagged with the cluster it came from
#[derive(Debug, Clone)]
pub struct AggregateEvent<K> {
    pub cluster: ClusterId,
    pub event: ClusterEvent<K>,
}

/// Final or current state of every per-cluster watch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchReport {
    pub clusters: BTreeMap<ClusterId, WatchTaskState>,
}

impl WatchReport {
    pub fn state(&self, cluster: &str) -> Option<WatchTaskState> {
        self.clusters.get(cluster).copied()
    }

    pub fn all_terminal(&self) -> bool {
        self.clusters.values().all(WatchTaskState::is_terminal)
    }
}

type SharedStates = Arc<Mutex<BTreeMap<ClusterId, WatchTaskState>>>;

/// Combined watch over every cluster.
///
/// Yields events as a `Stream`. The stream ends once every per-cluster
/// watch has terminated. Dropping it cancels all of them.
pub struct AggregateWatch<K> {
    rx: mpsc::Receiver<AggregateEvent<K>>,
    token: CancellationToken,
    states: SharedStates,
    supervisor: Option<JoinHandle<WatchReport>>,
}

impl<K> AggregateWatch<K> {
    /// Next event, or `None` once every cluster's watch has ended
    pub async fn recv(&mut self) -> Option<AggregateEvent<K>> {
        self.rx.recv().await
    }

    /// Cancel every per-cluster watch without waiting
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token scoping this watch's tasks
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Current state of every per-cluster watch
    pub fn task_states(&self) -> WatchReport {
        WatchReport {
            clusters: self.states.lock().clone(),
        }
    }

    /// Cancel and wait until every per-cluster task has exited
    pub async fn shutdown(mut self) -> WatchReport {
        self.token.cancel();
        self.rx.close();

        match self.supervisor.take() {
            Some(supervisor) => match supervisor.await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Watch supervisor failed");
                    self.task_states()
                }
            },
            None => self.task_states(),
        }
    }
}

impl<K> Stream for AggregateWatch<K> {
    type Item = AggregateEvent<K>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<K> Drop for AggregateWatch<K> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<K> std::fmt::Debug for AggregateWatch<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateWatch")
            .field("states", &*self.states.lock())
            .field("stopped", &self.token.is_cancelled())
            .finish()
    }
}

/// Start one producer task per cluster feeding a shared bounded channel
pub(super) fn spawn<L>(
    watchers: Vec<(ClusterId, McResult<L>)>,
    params: WatchParams,
    versions: &ResourceVersions,
    parent: &CancellationToken,
    capacity: usize,
) -> AggregateWatch<L::Object>
where
    L: ListWatch + 'static,
{
    let token = parent.child_token();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let states: SharedStates = Arc::default();
    let params = Arc::new(params);
    let mut tasks = JoinSet::new();

    for (cluster, lw) in watchers {
        states.lock().insert(cluster.clone(), WatchTaskState::Starting);

        let producer = Producer {
            resource_version: versions.start_version(cluster.as_str()).to_string(),
            cluster,
            tx: tx.clone(),
            token: token.clone(),
            states: states.clone(),
        };
        tasks.spawn(producer.run(lw, params.clone()));
    }

    // The channel closes when the last producer drops its sender
    drop(tx);

    info!(clusters = tasks.len(), "Aggregate watch started");
    let supervisor = tokio::spawn(supervise(tasks, states.clone()));

    AggregateWatch {
        rx,
        token,
        states,
        supervisor: Some(supervisor),
    }
}

async fn supervise(
    mut tasks: JoinSet<(ClusterId, WatchTaskState)>,
    states: SharedStates,
) -> WatchReport {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((cluster, state)) => debug!(cluster = %cluster, state = %state, "Watch task exited"),
            Err(e) => error!(error = %e, "Watch task failed"),
        }
    }

    // A task that panicked never recorded a terminal state
    let mut guard = states.lock();
    for state in guard.values_mut() {
        if !state.is_terminal() {
            *state = WatchTaskState::Errored;
        }
    }

    debug!("Aggregate watch finished");
    WatchReport {
        clusters: guard.clone(),
    }
}

struct Producer<K> {
    cluster: ClusterId,
    resource_version: String,
    tx: mpsc::Sender<AggregateEvent<K>>,
    token: CancellationToken,
    states: SharedStates,
}

impl<K: Send + 'static> Producer<K> {
    async fn run<L>(self, lw: McResult<L>, params: Arc<WatchParams>) -> (ClusterId, WatchTaskState)
    where
        L: ListWatch<Object = K>,
    {
        let state = self.forward(lw, &params).await;
        self.set_state(state);
        (self.cluster, state)
    }

    async fn forward<L>(&self, lw: McResult<L>, params: &WatchParams) -> WatchTaskState
    where
        L: ListWatch<Object = K>,
    {
        let lw = match lw {
            Ok(lw) => lw,
            Err(e) => {
                warn!(cluster = %self.cluster, error = %e, "Cluster unavailable for watch");
                return self
                    .finish(WatchFailure::Unavailable(e.to_string()), WatchTaskState::Errored)
                    .await;
            }
        };

        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return WatchTaskState::Cancelled,
            opened = lw.watch(params, &self.resource_version) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(cluster = %self.cluster, error = %e, "Failed to open watch");
                return self.finish(e.into(), WatchTaskState::Errored).await;
            }
        };

        self.set_state(WatchTaskState::Streaming);
        debug!(
            cluster = %self.cluster,
            resource_version = %self.resource_version,
            "Watch opened"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!(cluster = %self.cluster, "Watch cancelled");
                    return WatchTaskState::Cancelled;
                }
                next = stream.next() => next,
            };

            let event = match next {
                None => {
                    info!(cluster = %self.cluster, "Cluster closed watch stream");
                    return self
                        .finish(WatchFailure::StreamClosed, WatchTaskState::Closed)
                        .await;
                }
                Some(Err(e)) => {
                    warn!(cluster = %self.cluster, error = %e, "Watch stream failed");
                    return self.finish(e.into(), WatchTaskState::Errored).await;
                }
                Some(Ok(WatchEvent::Error(status))) => {
                    warn!(cluster = %self.cluster, error = %status, "Watch error status");
                    return self
                        .finish(WatchFailure::Status(status), WatchTaskState::Errored)
                        .await;
                }
                Some(Ok(event)) => ClusterEvent::from(event),
            };

            if !self.send(event).await {
                return WatchTaskState::Cancelled;
            }
        }
    }

    /// Emit the terminal event, unless cancelled first
    async fn finish(&self, failure: WatchFailure, state: WatchTaskState) -> WatchTaskState {
        if self.send(ClusterEvent::Error(failure)).await {
            state
        } else {
            WatchTaskState::Cancelled
        }
    }

    /// False when cancelled or the consumer is gone
    async fn send(&self, event: ClusterEvent<K>) -> bool {
        let event = AggregateEvent {
            cluster: self.cluster.clone(),
            event,
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    fn set_state(&self, state: WatchTaskState) {
        self.states.lock().insert(self.cluster.clone(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::*;
    use super::super::{AggregateSettings, CrossClusterListWatch};
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::time::Duration;
    use tokio::time::timeout;

    const BOUND: Duration = Duration::from_secs(5);

    fn aggregate<P: super::super::ListWatchProvider>(provider: P) -> CrossClusterListWatch<P> {
        CrossClusterListWatch::new(provider, AggregateSettings::default())
    }

    async fn next(watch: &mut AggregateWatch<ConfigMap>) -> AggregateEvent<ConfigMap> {
        timeout(BOUND, watch.recv())
            .await
            .expect("timed out waiting for event")
            .expect("watch ended early")
    }

    fn added(name: &str) -> FakeEvent {
        Ok(WatchEvent::Added(config_map(name)))
    }

    #[tokio::test]
    async fn test_events_are_tagged_with_cluster() {
        let (a, tx_a) = FakeCluster::new(&[]).streaming();
        let (b, tx_b) = FakeCluster::new(&[]).streaming();
        let agg = aggregate(clusters(vec![("cluster-a", a), ("cluster-b", b)]));
        let token = CancellationToken::new();
        let mut watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        tx_a.send(added("x")).await.unwrap();
        tx_b.send(added("z")).await.unwrap();

        let mut seen = vec![];
        for _ in 0..2 {
            let event = next(&mut watch).await;
            assert_eq!(event.event.event_type(), WatchEventType::Added);
            let name = name_of(event.event.object().unwrap()).to_string();
            seen.push((event.cluster.to_string(), name));
        }
        seen.sort();

        assert_eq!(
            seen,
            vec![
                ("cluster-a".to_string(), "x".to_string()),
                ("cluster-b".to_string(), "z".to_string()),
            ]
        );
        assert_eq!(watch.task_states().state("cluster-a"), Some(WatchTaskState::Streaming));
    }

    #[tokio::test]
    async fn test_per_cluster_order_is_kept() {
        let (a, tx_a) = FakeCluster::new(&[]).streaming();
        let agg = aggregate(clusters(vec![("cluster-a", a)]));
        let token = CancellationToken::new();
        let mut watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        tx_a.send(added("first")).await.unwrap();
        tx_a.send(Ok(WatchEvent::Modified(config_map("first")))).await.unwrap();
        tx_a.send(Ok(WatchEvent::Deleted(config_map("first")))).await.unwrap();

        let types: Vec<_> = [
            next(&mut watch).await,
            next(&mut watch).await,
            next(&mut watch).await,
        ]
        .iter()
        .map(|e| e.event.event_type())
        .collect();

        assert_eq!(
            types,
            vec![
                WatchEventType::Added,
                WatchEventType::Modified,
                WatchEventType::Deleted
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_tears_down_every_producer() {
        let (a, tx_a) = FakeCluster::new(&[]).streaming();
        let (b, tx_b) = FakeCluster::new(&[]).streaming();
        let agg = aggregate(clusters(vec![("cluster-a", a), ("cluster-b", b)]));
        let token = CancellationToken::new();
        let mut watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        tx_a.send(added("x")).await.unwrap();
        next(&mut watch).await;
        wait_streaming(&watch, "cluster-b").await;

        token.cancel();

        // Combined channel closes
        timeout(BOUND, async { while watch.recv().await.is_some() {} })
            .await
            .expect("channel did not close after cancel");

        // Both cluster streams were dropped
        timeout(BOUND, tx_a.closed()).await.unwrap();
        timeout(BOUND, tx_b.closed()).await.unwrap();

        let report = timeout(BOUND, watch.shutdown()).await.unwrap();
        assert_eq!(report.state("cluster-a"), Some(WatchTaskState::Cancelled));
        assert_eq!(report.state("cluster-b"), Some(WatchTaskState::Cancelled));
        assert!(report.all_terminal());
    }

    #[tokio::test]
    async fn test_closed_cluster_emits_one_terminal_event() {
        let (a, tx_a) = FakeCluster::new(&[]).streaming();
        let (b, tx_b) = FakeCluster::new(&[]).streaming();
        let agg = aggregate(clusters(vec![("cluster-a", a), ("cluster-b", b)]));
        let token = CancellationToken::new();
        let mut watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        drop(tx_b);

        let event = next(&mut watch).await;
        assert_eq!(event.cluster.as_str(), "cluster-b");
        assert!(matches!(
            event.event,
            ClusterEvent::Error(WatchFailure::StreamClosed)
        ));

        // A keeps streaming
        tx_a.send(added("y")).await.unwrap();
        let event = next(&mut watch).await;
        assert_eq!(event.cluster.as_str(), "cluster-a");
        assert_eq!(name_of(event.event.object().unwrap()), "y");

        // Nothing more from B, and the channel stays open for A
        drop(tx_a);
        let event = next(&mut watch).await;
        assert_eq!(event.cluster.as_str(), "cluster-a");
        assert!(event.event.is_terminal());
        assert!(timeout(BOUND, watch.recv()).await.unwrap().is_none());

        let report = watch.shutdown().await;
        assert_eq!(report.state("cluster-b"), Some(WatchTaskState::Closed));
        assert_eq!(report.state("cluster-a"), Some(WatchTaskState::Closed));
    }

    #[tokio::test]
    async fn test_error_status_terminates_cluster() {
        let (a, _tx_a) = FakeCluster::new(&[]).streaming();
        let (b, tx_b) = FakeCluster::new(&[]).streaming();
        let agg = aggregate(clusters(vec![("cluster-a", a), ("cluster-b", b)]));
        let token = CancellationToken::new();
        let mut watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        tx_b.send(Ok(WatchEvent::Error(unavailable("too old resource version"))))
            .await
            .unwrap();

        let event = next(&mut watch).await;
        assert_eq!(event.cluster.as_str(), "cluster-b");
        assert!(matches!(
            event.event,
            ClusterEvent::Error(WatchFailure::Status(ref s)) if s.code == 503
        ));

        // B's stream is dropped after its terminal event
        timeout(BOUND, tx_b.closed()).await.unwrap();
        assert!(tx_b.send(added("late")).await.is_err());

        let report = watch.shutdown().await;
        assert_eq!(report.state("cluster-b"), Some(WatchTaskState::Errored));
        assert_eq!(report.state("cluster-a"), Some(WatchTaskState::Cancelled));
    }

    #[tokio::test]
    async fn test_open_failure_is_errored() {
        let (a, tx_a) = FakeCluster::new(&[]).streaming();
        let b = Arc::new(FakeCluster::new(&[]).failing_watch("connection refused"));
        let agg = aggregate(clusters(vec![("cluster-a", a), ("cluster-b", b)]));
        let token = CancellationToken::new();
        let mut watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        let event = next(&mut watch).await;
        assert_eq!(event.cluster.as_str(), "cluster-b");
        assert!(event.event.is_terminal());

        tx_a.send(added("x")).await.unwrap();
        assert_eq!(next(&mut watch).await.cluster.as_str(), "cluster-a");

        let report = watch.shutdown().await;
        assert_eq!(report.state("cluster-b"), Some(WatchTaskState::Errored));
        assert_eq!(report.state("cluster-a"), Some(WatchTaskState::Cancelled));
    }

    #[tokio::test]
    async fn test_unavailable_cluster_is_errored() {
        let provider = PartiallyUnavailable {
            clusters: clusters(vec![]),
            unavailable: vec![id("cluster-c")],
        };
        let agg = aggregate(provider);
        let token = CancellationToken::new();
        let mut watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        let event = next(&mut watch).await;
        assert_eq!(event.cluster.as_str(), "cluster-c");
        assert!(matches!(
            event.event,
            ClusterEvent::Error(WatchFailure::Unavailable(_))
        ));
        assert!(timeout(BOUND, watch.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_block_cancel() {
        let (a, tx_a) = FakeCluster::new(&[]).streaming();
        let agg = CrossClusterListWatch::new(
            clusters(vec![("cluster-a", a)]),
            AggregateSettings {
                watch_channel_capacity: 1,
                ..Default::default()
            },
        );
        let token = CancellationToken::new();
        let watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);
        wait_streaming(&watch, "cluster-a").await;

        // Producer fills the channel and blocks on send
        for i in 0..5 {
            tx_a.send(added(&format!("cm{}", i))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = timeout(BOUND, watch.shutdown())
            .await
            .expect("shutdown hung on a blocked producer");
        assert_eq!(report.state("cluster-a"), Some(WatchTaskState::Cancelled));
        timeout(BOUND, tx_a.closed()).await.unwrap();
    }

    async fn wait_streaming(watch: &AggregateWatch<ConfigMap>, cluster: &str) {
        timeout(BOUND, async {
            while watch.task_states().state(cluster) != Some(WatchTaskState::Streaming) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("watch never started streaming");
    }

    #[tokio::test]
    async fn test_drop_cancels_producers() {
        let (a, tx_a) = FakeCluster::new(&[]).streaming();
        let agg = aggregate(clusters(vec![("cluster-a", a)]));
        let token = CancellationToken::new();
        let watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        wait_streaming(&watch, "cluster-a").await;
        drop(watch);

        timeout(BOUND, tx_a.closed())
            .await
            .expect("producer outlived the aggregate watch");
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_before_open_skips_watch() {
        let (a, _tx_a) = FakeCluster::new(&[]).streaming();
        let agg = aggregate(clusters(vec![("cluster-a", a.clone())]));
        let token = CancellationToken::new();
        let watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        // Current-thread runtime: no producer has been polled yet
        let report = timeout(BOUND, watch.shutdown()).await.unwrap();

        assert_eq!(report.state("cluster-a"), Some(WatchTaskState::Cancelled));
        assert!(a.watched_from().is_none());
    }

    #[tokio::test]
    async fn test_parent_cancel_propagates() {
        let (a, _tx_a) = FakeCluster::new(&[]).streaming();
        let agg = aggregate(clusters(vec![("cluster-a", a)]));
        let parent = CancellationToken::new();
        let mut watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &parent);

        parent.cancel();

        assert!(timeout(BOUND, watch.recv()).await.unwrap().is_none());
        assert!(watch.is_stopped());
    }

    #[tokio::test]
    async fn test_no_clusters_closes_immediately() {
        let agg = aggregate(clusters(vec![]));
        let token = CancellationToken::new();
        let mut watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        assert!(timeout(BOUND, watch.recv()).await.unwrap().is_none());
        assert!(watch.shutdown().await.clusters.is_empty());
    }

    #[tokio::test]
    async fn test_watch_resumes_from_listed_versions() {
        let (a, _tx_a) = FakeCluster::new(&[]).streaming();
        let (b, _tx_b) = FakeCluster::new(&[]).streaming();
        let agg = aggregate(clusters(vec![("cluster-a", a.clone()), ("cluster-b", b.clone())]));
        let token = CancellationToken::new();

        let mut versions = ResourceVersions::new();
        versions.insert(id("cluster-a"), "42");
        let watch = agg.watch(&WatchParams::default(), &versions, &token);

        timeout(BOUND, async {
            while !watch.task_states().clusters.values().all(|s| *s == WatchTaskState::Streaming) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(a.watched_from().as_deref(), Some("42"));
        assert_eq!(b.watched_from().as_deref(), Some("0"));
        watch.shutdown().await;
    }

    #[tokio::test]
    async fn test_bookmarks_are_forwarded() {
        let (a, tx_a) = FakeCluster::new(&[]).streaming();
        let agg = aggregate(clusters(vec![("cluster-a", a)]));
        let token = CancellationToken::new();
        let mut watch = agg.watch(&WatchParams::default(), &ResourceVersions::new(), &token);

        let bookmark: WatchEvent<ConfigMap> = serde_json::from_value(serde_json::json!({
            "type": "BOOKMARK",
            "object": {
                "kind": "ConfigMap",
                "apiVersion": "v1",
                "metadata": { "resourceVersion": "1234" }
            }
        }))
        .unwrap();
        tx_a.send(Ok(bookmark)).await.unwrap();

        let event = next(&mut watch).await;
        assert!(matches!(
            event.event,
            ClusterEvent::Bookmark { ref resource_version } if resource_version == "1234"
        ));
    }
}
