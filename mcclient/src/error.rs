//! Multi-cluster client error types
//!
//! Unknown clusters, broken credentials and per-cluster transport failures
//! are all recoverable, typed outcomes.

use mcclient_common::ClusterId;
use thiserror::Error;

/// Errors raised by the multi-cluster client
#[derive(Debug, Error)]
pub enum McError {
    /// No credentials are known for this cluster
    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),

    /// Connection parameters are malformed or incomplete
    #[error("Invalid configuration for cluster {cluster}: {reason}")]
    Config { cluster: String, reason: String },

    /// A list or watch call against one cluster failed
    #[error("Request to cluster {cluster} failed: {source}")]
    Transport {
        cluster: ClusterId,
        #[source]
        source: kube::Error,
    },

    /// One or more clusters failed during an aggregate list
    #[error(transparent)]
    AggregateList(#[from] AggregateListFailure),

    /// A cluster ended its watch stream
    #[error("Watch stream closed by cluster {0}")]
    StreamClosed(ClusterId),

    /// The management cluster subscription ended; the cache is stale
    #[error("Credential watch on the management cluster terminated")]
    CredentialWatchTerminated,

    /// The first credential list did not complete in time
    #[error("Timed out after {0:?} waiting for the cluster cache to sync")]
    SyncTimeout(std::time::Duration),

    #[error(transparent)]
    InvalidClusterId(#[from] mcclient_common::Error),

    /// Error from the management cluster client
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid kubeconfig for the management cluster
    #[error("Invalid kubeconfig: {0}")]
    InvalidKubeconfig(String),

    /// Invalid settings
    #[error("Settings error: {0}")]
    Settings(String),
}

impl McError {
    /// Cluster the error is attributed to, if any
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Self::UnknownCluster(id) => Some(id),
            Self::Config { cluster, .. } => Some(cluster),
            Self::Transport { cluster, .. } | Self::StreamClosed(cluster) => {
                Some(cluster.as_str())
            }
            _ => None,
        }
    }

    pub fn is_unknown_cluster(&self) -> bool {
        matches!(self, Self::UnknownCluster(_))
    }
}

/// Failure of an aggregate list: every cluster that failed, with its cause
#[derive(Debug)]
pub struct AggregateListFailure {
    pub failures: Vec<(ClusterId, McError)>,
}

impl AggregateListFailure {
    pub fn failed_clusters(&self) -> Vec<&ClusterId> {
        self.failures.iter().map(|(id, _)| id).collect()
    }

    pub fn contains(&self, cluster: &str) -> bool {
        self.failures.iter().any(|(id, _)| id.as_str() == cluster)
    }
}

impl std::fmt::Display for AggregateListFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "List failed for cluster(s) ")?;
        for (i, (id, err)) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} ({})", id, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateListFailure {}

/// Result type alias for multi-cluster operations
pub type McResult<T> = std::result::Result<T, McError>;
