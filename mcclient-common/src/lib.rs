//! Common types shared between the mcclient library and the mc-controller binary

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::sync::LazyLock;

/// Maximum length of a Kubernetes object name (DNS subdomain)
pub const MAX_CLUSTER_ID_LENGTH: usize = 253;

/// Maximum length of a namespace name (DNS label)
pub const MAX_NAMESPACE_LENGTH: usize = 63;

static CLUSTER_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

static NAMESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Identifier of one target cluster.
///
/// Doubles as the name of the credential record in the management cluster,
/// so it follows the Kubernetes object naming rules.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterId(String);

impl ClusterId {
    /// Validate and wrap a cluster identifier
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_cluster_id(&id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ClusterId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ClusterId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClusterId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ClusterId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl std::str::FromStr for ClusterId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl From<ClusterId> for String {
    fn from(id: ClusterId) -> Self {
        id.0
    }
}

/// Cluster ID validation
pub fn validate_cluster_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidClusterId {
            id: id.to_string(),
            reason: "cluster id cannot be empty".to_string(),
        });
    }

    if id.len() > MAX_CLUSTER_ID_LENGTH {
        return Err(Error::InvalidClusterId {
            id: id.to_string(),
            reason: format!("cluster id too long (max {} characters)", MAX_CLUSTER_ID_LENGTH),
        });
    }

    if !CLUSTER_ID_REGEX.is_match(id) {
        return Err(Error::InvalidClusterId {
            id: id.to_string(),
            reason: "must consist of lower case alphanumeric characters, '-' or '.'".to_string(),
        });
    }

    Ok(())
}

/// Namespace name validation
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LENGTH {
        return Err(Error::InvalidConfig(format!(
            "namespace must be 1-{} characters",
            MAX_NAMESPACE_LENGTH
        )));
    }

    if !NAMESPACE_REGEX.is_match(namespace) {
        return Err(Error::InvalidConfig(format!(
            "invalid namespace '{}': must consist of lower case alphanumeric characters or '-'",
            namespace
        )));
    }

    Ok(())
}

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl std::fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "ADDED"),
            Self::Modified => write!(f, "MODIFIED"),
            Self::Deleted => write!(f, "DELETED"),
            Self::Bookmark => write!(f, "BOOKMARK"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Lifecycle of the task driving one cluster's watch inside an aggregate watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchTaskState {
    /// Opening the watch against the cluster
    #[default]
    Starting,
    /// Forwarding events
    Streaming,
    /// The cluster ended the stream
    Closed,
    /// The aggregate watch was cancelled or its consumer went away
    Cancelled,
    /// Opening or reading the stream failed
    Errored,
}

impl WatchTaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled | Self::Errored)
    }
}

impl std::fmt::Display for WatchTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Streaming => write!(f, "streaming"),
            Self::Closed => write!(f, "closed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Known cluster as reported to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: ClusterId,
    /// Kubernetes API server URL
    pub api_server: String,
    /// Kubeconfig context the connection was built from
    pub context: Option<String>,
    /// Whether a client handle has been built for this cluster
    pub client_ready: bool,
    /// When the current credentials were observed
    pub observed_at: chrono::DateTime<chrono::Utc>,
}

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid cluster id '{id}': {reason}")]
    InvalidClusterId { id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
