use thiserror::Error;

/// Failure of an upstream `list_recent_items` call, split by whether the next
/// cycle may succeed.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Quota exhaustion, rate limiting, timeouts, network faults, 5xx.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// The channel no longer exists or can never be listed.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Transient(format!("request timed out: {err}"))
        } else {
            UpstreamError::Transient(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no channel found for handle {0}")]
    NotFound(String),
    #[error("handle resolution is not supported by this source")]
    Unsupported,
    #[error("handle resolution failed: {0}")]
    Upstream(String),
}

impl From<reqwest::Error> for ResolveError {
    fn from(err: reqwest::Error) -> Self {
        ResolveError::Upstream(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("channel {0} is already watched")]
    AlreadyExists(String),
    #[error("channel {0} is not watched")]
    NotFound(String),
    #[error("failed to persist {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize channel snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0} is in use by another tubewatch process (is `tubewatch run` active?)")]
    Locked(String),
    #[error("channel store was opened read-only")]
    ReadOnly,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("delivery request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{sink} rejected the notification with status {status}")]
    Rejected { sink: &'static str, status: u16 },
    #[error("event receiver dropped")]
    ReceiverClosed,
    #[error("{failed} of {total} sinks failed")]
    Partial { failed: usize, total: usize },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unrecognized channel reference: {0:?}")]
    UnrecognizedInput(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON in config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("could not locate a {0} directory")]
    NoDirectory(&'static str),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("final flush failed: {0}")]
    Flush(#[from] StoreError),
}
