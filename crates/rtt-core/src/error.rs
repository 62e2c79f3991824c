use thiserror::Error;

/// Failures raised by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connect or authentication failure. Fatal to a run, never retried.
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("disconnect failed: {0}")]
    Disconnect(String),

    /// Operation attempted before `connect` or after `disconnect`.
    #[error("transport is not connected")]
    Closed,
}

/// A response payload that cannot be correlated. Always discarded locally.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no string `id` field")]
    MissingId,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("request id {0} is already pending")]
    DuplicateId(String),

    #[error("tracker is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level error returned by the probe and echo loops.
#[derive(Debug, Error)]
pub enum RttError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T, E = RttError> = std::result::Result<T, E>;
