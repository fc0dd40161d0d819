//! Error types for the weather relay.

use thiserror::Error;

/// Failures talking to the weather provider.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure or timeout
    #[error("HTTP error ({endpoint}): {source}")]
    Http {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// Provider answered with a non-success status
    #[error("{endpoint} request failed with status {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    /// Provider body did not match the expected shape
    #[error("failed to parse {endpoint} response: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures in the dedup ledger.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failures publishing a normalized event.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Zenoh error: {0}")]
    Zenoh(String),

    #[error("publish timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<zenoh::Error> for PublishError {
    fn from(err: zenoh::Error) -> Self {
        PublishError::Zenoh(err.to_string())
    }
}

/// Provider data that cannot be normalized.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("timestamp out of range: {0}")]
    Timestamp(i64),
}

/// Why a single request did not complete.
///
/// Always local to one worker; the dispatch loop keeps running.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed request: {0}")]
    Decode(String),

    #[error("dedup store error for {city}: {source}")]
    Store {
        city: String,
        #[source]
        source: StoreError,
    },

    #[error("fetch failed for {city}: {source}")]
    Fetch {
        city: String,
        #[source]
        source: FetchError,
    },

    #[error("normalize failed for {city}: {source}")]
    Normalize {
        city: String,
        #[source]
        source: NormalizeError,
    },

    #[error("publish failed for {city}: {source}")]
    Publish {
        city: String,
        #[source]
        source: PublishError,
    },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Top-level errors for the relay process.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// The broker could not be reached at startup
    #[error("failed to connect to broker at {endpoint}: {message}")]
    BrokerConnect { endpoint: String, message: String },

    #[error("Zenoh error: {0}")]
    Zenoh(String),

    #[error("dedup store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),
}

impl From<zenoh::Error> for RelayError {
    fn from(err: zenoh::Error) -> Self {
        RelayError::Zenoh(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
