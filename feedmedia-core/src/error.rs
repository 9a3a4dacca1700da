use feedmedia_model::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] ModelError),

    #[error("Index {index} is out of range for {len} items")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Media engine has stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Disk cache error: {0}")]
    Disk(String),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How the engine reacts to a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth another attempt through the retry ledger.
    Transient,
    /// The resource will never become valid media; never retried
    /// automatically.
    Permanent,
    /// Not a failure; the result is discarded without retry bookkeeping.
    Cancelled,
}

/// Failure of a single fetch attempt. Never escapes the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Response body was empty")]
    EmptyBody,

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Failed to decode media: {0}")]
    Decode(String),

    #[error("Derivative could not be reduced below {target} bytes")]
    Oversized { target: u64 },

    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn class(&self) -> FailureClass {
        match self {
            FetchError::Network(_)
            | FetchError::Timeout
            | FetchError::Status(_) => FailureClass::Transient,
            FetchError::EmptyBody
            | FetchError::UnsupportedContentType(_)
            | FetchError::Decode(_)
            | FetchError::Oversized { .. } => FailureClass::Permanent,
            FetchError::Cancelled => FailureClass::Cancelled,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fetch_failures() {
        assert_eq!(FetchError::Status(503).class(), FailureClass::Transient);
        assert_eq!(FetchError::Status(404).class(), FailureClass::Transient);
        assert_eq!(FetchError::Timeout.class(), FailureClass::Transient);
        assert_eq!(FetchError::EmptyBody.class(), FailureClass::Permanent);
        assert_eq!(
            FetchError::UnsupportedContentType("text/html".into()).class(),
            FailureClass::Permanent
        );
        assert_eq!(FetchError::Cancelled.class(), FailureClass::Cancelled);
    }
}
