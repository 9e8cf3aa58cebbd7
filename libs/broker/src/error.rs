use thiserror::Error;

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

/// Failure taxonomy shared by every broker operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Bad credentials, rejected passcode, or a token the upstream refused.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not logged in, complete login and session exchange first")]
    NotAuthenticated,

    /// Every candidate spelling was exhausted.
    #[error("{0}")]
    NotFound(String),

    /// Non-auth HTTP failure or a payload we could not make sense of.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Timeout or connection failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("session storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    /// True for errors that mean the held session is no longer usable.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::NotAuthenticated)
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("request timeout: {err}"))
        } else if err.is_connect() {
            Self::Transport(format!("connection failed: {err}"))
        } else if err.is_decode() {
            Self::Upstream(format!("failed to read response body: {err}"))
        } else {
            Self::Transport(format!("request failed: {err}"))
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("invalid session record: {err}"))
    }
}
