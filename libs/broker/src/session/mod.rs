mod manager;
mod store;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub(crate) use manager::VERSION_HEADER;
pub use manager::{LoginOutcome, SessionManager, SessionOutcome, SessionStatus};
pub use store::SessionStore;

/// Fixed validity window of an exchanged session.
pub const SESSION_DURATION: Duration = Duration::hours(24);

/// Durable authentication state. One process holds at most one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_logged_in(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// A persisted record is only adopted while younger than [`SESSION_DURATION`].
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.saved_at
            .is_some_and(|saved_at| now - saved_at < SESSION_DURATION)
    }
}

/// Snapshot of what an authenticated call needs. Handed to fetchers so they never hold the lock.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub api_key: String,
    pub access_token: String,
}

impl ApiCredentials {
    /// `Authorization` value for the type A surface.
    pub fn token_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    /// `Authorization` value for the type B surface.
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"<redacted>")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
