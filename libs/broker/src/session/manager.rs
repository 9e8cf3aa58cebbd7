use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{ApiCredentials, Clock, SESSION_DURATION, Session, SessionStore, SystemClock};
use crate::{
    config::BrokerConfig,
    error::{BrokerError, Result},
    http::{HttpRequest, Transport},
};

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const VERSION_HEADER: (&str, &str) = ("X-Mirae-Version", "1");

/// Result of the first login step. The token is only good for [`SessionManager::exchange_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub intermediate_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub expires_at: DateTime<Utc>,
    /// False when the session is live in memory but could not be written to disk.
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub logged_in: bool,
    pub username: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    session: Session,
    /// Credentials from a successful login step, waiting for the OTP exchange.
    pending: Option<(String, String)>,
}

/// Owns the one process-wide session. All read-modify-write paths go through `state`.
pub struct SessionManager {
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    store: SessionStore,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl SessionManager {
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    /// Adopts the saved record if it is younger than [`SESSION_DURATION`], otherwise removes it.
    pub fn with_clock(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = SessionStore::new(config.session_file.clone());
        let session = restore(&store, clock.now());

        Self {
            config,
            transport,
            store,
            clock,
            state: Mutex::new(State {
                session,
                pending: None,
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Step one: username and password. Never retried.
    #[instrument(name = "login", skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome> {
        let request = HttpRequest::post(self.config.type_a_url("connect/login"))
            .header(VERSION_HEADER.0, VERSION_HEADER.1)
            .form(&[("username", username), ("password", password)])
            .timeout(AUTH_TIMEOUT);

        let payload = self.auth_call(request, "login").await?;
        let data = &payload["data"];
        let token = non_empty_str(&data["request_token"])
            .or_else(|| non_empty_str(&data["ugid"]))
            .ok_or_else(|| BrokerError::Auth("login response carried no request token".into()))?;

        self.state.lock().await.pending = Some((username.to_string(), password.to_string()));
        info!("login accepted, awaiting one-time passcode");

        Ok(LoginOutcome {
            intermediate_token: token.to_string(),
        })
    }

    /// Step two: trade the passcode for an access token and persist the session.
    #[instrument(name = "exchange_session", skip_all)]
    pub async fn exchange_session(
        &self,
        api_key: &str,
        intermediate_token: &str,
        otp: &str,
    ) -> Result<SessionOutcome> {
        let request = HttpRequest::post(self.config.type_a_url("session/token"))
            .header(VERSION_HEADER.0, VERSION_HEADER.1)
            .form(&[
                ("api_key", api_key),
                ("request_token", intermediate_token),
                ("otp", otp),
                ("checksum", "L"),
            ])
            .timeout(AUTH_TIMEOUT);

        let payload = self.auth_call(request, "session exchange").await?;
        let access_token = non_empty_str(&payload["data"]["access_token"])
            .ok_or_else(|| BrokerError::Auth("session response carried no access token".into()))?
            .to_string();

        let now = self.clock.now();
        let expires_at = now + SESSION_DURATION;

        let mut state = self.state.lock().await;
        let (username, password) = match state.pending.take() {
            Some((username, password)) => (Some(username), Some(password)),
            None => (state.session.username.take(), state.session.password.take()),
        };
        state.session = Session {
            username,
            password,
            api_key: Some(api_key.to_string()),
            access_token: Some(access_token),
            expires_at: Some(expires_at),
            saved_at: Some(now),
        };

        let persisted = match self.store.save(&state.session) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "session established but not persisted");
                false
            }
        };
        info!(%expires_at, persisted, "session established");

        Ok(SessionOutcome {
            expires_at,
            persisted,
        })
    }

    /// Probes the upstream with the held token. Only a 401-class answer erases the session.
    #[instrument(name = "validate_session", skip(self))]
    pub async fn validate(&self) -> bool {
        let mut state = self.state.lock().await;

        let Some(credentials) = credentials_of(&state.session) else {
            debug!("no session held");
            return false;
        };
        if state.session.is_expired_at(self.clock.now()) {
            info!("session expired");
            self.erase(&mut state);
            return false;
        }

        let request = HttpRequest::get(self.config.type_a_url("instruments/quote/ltp"))
            .query("i", self.config.probe_symbol.as_str())
            .header(VERSION_HEADER.0, VERSION_HEADER.1)
            .header("Authorization", credentials.token_header())
            .timeout(PROBE_TIMEOUT);

        match self.transport.execute(request).await {
            Ok(response) if response.is_success() => {
                debug!("session is valid");
                true
            }
            Ok(response) if response.is_unauthorized() => {
                warn!(status = response.status, "session rejected by upstream");
                self.erase(&mut state);
                false
            }
            Ok(response) => {
                warn!(status = response.status, "session probe inconclusive, keeping session");
                false
            }
            Err(e) => {
                warn!(error = %e, "session probe failed, keeping session");
                false
            }
        }
    }

    /// Confirms or invalidates the held session. Never logs in again: that would spend a passcode.
    pub async fn refresh_if_needed(&self) -> bool {
        self.validate().await
    }

    #[instrument(name = "logout", skip(self))]
    pub async fn logout(&self) {
        let mut state = self.state.lock().await;
        self.erase(&mut state);
        info!("logged out");
    }

    /// Credentials for an authenticated call, or `None` when logged out or expired.
    pub async fn credentials(&self) -> Option<ApiCredentials> {
        let state = self.state.lock().await;
        if state.session.is_expired_at(self.clock.now()) {
            return None;
        }
        credentials_of(&state.session)
    }

    /// Erases the session, but only if it still holds `access_token`.
    pub async fn invalidate(&self, access_token: &str) {
        let mut state = self.state.lock().await;
        if state.session.access_token.as_deref() == Some(access_token) {
            warn!("access token rejected mid-request, erasing session");
            self.erase(&mut state);
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        let now = self.clock.now();

        SessionStatus {
            logged_in: state.session.is_logged_in() && !state.session.is_expired_at(now),
            username: state.session.username.clone(),
            expires_at: state.session.expires_at,
        }
    }

    async fn auth_call(&self, request: HttpRequest, step: &str) -> Result<Value> {
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(|e| BrokerError::Auth(format!("{step} request failed: {e}")))?;

        if !response.is_success() {
            warn!(status = response.status, "{step} rejected");
            return Err(BrokerError::Auth(format!(
                "{step} rejected with status {}",
                response.status
            )));
        }

        let payload = response
            .json()
            .map_err(|e| BrokerError::Auth(format!("{step} response unreadable: {e}")))?;

        if payload["status"].as_str() != Some("success") {
            let message = payload["message"].as_str().unwrap_or("unsuccessful status");
            return Err(BrokerError::Auth(format!("{step} rejected: {message}")));
        }

        Ok(payload)
    }

    fn erase(&self, state: &mut State) {
        *state = State::default();
        self.store.remove();
    }
}

fn restore(store: &SessionStore, now: DateTime<Utc>) -> Session {
    match store.load() {
        Some(session) if session.is_fresh_at(now) => {
            info!(
                username = ?session.username,
                expires_at = ?session.expires_at,
                "session restored"
            );
            session
        }
        Some(_) => {
            info!("saved session is stale, removing it");
            store.remove();
            Session::default()
        }
        None => Session::default(),
    }
}

fn credentials_of(session: &Session) -> Option<ApiCredentials> {
    if !session.is_logged_in() {
        return None;
    }

    Some(ApiCredentials {
        api_key: session.api_key.clone().unwrap_or_default(),
        access_token: session.access_token.clone()?,
    })
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as TimeDelta, TimeZone};
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        http::{HttpResponse, testing::ScriptedTransport},
        session::testing::{FixedClock, test_config},
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 30, 9, 0, 0).unwrap()
    }

    fn auth_ok(request: &HttpRequest) -> Result<HttpResponse> {
        if request.url.ends_with("connect/login") {
            Ok(HttpResponse::new(
                200,
                json!({"status": "success", "data": {"request_token": "req-1"}}).to_string(),
            ))
        } else if request.url.ends_with("session/token") {
            Ok(HttpResponse::new(
                200,
                json!({"status": "success", "data": {"access_token": "acc-1"}}).to_string(),
            ))
        } else {
            Ok(HttpResponse::new(200, "{}"))
        }
    }

    fn saved_session(dir: &TempDir, saved_at: DateTime<Utc>) {
        SessionStore::new(dir.path().join("session.json"))
            .save(&Session {
                username: Some("trader".into()),
                password: Some("secret".into()),
                api_key: Some("key".into()),
                access_token: Some("acc-0".into()),
                expires_at: Some(saved_at + SESSION_DURATION),
                saved_at: Some(saved_at),
            })
            .unwrap();
    }

    fn manager_with(
        dir: &TempDir,
        clock: Arc<FixedClock>,
        responder: impl Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    ) -> (SessionManager, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(responder));
        let manager = SessionManager::with_clock(test_config(dir), transport.clone(), clock);
        (manager, transport)
    }

    #[tokio::test]
    async fn two_step_login_persists_session() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(t0()));
        let (manager, transport) = manager_with(&dir, clock, auth_ok);

        let login = manager.login("trader", "secret").await.unwrap();
        assert_eq!(login.intermediate_token, "req-1");
        assert!(manager.credentials().await.is_none());

        let outcome = manager
            .exchange_session("key", &login.intermediate_token, "123456")
            .await
            .unwrap();
        assert_eq!(outcome.expires_at, t0() + TimeDelta::hours(24));
        assert!(outcome.persisted);

        let saved = SessionStore::new(dir.path().join("session.json"))
            .load()
            .unwrap();
        assert_eq!(saved.username.as_deref(), Some("trader"));
        assert_eq!(saved.password.as_deref(), Some("secret"));
        assert_eq!(saved.access_token.as_deref(), Some("acc-1"));
        assert_eq!(saved.saved_at, Some(t0()));

        let requests = transport.requests();
        let exchange = requests.last().unwrap();
        assert_eq!(exchange.header_value("X-Mirae-Version"), Some("1"));
        assert!(matches!(
            &exchange.body,
            Some(crate::http::HttpBody::Form(fields))
                if fields.contains(&("otp".to_string(), "123456".to_string()))
                && fields.contains(&("request_token".to_string(), "req-1".to_string()))
        ));

        let credentials = manager.credentials().await.unwrap();
        assert_eq!(credentials.token_header(), "token key:acc-1");
    }

    #[tokio::test]
    async fn login_accepts_ugid_token() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(t0()));
        let (manager, _) = manager_with(&dir, clock, |_| {
            Ok(HttpResponse::new(
                200,
                json!({"status": "success", "data": {"ugid": "ugid-9"}}).to_string(),
            ))
        });

        let login = manager.login("trader", "secret").await.unwrap();
        assert_eq!(login.intermediate_token, "ugid-9");
    }

    #[tokio::test]
    async fn login_failures_are_auth_errors() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(t0()));

        let (rejected, _) = manager_with(&dir, clock.clone(), |_| Ok(HttpResponse::new(400, "")));
        let err = rejected.login("trader", "wrong").await.unwrap_err();
        assert!(matches!(err, BrokerError::Auth(_)));

        let (offline, transport) = manager_with(&dir, clock, |_| {
            Err(BrokerError::Transport("connection refused".into()))
        });
        let err = offline.login("trader", "secret").await.unwrap_err();
        assert!(matches!(err, BrokerError::Auth(msg) if msg.contains("connection refused")));
        assert_eq!(transport.requests().len(), 1, "login must not be retried");
    }

    #[tokio::test]
    async fn rejected_passcode_leaves_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(t0()));
        let (manager, _) = manager_with(&dir, clock, |request| {
            if request.url.ends_with("session/token") {
                Ok(HttpResponse::new(
                    200,
                    json!({"status": "error", "message": "invalid otp"}).to_string(),
                ))
            } else {
                auth_ok(request)
            }
        });

        manager.login("trader", "secret").await.unwrap();
        let err = manager
            .exchange_session("key", "req-1", "000000")
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Auth(msg) if msg.contains("invalid otp")));
        assert!(!manager.status().await.logged_in);
        assert!(!dir.path().join("session.json").exists());
    }

    #[tokio::test]
    async fn validate_erases_on_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        saved_session(&dir, t0());
        let clock = Arc::new(FixedClock::new(t0() + TimeDelta::hours(1)));
        let (manager, _) = manager_with(&dir, clock, |_| Ok(HttpResponse::new(401, "")));

        assert!(!manager.validate().await);
        assert!(manager.credentials().await.is_none());
        assert!(!dir.path().join("session.json").exists());
    }

    #[tokio::test]
    async fn validate_keeps_session_on_not_found() {
        let dir = tempfile::tempdir().unwrap();
        saved_session(&dir, t0());
        let clock = Arc::new(FixedClock::new(t0() + TimeDelta::hours(1)));
        let (manager, transport) = manager_with(&dir, clock, |_| Ok(HttpResponse::new(404, "")));

        assert!(!manager.validate().await);
        assert!(manager.credentials().await.is_some());
        assert!(dir.path().join("session.json").exists());

        let probe = &transport.requests()[0];
        assert_eq!(probe.query_value("i"), Some("NSE:NIFTYBEES-EQ"));
        assert_eq!(probe.header_value("Authorization"), Some("token key:acc-0"));
    }

    #[tokio::test]
    async fn validate_keeps_session_when_upstream_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        saved_session(&dir, t0());
        let clock = Arc::new(FixedClock::new(t0() + TimeDelta::hours(1)));
        let (manager, _) = manager_with(&dir, clock, |_| {
            Err(BrokerError::Transport("request timeout".into()))
        });

        assert!(!manager.validate().await);
        assert!(manager.status().await.logged_in);
    }

    #[tokio::test]
    async fn expired_session_fails_without_probe() {
        let dir = tempfile::tempdir().unwrap();
        saved_session(&dir, t0());
        let clock = Arc::new(FixedClock::new(t0() + TimeDelta::hours(1)));
        let (manager, transport) =
            manager_with(&dir, clock.clone(), |_| Ok(HttpResponse::new(200, "{}")));

        assert!(manager.validate().await);
        clock.set(t0() + TimeDelta::hours(25));
        assert!(!manager.validate().await);
        assert_eq!(transport.requests().len(), 1);
        assert!(!dir.path().join("session.json").exists());
    }

    #[tokio::test]
    async fn refresh_never_logs_in() {
        let dir = tempfile::tempdir().unwrap();
        saved_session(&dir, t0());
        let clock = Arc::new(FixedClock::new(t0() + TimeDelta::hours(2)));
        let (manager, transport) = manager_with(&dir, clock.clone(), |request| {
            if request.url.contains("instruments/quote/ltp") {
                Ok(HttpResponse::new(401, ""))
            } else {
                auth_ok(request)
            }
        });

        assert!(!manager.refresh_if_needed().await);
        assert!(!manager.refresh_if_needed().await);
        clock.set(t0() + TimeDelta::hours(30));
        assert!(!manager.refresh_if_needed().await);

        for url in transport.urls() {
            assert!(!url.contains("connect/login"), "refresh reached login: {url}");
            assert!(!url.contains("session/token"), "refresh reached exchange: {url}");
        }
    }

    #[tokio::test]
    async fn reload_honours_the_24_hour_window() {
        let dir = tempfile::tempdir().unwrap();

        saved_session(&dir, t0());
        let clock = Arc::new(FixedClock::new(t0() + TimeDelta::hours(23) + TimeDelta::minutes(59)));
        let (fresh, _) = manager_with(&dir, clock, auth_ok);
        assert!(fresh.status().await.logged_in);
        assert_eq!(fresh.status().await.username.as_deref(), Some("trader"));

        let clock = Arc::new(FixedClock::new(t0() + TimeDelta::hours(24) + TimeDelta::minutes(1)));
        let (stale, _) = manager_with(&dir, clock, auth_ok);
        assert!(!stale.status().await.logged_in);
        assert!(stale.credentials().await.is_none());
        assert!(!dir.path().join("session.json").exists());
    }

    #[tokio::test]
    async fn logout_clears_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        saved_session(&dir, t0());
        let clock = Arc::new(FixedClock::new(t0()));
        let (manager, _) = manager_with(&dir, clock, auth_ok);

        manager.logout().await;
        let status = manager.status().await;
        assert!(!status.logged_in);
        assert!(status.username.is_none());
        assert!(!dir.path().join("session.json").exists());
    }

    #[tokio::test]
    async fn invalidate_ignores_stale_tokens() {
        let dir = tempfile::tempdir().unwrap();
        saved_session(&dir, t0());
        let clock = Arc::new(FixedClock::new(t0()));
        let (manager, _) = manager_with(&dir, clock, auth_ok);

        manager.invalidate("some-older-token").await;
        assert!(manager.credentials().await.is_some());

        manager.invalidate("acc-0").await;
        assert!(manager.credentials().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_validation_erases_once() {
        let dir = tempfile::tempdir().unwrap();
        saved_session(&dir, t0());
        let clock = Arc::new(FixedClock::new(t0()));
        let (manager, transport) = manager_with(&dir, clock, |_| Ok(HttpResponse::new(401, "")));
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.validate().await })
            })
            .collect();
        for handle in handles {
            assert!(!handle.await.unwrap());
        }

        // The first validator erased the session; the rest saw no token and skipped the probe.
        assert_eq!(transport.requests().len(), 1);
    }
}
