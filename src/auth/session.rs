//! Session lifecycle
//!
//! [`SessionManager`] owns the one live session: login, refresh bookkeeping on
//! behalf of the refresh coordinator, and the logout cascade. It is the only
//! writer of session status and tokens.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};

use super::backend::{AuthBackend, BackendError, IssuedToken};
use super::codec::{self, DecodeError};
use super::expiry::{now_unix, ExpirationPolicy};
use super::refresh::RefreshError;
use super::tokens::{SessionRecord, StoreError, TokenStore};
use crate::models::{Claims, DEFAULT_ALLOWED_ROLES};

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
    /// Transient: listeners are running, collapses to `Anonymous`.
    LoggedOut,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    UserInitiated,
    RefreshFailed,
    Unauthorized,
    Forbidden,
}

impl LogoutReason {
    pub fn is_forced(self) -> bool {
        !matches!(self, LogoutReason::UserInitiated)
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogoutReason::UserInitiated => "user initiated",
            LogoutReason::RefreshFailed => "token refresh failed",
            LogoutReason::Unauthorized => "request unauthorized",
            LogoutReason::Forbidden => "request forbidden",
        };
        f.write_str(s)
    }
}

/// Lifecycle notifications for the rest of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Authenticated { subject: String, role: String },
    Refreshed { expires_at: i64 },
    LoggedOut { reason: LogoutReason },
}

/// Snapshot of the live session.
#[derive(Clone)]
pub struct Session {
    pub status: SessionStatus,
    pub access_token: String,
    pub refresh_token: String,
    pub claims: Claims,
    pub created_at: DateTime<Utc>,
    /// Bumped on every login; refreshes keep it.
    pub generation: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("claims", &self.claims)
            .field("created_at", &self.created_at)
            .field("generation", &self.generation)
            .finish()
    }
}

/// What the request layer should attach to an outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bearer {
    Anonymous,
    Valid { generation: u64, token: String },
    /// Expired, or a refresh is already running.
    Stale { generation: u64, token: String },
}

/// Inputs for one refresh attempt.
#[derive(Clone)]
pub(crate) struct RefreshTicket {
    pub generation: u64,
    pub access_token: String,
    pub refresh_token: String,
    pub claims: Claims,
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("login rejected (HTTP {status})")]
    Rejected { status: u16 },
    #[error("login request failed: {0}")]
    Network(String),
    #[error("login response was malformed: {0}")]
    Malformed(String),
    #[error("login token could not be decoded: {0}")]
    Decode(#[from] DecodeError),
    #[error("role '{role}' is not permitted to sign in")]
    ForbiddenRole { role: String },
    #[error("login token is already expired")]
    Expired,
    #[error("failed to persist session: {0}")]
    Storage(#[from] StoreError),
    #[error("already logged in")]
    AlreadyAuthenticated,
    #[error("another login or logout is in progress")]
    Busy,
}

impl From<BackendError> for LoginError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Rejected { status, .. } => LoginError::Rejected { status },
            BackendError::Network(msg) => LoginError::Network(msg),
            BackendError::Malformed(msg) => LoginError::Malformed(msg),
        }
    }
}

/// Tunables for the session layer.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub allowed_roles: Vec<String>,
    pub policy: ExpirationPolicy,
    /// Upper bound on the best-effort backend logout call.
    pub logout_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            allowed_roles: DEFAULT_ALLOWED_ROLES.iter().map(|r| r.to_string()).collect(),
            policy: ExpirationPolicy::default(),
            logout_timeout: Duration::from_secs(5),
        }
    }
}

type LogoutCallback = Arc<dyn Fn(&LogoutReason) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    entries: Vec<(u64, LogoutCallback)>,
}

/// Handle returned by [`SessionManager::on_logout`].
pub struct LogoutSubscription {
    id: u64,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl LogoutSubscription {
    pub fn unregister(self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

struct SessionState {
    status: SessionStatus,
    active: Option<SessionRecord>,
    generation: u64,
    /// Present while a logout cascade runs.
    logout: Option<watch::Receiver<bool>>,
}

impl SessionState {
    fn snapshot(&self) -> Option<Session> {
        self.active.as_ref().map(|record| Session {
            status: self.status,
            access_token: record.access_token.clone(),
            refresh_token: record.refresh_token.clone(),
            claims: record.user.clone(),
            created_at: record.saved_at,
            generation: self.generation,
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Best-effort server-side invalidation of `access_token`.
async fn revoke_remote(backend: Arc<dyn AuthBackend>, access_token: String, timeout: Duration) {
    match tokio::time::timeout(timeout, backend.logout(&access_token)).await {
        Ok(Ok(())) => tracing::debug!("Backend logout acknowledged"),
        Ok(Err(e)) => tracing::warn!("Backend logout failed (ignored): {}", e),
        Err(_) => tracing::warn!("Backend logout timed out after {:?} (ignored)", timeout),
    }
}

/// Releases logout waiters even if the logout cascade panics midway.
struct LogoutCompletion<'a> {
    state: &'a Mutex<SessionState>,
    done: watch::Sender<bool>,
}

impl Drop for LogoutCompletion<'_> {
    fn drop(&mut self) {
        {
            let mut state = lock(self.state);
            state.logout = None;
            if state.status == SessionStatus::LoggedOut {
                state.active = None;
                state.status = SessionStatus::Anonymous;
            }
        }
        self.done.send_replace(true);
    }
}

/// Puts the status back to `Anonymous` if a login does not finish.
struct LoginAttempt<'a> {
    state: &'a Mutex<SessionState>,
}

impl Drop for LoginAttempt<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        if state.status == SessionStatus::Authenticating {
            state.status = SessionStatus::Anonymous;
        }
    }
}

pub struct SessionManager {
    state: Mutex<SessionState>,
    store: Arc<dyn TokenStore>,
    backend: Arc<dyn AuthBackend>,
    settings: SessionSettings,
    listeners: Arc<Mutex<ListenerRegistry>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        backend: Arc<dyn AuthBackend>,
        settings: SessionSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(SessionState {
                status: SessionStatus::Anonymous,
                active: None,
                generation: 0,
                logout: None,
            }),
            store,
            backend,
            settings,
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
            events,
        }
    }

    pub fn policy(&self) -> ExpirationPolicy {
        self.settings.policy
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    pub fn current(&self) -> Option<Session> {
        lock(&self.state).snapshot()
    }

    pub fn current_user(&self) -> Option<Claims> {
        lock(&self.state).active.as_ref().map(|r| r.user.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::Authenticated | SessionStatus::Refreshing
        )
    }

    fn role_allowed(&self, claims: &Claims) -> bool {
        claims.has_role_in(&self.settings.allowed_roles)
    }

    /// Register a callback run once per logout, in registration order.
    pub fn on_logout<F>(&self, callback: F) -> LogoutSubscription
    where
        F: Fn(&LogoutReason) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.listeners);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push((id, Arc::new(callback)));
        LogoutSubscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Load a persisted session at startup.
    ///
    /// Records that no longer decode or carry a disallowed role are cleared
    /// instead of restored, as are expired records without a separate
    /// refresh token. An expired record that has one comes back with a stale
    /// bearer, so the first request refreshes it.
    pub fn restore(&self) -> Result<Option<Session>, StoreError> {
        let Some(record) = self.store.load()? else {
            return Ok(None);
        };

        let claims = match codec::decode(&record.access_token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!("Stored session token is undecodable, discarding: {}", e);
                self.store.clear()?;
                return Ok(None);
            }
        };
        if !self.role_allowed(&claims) {
            tracing::warn!("Stored session has disallowed role '{}', discarding", claims.role);
            self.store.clear()?;
            return Ok(None);
        }
        let now = now_unix();
        if self.settings.policy.is_expired(&claims, now) {
            // A separate refresh token may outlive the access token.
            if record.refresh_token == record.access_token {
                tracing::info!("Stored session expired, discarding");
                self.store.clear()?;
                return Ok(None);
            }
            tracing::info!("Stored access token expired; it will be refreshed before use");
        }

        let mut state = lock(&self.state);
        if state.active.is_some()
            || state.logout.is_some()
            || state.status == SessionStatus::Authenticating
        {
            return Ok(state.snapshot());
        }
        tracing::info!("Restored session for subject {}", claims.subject);
        state.generation += 1;
        state.active = Some(SessionRecord {
            user: claims,
            ..record
        });
        state.status = SessionStatus::Authenticated;
        Ok(state.snapshot())
    }

    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Session, LoginError> {
        {
            let mut state = lock(&self.state);
            if state.logout.is_some() || state.status == SessionStatus::Authenticating {
                return Err(LoginError::Busy);
            }
            if state.active.is_some() {
                return Err(LoginError::AlreadyAuthenticated);
            }
            state.status = SessionStatus::Authenticating;
        }
        let _attempt = LoginAttempt { state: &self.state };

        tracing::info!("Logging in as {}", identifier);
        let issued = self.backend.login(identifier, secret).await?;
        let claims = match codec::decode(&issued.token) {
            Ok(claims) => claims,
            Err(e) => {
                self.discard_partial();
                return Err(e.into());
            }
        };

        if !self.role_allowed(&claims) {
            tracing::warn!("Login refused for role '{}'", claims.role);
            self.discard_partial();
            return Err(LoginError::ForbiddenRole { role: claims.role });
        }
        if self.settings.policy.is_expired(&claims, now_unix()) {
            self.discard_partial();
            return Err(LoginError::Expired);
        }

        let record = SessionRecord::new(issued.token, issued.refresh_token, claims);
        let session = {
            let mut state = lock(&self.state);
            if state.status != SessionStatus::Authenticating {
                return Err(LoginError::Busy);
            }
            self.store.save(&record)?;
            state.generation += 1;
            state.active = Some(record);
            state.status = SessionStatus::Authenticated;
            state.snapshot()
        };
        let session = session.ok_or(LoginError::Busy)?;

        tracing::info!(
            "Logged in: subject={} role={}",
            session.claims.subject,
            session.claims.role
        );
        self.emit(SessionEvent::Authenticated {
            subject: session.claims.subject.clone(),
            role: session.claims.role.clone(),
        });
        Ok(session)
    }

    fn discard_partial(&self) {
        if let Err(e) = self.store.clear() {
            tracing::warn!("Failed to clear session store: {}", e);
        }
    }

    /// User-initiated logout. Idempotent; concurrent callers share one run.
    /// Returns once the backend logout has been acknowledged or timed out.
    pub async fn logout(&self) {
        self.end_session(None, LogoutReason::UserInitiated).await
    }

    /// System-initiated logout for the session `generation` it was raised
    /// against. Ignored when that session is already gone.
    ///
    /// Returns after the local teardown; the backend logout continues on its
    /// own task.
    pub async fn force_logout(&self, generation: u64, reason: LogoutReason) {
        self.end_session(Some(generation), reason).await
    }

    async fn end_session(&self, generation: Option<u64>, reason: LogoutReason) {
        enum Step {
            Nothing,
            Wait(watch::Receiver<bool>),
            Run(watch::Sender<bool>, String),
        }

        let step = {
            let mut state = lock(&self.state);
            if let Some(rx) = &state.logout {
                Step::Wait(rx.clone())
            } else if generation.is_some_and(|g| g != state.generation) {
                Step::Nothing
            } else {
                match state.active.as_ref().map(|r| r.access_token.clone()) {
                    None => Step::Nothing,
                    Some(token) => {
                        let (tx, rx) = watch::channel(false);
                        state.logout = Some(rx);
                        state.status = SessionStatus::LoggedOut;
                        Step::Run(tx, token)
                    }
                }
            }
        };

        match step {
            Step::Nothing => {}
            Step::Wait(mut rx) => {
                tracing::debug!("Logout already in progress, waiting");
                let _ = rx.wait_for(|done| *done).await;
            }
            Step::Run(done, token) => {
                {
                    let _completion = LogoutCompletion {
                        state: &self.state,
                        done,
                    };
                    self.run_local_logout(reason);
                }

                let revoke = revoke_remote(
                    Arc::clone(&self.backend),
                    token,
                    self.settings.logout_timeout,
                );
                if reason.is_forced() {
                    tokio::spawn(revoke);
                } else {
                    revoke.await;
                }
            }
        }
    }

    /// Store clear, listeners, `Anonymous`, event. Never waits on the network.
    fn run_local_logout(&self, reason: LogoutReason) {
        if reason.is_forced() {
            tracing::warn!("Forced logout: {}", reason);
        } else {
            tracing::info!("Logging out");
        }

        self.discard_partial();
        self.notify_listeners(&reason);
        {
            let mut state = lock(&self.state);
            state.active = None;
            state.status = SessionStatus::Anonymous;
        }
        self.emit(SessionEvent::LoggedOut { reason });
    }

    fn notify_listeners(&self, reason: &LogoutReason) {
        let callbacks: Vec<LogoutCallback> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(reason))).is_err() {
                tracing::warn!("Logout listener panicked; continuing with the rest");
            }
        }
    }

    /// What to attach to a request sent at `now`.
    pub fn bearer(&self, now: i64) -> Bearer {
        let state = lock(&self.state);
        let Some(record) = state.active.as_ref() else {
            return Bearer::Anonymous;
        };
        let generation = state.generation;
        let token = record.access_token.clone();
        match state.status {
            SessionStatus::Authenticated if !self.settings.policy.is_expired(&record.user, now) => {
                Bearer::Valid { generation, token }
            }
            SessionStatus::Authenticated | SessionStatus::Refreshing => {
                Bearer::Stale { generation, token }
            }
            _ => Bearer::Anonymous,
        }
    }

    pub(crate) fn refresh_ticket(&self) -> Option<RefreshTicket> {
        let state = lock(&self.state);
        if state.logout.is_some() {
            return None;
        }
        match state.status {
            SessionStatus::Authenticated | SessionStatus::Refreshing => {}
            _ => return None,
        }
        state.active.as_ref().map(|record| RefreshTicket {
            generation: state.generation,
            access_token: record.access_token.clone(),
            refresh_token: record.refresh_token.clone(),
            claims: record.user.clone(),
        })
    }

    pub(crate) fn begin_refresh(&self, generation: u64) {
        let mut state = lock(&self.state);
        if state.generation == generation && state.status == SessionStatus::Authenticated {
            state.status = SessionStatus::Refreshing;
        }
    }

    /// Swap a refreshed token into the store and the live session.
    pub(crate) fn apply_refresh(
        &self,
        generation: u64,
        issued: &IssuedToken,
        claims: Claims,
    ) -> Result<String, RefreshError> {
        if !self.role_allowed(&claims) {
            return Err(RefreshError::ForbiddenRole { role: claims.role });
        }
        if self.settings.policy.is_expired(&claims, now_unix()) {
            return Err(RefreshError::InvalidToken(
                "refreshed token is already expired".into(),
            ));
        }

        let expires_at = claims.expires_at;
        {
            let mut state = lock(&self.state);
            if state.generation != generation || state.logout.is_some() {
                return Err(RefreshError::Superseded);
            }
            let Some(record) = state.active.as_mut() else {
                return Err(RefreshError::Superseded);
            };

            if let Err(e) = self.store.update_access_token(
                &issued.token,
                issued.refresh_token.as_deref(),
                &claims,
            ) {
                tracing::warn!("Failed to persist refreshed token: {}", e);
            }
            record.rotate(&issued.token, issued.refresh_token.as_deref(), &claims);
            state.status = SessionStatus::Authenticated;
        }

        tracing::info!("Access token refreshed (expires_at={})", expires_at);
        self.emit(SessionEvent::Refreshed { expires_at });
        Ok(issued.token.clone())
    }

    /// Drop every logout listener. The persisted session is kept.
    pub fn dispose(&self) {
        lock(&self.listeners).entries.clear();
        tracing::debug!("Session manager disposed");
    }

    #[cfg(test)]
    pub(crate) fn install(&self, record: SessionRecord) -> u64 {
        let mut state = lock(&self.state);
        state.generation += 1;
        state.active = Some(record);
        state.status = SessionStatus::Authenticated;
        state.generation
    }
}
