//! Single-flight token refresh
//!
//! However many requests find the access token stale at once, only one
//! refresh call goes to the backend. Everyone who asked while it was running
//! gets the same outcome, delivered in the order they joined.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use super::backend::{AuthBackend, BackendError};
use super::codec;
use super::expiry::now_unix;
use super::session::{LogoutReason, RefreshTicket, SessionManager};

/// Default bound on the refresh network call.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("no active session to refresh")]
    NoSession,
    #[error("session has no refresh token")]
    MissingRefreshToken,
    #[error("refresh rejected (HTTP {status})")]
    Rejected { status: u16 },
    #[error("refresh request failed: {0}")]
    Network(String),
    #[error("refreshed token is invalid: {0}")]
    InvalidToken(String),
    #[error("refreshed token carries disallowed role '{role}'")]
    ForbiddenRole { role: String },
    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),
    #[error("session changed while refreshing")]
    Superseded,
    #[error("refresh ended without a result")]
    Abandoned,
}

impl From<BackendError> for RefreshError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Rejected { status, .. } => RefreshError::Rejected { status },
            BackendError::Network(msg) => RefreshError::Network(msg),
            BackendError::Malformed(msg) => RefreshError::InvalidToken(msg),
        }
    }
}

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

/// Exists exactly while a refresh is in flight.
#[derive(Default)]
struct PendingRefresh {
    waiters: Vec<Waiter>,
}

/// Resolves every waiter once; a dropped leader resolves them as abandoned.
struct FanOut<'a> {
    pending: &'a Mutex<Option<PendingRefresh>>,
    finished: bool,
}

impl FanOut<'_> {
    fn finish(mut self, outcome: Result<String, RefreshError>) {
        self.finished = true;
        self.resolve(outcome);
    }

    fn resolve(&self, outcome: Result<String, RefreshError>) {
        let waiters = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|p| p.waiters)
            .unwrap_or_default();

        tracing::debug!("Resolving {} refresh waiter(s)", waiters.len());
        for waiter in waiters {
            // A waiter whose request was dropped is gone; skip it.
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for FanOut<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.resolve(Err(RefreshError::Abandoned));
        }
    }
}

pub struct RefreshCoordinator {
    session: Arc<SessionManager>,
    backend: Arc<dyn AuthBackend>,
    timeout: Duration,
    pending: Mutex<Option<PendingRefresh>>,
}

impl RefreshCoordinator {
    pub fn new(
        session: Arc<SessionManager>,
        backend: Arc<dyn AuthBackend>,
        timeout: Duration,
    ) -> Self {
        Self {
            session,
            backend,
            timeout,
            pending: Mutex::new(None),
        }
    }

    pub fn in_flight(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Get a fresh access token, replacing `observed_token`.
    ///
    /// Joins the refresh already in flight if there is one. The refresh itself
    /// runs on its own task, so it completes (or times out) even if this
    /// caller goes away.
    pub async fn refresh(self: &Arc<Self>, observed_token: &str) -> Result<String, RefreshError> {
        let (tx, rx) = oneshot::channel();
        let lead = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.as_mut() {
                Some(p) => {
                    p.waiters.push(tx);
                    false
                }
                None => {
                    *pending = Some(PendingRefresh { waiters: vec![tx] });
                    true
                }
            }
        };

        if lead {
            let this = Arc::clone(self);
            let observed = observed_token.to_string();
            tokio::spawn(async move { this.lead(observed).await });
        } else {
            tracing::debug!("Joining in-flight token refresh");
        }

        rx.await.unwrap_or(Err(RefreshError::Abandoned))
    }

    async fn lead(&self, observed: String) {
        let fan_out = FanOut {
            pending: &self.pending,
            finished: false,
        };

        let outcome = match self.session.refresh_ticket() {
            None => Err(RefreshError::NoSession),
            Some(ticket) => {
                let outcome = self.perform(&ticket, &observed).await;
                if let Err(e) = &outcome {
                    tracing::warn!("Token refresh failed: {}", e);
                    self.session
                        .force_logout(ticket.generation, LogoutReason::RefreshFailed)
                        .await;
                }
                outcome
            }
        };

        fan_out.finish(outcome);
    }

    async fn perform(&self, ticket: &RefreshTicket, observed: &str) -> Result<String, RefreshError> {
        // Someone else already swapped the token in.
        if ticket.access_token != observed
            && !self.session.policy().is_expired(&ticket.claims, now_unix())
        {
            tracing::debug!("Token already refreshed, skipping network call");
            return Ok(ticket.access_token.clone());
        }
        if ticket.refresh_token.is_empty() {
            return Err(RefreshError::MissingRefreshToken);
        }

        self.session.begin_refresh(ticket.generation);
        tracing::info!("Refreshing access token...");

        let issued =
            match tokio::time::timeout(self.timeout, self.backend.refresh(&ticket.refresh_token))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(RefreshError::TimedOut(self.timeout)),
            };

        let claims =
            codec::decode(&issued.token).map_err(|e| RefreshError::InvalidToken(e.to_string()))?;
        self.session.apply_refresh(ticket.generation, &issued, claims)
    }
}
