//! Application-facing entry point
//!
//! [`SessionKeeper`] wires the session manager, the refresh coordinator and
//! the request pipeline together so feature code only sees login, logout and
//! `request`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::api::{ApiClient, ApiRequest, ApiResponse, RequestError, ReqwestTransport, Transport};
use crate::auth::expiry::now_unix;
use crate::auth::{
    AuthBackend, FileTokenStore, HttpAuthBackend, LoginError, LogoutReason, LogoutSubscription,
    RefreshCoordinator, RefreshError, Session, SessionEvent, SessionManager, SessionSettings,
    StoreError, TokenStore,
};
use crate::config::Config;
use crate::models::Claims;

pub struct SessionKeeper {
    session: Arc<SessionManager>,
    refresher: Arc<RefreshCoordinator>,
    api: ApiClient,
}

impl SessionKeeper {
    /// Build the file-backed, HTTP-backed stack described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = ReqwestTransport::build_http(config.request_timeout())
            .context("Failed to build HTTP client")?;
        let session_path = config.session_path()?;
        tracing::debug!("Session file: {}", session_path.display());

        let store = Arc::new(FileTokenStore::new(session_path));
        let backend = Arc::new(HttpAuthBackend::new(
            http.clone(),
            config.auth_endpoints()?,
        ));
        let transport = Arc::new(ReqwestTransport::new(http, config.base_url.clone()));

        Ok(Self::with_parts(
            store,
            backend,
            transport,
            config.settings(),
            config.refresh_timeout(),
            config.excluded_paths.clone(),
        ))
    }

    pub fn with_parts(
        store: Arc<dyn TokenStore>,
        backend: Arc<dyn AuthBackend>,
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
        refresh_timeout: Duration,
        excluded_paths: Vec<String>,
    ) -> Self {
        let session = Arc::new(SessionManager::new(store, backend.clone(), settings));
        let refresher = Arc::new(RefreshCoordinator::new(
            session.clone(),
            backend,
            refresh_timeout,
        ));
        let api = ApiClient::new(
            session.clone(),
            refresher.clone(),
            transport,
            excluded_paths,
        );
        Self {
            session,
            refresher,
            api,
        }
    }

    /// Pick up the session persisted by a previous run.
    pub fn restore(&self) -> Result<Option<Session>, StoreError> {
        self.session.restore()
    }

    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Session, LoginError> {
        self.session.login(identifier, secret).await
    }

    pub async fn logout(&self) {
        self.session.logout().await
    }

    pub fn current_user(&self) -> Option<Claims> {
        self.session.current_user()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn on_logout<F>(&self, callback: F) -> LogoutSubscription
    where
        F: Fn(&LogoutReason) + Send + Sync + 'static,
    {
        self.session.on_logout(callback)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
        self.api.request(request).await
    }

    /// Refresh now if the access token is inside the refresh buffer.
    /// Returns whether a refresh happened.
    pub async fn refresh_if_needed(&self) -> Result<bool, RefreshError> {
        let session = self.session.current().ok_or(RefreshError::NoSession)?;
        if !self
            .session
            .policy()
            .needs_refresh(&session.claims, now_unix())
        {
            return Ok(false);
        }
        self.refresher.refresh(&session.access_token).await?;
        Ok(true)
    }

    /// Refresh regardless of how long the current token has left.
    pub async fn refresh_now(&self) -> Result<Session, RefreshError> {
        let session = self.session.current().ok_or(RefreshError::NoSession)?;
        self.refresher.refresh(&session.access_token).await?;
        self.session.current().ok_or(RefreshError::Superseded)
    }

    pub fn session(&self) -> Option<Session> {
        self.session.current()
    }

    /// Drop listeners. The persisted session survives for the next run.
    pub fn dispose(&self) {
        self.session.dispose()
    }
}
