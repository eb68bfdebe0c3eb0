//! Authenticated HTTP client for backend APIs
//!
//! Every feature call goes through [`ApiClient::request`], which attaches the
//! bearer token, refreshes it when stale and retries a 401 exactly once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{ApiRequest, ApiResponse, Transport, TransportError};
use crate::auth::expiry::now_unix;
use crate::auth::refresh::RefreshCoordinator;
use crate::auth::session::{Bearer, LogoutReason, SessionManager};

/// Sends after a refresh allowed per request.
const MAX_RETRIES: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request unauthorized; session ended")]
    Unauthorized,
    #[error("request forbidden; session ended")]
    Forbidden,
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response body: {0}")]
    Decode(String),
}

/// A request plus how many times it has been re-sent after a refresh.
struct RequestAttempt {
    request: ApiRequest,
    attempt_count: u32,
}

/// Token-managing client that all feature code sends through.
pub struct ApiClient {
    session: Arc<SessionManager>,
    refresher: Arc<RefreshCoordinator>,
    transport: Arc<dyn Transport>,
    /// Paths sent as-is, with no bearer and no refresh handling.
    excluded_paths: Vec<String>,
}

impl ApiClient {
    pub fn new(
        session: Arc<SessionManager>,
        refresher: Arc<RefreshCoordinator>,
        transport: Arc<dyn Transport>,
        excluded_paths: Vec<String>,
    ) -> Self {
        Self {
            session,
            refresher,
            transport,
            excluded_paths,
        }
    }

    fn is_excluded(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
        self.excluded_paths
            .iter()
            .any(|p| p.trim_end_matches('/') == path)
    }

    /// GET request below the base URL.
    pub async fn get(&self, path: &str) -> Result<ApiResponse, RequestError> {
        self.request(ApiRequest::get(path)).await
    }

    /// POST request with a JSON body.
    pub async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<ApiResponse, RequestError> {
        self.request(ApiRequest::post(path, body.clone())).await
    }

    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
        if self.is_excluded(&request.path) {
            tracing::debug!("{} {} (excluded from token handling)", request.method, request.path);
            return self.send(&request, None).await;
        }

        let mut attempt = RequestAttempt {
            request,
            attempt_count: 0,
        };
        let (mut generation, mut bearer) = self.prepare_bearer().await?;

        loop {
            let resp = self.send(&attempt.request, bearer.as_deref()).await?;

            match resp.status {
                StatusCode::UNAUTHORIZED if attempt.attempt_count < MAX_RETRIES => {
                    attempt.attempt_count += 1;
                    tracing::debug!(
                        "401 for {}; refreshing token and retrying",
                        attempt.request.path
                    );
                    match self
                        .refresher
                        .refresh(bearer.as_deref().unwrap_or_default())
                        .await
                    {
                        Ok(token) => {
                            bearer = Some(token);
                            generation =
                                generation.or_else(|| self.session.current().map(|s| s.generation));
                        }
                        Err(e) => {
                            tracing::warn!("Refresh after 401 failed: {}", e);
                            self.end_session(generation, LogoutReason::RefreshFailed).await;
                            return Err(RequestError::Unauthorized);
                        }
                    }
                }
                StatusCode::UNAUTHORIZED => {
                    tracing::warn!(
                        "401 for {} after token refresh; ending session",
                        attempt.request.path
                    );
                    self.end_session(generation, LogoutReason::Unauthorized).await;
                    return Err(RequestError::Unauthorized);
                }
                StatusCode::FORBIDDEN => {
                    tracing::warn!("403 for {}; ending session", attempt.request.path);
                    self.end_session(generation, LogoutReason::Forbidden).await;
                    return Err(RequestError::Forbidden);
                }
                _ => return Ok(resp),
            }
        }
    }

    /// Pick the token to send with, refreshing first if it is known stale.
    async fn prepare_bearer(&self) -> Result<(Option<u64>, Option<String>), RequestError> {
        match self.session.bearer(now_unix()) {
            Bearer::Anonymous => Ok((None, None)),
            Bearer::Valid { generation, token } => Ok((Some(generation), Some(token))),
            Bearer::Stale { generation, token } => {
                tracing::debug!("Access token stale, refreshing before send");
                match self.refresher.refresh(&token).await {
                    Ok(fresh) => Ok((Some(generation), Some(fresh))),
                    Err(e) => {
                        tracing::warn!("Refresh before send failed: {}", e);
                        self.end_session(Some(generation), LogoutReason::RefreshFailed)
                            .await;
                        Err(RequestError::Unauthorized)
                    }
                }
            }
        }
    }

    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, RequestError> {
        self.transport.send(request, bearer).await.map_err(|e| {
            tracing::debug!("{} {} failed: {}", request.method, request.path, e);
            RequestError::Network(e.to_string())
        })
    }

    async fn end_session(&self, generation: Option<u64>, reason: LogoutReason) {
        // Anonymous requests have no session to end.
        if let Some(generation) = generation {
            self.session.force_logout(generation, reason).await;
        }
    }
}

/// [`Transport`] over reqwest.
pub struct ReqwestTransport {
    http: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Build a reqwest client with a per-request timeout.
    pub fn build_http(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder().timeout(timeout).build()
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.path);
        tracing::debug!("{} {}", request.method, url);

        let mut builder = self.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| TransportError(format!("{} {} failed: {}", request.method, url, e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError(format!("reading body of {} failed: {}", url, e)))?;
        Ok(ApiResponse { status, body })
    }
}
