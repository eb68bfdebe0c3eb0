//! Backend authentication endpoints
//!
//! Login, refresh and logout live on the backend; this module only speaks to
//! them. The session layer talks to the [`AuthBackend`] trait so the HTTP side
//! can be swapped out.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::AuthEndpoints;

/// A token pair handed out by login or refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    /// Only set when the backend issues a separate refresh token.
    pub refresh_token: Option<String>,
}

impl IssuedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            refresh_token: None,
        }
    }
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("backend unreachable: {0}")]
    Network(String),
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn login(&self, identifier: &str, secret: &str) -> Result<IssuedToken, BackendError>;
    async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, BackendError>;
    /// Best-effort server-side invalidation.
    async fn logout(&self, access_token: &str) -> Result<(), BackendError>;
}

/// Token response from login and refresh.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    token: Option<String>,
    #[serde(rename = "refreshToken", alias = "refresh_token")]
    refresh_token: Option<String>,
}

impl TokenResponse {
    fn into_issued(self) -> Result<IssuedToken, BackendError> {
        let token = self
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BackendError::Malformed("response missing 'token'".into()))?;
        Ok(IssuedToken {
            token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
        })
    }
}

/// [`AuthBackend`] over HTTP.
pub struct HttpAuthBackend {
    http: reqwest::Client,
    endpoints: AuthEndpoints,
}

impl HttpAuthBackend {
    pub fn new(http: reqwest::Client, endpoints: AuthEndpoints) -> Self {
        Self { http, endpoints }
    }

    async fn post_for_token(
        &self,
        url: &Url,
        body: &serde_json::Value,
    ) -> Result<IssuedToken, BackendError> {
        tracing::debug!("Auth POST {}", url);

        let resp = self
            .http
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        parsed.into_issued()
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, identifier: &str, secret: &str) -> Result<IssuedToken, BackendError> {
        let body = serde_json::json!({ "identifier": identifier, "secret": secret });
        self.post_for_token(&self.endpoints.login, &body).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, BackendError> {
        let body = serde_json::json!({ "refreshToken": refresh_token });
        self.post_for_token(&self.endpoints.refresh, &body).await
    }

    async fn logout(&self, access_token: &str) -> Result<(), BackendError> {
        tracing::debug!("Auth POST {}", self.endpoints.logout);

        let resp = self
            .http
            .post(self.endpoints.logout.clone())
            .bearer_auth(access_token)
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<IssuedToken, BackendError> {
        serde_json::from_str::<TokenResponse>(json)
            .unwrap()
            .into_issued()
    }

    #[test]
    fn test_token_response_variants() {
        assert_eq!(parse(r#"{"token":"a"}"#).unwrap(), IssuedToken::new("a"));
        assert_eq!(parse(r#"{"accessToken":"b"}"#).unwrap().token, "b");

        let pair = parse(r#"{"token":"a","refreshToken":"r"}"#).unwrap();
        assert_eq!(pair.refresh_token.as_deref(), Some("r"));
    }

    #[test]
    fn test_token_response_missing_token() {
        assert!(matches!(parse("{}"), Err(BackendError::Malformed(_))));
        assert!(matches!(
            parse(r#"{"token":""}"#),
            Err(BackendError::Malformed(_))
        ));
    }
}
