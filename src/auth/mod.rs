//! Authentication and session management
//!
//! Decodes bearer tokens, persists the session between runs, refreshes the
//! access token behind a single-flight gate and runs the logout cascade.

pub mod backend;
pub mod codec;
pub mod expiry;
pub mod refresh;
pub mod session;
pub mod tokens;

use url::Url;

pub use backend::{AuthBackend, BackendError, HttpAuthBackend, IssuedToken};
pub use codec::{decode, DecodeError};
pub use expiry::{ExpirationPolicy, TokenState};
pub use refresh::{RefreshCoordinator, RefreshError};
pub use session::{
    LoginError, LogoutReason, LogoutSubscription, Session, SessionEvent, SessionManager,
    SessionSettings, SessionStatus,
};
pub use tokens::{FileTokenStore, MemoryTokenStore, SessionRecord, StoreError, TokenStore};

/// Backend authentication endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    /// Exchanges credentials for a token
    pub login: Url,
    /// Exchanges a refresh token for a new access token
    pub refresh: Url,
    /// Invalidates a token server-side
    pub logout: Url,
}
