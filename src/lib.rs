//! session-keeper - client-side session and token lifecycle
//!
//! Holds one authenticated session against a token-issuing backend: decodes
//! and persists tokens, refreshes them behind a single-flight gate and ends
//! the session everywhere at once when authorization is lost.

pub mod api;
pub mod auth;
pub mod config;
pub mod keeper;
pub mod models;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ApiRequest, ApiResponse, RequestError};
pub use auth::{LoginError, LogoutReason, RefreshError, Session, SessionEvent, SessionStatus};
pub use config::Config;
pub use keeper::SessionKeeper;
pub use models::Claims;
