//! Token expiration checks

use crate::models::Claims;

/// Refresh this many seconds before true expiry unless configured otherwise.
pub const DEFAULT_REFRESH_BUFFER_SECS: i64 = 300;

/// Current Unix time in seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// True once `expires_at` is strictly in the past.
pub fn is_expired(claims: &Claims, now: i64) -> bool {
    claims.expires_at < now
}

/// True when the token expires within `buffer_secs` of `now`.
pub fn needs_refresh(claims: &Claims, now: i64, buffer_secs: i64) -> bool {
    claims.expires_at < now.saturating_add(buffer_secs)
}

/// Where a token sits relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    NeedsRefresh,
    Expired,
}

/// Expiration checks bound to a configured buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub buffer_secs: i64,
}

impl ExpirationPolicy {
    pub fn new(buffer_secs: i64) -> Self {
        Self { buffer_secs }
    }

    pub fn is_expired(&self, claims: &Claims, now: i64) -> bool {
        is_expired(claims, now)
    }

    pub fn needs_refresh(&self, claims: &Claims, now: i64) -> bool {
        needs_refresh(claims, now, self.buffer_secs)
    }

    pub fn classify(&self, claims: &Claims, now: i64) -> TokenState {
        if self.is_expired(claims, now) {
            TokenState::Expired
        } else if self.needs_refresh(claims, now) {
            TokenState::NeedsRefresh
        } else {
            TokenState::Valid
        }
    }
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_BUFFER_SECS)
    }
}
