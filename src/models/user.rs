//! User-related models

use serde::{Deserialize, Serialize};

/// Roles admitted to the admin and counseling surfaces.
pub const DEFAULT_ALLOWED_ROLES: [&str; 3] = ["manager", "teacher", "counselor"];

/// Claims decoded from an access token.
///
/// Always derived from the token it came with; never edited on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub subject: String,
    pub role: String,
    /// Seconds since the Unix epoch.
    pub issued_at: i64,
    /// Seconds since the Unix epoch.
    pub expires_at: i64,
}

impl Claims {
    /// Whether `role` appears in the allow-list (exact match).
    pub fn has_role_in<S: AsRef<str>>(&self, allowed: &[S]) -> bool {
        allowed.iter().any(|r| r.as_ref() == self.role)
    }
}
