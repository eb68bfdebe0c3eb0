//! Bearer token decoding
//!
//! Tokens are three dot-separated segments with a base64url JSON payload in
//! the middle. The signature is never checked here; the backend does that.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de;
use serde::Deserialize;

use crate::models::Claims;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("token has {found} segments, expected 3")]
    SegmentCount { found: usize },
    #[error("token payload is not valid base64url: {0}")]
    Base64(String),
    #[error("token payload is not a valid claims object: {0}")]
    Payload(String),
}

fn string_or_number<'de, D: de::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = String;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("string or integer subject")
        }
        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_string())
        }
        fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }
        fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }
    }
    d.deserialize_any(Visitor)
}

/// Wire shape of the payload. Every field is required.
#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(alias = "id", alias = "userId", deserialize_with = "string_or_number")]
    sub: String,
    role: String,
    iat: i64,
    exp: i64,
}

/// Decode a token into claims. Expired tokens decode normally.
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 {
        return Err(DecodeError::SegmentCount {
            found: segments.len(),
        });
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    let raw: RawClaims =
        serde_json::from_slice(&payload).map_err(|e| DecodeError::Payload(e.to_string()))?;

    Ok(Claims {
        subject: raw.sub,
        role: raw.role,
        issued_at: raw.iat,
        expires_at: raw.exp,
    })
}
