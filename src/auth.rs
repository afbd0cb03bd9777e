//! Bearer-token authentication for the relay.
//!
//! A token is two base64url segments, `claims.signature`: the serialized
//! [`Claims`] followed by an HMAC-SHA256 tag over the claims segment, keyed
//! with the relay's shared secret. Verification is constant-time on the tag
//! and tolerant of nothing else; any malformed, forged or expired token is
//! simply rejected.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Fallback signing secret for development setups.
pub const DEFAULT_SHARED_SECRET: &str = "dev-secret";

/// Token payload. The authenticated author may be carried as either `sub`
/// or `id`; `sub` wins when both are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Expiry, seconds since the Unix epoch. Tokens without one never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl Claims {
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            sub: Some(subject.into()),
            id: None,
            exp: None,
        }
    }

    /// The principal this token authenticates, if it names one.
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref().or(self.id.as_deref())
    }
}

/// Serialize and sign `claims` with `secret`.
pub fn mint_token(secret: &str, claims: &Claims) -> Result<String, serde_json::Error> {
    let body = serde_json::to_vec(claims)?;
    let encoded = URL_SAFE_NO_PAD.encode(body);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(encoded.as_bytes());
    let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{encoded}.{tag}"))
}

/// Check signature and expiry. Returns `None` for anything that does not
/// verify, without distinguishing why.
pub fn verify_token(secret: &str, token: &str) -> Option<Claims> {
    let (encoded, tag) = token.split_once('.')?;
    let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(encoded.as_bytes());
    mac.verify_slice(&tag).ok()?;

    let body = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    let claims: Claims = serde_json::from_slice(&body).ok()?;
    if let Some(exp) = claims.exp {
        if exp <= unix_now() {
            return None;
        }
    }
    Some(claims)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
