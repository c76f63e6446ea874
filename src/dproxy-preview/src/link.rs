//! Preview link data.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Random bytes per token (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// A capability URL for one sandbox port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewLink {
    /// URL-safe random token.
    pub token: String,
    /// Sandbox port the link is bound to.
    pub port: u16,
    /// `{base}/preview/{token}`.
    pub url: String,
    /// Expiry as epoch seconds. `None` never expires.
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PreviewLink {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }
}

/// Outcome of looking up a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkLookup {
    Active(PreviewLink),
    /// Known but past its expiry and not yet swept.
    Expired(PreviewLink),
    Missing,
}

/// Registry counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub total_links: usize,
    pub active_links: usize,
    pub expired_links: usize,
}

/// Generate a fresh token from the thread-local CSPRNG.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}
