//! Refresh session model - server-side record behind every refresh token.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Refresh session entity. Only the SHA-256 of the token is stored.
#[derive(Debug, Clone)]
pub struct RefreshSession {
    pub session_id: Uuid,
    pub account_id: Uuid,
    pub token_hash_text: String,
    pub expiry_utc: DateTime<Utc>,
    pub revoked_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl RefreshSession {
    pub fn new(session_id: Uuid, account_id: Uuid, token_hash: String, expiry_days: i64) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            account_id,
            token_hash_text: token_hash,
            expiry_utc: now + Duration::days(expiry_days),
            revoked_utc: None,
            created_utc: now,
        }
    }

    /// SHA-256 hex of a raw refresh token.
    pub fn hash_token(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    pub fn matches_token(&self, token: &str) -> bool {
        self.token_hash_text == Self::hash_token(token)
    }

    /// Not expired and not revoked.
    pub fn is_valid(&self) -> bool {
        self.revoked_utc.is_none() && self.expiry_utc > Utc::now()
    }
}
