use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use uuid::Uuid;

/// Single-use proof of email ownership.
#[derive(Debug, Clone)]
pub struct VerificationToken {
    pub token: String,
    pub account_id: Uuid,
    pub issued_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub consumed_utc: Option<DateTime<Utc>>,
    /// Set when a newer token was issued for the same account.
    pub superseded_utc: Option<DateTime<Utc>>,
}

impl VerificationToken {
    pub fn new(account_id: Uuid, ttl: Duration) -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let now = Utc::now();
        Self {
            token: hex::encode(bytes),
            account_id,
            issued_utc: now,
            expiry_utc: now + ttl,
            consumed_utc: None,
            superseded_utc: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_utc
    }

    pub fn is_consumable_at(&self, now: DateTime<Utc>) -> bool {
        self.consumed_utc.is_none() && self.superseded_utc.is_none() && !self.is_expired_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_64_hex_chars_and_unique() {
        let account_id = Uuid::new_v4();
        let a = VerificationToken::new(account_id, Duration::hours(24));
        let b = VerificationToken::new(account_id, Duration::hours(24));
        assert_eq!(a.token.len(), 64);
        assert!(a.token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn test_consumable_until_expiry() {
        let token = VerificationToken::new(Uuid::new_v4(), Duration::hours(1));
        assert!(token.is_consumable_at(Utc::now()));
        assert!(!token.is_consumable_at(Utc::now() + Duration::hours(2)));
    }
}
