use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    EmailVerification,
    PasswordReset,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::EmailVerification => "email_verification",
            TokenPurpose::PasswordReset => "password_reset",
        }
    }

    fn lifetime(&self) -> Duration {
        match self {
            TokenPurpose::EmailVerification => Duration::hours(24),
            TokenPurpose::PasswordReset => Duration::hours(1),
        }
    }
}

/// Single-use token mailed to a user. Only its hash is persisted.
#[derive(Debug, Clone, FromRow)]
pub struct VerificationToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub purpose: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VerificationToken {
    pub fn new(user_id: Uuid, token: &str, purpose: TokenPurpose) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            token_hash: Self::hash_token(token),
            purpose: purpose.as_str().to_string(),
            expires_at: now + purpose.lifetime(),
            used_at: None,
            created_at: now,
        }
    }

    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetimes() {
        let reset = VerificationToken::new(Uuid::new_v4(), "tok", TokenPurpose::PasswordReset);
        assert_eq!((reset.expires_at - reset.created_at).num_hours(), 1);

        let verify =
            VerificationToken::new(Uuid::new_v4(), "tok", TokenPurpose::EmailVerification);
        assert_eq!((verify.expires_at - verify.created_at).num_hours(), 24);
        assert!(!verify.is_expired());
    }
}
