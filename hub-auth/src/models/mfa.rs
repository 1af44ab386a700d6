//! MFA factor models - backup codes, SMS codes and WebAuthn credentials.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Number of backup codes issued per enrollment.
pub const BACKUP_CODE_COUNT: usize = 10;

/// Lifetime of an SMS verification code.
pub const SMS_CODE_TTL_MINUTES: i64 = 5;

/// Hash a one-time code after normalizing separators and case.
pub fn hash_code(code: &str) -> String {
    let normalized: String = code
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(|c| c.to_lowercase())
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Single-use MFA fallback code.
#[derive(Debug, Clone, FromRow)]
pub struct BackupCode {
    pub id: Uuid,
    pub user_id: Uuid,
    pub code_hash: String,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BackupCode {
    pub fn new(user_id: Uuid, code: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            code_hash: hash_code(code),
            used: false,
            used_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Six digit code delivered by SMS.
#[derive(Debug, Clone, FromRow)]
pub struct SmsVerificationCode {
    pub id: Uuid,
    pub user_id: Uuid,
    pub phone_number: String,
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

impl SmsVerificationCode {
    pub fn new(user_id: Uuid, phone_number: &str, code: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            phone_number: phone_number.to_string(),
            code_hash: hash_code(code),
            expires_at: now + Duration::minutes(SMS_CODE_TTL_MINUTES),
            used: false,
            created_at: now,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.used && self.expires_at > Utc::now()
    }
}

/// Registered WebAuthn authenticator.
#[derive(Debug, Clone, FromRow)]
pub struct WebAuthnCredential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub credential_id: Vec<u8>,
    pub public_key: Vec<u8>,
    pub sign_count: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_code_normalizes_input() {
        assert_eq!(hash_code("ABCD-EFGH"), hash_code("abcdefgh"));
        assert_eq!(hash_code(" abcd efgh "), hash_code("abcdefgh"));
        assert_ne!(hash_code("abcdefgh"), hash_code("abcdefgi"));
    }

    #[test]
    fn test_sms_code_expiry() {
        let mut code = SmsVerificationCode::new(Uuid::new_v4(), "+15550100", "123456");
        assert!(code.is_valid());

        code.expires_at = Utc::now() - Duration::seconds(1);
        assert!(!code.is_valid());
    }
}
