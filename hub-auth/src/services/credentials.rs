//! Password hashing and strength policy.

use crate::services::error::AuthError;
use crate::utils::{self, Password, PasswordHashString};

pub const MIN_PASSWORD_LENGTH: usize = 12;

/// Argon2id hash with the default cost parameters that no password matches. Verified in
/// place of a missing account's hash.
pub const DUMMY_PASSWORD_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$aHViLWR1bW15LXNhbHQtMQ$9Q1q/xgjCMyM7rjRyadKcamxsH6xEzwnIdQlcaj7rys";

/// Return the rules `password` violates; an empty list means it is acceptable.
pub fn validate_strength(password: &str) -> Vec<String> {
    let mut violations = Vec::new();

    if password.chars().count() < MIN_PASSWORD_LENGTH {
        violations.push(format!(
            "must be at least {} characters",
            MIN_PASSWORD_LENGTH
        ));
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        violations.push("must contain an uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        violations.push("must contain a lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push("must contain a digit".to_string());
    }
    if !password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
    {
        violations.push("must contain a symbol".to_string());
    }

    violations
}

/// Argon2id hashing run on the blocking pool.
#[derive(Clone, Default)]
pub struct CredentialStore;

impl CredentialStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn hash_password(&self, plain: &str) -> Result<String, AuthError> {
        let password = Password::new(plain);
        let hash = tokio::task::spawn_blocking(move || utils::hash_password(&password))
            .await
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Hashing task failed: {}", e)))??;
        Ok(hash.into_string())
    }

    /// Constant-time verification; malformed or empty hashes verify as false.
    pub async fn verify(&self, hash: &str, plain: &str) -> Result<bool, AuthError> {
        let password = Password::new(plain);
        let hash = PasswordHashString::new(hash.to_string());
        let verified = tokio::task::spawn_blocking(move || {
            utils::verify_password(&password, &hash).is_ok()
        })
        .await
        .map_err(|e| AuthError::Internal(anyhow::anyhow!("Verification task failed: {}", e)))?;
        Ok(verified)
    }

    /// Spend one full verification when there is no account to verify against.
    pub async fn verify_dummy(&self, plain: &str) -> Result<(), AuthError> {
        self.verify(DUMMY_PASSWORD_HASH, plain).await.map(|_| ())
    }

    /// Validate strength, then hash.
    pub async fn hash_new_password(&self, plain: &str) -> Result<String, AuthError> {
        let violations = validate_strength(plain);
        if !violations.is_empty() {
            return Err(AuthError::WeakPassword(violations));
        }
        self.hash_password(plain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strong_password_passes() {
        assert!(validate_strength("Secret123!@#").is_empty());
    }

    #[test]
    fn test_each_rule_reported() {
        let violations = validate_strength("short");
        assert_eq!(violations.len(), 4);

        assert_eq!(validate_strength("alllowercase1!").len(), 1);
        assert_eq!(validate_strength("NoDigitsHere!!").len(), 1);
        assert_eq!(validate_strength("NoSymbols12345").len(), 1);
    }

    #[tokio::test]
    async fn test_hash_and_verify_off_thread() {
        let store = CredentialStore::new();
        let hash = store.hash_password("Secret123!@#").await.unwrap();

        assert!(store.verify(&hash, "Secret123!@#").await.unwrap());
        assert!(!store.verify(&hash, "Secret123!@$").await.unwrap());
        assert!(!store.verify("", "Secret123!@#").await.unwrap());
        assert!(!store.verify("not-a-phc-string", "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_dummy_hash_runs_full_argon2_and_never_matches() {
        let parsed = argon2::password_hash::PasswordHash::new(DUMMY_PASSWORD_HASH).unwrap();
        let params = argon2::Params::try_from(&parsed).unwrap();
        assert_eq!(params.m_cost(), argon2::Params::DEFAULT_M_COST);
        assert_eq!(params.t_cost(), argon2::Params::DEFAULT_T_COST);
        assert_eq!(params.p_cost(), argon2::Params::DEFAULT_P_COST);

        let store = CredentialStore::new();
        assert!(!store.verify(DUMMY_PASSWORD_HASH, "Secret123!@#").await.unwrap());
        assert!(!store.verify(DUMMY_PASSWORD_HASH, "").await.unwrap());
        store.verify_dummy("Secret123!@#").await.unwrap();
    }

    #[tokio::test]
    async fn test_weak_password_rejected_before_hashing() {
        let store = CredentialStore::new();
        assert!(matches!(
            store.hash_new_password("password").await,
            Err(AuthError::WeakPassword(_))
        ));
    }
}
