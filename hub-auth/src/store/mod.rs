//! Persistence capabilities consumed by the auth core.
//!
//! Every write that has to be atomic (refresh rotation, state consumption, one-time code
//! consumption) is a single conditional operation on the store; callers never
//! read-then-write. [`PgStore`] is the production backend, [`MemoryStore`] serves tests and
//! non-production environments, and [`RedisBlacklist`] can replace the blacklist table.

mod memory;
mod postgres;
mod redis;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use redis::RedisBlacklist;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AccountLockout, BackupCode, BlacklistEntry, FailureWindow, LoginAttempt, OAuthAccount,
    OAuthState, SecurityEvent, Session, SmsVerificationCode, User, VerificationToken,
    WebAuthnCredential,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the username or email is taken.
    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;
    /// Case-insensitive match.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
    async fn update_password_hash(&self, user_id: Uuid, hash: &str) -> Result<(), StoreError>;
    async fn mark_email_verified(&self, user_id: Uuid) -> Result<(), StoreError>;
    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn enable_mfa(&self, user_id: Uuid, totp_secret: &str) -> Result<(), StoreError>;
    async fn disable_mfa(&self, user_id: Uuid) -> Result<(), StoreError>;
    async fn set_admin(&self, user_id: Uuid, is_admin: bool) -> Result<(), StoreError>;
    async fn set_active(&self, user_id: Uuid, is_active: bool) -> Result<(), StoreError>;
    async fn update_display_name(
        &self,
        user_id: Uuid,
        display_name: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;
    /// Deactivate the user's live sessions beyond the `keep` most recently used. Expired
    /// sessions do not count toward the cap.
    async fn enforce_session_cap(
        &self,
        user_id: Uuid,
        keep: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
    async fn find_active_session(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError>;
    async fn touch_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;
    /// Swap the secret only if `old_hash` still identifies an active, unexpired session.
    async fn rotate_session_secret(
        &self,
        old_hash: &str,
        new_hash: &str,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError>;
    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, StoreError>;
    async fn revoke_session_by_hash(&self, token_hash: &str) -> Result<Option<Session>, StoreError>;
    async fn revoke_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError>;
    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError>;
    async fn distinct_session_ips(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;
    /// Optimistic update: applies only when the stored flags still equal `expected`.
    async fn update_security_flags(
        &self,
        session_id: Uuid,
        expected: i32,
        flags: i32,
    ) -> Result<bool, StoreError>;
    /// Delete sessions inactive or expired before `cutoff`.
    async fn delete_stale_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait BlacklistStore: Send + Sync {
    async fn insert_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<(), StoreError>;
    async fn is_hash_blacklisted(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Creation time of the newest unexpired user-scoped marker.
    async fn latest_user_marker(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
    async fn delete_expired_blacklist(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait MfaStore: Send + Sync {
    /// Replace all of the user's backup codes with `codes`.
    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        codes: &[BackupCode],
    ) -> Result<(), StoreError>;
    /// Mark a matching unused code as used; true only for the single winning caller.
    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn count_unused_backup_codes(&self, user_id: Uuid) -> Result<i64, StoreError>;
    async fn insert_sms_code(&self, code: &SmsVerificationCode) -> Result<(), StoreError>;
    async fn consume_sms_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn list_webauthn_credentials(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<WebAuthnCredential>, StoreError>;
    /// Users with MFA enabled and no unused backup code left.
    async fn mfa_users_without_backup_codes(&self) -> Result<Vec<Uuid>, StoreError>;
    async fn delete_expired_sms_codes(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait FederationStore: Send + Sync {
    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<(), StoreError>;
    /// Flip `used` on an unexpired, unused state for `provider`; `None` for everyone else.
    async fn consume_oauth_state(
        &self,
        state: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OAuthState>, StoreError>;
    async fn find_oauth_account(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<OAuthAccount>, StoreError>;
    /// Insert or refresh the (user, provider) link.
    async fn upsert_oauth_account(&self, account: &OAuthAccount) -> Result<(), StoreError>;
    async fn delete_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError>;
    async fn insert_security_event(&self, event: &SecurityEvent) -> Result<(), StoreError>;
    async fn insert_lockout(&self, lockout: &AccountLockout) -> Result<(), StoreError>;
    async fn failures_by_email(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<FailureWindow, StoreError>;
    async fn failures_by_ip(
        &self,
        ip_address: &str,
        since: DateTime<Utc>,
    ) -> Result<FailureWindow, StoreError>;
    async fn recent_security_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, StoreError>;
    async fn delete_login_attempts_before(&self, cutoff: DateTime<Utc>)
        -> Result<u64, StoreError>;
    async fn delete_security_events_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_verification_token(&self, token: &VerificationToken)
        -> Result<(), StoreError>;
    /// Mark an unused, unexpired token as used and return its owner.
    async fn consume_verification_token(
        &self,
        token_hash: &str,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError>;
    async fn delete_expired_verification_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// A backend implementing every capability.
pub trait AuthStore:
    UserStore + SessionStore + BlacklistStore + MfaStore + FederationStore + TelemetryStore + TokenStore
{
}

impl<T> AuthStore for T where
    T: UserStore
        + SessionStore
        + BlacklistStore
        + MfaStore
        + FederationStore
        + TelemetryStore
        + TokenStore
{
}

/// Handles to each capability, usually all backed by the same store.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub blacklist: Arc<dyn BlacklistStore>,
    pub mfa: Arc<dyn MfaStore>,
    pub federation: Arc<dyn FederationStore>,
    pub telemetry: Arc<dyn TelemetryStore>,
    pub tokens: Arc<dyn TokenStore>,
}

impl Stores {
    pub fn from_backend<S: AuthStore + 'static>(backend: Arc<S>) -> Self {
        Self {
            users: backend.clone(),
            sessions: backend.clone(),
            blacklist: backend.clone(),
            mfa: backend.clone(),
            federation: backend.clone(),
            telemetry: backend.clone(),
            tokens: backend,
        }
    }

    /// Use a separate backend for the token blacklist.
    pub fn with_blacklist(mut self, blacklist: Arc<dyn BlacklistStore>) -> Self {
        self.blacklist = blacklist;
        self
    }
}
