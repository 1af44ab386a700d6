//! Session ledger - persisted refresh sessions with rotation, revocation and a per-user cap.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::models::{SecurityFlags, Session, SessionInfo};
use crate::services::error::AuthError;
use crate::store::SessionStore;
use crate::utils::generate_random_token;

/// More distinct IPs than this in the trailing day is considered suspicious.
const SUSPICIOUS_IP_THRESHOLD: usize = 3;

/// A session together with the raw refresh secret handed to the client.
///
/// The secret exists only here; the ledger persists its hash.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub refresh_token: String,
}

#[derive(Clone)]
pub struct SessionLedger {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionLedger {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    fn lifetime(&self, remember_me: bool) -> Duration {
        if remember_me {
            Duration::days(self.config.remember_me_days)
        } else {
            Duration::days(self.config.lifetime_days)
        }
    }

    /// Persist a new session and evict the least recently used ones beyond the cap.
    #[tracing::instrument(skip(self, user_agent))]
    pub async fn create_session(
        &self,
        user_id: Uuid,
        ip_address: &str,
        user_agent: &str,
        remember_me: bool,
    ) -> Result<IssuedSession, AuthError> {
        let refresh_token = generate_random_token();
        let session = Session::new(
            user_id,
            &refresh_token,
            ip_address,
            user_agent,
            remember_me,
            self.lifetime(remember_me),
        );

        self.store.insert_session(&session).await?;

        let evicted = self
            .store
            .enforce_session_cap(user_id, self.config.max_sessions, Utc::now())
            .await?;
        if evicted > 0 {
            tracing::info!(user_id = %user_id, evicted, "Evicted sessions over the cap");
        }

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            device = %session.device_name,
            "Session created"
        );

        Ok(IssuedSession {
            session,
            refresh_token,
        })
    }

    /// Look up an active, unexpired session by its secret and mark it used.
    pub async fn validate_refresh_token(&self, secret: &str) -> Result<Session, AuthError> {
        let now = Utc::now();
        let mut session = self
            .store
            .find_active_session(&Session::hash_secret(secret), now)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        self.store.touch_session(session.id, now).await?;
        session.last_used_at = now;
        Ok(session)
    }

    /// Like [`validate_refresh_token`](Self::validate_refresh_token), but a session idle
    /// for longer than the configured timeout is revoked and rejected.
    pub async fn validate_with_idle_check(&self, secret: &str) -> Result<Session, AuthError> {
        let now = Utc::now();
        let session = self
            .store
            .find_active_session(&Session::hash_secret(secret), now)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if now - session.last_used_at > Duration::minutes(self.config.idle_timeout_minutes) {
            self.store.revoke_session(session.id).await?;
            tracing::info!(
                user_id = %session.user_id,
                session_id = %session.id,
                "Session revoked after idle timeout"
            );
            return Err(AuthError::InvalidToken);
        }

        self.store.touch_session(session.id, now).await?;
        Ok(Session {
            last_used_at: now,
            ..session
        })
    }

    /// Replace the refresh secret and extend expiry.
    ///
    /// The swap is conditional on the old secret hash, so of several concurrent callers
    /// presenting the same secret exactly one wins; the rest see
    /// [`AuthError::InvalidToken`].
    #[tracing::instrument(skip_all)]
    pub async fn refresh_session(&self, secret: &str) -> Result<IssuedSession, AuthError> {
        let now = Utc::now();
        let old_hash = Session::hash_secret(secret);

        let current = self
            .store
            .find_active_session(&old_hash, now)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        let refresh_token = generate_random_token();
        let new_expiry = now + self.lifetime(current.remember_me);

        let session = self
            .store
            .rotate_session_secret(&old_hash, &Session::hash_secret(&refresh_token), new_expiry, now)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        tracing::debug!(user_id = %session.user_id, session_id = %session.id, "Session rotated");

        Ok(IssuedSession {
            session,
            refresh_token,
        })
    }

    pub async fn revoke_session(&self, session_id: Uuid) -> Result<bool, AuthError> {
        Ok(self.store.revoke_session(session_id).await?)
    }

    /// Revoke the session identified by a refresh secret, returning it if it was active.
    pub async fn revoke_by_token(&self, secret: &str) -> Result<Option<Session>, AuthError> {
        Ok(self
            .store
            .revoke_session_by_hash(&Session::hash_secret(secret))
            .await?)
    }

    /// Logout everywhere. Rows are kept for audit.
    pub async fn revoke_user_sessions(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let revoked = self.store.revoke_user_sessions(user_id).await?;
        tracing::info!(user_id = %user_id, revoked, "Revoked all user sessions");
        Ok(revoked)
    }

    /// True when the user's sessions used in the last 24 hours, plus `ip_address`, span more
    /// than three distinct IPs. Informational only.
    pub async fn detect_suspicious_activity(
        &self,
        user_id: Uuid,
        ip_address: &str,
    ) -> Result<bool, AuthError> {
        let since = Utc::now() - Duration::hours(24);
        let mut ips = self.store.distinct_session_ips(user_id, since).await?;
        if !ip_address.is_empty() && !ips.iter().any(|ip| ip == ip_address) {
            ips.push(ip_address.to_string());
        }
        Ok(ips.len() > SUSPICIOUS_IP_THRESHOLD)
    }

    /// Add `flags` to a session's security flags.
    ///
    /// Returns false when another writer changed the flags since `session` was read.
    pub async fn mark_session_flags(
        &self,
        session: &Session,
        flags: SecurityFlags,
    ) -> Result<bool, AuthError> {
        let updated = session.flags().union(flags);
        Ok(self
            .store
            .update_security_flags(session.id, session.security_flags, updated.bits())
            .await?)
    }

    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<SessionInfo>, AuthError> {
        let sessions = self.store.list_active_sessions(user_id, Utc::now()).await?;
        Ok(sessions.into_iter().map(SessionInfo::from).collect())
    }

    /// Delete sessions that expired, or were deactivated, longer ago than the grace period.
    /// Idempotent and never touches a session that could still validate.
    pub async fn cleanup_expired_sessions(&self) -> Result<u64, AuthError> {
        let cutoff = Utc::now() - Duration::hours(self.config.cleanup_grace_hours);
        Ok(self.store.delete_stale_sessions(cutoff).await?)
    }
}
