//! PostgreSQL store backed by sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use super::{
    BlacklistStore, FederationStore, MfaStore, SessionStore, StoreError, TelemetryStore,
    TokenStore, UserStore,
};
use crate::models::{
    AccountLockout, BackupCode, BlacklistEntry, FailureWindow, LoginAttempt, OAuthAccount,
    OAuthState, SecurityEvent, Session, SmsVerificationCode, User, VerificationToken,
    WebAuthnCredential,
};

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Translate unique violations into [`StoreError::Conflict`].
fn insert_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = e {
        if db.is_unique_violation() {
            return StoreError::Conflict(db.constraint().unwrap_or("unique").to_string());
        }
    }
    StoreError::Database(e)
}

fn failure_window(row: &sqlx::postgres::PgRow) -> Result<FailureWindow, StoreError> {
    Ok(FailureWindow {
        count: row.try_get("count")?,
        oldest: row.try_get("oldest")?,
        latest: row.try_get("latest")?,
    })
}

// ==================== User Operations ====================

#[async_trait]
impl UserStore for PgStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, display_name, password_hash, email_verified,
                               is_active, is_admin, roles, mfa_enabled, totp_secret, last_login_at,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.password_hash)
        .bind(user.email_verified)
        .bind(user.is_active)
        .bind(user.is_admin)
        .bind(&user.roles)
        .bind(user.mfa_enabled)
        .bind(&user.totp_secret)
        .bind(user.last_login_at)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(insert_error)?;
        Ok(())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_password_hash(&self, user_id: Uuid, hash: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_email_verified(&self, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET email_verified = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_login_at = $2 WHERE id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enable_mfa(&self, user_id: Uuid, totp_secret: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE users SET mfa_enabled = TRUE, totp_secret = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(totp_secret)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn disable_mfa(&self, user_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE users SET mfa_enabled = FALSE, totp_secret = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM backup_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_admin(&self, user_id: Uuid, is_admin: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET is_admin = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(is_admin)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_active(&self, user_id: Uuid, is_active: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET is_active = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(is_active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_display_name(
        &self,
        user_id: Uuid,
        display_name: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET display_name = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(display_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ==================== Session Operations ====================

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, refresh_token_hash, expires_at, remember_me,
                                  created_at, last_used_at, ip_address, user_agent, device_name,
                                  location, is_active, security_flags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.refresh_token_hash)
        .bind(session.expires_at)
        .bind(session.remember_me)
        .bind(session.created_at)
        .bind(session.last_used_at)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(&session.device_name)
        .bind(&session.location)
        .bind(session.is_active)
        .bind(session.security_flags)
        .execute(&self.pool)
        .await
        .map_err(insert_error)?;
        Ok(())
    }

    async fn enforce_session_cap(
        &self,
        user_id: Uuid,
        keep: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET is_active = FALSE
            WHERE id IN (
                SELECT id FROM sessions
                WHERE user_id = $1 AND is_active = TRUE AND expires_at > $3
                ORDER BY last_used_at DESC, created_at DESC
                OFFSET $2
            )
            "#,
        )
        .bind(user_id)
        .bind(keep)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_active_session(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        Ok(sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE refresh_token_hash = $1 AND is_active = TRUE AND expires_at > $2
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn touch_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET last_used_at = $2 WHERE id = $1")
            .bind(session_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rotate_session_secret(
        &self,
        old_hash: &str,
        new_hash: &str,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        Ok(sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET refresh_token_hash = $2, expires_at = $3, last_used_at = $4
            WHERE refresh_token_hash = $1 AND is_active = TRUE AND expires_at > $4
            RETURNING *
            "#,
        )
        .bind(old_hash)
        .bind(new_hash)
        .bind(new_expiry)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE sessions SET is_active = FALSE WHERE id = $1 AND is_active = TRUE")
                .bind(session_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_session_by_hash(&self, token_hash: &str) -> Result<Option<Session>, StoreError> {
        Ok(sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions SET is_active = FALSE
            WHERE refresh_token_hash = $1 AND is_active = TRUE
            RETURNING *
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn revoke_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET is_active = FALSE WHERE user_id = $1 AND is_active = TRUE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        Ok(sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE user_id = $1 AND is_active = TRUE AND expires_at > $2
            ORDER BY last_used_at DESC
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn distinct_session_ips(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ip_address FROM sessions
            WHERE user_id = $1 AND last_used_at >= $2 AND ip_address <> ''
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("ip_address").map_err(StoreError::from))
            .collect()
    }

    async fn update_security_flags(
        &self,
        session_id: Uuid,
        expected: i32,
        flags: i32,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET security_flags = $3 WHERE id = $1 AND security_flags = $2",
        )
        .bind(session_id)
        .bind(expected)
        .bind(flags)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_stale_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sessions
            WHERE expires_at < $1 OR (is_active = FALSE AND last_used_at < $1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ==================== Blacklist Operations ====================

#[async_trait]
impl BlacklistStore for PgStore {
    async fn insert_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO token_blacklist (id, token_hash, user_id, scope, expires_at, reason,
                                         blacklisted_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (token_hash) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(&entry.token_hash)
        .bind(entry.user_id)
        .bind(&entry.scope)
        .bind(entry.expires_at)
        .bind(&entry.reason)
        .bind(entry.blacklisted_by)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_hash_blacklisted(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM token_blacklist WHERE token_hash = $1 AND expires_at > $2) AS hit",
        )
        .bind(token_hash)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("hit")?)
    }

    async fn latest_user_marker(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(created_at) AS marked_at FROM token_blacklist
            WHERE user_id = $1 AND scope = 'user' AND expires_at > $2
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("marked_at")?)
    }

    async fn delete_expired_blacklist(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM token_blacklist WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ==================== MFA Operations ====================

#[async_trait]
impl MfaStore for PgStore {
    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        codes: &[BackupCode],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM backup_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for code in codes {
            sqlx::query(
                r#"
                INSERT INTO backup_codes (id, user_id, code_hash, used, used_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(code.id)
            .bind(code.user_id)
            .bind(&code.code_hash)
            .bind(code.used)
            .bind(code.used_at)
            .bind(code.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE backup_codes SET used = TRUE, used_at = $3
            WHERE id = (
                SELECT id FROM backup_codes
                WHERE user_id = $1 AND code_hash = $2 AND used = FALSE
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_unused_backup_codes(&self, user_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS remaining FROM backup_codes WHERE user_id = $1 AND used = FALSE",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("remaining")?)
    }

    async fn insert_sms_code(&self, code: &SmsVerificationCode) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sms_codes (id, user_id, phone_number, code_hash, expires_at, used, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(code.id)
        .bind(code.user_id)
        .bind(&code.phone_number)
        .bind(&code.code_hash)
        .bind(code.expires_at)
        .bind(code.used)
        .bind(code.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_sms_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sms_codes SET used = TRUE
            WHERE id = (
                SELECT id FROM sms_codes
                WHERE user_id = $1 AND code_hash = $2 AND used = FALSE AND expires_at > $3
                ORDER BY created_at DESC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_webauthn_credentials(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<WebAuthnCredential>, StoreError> {
        Ok(sqlx::query_as::<_, WebAuthnCredential>(
            "SELECT * FROM webauthn_credentials WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn mfa_users_without_backup_codes(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT u.id FROM users u
            WHERE u.mfa_enabled = TRUE
              AND NOT EXISTS (
                  SELECT 1 FROM backup_codes b WHERE b.user_id = u.id AND b.used = FALSE
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("id").map_err(StoreError::from))
            .collect()
    }

    async fn delete_expired_sms_codes(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sms_codes WHERE expires_at <= $1 OR used = TRUE")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ==================== Federation Operations ====================

#[async_trait]
impl FederationStore for PgStore {
    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_states (state, provider, redirect_uri, expires_at, used, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&state.state)
        .bind(&state.provider)
        .bind(&state.redirect_uri)
        .bind(state.expires_at)
        .bind(state.used)
        .bind(state.created_at)
        .execute(&self.pool)
        .await
        .map_err(insert_error)?;
        Ok(())
    }

    async fn consume_oauth_state(
        &self,
        state: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OAuthState>, StoreError> {
        Ok(sqlx::query_as::<_, OAuthState>(
            r#"
            UPDATE oauth_states SET used = TRUE
            WHERE state = $1 AND provider = $2 AND used = FALSE AND expires_at > $3
            RETURNING *
            "#,
        )
        .bind(state)
        .bind(provider)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_oauth_account(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<OAuthAccount>, StoreError> {
        Ok(sqlx::query_as::<_, OAuthAccount>(
            "SELECT * FROM oauth_accounts WHERE provider = $1 AND provider_user_id = $2",
        )
        .bind(provider)
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn upsert_oauth_account(&self, account: &OAuthAccount) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_accounts (id, user_id, provider, provider_user_id, email, username,
                                        access_token, refresh_token, token_expires_at,
                                        created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id, provider) DO UPDATE SET
                provider_user_id = EXCLUDED.provider_user_id,
                email = EXCLUDED.email,
                username = EXCLUDED.username,
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                token_expires_at = EXCLUDED.token_expires_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(account.id)
        .bind(account.user_id)
        .bind(&account.provider)
        .bind(&account.provider_user_id)
        .bind(&account.email)
        .bind(&account.username)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.token_expires_at)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(insert_error)?;
        Ok(())
    }

    async fn delete_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at <= $1 OR used = TRUE")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ==================== Telemetry Operations ====================

#[async_trait]
impl TelemetryStore for PgStore {
    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO login_attempts (id, user_id, email, ip_address, user_agent, success,
                                        failure_reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.user_id)
        .bind(&attempt.email)
        .bind(&attempt.ip_address)
        .bind(&attempt.user_agent)
        .bind(attempt.success)
        .bind(&attempt.failure_reason)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_security_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO security_events (id, user_id, event_type, severity, ip_address,
                                         user_agent, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(&event.severity)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.details)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_lockout(&self, lockout: &AccountLockout) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO account_lockouts (id, email, locked_at, locked_until, failure_count)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(lockout.id)
        .bind(&lockout.email)
        .bind(lockout.locked_at)
        .bind(lockout.locked_until)
        .bind(lockout.failure_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failures_by_email(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<FailureWindow, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count, MIN(created_at) AS oldest, MAX(created_at) AS latest
            FROM login_attempts
            WHERE email = LOWER($1) AND success = FALSE AND created_at >= $2
            "#,
        )
        .bind(email)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        failure_window(&row)
    }

    async fn failures_by_ip(
        &self,
        ip_address: &str,
        since: DateTime<Utc>,
    ) -> Result<FailureWindow, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count, MIN(created_at) AS oldest, MAX(created_at) AS latest
            FROM login_attempts
            WHERE ip_address = $1 AND success = FALSE AND created_at >= $2
            "#,
        )
        .bind(ip_address)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        failure_window(&row)
    }

    async fn recent_security_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        Ok(sqlx::query_as::<_, SecurityEvent>(
            r#"
            SELECT * FROM security_events
            WHERE ($1::uuid IS NULL OR user_id = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn delete_login_attempts_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM login_attempts WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_security_events_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM security_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ==================== Verification Token Operations ====================

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_verification_token(
        &self,
        token: &VerificationToken,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO verification_tokens (id, user_id, token_hash, purpose, expires_at,
                                             used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(&token.purpose)
        .bind(token.expires_at)
        .bind(token.used_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(insert_error)?;
        Ok(())
    }

    async fn consume_verification_token(
        &self,
        token_hash: &str,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE verification_tokens SET used_at = $3
            WHERE token_hash = $1 AND purpose = $2 AND used_at IS NULL AND expires_at > $3
            RETURNING user_id
            "#,
        )
        .bind(token_hash)
        .bind(purpose)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("user_id")?)),
            None => Ok(None),
        }
    }

    async fn delete_expired_verification_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM verification_tokens WHERE expires_at <= $1 OR used_at IS NOT NULL",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
