//! In-process store used by tests and single-node development setups.
//!
//! A single mutex guards all tables, so every conditional update below is atomic with
//! respect to other callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    BlacklistStore, FederationStore, MfaStore, SessionStore, StoreError, TelemetryStore,
    TokenStore, UserStore,
};
use crate::models::{
    AccountLockout, BackupCode, BlacklistEntry, BlacklistScope, FailureWindow, LoginAttempt,
    OAuthAccount, OAuthState, SecurityEvent, Session, SmsVerificationCode, User,
    VerificationToken, WebAuthnCredential,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    sessions: HashMap<Uuid, Session>,
    blacklist: HashMap<String, BlacklistEntry>,
    oauth_states: HashMap<String, OAuthState>,
    oauth_accounts: Vec<OAuthAccount>,
    backup_codes: Vec<BackupCode>,
    sms_codes: Vec<SmsVerificationCode>,
    webauthn: Vec<WebAuthnCredential>,
    verification_tokens: Vec<VerificationToken>,
    login_attempts: Vec<LoginAttempt>,
    security_events: Vec<SecurityEvent>,
    lockouts: Vec<AccountLockout>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    pub fn add_webauthn_credential(&self, credential: WebAuthnCredential) -> Result<(), StoreError> {
        self.tables()?.webauthn.push(credential);
        Ok(())
    }

    /// Lockout audit rows written so far.
    pub fn lockouts(&self) -> Result<Vec<AccountLockout>, StoreError> {
        Ok(self.tables()?.lockouts.clone())
    }

    pub fn login_attempt_count(&self) -> Result<usize, StoreError> {
        Ok(self.tables()?.login_attempts.len())
    }
}

fn window<'a>(attempts: impl Iterator<Item = &'a LoginAttempt>) -> FailureWindow {
    attempts.fold(FailureWindow::default(), |mut w, a| {
        w.count += 1;
        w.oldest = Some(w.oldest.map_or(a.created_at, |o| o.min(a.created_at)));
        w.latest = Some(w.latest.map_or(a.created_at, |l| l.max(a.created_at)));
        w
    })
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if t.users.values().any(|u| u.username == user.username) {
            return Err(StoreError::Conflict("idx_users_username".to_string()));
        }
        if t
            .users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::Conflict("idx_users_email_lower".to_string()));
        }
        t.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.tables()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .tables()?
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .tables()?
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn update_password_hash(&self, user_id: Uuid, hash: &str) -> Result<(), StoreError> {
        if let Some(u) = self.tables()?.users.get_mut(&user_id) {
            u.password_hash = hash.to_string();
            u.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_email_verified(&self, user_id: Uuid) -> Result<(), StoreError> {
        if let Some(u) = self.tables()?.users.get_mut(&user_id) {
            u.email_verified = true;
            u.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(u) = self.tables()?.users.get_mut(&user_id) {
            u.last_login_at = Some(at);
        }
        Ok(())
    }

    async fn enable_mfa(&self, user_id: Uuid, totp_secret: &str) -> Result<(), StoreError> {
        if let Some(u) = self.tables()?.users.get_mut(&user_id) {
            u.mfa_enabled = true;
            u.totp_secret = Some(totp_secret.to_string());
            u.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn disable_mfa(&self, user_id: Uuid) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if let Some(u) = t.users.get_mut(&user_id) {
            u.mfa_enabled = false;
            u.totp_secret = None;
            u.updated_at = Utc::now();
        }
        t.backup_codes.retain(|c| c.user_id != user_id);
        Ok(())
    }

    async fn set_admin(&self, user_id: Uuid, is_admin: bool) -> Result<(), StoreError> {
        if let Some(u) = self.tables()?.users.get_mut(&user_id) {
            u.is_admin = is_admin;
            u.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_active(&self, user_id: Uuid, is_active: bool) -> Result<(), StoreError> {
        if let Some(u) = self.tables()?.users.get_mut(&user_id) {
            u.is_active = is_active;
            u.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_display_name(
        &self,
        user_id: Uuid,
        display_name: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(u) = self.tables()?.users.get_mut(&user_id) {
            u.display_name = display_name.map(|d| d.to_string());
            u.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if t
            .sessions
            .values()
            .any(|s| s.refresh_token_hash == session.refresh_token_hash)
        {
            return Err(StoreError::Conflict("idx_sessions_token_hash".to_string()));
        }
        t.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn enforce_session_cap(
        &self,
        user_id: Uuid,
        keep: i64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut t = self.tables()?;
        let mut active: Vec<(DateTime<Utc>, DateTime<Utc>, Uuid)> = t
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active && s.expires_at > now)
            .map(|s| (s.last_used_at, s.created_at, s.id))
            .collect();
        active.sort_by(|a, b| b.cmp(a));

        let keep = usize::try_from(keep.max(0)).unwrap_or(usize::MAX);
        let mut revoked = 0;
        for (_, _, id) in active.into_iter().skip(keep) {
            if let Some(s) = t.sessions.get_mut(&id) {
                s.is_active = false;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn find_active_session(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .tables()?
            .sessions
            .values()
            .find(|s| s.refresh_token_hash == token_hash && s.is_active && s.expires_at > now)
            .cloned())
    }

    async fn touch_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(s) = self.tables()?.sessions.get_mut(&session_id) {
            s.last_used_at = now;
        }
        Ok(())
    }

    async fn rotate_session_secret(
        &self,
        old_hash: &str,
        new_hash: &str,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let mut t = self.tables()?;
        let Some(session) = t
            .sessions
            .values_mut()
            .find(|s| s.refresh_token_hash == old_hash && s.is_active && s.expires_at > now)
        else {
            return Ok(None);
        };
        session.refresh_token_hash = new_hash.to_string();
        session.expires_at = new_expiry;
        session.last_used_at = now;
        Ok(Some(session.clone()))
    }

    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        match self.tables()?.sessions.get_mut(&session_id) {
            Some(s) if s.is_active => {
                s.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_session_by_hash(&self, token_hash: &str) -> Result<Option<Session>, StoreError> {
        let mut t = self.tables()?;
        let Some(session) = t
            .sessions
            .values_mut()
            .find(|s| s.refresh_token_hash == token_hash && s.is_active)
        else {
            return Ok(None);
        };
        session.is_active = false;
        Ok(Some(session.clone()))
    }

    async fn revoke_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut t = self.tables()?;
        let mut revoked = 0;
        for s in t
            .sessions
            .values_mut()
            .filter(|s| s.user_id == user_id && s.is_active)
        {
            s.is_active = false;
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self
            .tables()?
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active && s.expires_at > now)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(sessions)
    }

    async fn distinct_session_ips(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let ips: HashSet<String> = self
            .tables()?
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.last_used_at >= since && !s.ip_address.is_empty())
            .map(|s| s.ip_address.clone())
            .collect();
        Ok(ips.into_iter().collect())
    }

    async fn update_security_flags(
        &self,
        session_id: Uuid,
        expected: i32,
        flags: i32,
    ) -> Result<bool, StoreError> {
        match self.tables()?.sessions.get_mut(&session_id) {
            Some(s) if s.security_flags == expected => {
                s.security_flags = flags;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_stale_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut t = self.tables()?;
        let before = t.sessions.len();
        t.sessions
            .retain(|_, s| !(s.expires_at < cutoff || (!s.is_active && s.last_used_at < cutoff)));
        Ok((before - t.sessions.len()) as u64)
    }
}

#[async_trait]
impl BlacklistStore for MemoryStore {
    async fn insert_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<(), StoreError> {
        self.tables()?
            .blacklist
            .entry(entry.token_hash.clone())
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn is_hash_blacklisted(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .tables()?
            .blacklist
            .get(token_hash)
            .is_some_and(|e| e.expires_at > now))
    }

    async fn latest_user_marker(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .tables()?
            .blacklist
            .values()
            .filter(|e| {
                e.user_id == Some(user_id)
                    && e.scope == BlacklistScope::User.as_str()
                    && e.expires_at > now
            })
            .map(|e| e.created_at)
            .max())
    }

    async fn delete_expired_blacklist(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut t = self.tables()?;
        let before = t.blacklist.len();
        t.blacklist.retain(|_, e| e.expires_at > now);
        Ok((before - t.blacklist.len()) as u64)
    }
}

#[async_trait]
impl MfaStore for MemoryStore {
    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        codes: &[BackupCode],
    ) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        t.backup_codes.retain(|c| c.user_id != user_id);
        t.backup_codes.extend_from_slice(codes);
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut t = self.tables()?;
        match t
            .backup_codes
            .iter_mut()
            .find(|c| c.user_id == user_id && c.code_hash == code_hash && !c.used)
        {
            Some(code) => {
                code.used = true;
                code.used_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_unused_backup_codes(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .tables()?
            .backup_codes
            .iter()
            .filter(|c| c.user_id == user_id && !c.used)
            .count() as i64)
    }

    async fn insert_sms_code(&self, code: &SmsVerificationCode) -> Result<(), StoreError> {
        self.tables()?.sms_codes.push(code.clone());
        Ok(())
    }

    async fn consume_sms_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut t = self.tables()?;
        match t.sms_codes.iter_mut().rev().find(|c| {
            c.user_id == user_id && c.code_hash == code_hash && !c.used && c.expires_at > now
        }) {
            Some(code) => {
                code.used = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_webauthn_credentials(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<WebAuthnCredential>, StoreError> {
        Ok(self
            .tables()?
            .webauthn
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn mfa_users_without_backup_codes(&self) -> Result<Vec<Uuid>, StoreError> {
        let t = self.tables()?;
        Ok(t.users
            .values()
            .filter(|u| u.mfa_enabled)
            .filter(|u| !t.backup_codes.iter().any(|c| c.user_id == u.id && !c.used))
            .map(|u| u.id)
            .collect())
    }

    async fn delete_expired_sms_codes(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut t = self.tables()?;
        let before = t.sms_codes.len();
        t.sms_codes.retain(|c| c.expires_at > now && !c.used);
        Ok((before - t.sms_codes.len()) as u64)
    }
}

#[async_trait]
impl FederationStore for MemoryStore {
    async fn insert_oauth_state(&self, state: &OAuthState) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if t.oauth_states.contains_key(&state.state) {
            return Err(StoreError::Conflict("oauth_states_pkey".to_string()));
        }
        t.oauth_states.insert(state.state.clone(), state.clone());
        Ok(())
    }

    async fn consume_oauth_state(
        &self,
        state: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OAuthState>, StoreError> {
        let mut t = self.tables()?;
        match t.oauth_states.get_mut(state) {
            Some(s) if s.provider == provider && !s.used && s.expires_at > now => {
                s.used = true;
                Ok(Some(s.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn find_oauth_account(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<OAuthAccount>, StoreError> {
        Ok(self
            .tables()?
            .oauth_accounts
            .iter()
            .find(|a| a.provider == provider && a.provider_user_id == provider_user_id)
            .cloned())
    }

    async fn upsert_oauth_account(&self, account: &OAuthAccount) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if let Some(existing) = t
            .oauth_accounts
            .iter_mut()
            .find(|a| a.user_id == account.user_id && a.provider == account.provider)
        {
            existing.provider_user_id = account.provider_user_id.clone();
            existing.email = account.email.clone();
            existing.username = account.username.clone();
            existing.access_token = account.access_token.clone();
            existing.refresh_token = account.refresh_token.clone();
            existing.token_expires_at = account.token_expires_at;
            existing.updated_at = account.updated_at;
            return Ok(());
        }
        if t.oauth_accounts.iter().any(|a| {
            a.provider == account.provider && a.provider_user_id == account.provider_user_id
        }) {
            return Err(StoreError::Conflict(
                "oauth_accounts_provider_provider_user_id_key".to_string(),
            ));
        }
        t.oauth_accounts.push(account.clone());
        Ok(())
    }

    async fn delete_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut t = self.tables()?;
        let before = t.oauth_states.len();
        t.oauth_states.retain(|_, s| s.expires_at > now && !s.used);
        Ok((before - t.oauth_states.len()) as u64)
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        self.tables()?.login_attempts.push(attempt.clone());
        Ok(())
    }

    async fn insert_security_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.tables()?.security_events.push(event.clone());
        Ok(())
    }

    async fn insert_lockout(&self, lockout: &AccountLockout) -> Result<(), StoreError> {
        self.tables()?.lockouts.push(lockout.clone());
        Ok(())
    }

    async fn failures_by_email(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<FailureWindow, StoreError> {
        let email = email.to_lowercase();
        let t = self.tables()?;
        Ok(window(t.login_attempts.iter().filter(|a| {
            a.email == email && !a.success && a.created_at >= since
        })))
    }

    async fn failures_by_ip(
        &self,
        ip_address: &str,
        since: DateTime<Utc>,
    ) -> Result<FailureWindow, StoreError> {
        let t = self.tables()?;
        Ok(window(t.login_attempts.iter().filter(|a| {
            a.ip_address == ip_address && !a.success && a.created_at >= since
        })))
    }

    async fn recent_security_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let t = self.tables()?;
        let mut events: Vec<SecurityEvent> = t
            .security_events
            .iter()
            .filter(|e| user_id.is_none() || e.user_id == user_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit);
        Ok(events)
    }

    async fn delete_login_attempts_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut t = self.tables()?;
        let before = t.login_attempts.len();
        t.login_attempts.retain(|a| a.created_at >= cutoff);
        Ok((before - t.login_attempts.len()) as u64)
    }

    async fn delete_security_events_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut t = self.tables()?;
        let before = t.security_events.len();
        t.security_events.retain(|e| e.created_at >= cutoff);
        Ok((before - t.security_events.len()) as u64)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_verification_token(
        &self,
        token: &VerificationToken,
    ) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if t
            .verification_tokens
            .iter()
            .any(|v| v.token_hash == token.token_hash)
        {
            return Err(StoreError::Conflict(
                "verification_tokens_token_hash_key".to_string(),
            ));
        }
        t.verification_tokens.push(token.clone());
        Ok(())
    }

    async fn consume_verification_token(
        &self,
        token_hash: &str,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut t = self.tables()?;
        match t.verification_tokens.iter_mut().find(|v| {
            v.token_hash == token_hash
                && v.purpose == purpose
                && v.used_at.is_none()
                && v.expires_at > now
        }) {
            Some(token) => {
                token.used_at = Some(now);
                Ok(Some(token.user_id))
            }
            None => Ok(None),
        }
    }

    async fn delete_expired_verification_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut t = self.tables()?;
        let before = t.verification_tokens.len();
        t.verification_tokens
            .retain(|v| v.expires_at > now && v.used_at.is_none());
        Ok((before - t.verification_tokens.len()) as u64)
    }
}
