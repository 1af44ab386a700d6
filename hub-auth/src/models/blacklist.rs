//! Token blacklist entries - revoked access tokens and per-user revocation markers.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Scope of a blacklist row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistScope {
    /// A single revoked token, matched by hash.
    Token,
    /// Every token of one user issued at or before `created_at`.
    User,
}

impl BlacklistScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlacklistScope::Token => "token",
            BlacklistScope::User => "user",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BlacklistEntry {
    pub id: Uuid,
    pub token_hash: String,
    pub user_id: Option<Uuid>,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
    pub blacklisted_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn for_token(
        token: &str,
        user_id: Option<Uuid>,
        expires_at: DateTime<Utc>,
        reason: &str,
        blacklisted_by: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            token_hash: Self::hash_token(token),
            user_id,
            scope: BlacklistScope::Token.as_str().to_string(),
            expires_at,
            reason: reason.to_string(),
            blacklisted_by,
            created_at: Utc::now(),
        }
    }

    /// Synthetic marker blocking every token of `user_id` issued up to now.
    pub fn user_marker(
        user_id: Uuid,
        expires_at: DateTime<Utc>,
        reason: &str,
        blacklisted_by: Option<Uuid>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            token_hash: Self::hash_token(&format!("user-revocation:{}:{}", user_id, id)),
            user_id: Some(user_id),
            scope: BlacklistScope::User.as_str().to_string(),
            expires_at,
            reason: reason.to_string(),
            blacklisted_by,
            created_at: Utc::now(),
        }
    }

    /// Hash a token using SHA-256
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub fn is_user_marker(&self) -> bool {
        self.scope == BlacklistScope::User.as_str()
    }
}
