use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::BlacklistEntry;
use crate::services::error::AuthError;
use crate::services::jwt::Claims;
use crate::store::BlacklistStore;

/// Revocation list for access tokens.
///
/// Only SHA-256 hashes are stored. A user-scoped marker rejects every token of that user
/// issued at or before the marker (microsecond precision), for as long as an access token
/// can live.
#[derive(Clone)]
pub struct TokenBlacklistService {
    store: Arc<dyn BlacklistStore>,
    access_token_lifetime: Duration,
}

impl TokenBlacklistService {
    pub fn new(store: Arc<dyn BlacklistStore>, access_token_expiry_hours: i64) -> Self {
        Self {
            store,
            access_token_lifetime: Duration::hours(access_token_expiry_hours),
        }
    }

    pub async fn blacklist_token(
        &self,
        token: &str,
        user_id: Option<Uuid>,
        expires_at: DateTime<Utc>,
        reason: &str,
        blacklisted_by: Option<Uuid>,
    ) -> Result<(), AuthError> {
        let entry = BlacklistEntry::for_token(token, user_id, expires_at, reason, blacklisted_by);
        self.store.insert_blacklist_entry(&entry).await?;
        tracing::info!(user_id = ?user_id, reason = %reason, "Token blacklisted");
        Ok(())
    }

    pub async fn is_token_blacklisted(&self, token: &str) -> Result<bool, AuthError> {
        Ok(self
            .store
            .is_hash_blacklisted(&BlacklistEntry::hash_token(token), Utc::now())
            .await?)
    }

    /// Block every access token of `user_id` issued up to now.
    pub async fn blacklist_user_tokens(
        &self,
        user_id: Uuid,
        reason: &str,
        blacklisted_by: Option<Uuid>,
    ) -> Result<(), AuthError> {
        let expires_at = Utc::now() + self.access_token_lifetime;
        let marker = BlacklistEntry::user_marker(user_id, expires_at, reason, blacklisted_by);
        self.store.insert_blacklist_entry(&marker).await?;
        tracing::info!(user_id = %user_id, reason = %reason, "User tokens blacklisted");
        Ok(())
    }

    /// Point lookup on the token hash, then the user's revocation marker.
    pub async fn is_revoked(&self, token: &str, claims: &Claims) -> Result<bool, AuthError> {
        if self.is_token_blacklisted(token).await? {
            return Ok(true);
        }

        let marker = self
            .store
            .latest_user_marker(claims.user_id, Utc::now())
            .await?;
        Ok(match marker {
            Some(marked_at) => claims.issued_at_micros() <= marked_at.timestamp_micros(),
            None => false,
        })
    }

    /// Expiry time encoded in the claims, for blacklisting a presented token.
    pub fn expiry_of(claims: &Claims) -> DateTime<Utc> {
        Utc.timestamp_opt(claims.exp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub async fn cleanup_expired_blacklist(&self) -> Result<u64, AuthError> {
        Ok(self.store.delete_expired_blacklist(Utc::now()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn claims(user_id: Uuid, iat: i64) -> Claims {
        Claims {
            user_id,
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            roles: vec!["user".to_string()],
            is_admin: false,
            iat,
            iat_us: iat * 1_000_000,
            nbf: iat,
            exp: iat + 3600,
        }
    }

    #[tokio::test]
    async fn test_blacklist_until_expiry_then_cleanup() {
        let store = Arc::new(MemoryStore::new());
        let blacklist = TokenBlacklistService::new(store, 24);

        blacklist
            .blacklist_token("tok-a", None, Utc::now() + Duration::hours(1), "logout", None)
            .await
            .unwrap();
        blacklist
            .blacklist_token("tok-b", None, Utc::now() - Duration::seconds(1), "logout", None)
            .await
            .unwrap();

        assert!(blacklist.is_token_blacklisted("tok-a").await.unwrap());
        assert!(!blacklist.is_token_blacklisted("tok-b").await.unwrap());
        assert!(!blacklist.is_token_blacklisted("tok-c").await.unwrap());

        assert_eq!(blacklist.cleanup_expired_blacklist().await.unwrap(), 1);
        assert!(blacklist.is_token_blacklisted("tok-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_user_marker_blocks_older_tokens_only() {
        let store = Arc::new(MemoryStore::new());
        let blacklist = TokenBlacklistService::new(store, 24);
        let user_id = Uuid::new_v4();
        let now = Utc::now().timestamp();

        blacklist
            .blacklist_user_tokens(user_id, "password changed", None)
            .await
            .unwrap();

        assert!(blacklist
            .is_revoked("old", &claims(user_id, now - 60))
            .await
            .unwrap());
        assert!(!blacklist
            .is_revoked("new", &claims(user_id, now + 60))
            .await
            .unwrap());
        assert!(!blacklist
            .is_revoked("other", &claims(Uuid::new_v4(), now - 60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_user_marker_resolves_within_one_second() {
        let store = Arc::new(MemoryStore::new());
        let blacklist = TokenBlacklistService::new(store, 24);
        let user_id = Uuid::new_v4();

        let before = Utc::now();
        blacklist
            .blacklist_user_tokens(user_id, "logout all", None)
            .await
            .unwrap();
        let after = Utc::now() + Duration::microseconds(1);

        let mut stale = claims(user_id, before.timestamp());
        stale.iat_us = before.timestamp_micros();
        let mut fresh = claims(user_id, after.timestamp());
        fresh.iat_us = after.timestamp_micros();

        assert!(blacklist.is_revoked("stale", &stale).await.unwrap());
        assert!(!blacklist.is_revoked("fresh", &fresh).await.unwrap());
    }
}
