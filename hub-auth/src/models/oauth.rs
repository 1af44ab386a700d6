//! Federation correlation state and external account links.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifetime of a CSRF state value.
pub const OAUTH_STATE_TTL_MINUTES: i64 = 10;

/// Single-use CSRF correlation record for OAuth/OIDC redirects and SAML RelayState.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthState {
    pub state: String,
    pub provider: String,
    pub redirect_uri: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

impl OAuthState {
    pub fn new(state: String, provider: &str, redirect_uri: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            state,
            provider: provider.to_string(),
            redirect_uri,
            expires_at: now + Duration::minutes(OAUTH_STATE_TTL_MINUTES),
            used: false,
            created_at: now,
        }
    }

    pub fn is_consumable(&self) -> bool {
        !self.used && self.expires_at > Utc::now()
    }
}

/// Link between a local user and an identity at an external provider.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthAccount {
    pub fn new(user_id: Uuid, provider: &str, provider_user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider: provider.to_string(),
            provider_user_id: provider_user_id.to_string(),
            email: None,
            username: None,
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
