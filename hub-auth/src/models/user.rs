//! User model - local identity record shared by every Hub subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// User entity.
///
/// `password_hash` is empty for accounts that only ever signed in through a
/// federated provider.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub password_hash: String,
    pub email_verified: bool,
    pub is_active: bool,
    pub is_admin: bool,
    pub roles: Vec<String>,
    pub mfa_enabled: bool,
    pub totp_secret: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a new local account with a password hash.
    pub fn new(username: String, email: String, password_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            username,
            email,
            display_name: None,
            password_hash,
            email_verified: false,
            is_active: true,
            is_admin: false,
            roles: vec!["user".to_string()],
            mfa_enabled: false,
            totp_secret: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create an account on behalf of an external identity provider.
    ///
    /// The provider asserted the email, so the account starts verified and has no
    /// local password.
    pub fn new_federated(username: String, email: String, display_name: Option<String>) -> Self {
        let mut user = Self::new(username, email, String::new());
        user.display_name = display_name;
        user.email_verified = true;
        user
    }

    pub fn has_password(&self) -> bool {
        !self.password_hash.is_empty()
    }

    /// Convert to sanitized response (no sensitive fields).
    pub fn sanitized(&self) -> UserInfo {
        UserInfo::from(self)
    }
}

/// User view safe to hand to the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub email_verified: bool,
    pub is_admin: bool,
    pub roles: Vec<String>,
    pub mfa_enabled: bool,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl From<&User> for UserInfo {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
            email: u.email.clone(),
            display_name: u.display_name.clone(),
            email_verified: u.email_verified,
            is_admin: u.is_admin,
            roles: u.roles.clone(),
            mfa_enabled: u.mfa_enabled,
            last_login_at: u.last_login_at,
        }
    }
}
