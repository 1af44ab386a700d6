use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::User;
use crate::services::error::AuthError;

const ALGORITHM: Algorithm = Algorithm::HS256;
const LEEWAY_SECONDS: u64 = 5;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub is_admin: bool,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Issued at in microseconds, matched against per-user revocation markers
    #[serde(default)]
    pub iat_us: i64,
    /// Not before (Unix timestamp)
    pub nbf: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    /// Issue time in microseconds; tokens without `iat_us` fall back to whole seconds.
    pub fn issued_at_micros(&self) -> i64 {
        if self.iat_us > 0 {
            self.iat_us
        } else {
            self.iat.saturating_mul(1_000_000)
        }
    }
}

/// Stateless HS256 access-token codec.
///
/// Holds only keys and the lifetime, so a single instance is shared across tasks.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_token_expiry_hours: i64,
}

impl TokenCodec {
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        if config.secret.is_empty() {
            return Err(anyhow::anyhow!("JWT secret must not be empty"));
        }

        let mut validation = Validation::new(ALGORITHM);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = LEEWAY_SECONDS;
        validation.set_required_spec_claims(&["exp", "nbf", "iat"]);

        tracing::info!("Token codec initialized with HS256");

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            access_token_expiry_hours: config.access_token_expiry_hours,
        })
    }

    /// Issue an access token for `user`.
    pub fn issue(&self, user: &User) -> Result<String, AuthError> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.access_token_expiry_hours);

        let claims = Claims {
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            roles: user.roles.clone(),
            is_admin: user.is_admin,
            iat: now.timestamp(),
            iat_us: now.timestamp_micros(),
            nbf: now.timestamp(),
            exp: exp.timestamp(),
        };

        self.encode_claims(&claims)
    }

    pub fn encode_claims(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(ALGORITHM), claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Failed to encode access token: {}", e)))
    }

    /// Decode and verify a token; any failure is reported as [`AuthError::InvalidToken`].
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Access token rejected");
                AuthError::InvalidToken
            })
    }

    /// Access token lifetime in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_hours * 3600
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(secret: &str) -> TokenCodec {
        TokenCodec::new(&JwtConfig {
            secret: secret.to_string(),
            access_token_expiry_hours: 24,
        })
        .unwrap()
    }

    fn user() -> User {
        let mut user = User::new(
            "alice".to_string(),
            "alice@example.com".to_string(),
            "hash".to_string(),
        );
        user.is_admin = true;
        user
    }

    #[test]
    fn test_issue_then_validate() {
        let codec = codec("test-secret-at-least-32-bytes-long!!");
        let user = user();

        let token = codec.issue(&user).unwrap();
        let claims = codec.validate(&token).unwrap();

        assert_eq!(claims.user_id, user.id);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.email, "alice@example.com");
        assert!(claims.is_admin);
        assert_eq!(claims.roles, vec!["user"]);
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
        assert_eq!(claims.iat_us / 1_000_000, claims.iat);
    }

    #[test]
    fn test_issued_at_micros_falls_back_to_seconds() {
        let codec = codec("test-secret-at-least-32-bytes-long!!");
        let mut claims = codec.validate(&codec.issue(&user()).unwrap()).unwrap();
        assert_eq!(claims.issued_at_micros(), claims.iat_us);

        claims.iat_us = 0;
        assert_eq!(claims.issued_at_micros(), claims.iat * 1_000_000);
    }

    #[test]
    fn test_rejects_other_secret() {
        let token = codec("secret-one-secret-one-secret-one!!").issue(&user()).unwrap();
        assert!(matches!(
            codec("secret-two-secret-two-secret-two!!").validate(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_rejects_expired_token() {
        let codec = codec("test-secret-at-least-32-bytes-long!!");
        let now = Utc::now().timestamp();
        let user = user();
        let token = codec
            .encode_claims(&Claims {
                user_id: user.id,
                username: user.username,
                email: user.email,
                roles: user.roles,
                is_admin: false,
                iat: now - 7200,
                iat_us: 0,
                nbf: now - 7200,
                exp: now - 3600,
            })
            .unwrap();

        assert!(matches!(codec.validate(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_rejects_not_yet_valid_token() {
        let codec = codec("test-secret-at-least-32-bytes-long!!");
        let now = Utc::now().timestamp();
        let user = user();
        let token = codec
            .encode_claims(&Claims {
                user_id: user.id,
                username: user.username,
                email: user.email,
                roles: user.roles,
                is_admin: false,
                iat: now,
                iat_us: 0,
                nbf: now + 3600,
                exp: now + 7200,
            })
            .unwrap();

        assert!(matches!(codec.validate(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_rejects_other_algorithm() {
        let secret = "test-secret-at-least-32-bytes-long!!";
        let codec = codec(secret);
        let now = Utc::now().timestamp();
        let user = user();
        let claims = Claims {
            user_id: user.id,
            username: user.username,
            email: user.email,
            roles: user.roles,
            is_admin: false,
            iat: now,
            iat_us: 0,
            nbf: now,
            exp: now + 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        assert!(matches!(codec.validate(&token), Err(AuthError::InvalidToken)));
    }
}
