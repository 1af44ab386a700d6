use service_core::error::AppError;
use thiserror::Error;

use crate::federation::FederationError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AuthError {
    /// Deliberately generic: never reveals whether the account exists.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is inactive")]
    AccountInactive,

    #[error("Account is locked")]
    AccountLocked { retry_after_secs: u64 },

    #[error("MFA code required")]
    MfaRequired,

    #[error("Invalid MFA code")]
    InvalidMfaCode,

    #[error("MFA is already enabled")]
    MfaAlreadyEnabled,

    #[error("Too many login attempts")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("User already exists")]
    UserAlreadyExists,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Password does not meet requirements: {}", .0.join(", "))]
    WeakPassword(Vec<String>),

    #[error("User not found")]
    UserNotFound,

    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Email error: {0}")]
    Email(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            AuthError::AccountInactive => AppError::Forbidden(anyhow::anyhow!("Account is inactive")),
            AuthError::AccountLocked { retry_after_secs } => AppError::TooManyRequests(
                "Account is temporarily locked".to_string(),
                Some(retry_after_secs),
            ),
            AuthError::MfaRequired => AppError::Unauthorized(anyhow::anyhow!("MFA code required")),
            AuthError::InvalidMfaCode => AppError::AuthError(anyhow::anyhow!("Invalid MFA code")),
            AuthError::MfaAlreadyEnabled => {
                AppError::Conflict(anyhow::anyhow!("MFA is already enabled"))
            }
            AuthError::RateLimited { retry_after_secs } => AppError::TooManyRequests(
                "Too many login attempts".to_string(),
                Some(retry_after_secs),
            ),
            AuthError::InvalidToken => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token"))
            }
            AuthError::UserAlreadyExists => {
                AppError::Conflict(anyhow::anyhow!("User already exists"))
            }
            AuthError::Validation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            AuthError::WeakPassword(rules) => AppError::BadRequest(anyhow::anyhow!(
                "Password does not meet requirements: {}",
                rules.join(", ")
            )),
            AuthError::UserNotFound => AppError::NotFound(anyhow::anyhow!("User not found")),
            AuthError::Federation(e) => {
                tracing::warn!(error = %e, "Federated login failed");
                if e.is_unreachable() {
                    AppError::ServiceUnavailable
                } else if e.is_rejection() {
                    AppError::AuthError(anyhow::anyhow!("Federated login rejected"))
                } else {
                    AppError::BadGateway("Identity provider error".to_string())
                }
            }
            AuthError::Store(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            AuthError::Email(e) => AppError::EmailError(e),
            AuthError::Internal(e) => AppError::InternalError(e),
        }
    }
}
