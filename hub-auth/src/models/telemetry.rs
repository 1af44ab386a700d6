//! Security telemetry models - login attempts, security events and lockouts.
//!
//! All rows are append-only and only ever read back through windowed counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Security event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    LoginSuccess,
    LoginFailure,
    /// Failures crossed the lockout threshold
    AccountLocked,
    /// Password accepted but a second factor is pending
    MfaChallenge,
    MfaEnabled,
    MfaDisabled,
    BackupCodeUsed,
    /// More distinct IPs than expected across a user's sessions
    SuspiciousActivity,
    SessionRevoked,
    AllSessionsRevoked,
    PasswordChanged,
    PasswordResetRequested,
    PasswordReset,
    FederatedLogin,
    InvalidTokenUsage,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::LoginSuccess => "login_success",
            SecurityEventType::LoginFailure => "login_failure",
            SecurityEventType::AccountLocked => "account_locked",
            SecurityEventType::MfaChallenge => "mfa_challenge",
            SecurityEventType::MfaEnabled => "mfa_enabled",
            SecurityEventType::MfaDisabled => "mfa_disabled",
            SecurityEventType::BackupCodeUsed => "backup_code_used",
            SecurityEventType::SuspiciousActivity => "suspicious_activity",
            SecurityEventType::SessionRevoked => "session_revoked",
            SecurityEventType::AllSessionsRevoked => "all_sessions_revoked",
            SecurityEventType::PasswordChanged => "password_changed",
            SecurityEventType::PasswordResetRequested => "password_reset_requested",
            SecurityEventType::PasswordReset => "password_reset",
            SecurityEventType::FederatedLogin => "federated_login",
            SecurityEventType::InvalidTokenUsage => "invalid_token_usage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct LoginAttempt {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub email: String,
    pub ip_address: String,
    pub user_agent: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LoginAttempt {
    pub fn new(
        user_id: Option<Uuid>,
        email: &str,
        ip_address: &str,
        user_agent: &str,
        success: bool,
        failure_reason: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            email: email.to_lowercase(),
            ip_address: ip_address.to_string(),
            user_agent: user_agent.to_string(),
            success,
            failure_reason: failure_reason.map(|r| r.to_string()),
            created_at: Utc::now(),
        }
    }
}

/// Security audit log entry.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub severity: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        event_type: SecurityEventType,
        severity: Severity,
        user_id: Option<Uuid>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            event_type: event_type.as_str().to_string(),
            severity: severity.as_str().to_string(),
            ip_address: None,
            user_agent: None,
            details: details.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_client(mut self, ip_address: &str, user_agent: &str) -> Self {
        self.ip_address = Some(ip_address.to_string());
        self.user_agent = Some(user_agent.to_string());
        self
    }
}

/// Audit row written when an account crosses the failure threshold.
#[derive(Debug, Clone, FromRow)]
pub struct AccountLockout {
    pub id: Uuid,
    pub email: String,
    pub locked_at: DateTime<Utc>,
    pub locked_until: DateTime<Utc>,
    pub failure_count: i64,
}

impl AccountLockout {
    pub fn new(email: &str, locked_until: DateTime<Utc>, failure_count: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_lowercase(),
            locked_at: Utc::now(),
            locked_until,
            failure_count,
        }
    }
}

/// Aggregate of failed attempts inside a trailing window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureWindow {
    pub count: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}
