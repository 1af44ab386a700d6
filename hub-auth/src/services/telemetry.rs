//! Security telemetry - login attempts, security events, rate limiting and lockout.
//!
//! Counts are read from the append-only attempt log, so concurrent logins may overshoot the
//! limit by a few attempts. That is accepted; nothing here takes a lock.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::models::{AccountLockout, LoginAttempt, SecurityEvent, SecurityEventType, Severity};
use crate::services::error::AuthError;
use crate::store::TelemetryStore;

#[derive(Clone)]
pub struct SecurityTelemetry {
    store: Arc<dyn TelemetryStore>,
    config: RateLimitConfig,
}

fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((at - now).num_seconds()).unwrap_or(0).max(1)
}

impl SecurityTelemetry {
    pub fn new(store: Arc<dyn TelemetryStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.config.window_seconds)
    }

    /// Append a login attempt and its matching security event.
    ///
    /// A failure that brings the email's window count to the threshold also writes an
    /// [`AccountLockout`] audit row.
    pub async fn record_login_attempt(
        &self,
        user_id: Option<Uuid>,
        email: &str,
        ip_address: &str,
        user_agent: &str,
        success: bool,
        failure_reason: Option<&str>,
    ) -> Result<(), AuthError> {
        let attempt = LoginAttempt::new(
            user_id,
            email,
            ip_address,
            user_agent,
            success,
            failure_reason,
        );
        self.store.insert_login_attempt(&attempt).await?;

        let event = if success {
            SecurityEvent::new(
                SecurityEventType::LoginSuccess,
                Severity::Info,
                user_id,
                format!("Login succeeded for {}", attempt.email),
            )
        } else {
            SecurityEvent::new(
                SecurityEventType::LoginFailure,
                Severity::Warning,
                user_id,
                format!(
                    "Login failed for {}: {}",
                    attempt.email,
                    failure_reason.unwrap_or("unknown")
                ),
            )
        };
        self.record_security_event(event.with_client(ip_address, user_agent))
            .await?;

        if success {
            return Ok(());
        }

        let now = Utc::now();
        let failures = self
            .store
            .failures_by_email(&attempt.email, now - self.window())
            .await?;
        if failures.count == self.config.max_attempts {
            let locked_until = now + Duration::seconds(self.config.lockout_seconds);
            self.store
                .insert_lockout(&AccountLockout::new(&attempt.email, locked_until, failures.count))
                .await?;
            self.record_security_event(
                SecurityEvent::new(
                    SecurityEventType::AccountLocked,
                    Severity::Critical,
                    user_id,
                    format!(
                        "{} locked until {} after {} failures",
                        attempt.email, locked_until, failures.count
                    ),
                )
                .with_client(ip_address, user_agent),
            )
            .await?;
        }

        Ok(())
    }

    /// Fail with [`AuthError::RateLimited`] when either the email or the IP has reached the
    /// failure limit inside the trailing window.
    pub async fn check_rate_limit(&self, email: &str, ip_address: &str) -> Result<(), AuthError> {
        let now = Utc::now();
        let since = now - self.window();

        let by_email = self.store.failures_by_email(email, since).await?;
        let by_ip = self.store.failures_by_ip(ip_address, since).await?;

        for window in [by_email, by_ip] {
            if window.count >= self.config.max_attempts {
                let reset_at = window.oldest.unwrap_or(now) + self.window();
                let retry_after_secs = seconds_until(reset_at, now);
                tracing::warn!(
                    email = %email,
                    ip = %ip_address,
                    failures = window.count,
                    "Login rate limit exceeded"
                );
                return Err(AuthError::RateLimited { retry_after_secs });
            }
        }

        Ok(())
    }

    /// Seconds remaining on the lockout, or `None` when the account is not locked.
    pub async fn is_account_locked(&self, email: &str) -> Result<Option<u64>, AuthError> {
        let now = Utc::now();
        let window = self
            .store
            .failures_by_email(email, now - self.window())
            .await?;

        if window.count < self.config.max_attempts {
            return Ok(None);
        }

        let Some(latest) = window.latest else {
            return Ok(None);
        };
        let locked_until = latest + Duration::seconds(self.config.lockout_seconds);
        if now < locked_until {
            Ok(Some(seconds_until(locked_until, now)))
        } else {
            Ok(None)
        }
    }

    pub async fn record_security_event(&self, event: SecurityEvent) -> Result<(), AuthError> {
        tracing::warn!(
            event_type = %event.event_type,
            severity = %event.severity,
            details = %event.details,
            "Security event"
        );
        self.store.insert_security_event(&event).await?;
        Ok(())
    }

    /// Record an event without failing the caller.
    pub async fn record_quietly(&self, event: SecurityEvent) {
        let event_type = event.event_type.clone();
        if let Err(e) = self.record_security_event(event).await {
            tracing::error!(error = %e, event_type = %event_type, "Failed to write security event");
        }
    }

    /// Newest events first, optionally for a single user.
    pub async fn recent_security_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, AuthError> {
        Ok(self.store.recent_security_events(user_id, limit).await?)
    }

    /// Delete attempts and events older than the retention period.
    pub async fn cleanup(&self, retention_days: i64) -> Result<(u64, u64), AuthError> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let attempts = self.store.delete_login_attempts_before(cutoff).await?;
        let events = self.store.delete_security_events_before(cutoff).await?;
        Ok((attempts, events))
    }
}
