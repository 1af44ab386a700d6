//! Periodic cleanup of expired security state.
//!
//! Every task is idempotent and only removes rows that can no longer validate. Failures are
//! logged and the next pass retries.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::services::auth::AuthService;
use crate::services::error::AuthError;
use crate::store::{FederationStore, Stores, TokenStore};

/// Rows removed by one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub sessions: u64,
    pub blacklist_entries: u64,
    pub sms_codes: u64,
    pub oauth_states: u64,
    pub verification_tokens: u64,
    pub login_attempts: u64,
    pub security_events: u64,
    /// MFA users with no unused backup code left.
    pub users_missing_backup_codes: usize,
}

#[derive(Clone)]
pub struct MaintenanceWorker {
    auth: AuthService,
    federation: Arc<dyn FederationStore>,
    tokens: Arc<dyn TokenStore>,
    telemetry_retention_days: i64,
}

fn logged<T: Default>(task: &str, result: Result<T, AuthError>) -> T {
    result.unwrap_or_else(|e| {
        tracing::error!(task, error = %e, "Maintenance task failed");
        T::default()
    })
}

impl MaintenanceWorker {
    pub fn new(auth: AuthService, stores: &Stores, telemetry_retention_days: i64) -> Self {
        Self {
            auth,
            federation: stores.federation.clone(),
            tokens: stores.tokens.clone(),
            telemetry_retention_days,
        }
    }

    /// One cleanup pass. Never fails; individual task errors are logged.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> MaintenanceReport {
        let now = Utc::now();

        let sessions = logged(
            "sessions",
            self.auth.sessions().cleanup_expired_sessions().await,
        );
        let blacklist_entries = logged(
            "blacklist",
            self.auth.blacklist().cleanup_expired_blacklist().await,
        );
        let sms_codes = logged("sms_codes", self.auth.mfa().cleanup_expired_sms_codes().await);
        let oauth_states = logged(
            "oauth_states",
            self.federation
                .delete_expired_oauth_states(now)
                .await
                .map_err(AuthError::from),
        );
        let verification_tokens = logged(
            "verification_tokens",
            self.tokens
                .delete_expired_verification_tokens(now)
                .await
                .map_err(AuthError::from),
        );
        let (login_attempts, security_events) = logged(
            "telemetry",
            self.auth
                .telemetry()
                .cleanup(self.telemetry_retention_days)
                .await,
        );

        let missing = logged(
            "backup_code_check",
            self.auth.mfa().users_missing_backup_codes().await,
        );
        for user_id in &missing {
            tracing::warn!(user_id = %user_id, "MFA user has no unused backup codes");
        }

        let report = MaintenanceReport {
            sessions,
            blacklist_entries,
            sms_codes,
            oauth_states,
            verification_tokens,
            login_attempts,
            security_events,
            users_missing_backup_codes: missing.len(),
        };
        tracing::info!(?report, "Maintenance pass complete");
        report
    }

    /// Run [`run_once`](Self::run_once) every `interval` until `shutdown` flips to true.
    pub async fn run_periodic_cleanup(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Maintenance worker stopping");
                        return;
                    }
                }
            }
        }
    }
}
