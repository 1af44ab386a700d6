//! MFA engine - TOTP enrollment and verification, backup codes, SMS codes and a WebAuthn
//! challenge placeholder.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::models::mfa::{hash_code, BACKUP_CODE_COUNT};
use crate::models::{BackupCode, SecurityEvent, SecurityEventType, Severity, SmsVerificationCode, User};
use crate::services::email::EmailProvider;
use crate::services::error::AuthError;
use crate::services::sms::{SmsKind, SmsProvider};
use crate::services::telemetry::SecurityTelemetry;
use crate::store::{MfaStore, UserStore};
use crate::utils::{generate_backup_code, generate_numeric_code, generate_random_token};

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP_SECONDS: u64 = 30;
const WEBAUTHN_TIMEOUT_MS: u64 = 60_000;

/// Returned once at enrollment; none of it is retrievable later.
#[derive(Debug, Clone, Serialize)]
pub struct TotpSetup {
    pub secret: String,
    pub provisioning_url: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MfaStatus {
    pub enabled: bool,
    pub backup_codes_remaining: i64,
    pub webauthn_credentials: usize,
}

/// Placeholder WebAuthn assertion challenge. No ceremony verification is performed.
#[derive(Debug, Clone, Serialize)]
pub struct WebAuthnChallenge {
    pub challenge: String,
    pub allow_credentials: Vec<String>,
    pub timeout_ms: u64,
}

/// Build a SHA1/6 digit/30 second TOTP with one step of skew either side.
pub fn build_totp(secret_base32: &str, issuer: &str, account: &str) -> Result<TOTP, AuthError> {
    let secret_bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| AuthError::Internal(anyhow::anyhow!("Invalid TOTP secret: {}", e)))?;

    // otpauth labels may not contain ':'
    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        TOTP_SKEW,
        TOTP_STEP_SECONDS,
        secret_bytes,
        Some(issuer.replace(':', "")),
        account.replace(':', ""),
    )
    .map_err(|e| AuthError::Internal(anyhow::anyhow!("TOTP init error: {}", e)))
}

fn looks_like_totp(code: &str) -> bool {
    code.len() == TOTP_DIGITS && code.chars().all(|c| c.is_ascii_digit())
}

#[derive(Clone)]
pub struct MfaEngine {
    users: Arc<dyn UserStore>,
    store: Arc<dyn MfaStore>,
    sms: Arc<dyn SmsProvider>,
    email: Arc<dyn EmailProvider>,
    telemetry: SecurityTelemetry,
    issuer: String,
}

impl MfaEngine {
    pub fn new(
        users: Arc<dyn UserStore>,
        store: Arc<dyn MfaStore>,
        sms: Arc<dyn SmsProvider>,
        email: Arc<dyn EmailProvider>,
        telemetry: SecurityTelemetry,
        issuer: String,
    ) -> Self {
        Self {
            users,
            store,
            sms,
            email,
            telemetry,
            issuer,
        }
    }

    async fn load_user(&self, user_id: Uuid) -> Result<User, AuthError> {
        self.users
            .find_user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    /// Start TOTP enrollment.
    ///
    /// Backup codes are stored immediately; the secret is persisted only once
    /// [`verify_totp`](Self::verify_totp) accepts a code for it. Re-enrollment requires
    /// [`disable_mfa`](Self::disable_mfa) first, so a live factor is never replaced unproven.
    #[tracing::instrument(skip(self))]
    pub async fn setup_totp(&self, user_id: Uuid) -> Result<TotpSetup, AuthError> {
        let user = self.load_user(user_id).await?;
        if user.mfa_enabled {
            return Err(AuthError::MfaAlreadyEnabled);
        }

        let secret_bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Secret generation error: {}", e)))?;
        let totp = TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP_SECONDS,
            secret_bytes,
            Some(self.issuer.replace(':', "")),
            user.email.replace(':', ""),
        )
        .map_err(|e| AuthError::Internal(anyhow::anyhow!("TOTP init error: {}", e)))?;
        let secret = totp.get_secret_base32();
        let provisioning_url = totp.get_url();

        let backup_codes = self.store_new_backup_codes(user_id).await?;

        if let Err(e) = self
            .email
            .send_mfa_setup_email(&user.email, &user.username)
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to send MFA setup email");
        }

        tracing::info!(user_id = %user_id, "TOTP enrollment started");

        Ok(TotpSetup {
            secret,
            provisioning_url,
            backup_codes,
        })
    }

    /// Check `code` against `secret` (current step +/- 1). The first success enables MFA
    /// and stores the secret. Once enabled, only the stored secret is accepted.
    pub async fn verify_totp(
        &self,
        user_id: Uuid,
        secret: &str,
        code: &str,
    ) -> Result<bool, AuthError> {
        let user = self.load_user(user_id).await?;
        if user.mfa_enabled {
            let stored = user.totp_secret.as_deref().unwrap_or_default();
            if !bool::from(stored.as_bytes().ct_eq(secret.as_bytes())) {
                return Err(AuthError::MfaAlreadyEnabled);
            }
        }
        let totp = build_totp(secret, &self.issuer, &user.email)?;

        if !totp.check_current(code.trim()).unwrap_or(false) {
            return Ok(false);
        }

        if !user.mfa_enabled {
            self.users.enable_mfa(user_id, secret).await?;
            self.telemetry
                .record_quietly(SecurityEvent::new(
                    SecurityEventType::MfaEnabled,
                    Severity::Info,
                    Some(user_id),
                    "TOTP enabled",
                ))
                .await;
            tracing::info!(user_id = %user_id, "MFA enabled");
        }

        Ok(true)
    }

    /// Verify a second factor: TOTP, then SMS code, then backup code.
    ///
    /// Always false for users without MFA enabled.
    pub async fn verify_mfa_code(&self, user_id: Uuid, code: &str) -> Result<bool, AuthError> {
        let user = self.load_user(user_id).await?;
        if !user.mfa_enabled {
            return Ok(false);
        }

        let code = code.trim();
        if code.is_empty() {
            return Ok(false);
        }

        if looks_like_totp(code) {
            if let Some(secret) = user.totp_secret.as_deref() {
                let totp = build_totp(secret, &self.issuer, &user.email)?;
                if totp.check_current(code).unwrap_or(false) {
                    return Ok(true);
                }
            }

            if self
                .store
                .consume_sms_code(user_id, &hash_code(code), Utc::now())
                .await?
            {
                return Ok(true);
            }
        }

        self.use_backup_code(user_id, code).await
    }

    /// Consume a backup code. A code succeeds at most once, however many callers race.
    pub async fn use_backup_code(&self, user_id: Uuid, code: &str) -> Result<bool, AuthError> {
        let used = self
            .store
            .consume_backup_code(user_id, &hash_code(code), Utc::now())
            .await?;

        if used {
            let remaining = self.store.count_unused_backup_codes(user_id).await?;
            self.telemetry
                .record_quietly(SecurityEvent::new(
                    SecurityEventType::BackupCodeUsed,
                    Severity::Warning,
                    Some(user_id),
                    format!("Backup code used, {} remaining", remaining),
                ))
                .await;
        }

        Ok(used)
    }

    /// Send a 6 digit code valid for five minutes.
    pub async fn send_sms_code(&self, user_id: Uuid, phone_number: &str) -> Result<(), AuthError> {
        let phone_number = phone_number.trim();
        if phone_number.is_empty() {
            return Err(AuthError::Validation("phone number is required".to_string()));
        }

        let code = generate_numeric_code(TOTP_DIGITS);
        self.store
            .insert_sms_code(&SmsVerificationCode::new(user_id, phone_number, &code))
            .await?;

        self.sms
            .send_sms(
                phone_number,
                SmsKind::VerificationCode,
                &format!("Your {} verification code is {}", self.issuer, code),
            )
            .await?;

        tracing::info!(user_id = %user_id, "SMS verification code sent");
        Ok(())
    }

    /// Turn MFA off and drop the secret and backup codes.
    pub async fn disable_mfa(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.users.disable_mfa(user_id).await?;
        self.telemetry
            .record_quietly(SecurityEvent::new(
                SecurityEventType::MfaDisabled,
                Severity::Warning,
                Some(user_id),
                "MFA disabled",
            ))
            .await;
        tracing::info!(user_id = %user_id, "MFA disabled");
        Ok(())
    }

    /// Replace all backup codes, returning the new plaintext codes.
    pub async fn regenerate_backup_codes(&self, user_id: Uuid) -> Result<Vec<String>, AuthError> {
        let user = self.load_user(user_id).await?;
        if !user.mfa_enabled {
            return Err(AuthError::Validation("MFA is not enabled".to_string()));
        }
        self.store_new_backup_codes(user_id).await
    }

    async fn store_new_backup_codes(&self, user_id: Uuid) -> Result<Vec<String>, AuthError> {
        let codes: Vec<String> = (0..BACKUP_CODE_COUNT).map(|_| generate_backup_code()).collect();
        let rows: Vec<BackupCode> = codes.iter().map(|c| BackupCode::new(user_id, c)).collect();
        self.store.replace_backup_codes(user_id, &rows).await?;
        Ok(codes)
    }

    pub async fn mfa_status(&self, user_id: Uuid) -> Result<MfaStatus, AuthError> {
        let user = self.load_user(user_id).await?;
        Ok(MfaStatus {
            enabled: user.mfa_enabled,
            backup_codes_remaining: self.store.count_unused_backup_codes(user_id).await?,
            webauthn_credentials: self.store.list_webauthn_credentials(user_id).await?.len(),
        })
    }

    pub async fn begin_webauthn(&self, user_id: Uuid) -> Result<WebAuthnChallenge, AuthError> {
        let credentials = self.store.list_webauthn_credentials(user_id).await?;
        Ok(WebAuthnChallenge {
            challenge: generate_random_token(),
            allow_credentials: credentials
                .iter()
                .map(|c| URL_SAFE_NO_PAD.encode(&c.credential_id))
                .collect(),
            timeout_ms: WEBAUTHN_TIMEOUT_MS,
        })
    }

    /// MFA users left without any unused backup code.
    pub async fn users_missing_backup_codes(&self) -> Result<Vec<Uuid>, AuthError> {
        Ok(self.store.mfa_users_without_backup_codes().await?)
    }

    pub async fn cleanup_expired_sms_codes(&self) -> Result<u64, AuthError> {
        Ok(self.store.delete_expired_sms_codes(Utc::now()).await?)
    }
}
