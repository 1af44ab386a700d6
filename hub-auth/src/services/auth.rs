//! Auth orchestrator: the operations exposed to the transport layer.
//!
//! Local and federated logins share one tail ([`AuthService::start_session`]): create the
//! session, run the suspicious-activity heuristic, issue the access token and record the
//! successful attempt.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::config::{AuthConfig, JwtConfig, MfaConfig, RateLimitConfig, SessionConfig};
use crate::dtos::{
    ChangePasswordRequest, ClientContext, LoginRequest, LoginResponse, PasswordResetConfirm,
    RegisterRequest, RegisterResponse,
};
use crate::federation::{ExternalIdentity, FederationGateway, LDAP_PROVIDER};
use crate::models::{
    SecurityEvent, SecurityEventType, SecurityFlags, SessionInfo, Severity, TokenPurpose, User,
    UserInfo, VerificationToken,
};
use crate::services::blacklist::TokenBlacklistService;
use crate::services::credentials::CredentialStore;
use crate::services::email::EmailProvider;
use crate::services::error::AuthError;
use crate::services::jwt::{Claims, TokenCodec};
use crate::services::mfa::MfaEngine;
use crate::services::session::SessionLedger;
use crate::services::sms::SmsProvider;
use crate::services::telemetry::SecurityTelemetry;
use crate::store::{StoreError, Stores, TokenStore, UserStore};
use crate::utils::generate_random_token;

const TOKEN_TYPE: &str = "Bearer";

/// The subset of [`AuthConfig`] the orchestrator needs.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub jwt: JwtConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub mfa: MfaConfig,
    /// Base URL for links in outgoing email.
    pub base_url: String,
}

impl From<&AuthConfig> for AuthSettings {
    fn from(config: &AuthConfig) -> Self {
        Self {
            jwt: config.jwt.clone(),
            session: config.session.clone(),
            rate_limit: config.rate_limit.clone(),
            mfa: config.mfa.clone(),
            base_url: config.federation.base_url.clone(),
        }
    }
}

fn is_valid_username(username: &str) -> bool {
    let mut chars = username.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !username.ends_with('-')
}

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    tokens: Arc<dyn TokenStore>,
    credentials: CredentialStore,
    codec: TokenCodec,
    sessions: SessionLedger,
    blacklist: TokenBlacklistService,
    mfa: MfaEngine,
    telemetry: SecurityTelemetry,
    federation: Arc<FederationGateway>,
    email: Arc<dyn EmailProvider>,
    base_url: String,
}

impl AuthService {
    pub fn new(
        settings: AuthSettings,
        stores: &Stores,
        email: Arc<dyn EmailProvider>,
        sms: Arc<dyn SmsProvider>,
        federation: Arc<FederationGateway>,
    ) -> Result<Self, AuthError> {
        let codec = TokenCodec::new(&settings.jwt)?;
        let telemetry = SecurityTelemetry::new(stores.telemetry.clone(), settings.rate_limit);
        let mfa = MfaEngine::new(
            stores.users.clone(),
            stores.mfa.clone(),
            sms,
            email.clone(),
            telemetry.clone(),
            settings.mfa.issuer,
        );

        Ok(Self {
            users: stores.users.clone(),
            tokens: stores.tokens.clone(),
            credentials: CredentialStore::new(),
            codec,
            sessions: SessionLedger::new(stores.sessions.clone(), settings.session),
            blacklist: TokenBlacklistService::new(
                stores.blacklist.clone(),
                settings.jwt.access_token_expiry_hours,
            ),
            mfa,
            telemetry,
            federation,
            email,
            base_url: settings.base_url,
        })
    }

    pub fn sessions(&self) -> &SessionLedger {
        &self.sessions
    }

    pub fn mfa(&self) -> &MfaEngine {
        &self.mfa
    }

    pub fn telemetry(&self) -> &SecurityTelemetry {
        &self.telemetry
    }

    pub fn blacklist(&self) -> &TokenBlacklistService {
        &self.blacklist
    }

    pub fn federation(&self) -> &FederationGateway {
        &self.federation
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    #[tracing::instrument(skip(self, req, client), fields(username = %req.username))]
    pub async fn register(
        &self,
        req: RegisterRequest,
        client: &ClientContext,
    ) -> Result<RegisterResponse, AuthError> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        let username = req.username.trim().to_string();
        if !is_valid_username(&username) {
            return Err(AuthError::Validation(
                "Username may only contain letters, digits, '-' and '_'".to_string(),
            ));
        }

        let password_hash = self.credentials.hash_new_password(&req.password).await?;

        let mut user = User::new(username, req.email.trim().to_string(), password_hash);
        user.display_name = req.display_name.filter(|n| !n.trim().is_empty());

        self.users.insert_user(&user).await.map_err(|e| match e {
            StoreError::Conflict(_) => AuthError::UserAlreadyExists,
            other => AuthError::Store(other),
        })?;

        tracing::info!(user_id = %user.id, ip = %client.ip_address, "User registered");

        // The account exists either way; the user can ask for the email again.
        if let Err(e) = self.send_verification(&user).await {
            tracing::warn!(user_id = %user.id, error = %e, "Failed to send verification email");
        }

        Ok(RegisterResponse {
            user: user.sanitized(),
            message: "Registration successful. Please check your email to verify your account."
                .to_string(),
        })
    }

    async fn find_login_user(&self, login: &str) -> Result<Option<User>, AuthError> {
        let user = if login.contains('@') {
            self.users.find_user_by_email(login).await?
        } else {
            self.users.find_user_by_username(login).await?
        };
        Ok(user)
    }

    async fn record_failure(
        &self,
        user_id: Option<Uuid>,
        key: &str,
        client: &ClientContext,
        reason: &str,
    ) -> Result<(), AuthError> {
        self.telemetry
            .record_login_attempt(
                user_id,
                key,
                &client.ip_address,
                &client.user_agent,
                false,
                Some(reason),
            )
            .await
    }

    /// Directory login for users without a local password.
    async fn ldap_login(&self, login: &str, password: &str) -> Result<Option<User>, AuthError> {
        if !self.federation.has_ldap() {
            return Ok(None);
        }
        match self.federation.authenticate_ldap(login, password).await? {
            Some(identity) => Ok(Some(
                self.federation.resolve_user(LDAP_PROVIDER, &identity).await?,
            )),
            None => Ok(None),
        }
    }

    /// Password login by username or email, followed by MFA when enabled.
    #[tracing::instrument(skip(self, req, client), fields(ip = %client.ip_address))]
    pub async fn login(
        &self,
        req: LoginRequest,
        client: &ClientContext,
    ) -> Result<LoginResponse, AuthError> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        let login = req.login.trim();

        let local = self.find_login_user(login).await?;
        let key = local
            .as_ref()
            .map(|u| u.email.to_lowercase())
            .unwrap_or_else(|| login.to_lowercase());

        if let Some(retry_after_secs) = self.telemetry.is_account_locked(&key).await? {
            tracing::warn!(login = %key, "Login attempt on locked account");
            return Err(AuthError::AccountLocked { retry_after_secs });
        }
        self.telemetry
            .check_rate_limit(&key, &client.ip_address)
            .await?;

        let local_id = local.as_ref().map(|u| u.id);
        let user = match local {
            Some(user) if user.has_password() => {
                if !self
                    .credentials
                    .verify(&user.password_hash, &req.password)
                    .await?
                {
                    self.record_failure(Some(user.id), &key, client, "invalid_password")
                        .await?;
                    return Err(AuthError::InvalidCredentials);
                }
                user
            }
            _ => match self.ldap_login(login, &req.password).await? {
                Some(user) => user,
                None => {
                    if !self.federation.has_ldap() {
                        self.credentials.verify_dummy(&req.password).await?;
                    }
                    self.record_failure(local_id, &key, client, "invalid_credentials")
                        .await?;
                    return Err(AuthError::InvalidCredentials);
                }
            },
        };

        if !user.is_active {
            self.record_failure(Some(user.id), &key, client, "account_inactive")
                .await?;
            return Err(AuthError::AccountInactive);
        }

        if user.mfa_enabled {
            let code = req
                .mfa_code
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty());
            let Some(code) = code else {
                self.telemetry
                    .record_quietly(
                        SecurityEvent::new(
                            SecurityEventType::MfaChallenge,
                            Severity::Info,
                            Some(user.id),
                            "MFA code requested",
                        )
                        .with_client(&client.ip_address, &client.user_agent),
                    )
                    .await;
                return Err(AuthError::MfaRequired);
            };

            if !self.mfa.verify_mfa_code(user.id, code).await? {
                self.record_failure(Some(user.id), &key, client, "invalid_mfa_code")
                    .await?;
                return Err(AuthError::InvalidMfaCode);
            }
        }

        self.start_session(user, client, req.remember_me).await
    }

    /// Log in a user asserted by an external provider.
    ///
    /// The provider is trusted for the second factor; local MFA is not re-checked.
    #[tracing::instrument(skip(self, identity, client), fields(external_id = %identity.external_id))]
    pub async fn complete_federated_login(
        &self,
        provider: &str,
        identity: &ExternalIdentity,
        client: &ClientContext,
    ) -> Result<LoginResponse, AuthError> {
        let user = self.federation.resolve_user(provider, identity).await?;

        self.telemetry
            .record_quietly(
                SecurityEvent::new(
                    SecurityEventType::FederatedLogin,
                    Severity::Info,
                    Some(user.id),
                    format!("Signed in through {}", provider),
                )
                .with_client(&client.ip_address, &client.user_agent),
            )
            .await;

        self.start_session(user, client, false).await
    }

    async fn start_session(
        &self,
        mut user: User,
        client: &ClientContext,
        remember_me: bool,
    ) -> Result<LoginResponse, AuthError> {
        let issued = self
            .sessions
            .create_session(user.id, &client.ip_address, &client.user_agent, remember_me)
            .await?;

        match self
            .sessions
            .detect_suspicious_activity(user.id, &client.ip_address)
            .await
        {
            Ok(true) => {
                if let Err(e) = self
                    .sessions
                    .mark_session_flags(&issued.session, SecurityFlags::SUSPICIOUS)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to flag suspicious session");
                }
                self.telemetry
                    .record_quietly(
                        SecurityEvent::new(
                            SecurityEventType::SuspiciousActivity,
                            Severity::Warning,
                            Some(user.id),
                            "Sessions from more than three IP addresses in 24 hours",
                        )
                        .with_client(&client.ip_address, &client.user_agent),
                    )
                    .await;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Suspicious activity check failed"),
        }

        let access_token = self.codec.issue(&user)?;

        let now = Utc::now();
        self.users.record_login(user.id, now).await?;
        user.last_login_at = Some(now);

        self.telemetry
            .record_login_attempt(
                Some(user.id),
                &user.email,
                &client.ip_address,
                &client.user_agent,
                true,
                None,
            )
            .await?;

        tracing::info!(user_id = %user.id, session_id = %issued.session.id, "User logged in");

        Ok(LoginResponse {
            access_token,
            refresh_token: issued.refresh_token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: self.codec.access_token_expiry_seconds(),
            user: user.sanitized(),
        })
    }

    /// Rotate the refresh secret and issue a fresh access token.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<LoginResponse, AuthError> {
        self.sessions.validate_with_idle_check(refresh_token).await?;
        let issued = self.sessions.refresh_session(refresh_token).await?;

        let user = self
            .users
            .find_user_by_id(issued.session.user_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if !user.is_active {
            self.sessions.revoke_session(issued.session.id).await?;
            return Err(AuthError::AccountInactive);
        }

        let access_token = self.codec.issue(&user)?;
        tracing::info!(user_id = %user.id, "Token refreshed for user");

        Ok(LoginResponse {
            access_token,
            refresh_token: issued.refresh_token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: self.codec.access_token_expiry_seconds(),
            user: user.sanitized(),
        })
    }

    /// Revoke the session behind `refresh_token` and, when given, blacklist the access token.
    pub async fn logout(
        &self,
        refresh_token: &str,
        access_token: Option<&str>,
    ) -> Result<(), AuthError> {
        if let Some(token) = access_token {
            if let Ok(claims) = self.codec.validate(token) {
                self.blacklist
                    .blacklist_token(
                        token,
                        Some(claims.user_id),
                        TokenBlacklistService::expiry_of(&claims),
                        "logout",
                        Some(claims.user_id),
                    )
                    .await?;
            }
        }

        let session = self
            .sessions
            .revoke_by_token(refresh_token)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        self.telemetry
            .record_quietly(SecurityEvent::new(
                SecurityEventType::SessionRevoked,
                Severity::Info,
                Some(session.user_id),
                format!("Session {} ended by logout", session.id),
            ))
            .await;

        tracing::info!(user_id = %session.user_id, "User logged out");
        Ok(())
    }

    /// Revoke every session of the user and block all access tokens issued so far.
    pub async fn logout_all(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let revoked = self.sessions.revoke_user_sessions(user_id).await?;
        self.blacklist
            .blacklist_user_tokens(user_id, "logout_all", Some(user_id))
            .await?;

        self.telemetry
            .record_quietly(SecurityEvent::new(
                SecurityEventType::AllSessionsRevoked,
                Severity::Warning,
                Some(user_id),
                format!("{} sessions revoked", revoked),
            ))
            .await;

        tracing::info!(user_id = %user_id, revoked, "User logged out everywhere");
        Ok(revoked)
    }

    /// Validate signature and lifetime, then the blacklist and the account state.
    pub async fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.codec.validate(token)?;

        if self.blacklist.is_revoked(token, &claims).await? {
            self.telemetry
                .record_quietly(SecurityEvent::new(
                    SecurityEventType::InvalidTokenUsage,
                    Severity::Warning,
                    Some(claims.user_id),
                    "Revoked access token presented",
                ))
                .await;
            return Err(AuthError::InvalidToken);
        }

        match self.users.find_user_by_id(claims.user_id).await? {
            Some(user) if user.is_active => Ok(claims),
            _ => Err(AuthError::InvalidToken),
        }
    }

    async fn issue_verification_token(
        &self,
        user_id: Uuid,
        purpose: TokenPurpose,
    ) -> Result<String, AuthError> {
        let token = generate_random_token();
        self.tokens
            .insert_verification_token(&VerificationToken::new(user_id, &token, purpose))
            .await?;
        Ok(token)
    }

    async fn send_verification(&self, user: &User) -> Result<(), AuthError> {
        let token = self
            .issue_verification_token(user.id, TokenPurpose::EmailVerification)
            .await?;
        self.email
            .send_email_verification(&user.email, &token, &self.base_url)
            .await
    }

    /// Always succeeds so the response never reveals whether the email is registered.
    pub async fn request_password_reset(
        &self,
        email: &str,
        client: &ClientContext,
    ) -> Result<(), AuthError> {
        let Some(user) = self.users.find_user_by_email(email.trim()).await? else {
            tracing::info!("Password reset requested for unknown email");
            return Ok(());
        };
        if !user.is_active {
            return Ok(());
        }

        let token = self
            .issue_verification_token(user.id, TokenPurpose::PasswordReset)
            .await?;
        if let Err(e) = self
            .email
            .send_password_reset_email(&user.email, &token, &self.base_url)
            .await
        {
            tracing::error!(user_id = %user.id, error = %e, "Failed to send password reset email");
        }

        self.telemetry
            .record_quietly(
                SecurityEvent::new(
                    SecurityEventType::PasswordResetRequested,
                    Severity::Info,
                    Some(user.id),
                    "Password reset requested",
                )
                .with_client(&client.ip_address, &client.user_agent),
            )
            .await;

        tracing::info!(user_id = %user.id, "Password reset requested");
        Ok(())
    }

    /// Consume a reset token, set the new password and sign the user out everywhere.
    pub async fn reset_password(&self, req: PasswordResetConfirm) -> Result<(), AuthError> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        // Hash before consuming so a weak password does not burn the token.
        let password_hash = self.credentials.hash_new_password(&req.new_password).await?;

        let user_id = self
            .tokens
            .consume_verification_token(
                &VerificationToken::hash_token(req.token.trim()),
                TokenPurpose::PasswordReset.as_str(),
                Utc::now(),
            )
            .await?
            .ok_or(AuthError::InvalidToken)?;

        self.users.update_password_hash(user_id, &password_hash).await?;
        self.sessions.revoke_user_sessions(user_id).await?;
        self.blacklist
            .blacklist_user_tokens(user_id, "password_reset", None)
            .await?;

        self.telemetry
            .record_quietly(SecurityEvent::new(
                SecurityEventType::PasswordReset,
                Severity::Warning,
                Some(user_id),
                "Password reset completed",
            ))
            .await;

        tracing::info!(user_id = %user_id, "Password reset successful");
        Ok(())
    }

    pub async fn verify_email(&self, token: &str) -> Result<(), AuthError> {
        let user_id = self
            .tokens
            .consume_verification_token(
                &VerificationToken::hash_token(token.trim()),
                TokenPurpose::EmailVerification.as_str(),
                Utc::now(),
            )
            .await?
            .ok_or(AuthError::InvalidToken)?;

        self.users.mark_email_verified(user_id).await?;
        tracing::info!(user_id = %user_id, "Email verified for user");
        Ok(())
    }

    /// Send a fresh verification link to an unverified account. Silent for anyone else.
    pub async fn resend_verification_email(&self, email: &str) -> Result<(), AuthError> {
        match self.users.find_user_by_email(email.trim()).await? {
            Some(user) if user.is_active && !user.email_verified => {
                if let Err(e) = self.send_verification(&user).await {
                    tracing::warn!(user_id = %user.id, error = %e, "Failed to resend verification email");
                }
            }
            _ => tracing::debug!("Verification resend skipped"),
        }
        Ok(())
    }

    /// Change the password of a signed-in user; every refresh session is revoked.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        req: ChangePasswordRequest,
    ) -> Result<(), AuthError> {
        req.validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        let user = self
            .users
            .find_user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        if !user.has_password()
            || !self
                .credentials
                .verify(&user.password_hash, &req.current_password)
                .await?
        {
            return Err(AuthError::InvalidCredentials);
        }

        let password_hash = self.credentials.hash_new_password(&req.new_password).await?;
        self.users.update_password_hash(user_id, &password_hash).await?;
        let revoked = self.sessions.revoke_user_sessions(user_id).await?;

        self.telemetry
            .record_quietly(SecurityEvent::new(
                SecurityEventType::PasswordChanged,
                Severity::Info,
                Some(user_id),
                format!("Password changed, {} sessions revoked", revoked),
            ))
            .await;

        tracing::info!(user_id = %user_id, "Password changed");
        Ok(())
    }

    pub async fn current_user(&self, user_id: Uuid) -> Result<UserInfo, AuthError> {
        self.users
            .find_user_by_id(user_id)
            .await?
            .map(|u| u.sanitized())
            .ok_or(AuthError::UserNotFound)
    }

    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<SessionInfo>, AuthError> {
        self.sessions.list_sessions(user_id).await
    }

    pub async fn recent_security_events(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, AuthError> {
        self.telemetry.recent_security_events(user_id, limit).await
    }
}
