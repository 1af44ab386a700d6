use async_trait::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, Message,
    SmtpTransport, Transport,
};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SmtpConfig;
use crate::services::error::AuthError;

/// Outbound email capability.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_password_reset_email(
        &self,
        to_email: &str,
        reset_token: &str,
        base_url: &str,
    ) -> Result<(), AuthError>;

    async fn send_email_verification(
        &self,
        to_email: &str,
        verification_token: &str,
        base_url: &str,
    ) -> Result<(), AuthError>;

    async fn send_mfa_setup_email(&self, to_email: &str, username: &str) -> Result<(), AuthError>;
}

#[derive(Clone)]
pub struct SmtpEmailService {
    mailer: SmtpTransport,
    from_email: String,
}

impl SmtpEmailService {
    pub fn new(config: &SmtpConfig) -> Result<Self, AuthError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let mailer = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| AuthError::Email(e.to_string()))?
            .credentials(creds)
            .port(config.port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.host, "Email service initialized with SMTP relay");

        Ok(Self {
            mailer,
            from_email: config.from.clone(),
        })
    }

    async fn send_email(
        &self,
        to_email: &str,
        subject: &str,
        plain_body: String,
        html_body: String,
    ) -> Result<(), AuthError> {
        let email = Message::builder()
            .from(
                self.from_email
                    .parse()
                    .map_err(|e: lettre::address::AddressError| AuthError::Email(e.to_string()))?,
            )
            .to(to_email
                .parse()
                .map_err(|e: lettre::address::AddressError| AuthError::Email(e.to_string()))?)
            .subject(subject)
            .multipart(
                lettre::message::MultiPart::alternative()
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain_body),
                    )
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body),
                    ),
            )
            .map_err(|e| AuthError::Email(e.to_string()))?;

        // SmtpTransport is synchronous
        let mailer = self.mailer.clone();
        let result = tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| AuthError::Internal(e.into()))?;

        match result {
            Ok(_) => {
                tracing::info!(to = %to_email, subject = %subject, "Email sent successfully");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, to = %to_email, "Failed to send email");
                Err(AuthError::Email(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl EmailProvider for SmtpEmailService {
    async fn send_password_reset_email(
        &self,
        to_email: &str,
        reset_token: &str,
        base_url: &str,
    ) -> Result<(), AuthError> {
        let reset_link = format!("{}/password-reset/confirm?token={}", base_url, reset_token);

        let html_body = format!(
            r###"<html>
    <body style="font-family: Arial, sans-serif;">
        <h2>Password Reset Request</h2>
        <p>We received a request to reset your password. Click the link below to set a new password:</p>
        <p><a href="{}">Reset Password</a></p>
        <p style="color: #666; font-size: 12px;">
            This link will expire in 1 hour. If you didn't request this, please ignore this email.
        </p>
    </body>
</html>"###,
            reset_link
        );

        let plain_body = format!(
            "Password Reset Request\n\nWe received a request to reset your password. Visit the following link to set a new password:\n\n{}\n\nThis link will expire in 1 hour. If you didn't request this, please ignore this email.",
            reset_link
        );

        self.send_email(to_email, "Reset Your Password", plain_body, html_body)
            .await
    }

    async fn send_email_verification(
        &self,
        to_email: &str,
        verification_token: &str,
        base_url: &str,
    ) -> Result<(), AuthError> {
        let verification_link = format!("{}/verify-email?token={}", base_url, verification_token);

        let html_body = format!(
            r###"<html>
    <body style="font-family: Arial, sans-serif;">
        <h2>Please verify your email</h2>
        <p>Thank you for registering. Click the link below to verify your email address:</p>
        <p><a href="{}">Verify Email</a></p>
        <p style="color: #666; font-size: 12px;">
            This link will expire in 24 hours. If you didn't request this, please ignore this email.
        </p>
    </body>
</html>"###,
            verification_link
        );

        let plain_body = format!(
            "Please verify your email\n\nThank you for registering. Visit the following link to verify your email address:\n\n{}\n\nThis link will expire in 24 hours. If you didn't request this, please ignore this email.",
            verification_link
        );

        self.send_email(to_email, "Verify Your Email Address", plain_body, html_body)
            .await
    }

    async fn send_mfa_setup_email(&self, to_email: &str, username: &str) -> Result<(), AuthError> {
        let html_body = format!(
            r###"<html>
    <body style="font-family: Arial, sans-serif;">
        <h2>Two-factor authentication setup started</h2>
        <p>Hi {}, two-factor authentication is being set up on your account.</p>
        <p style="color: #666; font-size: 12px;">
            If this wasn't you, change your password immediately.
        </p>
    </body>
</html>"###,
            username
        );

        let plain_body = format!(
            "Two-factor authentication setup started\n\nHi {}, two-factor authentication is being set up on your account.\n\nIf this wasn't you, change your password immediately.",
            username
        );

        self.send_email(
            to_email,
            "Two-Factor Authentication Setup",
            plain_body,
            html_body,
        )
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailKind {
    PasswordReset,
    Verification,
    MfaSetup,
}

#[derive(Debug, Clone)]
pub struct SentEmail {
    pub kind: EmailKind,
    pub to: String,
    /// Reset or verification token, empty for MFA notices.
    pub token: String,
}

/// Records messages instead of sending them.
#[derive(Default)]
pub struct MockEmailService {
    sent: Mutex<Vec<SentEmail>>,
    fail: bool,
}

impl MockEmailService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose every send fails.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Most recent token mailed to `to` for `kind`.
    pub fn last_token(&self, to: &str, kind: EmailKind) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.kind == kind && m.to == to)
            .map(|m| m.token)
    }

    fn record(&self, kind: EmailKind, to: &str, token: &str) -> Result<(), AuthError> {
        if self.fail {
            return Err(AuthError::Email("mock delivery failure".to_string()));
        }
        self.sent
            .lock()
            .map_err(|_| AuthError::Email("mock mailbox poisoned".to_string()))?
            .push(SentEmail {
                kind,
                to: to.to_string(),
                token: token.to_string(),
            });
        Ok(())
    }
}

#[async_trait]
impl EmailProvider for MockEmailService {
    async fn send_password_reset_email(
        &self,
        to_email: &str,
        reset_token: &str,
        _base_url: &str,
    ) -> Result<(), AuthError> {
        self.record(EmailKind::PasswordReset, to_email, reset_token)
    }

    async fn send_email_verification(
        &self,
        to_email: &str,
        verification_token: &str,
        _base_url: &str,
    ) -> Result<(), AuthError> {
        self.record(EmailKind::Verification, to_email, verification_token)
    }

    async fn send_mfa_setup_email(&self, to_email: &str, _username: &str) -> Result<(), AuthError> {
        self.record(EmailKind::MfaSetup, to_email, "")
    }
}
