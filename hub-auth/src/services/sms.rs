use async_trait::async_trait;
use std::sync::Mutex;

use crate::services::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsKind {
    VerificationCode,
}

impl SmsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerificationCode => "verification_code",
        }
    }
}

/// Outbound SMS capability.
#[async_trait]
pub trait SmsProvider: Send + Sync {
    async fn send_sms(&self, phone_number: &str, kind: SmsKind, message: &str) -> Result<(), AuthError>;
}

/// All but the last four characters replaced with `*`.
pub fn mask_phone_number(phone_number: &str) -> String {
    let total = phone_number.chars().count();
    phone_number
        .chars()
        .enumerate()
        .map(|(i, c)| if i + 4 < total { '*' } else { c })
        .collect()
}

/// Default provider: logs that a message would go out. The body is never logged.
#[derive(Clone, Default)]
pub struct LoggingSmsProvider;

#[async_trait]
impl SmsProvider for LoggingSmsProvider {
    async fn send_sms(&self, phone_number: &str, kind: SmsKind, _message: &str) -> Result<(), AuthError> {
        tracing::info!(
            to = %mask_phone_number(phone_number),
            kind = kind.as_str(),
            "SMS (log only)"
        );
        Ok(())
    }
}

/// Keeps every message in memory so tests can read the delivered code.
#[derive(Default)]
pub struct RecordingSmsProvider {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingSmsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Six digit code contained in the latest message to `phone_number`.
    pub fn last_code(&self, phone_number: &str) -> Option<String> {
        self.messages()
            .into_iter()
            .rev()
            .find(|(to, _)| to == phone_number)
            .and_then(|(_, body)| {
                body.split(|c: char| !c.is_ascii_digit())
                    .find(|part| part.len() == 6)
                    .map(str::to_string)
            })
    }
}

#[async_trait]
impl SmsProvider for RecordingSmsProvider {
    async fn send_sms(&self, phone_number: &str, _kind: SmsKind, message: &str) -> Result<(), AuthError> {
        self.messages
            .lock()
            .map_err(|_| AuthError::Internal(anyhow::anyhow!("SMS outbox poisoned")))?
            .push((phone_number.to_string(), message.to_string()));
        Ok(())
    }
}
