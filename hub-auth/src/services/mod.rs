//! Services layer for hub-auth.
//!
//! Each component owns one concern; [`AuthService`] composes them into the operations the
//! transport layer calls.

pub mod auth;
pub mod blacklist;
pub mod credentials;
pub mod email;
pub mod error;
pub mod jwt;
pub mod maintenance;
pub mod mfa;
pub mod session;
pub mod sms;
pub mod telemetry;

pub use auth::{AuthService, AuthSettings};
pub use blacklist::TokenBlacklistService;
pub use credentials::CredentialStore;
pub use email::{EmailKind, EmailProvider, MockEmailService, SmtpEmailService};
pub use error::AuthError;
pub use jwt::{Claims, TokenCodec};
pub use maintenance::{MaintenanceReport, MaintenanceWorker};
pub use mfa::{MfaEngine, MfaStatus, TotpSetup, WebAuthnChallenge};
pub use session::{IssuedSession, SessionLedger};
pub use sms::{LoggingSmsProvider, RecordingSmsProvider, SmsKind, SmsProvider};
pub use telemetry::SecurityTelemetry;
