pub mod blacklist;
pub mod mfa;
pub mod oauth;
pub mod session;
pub mod telemetry;
pub mod user;
pub mod verification_token;

pub use blacklist::{BlacklistEntry, BlacklistScope};
pub use mfa::{BackupCode, SmsVerificationCode, WebAuthnCredential};
pub use oauth::{OAuthAccount, OAuthState};
pub use session::{SecurityFlags, Session, SessionInfo};
pub use telemetry::{
    AccountLockout, FailureWindow, LoginAttempt, SecurityEvent, SecurityEventType, Severity,
};
pub use user::{User, UserInfo};
pub use verification_token::{TokenPurpose, VerificationToken};
