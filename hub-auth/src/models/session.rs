//! Session model - one row per logical device login, holding the rotating refresh secret.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Security flags bitmask stored on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SecurityFlags(pub i32);

impl SecurityFlags {
    pub const NONE: SecurityFlags = SecurityFlags(0);
    pub const SUSPICIOUS: SecurityFlags = SecurityFlags(1);
    pub const COMPROMISED: SecurityFlags = SecurityFlags(1 << 1);
    pub const LOCATION_CHANGED: SecurityFlags = SecurityFlags(1 << 2);
    pub const DEVICE_CHANGED: SecurityFlags = SecurityFlags(1 << 3);

    pub fn contains(self, other: SecurityFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: SecurityFlags) -> SecurityFlags {
        SecurityFlags(self.0 | other.0)
    }

    pub fn bits(self) -> i32 {
        self.0
    }
}

/// Session entity.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    /// SHA-256 of the opaque refresh secret; the raw secret is never stored.
    pub refresh_token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub remember_me: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub ip_address: String,
    pub user_agent: String,
    pub device_name: String,
    pub location: Option<String>,
    pub is_active: bool,
    pub security_flags: i32,
}

impl Session {
    /// Create a new session for the given secret.
    pub fn new(
        user_id: Uuid,
        refresh_secret: &str,
        ip_address: &str,
        user_agent: &str,
        remember_me: bool,
        lifetime: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            refresh_token_hash: Self::hash_secret(refresh_secret),
            expires_at: now + lifetime,
            remember_me,
            created_at: now,
            last_used_at: now,
            ip_address: ip_address.to_string(),
            user_agent: user_agent.to_string(),
            device_name: device_label(user_agent),
            location: None,
            is_active: true,
            security_flags: SecurityFlags::NONE.bits(),
        }
    }

    /// Hash a refresh secret using SHA-256
    pub fn hash_secret(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Check if session is usable (active and not expired).
    pub fn is_valid(&self) -> bool {
        self.is_active && !self.is_expired()
    }

    pub fn flags(&self) -> SecurityFlags {
        SecurityFlags(self.security_flags)
    }
}

/// Derive a human readable device label from a user agent string.
pub fn device_label(user_agent: &str) -> String {
    let ua = user_agent.to_lowercase();

    let os = if ua.contains("iphone") || ua.contains("ipad") {
        "iOS"
    } else if ua.contains("android") {
        "Android"
    } else if ua.contains("windows") {
        "Windows"
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        "macOS"
    } else if ua.contains("linux") {
        "Linux"
    } else {
        ""
    };

    let client = if ua.starts_with("git/") {
        "Git"
    } else if ua.contains("edg/") {
        "Edge"
    } else if ua.contains("firefox") {
        "Firefox"
    } else if ua.contains("chrome") {
        "Chrome"
    } else if ua.contains("safari") {
        "Safari"
    } else if ua.contains("curl") {
        "curl"
    } else {
        ""
    };

    match (client, os) {
        ("", "") => "Unknown device".to_string(),
        ("", os) => os.to_string(),
        (client, "") => client.to_string(),
        (client, os) => format!("{} on {}", client, os),
    }
}

/// Session info for API responses.
#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub device_name: String,
    pub ip_address: String,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub security_flags: SecurityFlags,
}

impl From<Session> for SessionInfo {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.id,
            security_flags: s.flags(),
            device_name: s.device_name,
            ip_address: s.ip_address,
            location: s.location,
            created_at: s.created_at,
            last_used_at: s.last_used_at,
            expires_at: s.expires_at,
        }
    }
}
