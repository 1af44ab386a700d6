use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::fmt::Display;
use std::str::FromStr;

use crate::federation::mapping::AttributeMapping;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_version: String,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub blacklist_backend: BlacklistBackend,
    pub jwt: JwtConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub mfa: MfaConfig,
    pub smtp: Option<SmtpConfig>,
    pub federation: FederationConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlacklistBackend {
    Postgres,
    Redis,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub access_token_expiry_hours: i64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_sessions: i64,
    pub lifetime_days: i64,
    pub remember_me_days: i64,
    pub idle_timeout_minutes: i64,
    /// How long inactive or expired rows are kept before cleanup deletes them.
    pub cleanup_grace_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            lifetime_days: 30,
            remember_me_days: 90,
            idle_timeout_minutes: 7 * 24 * 60,
            cleanup_grace_hours: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_attempts: i64,
    pub window_seconds: i64,
    pub lockout_seconds: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_seconds: 900,
            lockout_seconds: 900,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MfaConfig {
    pub issuer: String,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Debug, Clone, Default)]
pub struct FederationConfig {
    /// Public base URL used to build callback and ACS URLs.
    pub base_url: String,
    pub oauth: Vec<OAuthProviderConfig>,
    pub oidc: Option<OidcConfig>,
    pub saml: Option<SamlConfig>,
    pub ldap: Option<LdapConfig>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    /// One of `github`, `google`, `microsoft`, `gitlab`.
    pub provider: String,
    pub client_id: String,
    pub client_secret: String,
    /// Self-managed GitLab base URL or Microsoft tenant.
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub mapping: AttributeMapping,
    pub admin_group: Option<String>,
    pub sync_groups: bool,
}

#[derive(Debug, Clone)]
pub struct SamlConfig {
    pub sp_entity_id: String,
    pub acs_url: String,
    pub idp_entity_id: String,
    pub idp_sso_url: String,
    /// PEM encoded RSA public key of the IdP signing certificate.
    pub idp_public_key_pem: String,
    pub allow_idp_initiated: bool,
    pub clock_skew_seconds: i64,
    pub mapping: AttributeMapping,
    pub admin_group: Option<String>,
    pub sync_groups: bool,
}

#[derive(Debug, Clone)]
pub struct LdapConfig {
    pub url: String,
    pub bind_dn: String,
    pub bind_password: String,
    pub base_dn: String,
    /// Search filter with a `{username}` placeholder.
    pub user_filter: String,
    pub admin_group: Option<String>,
    pub mapping: AttributeMapping,
    pub sync_groups: bool,
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub interval_seconds: u64,
    pub telemetry_retention_days: i64,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let redis = opt_env("REDIS_URL").map(|url| RedisConfig { url });

        let config = AuthConfig {
            common: common_config,
            environment: environment.clone(),
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            blacklist_backend: get_env("BLACKLIST_BACKEND", Some("postgres"), false)?
                .parse()
                .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            redis,
            jwt: JwtConfig {
                secret: get_env("JWT_SECRET", None, is_prod)?,
                access_token_expiry_hours: parse_env("JWT_ACCESS_TOKEN_EXPIRY_HOURS", "24", is_prod)?,
            },
            session: SessionConfig {
                max_sessions: parse_env("SESSION_MAX_SESSIONS", "5", is_prod)?,
                lifetime_days: parse_env("SESSION_LIFETIME_DAYS", "30", is_prod)?,
                remember_me_days: parse_env("SESSION_REMEMBER_ME_DAYS", "90", is_prod)?,
                idle_timeout_minutes: parse_env("SESSION_IDLE_TIMEOUT_MINUTES", "10080", is_prod)?,
                cleanup_grace_hours: parse_env("SESSION_CLEANUP_GRACE_HOURS", "24", is_prod)?,
            },
            rate_limit: RateLimitConfig {
                max_attempts: parse_env("RATE_LIMIT_MAX_ATTEMPTS", "5", is_prod)?,
                window_seconds: parse_env("RATE_LIMIT_WINDOW_SECONDS", "900", is_prod)?,
                lockout_seconds: parse_env("RATE_LIMIT_LOCKOUT_SECONDS", "900", is_prod)?,
            },
            mfa: MfaConfig {
                issuer: get_env("MFA_ISSUER", Some("Hub"), is_prod)?,
            },
            smtp: match opt_env("SMTP_HOST") {
                Some(host) => Some(SmtpConfig {
                    host,
                    port: parse_env("SMTP_PORT", "587", is_prod)?,
                    username: get_env("SMTP_USERNAME", None, is_prod)?,
                    password: get_env("SMTP_PASSWORD", None, is_prod)?,
                    from: get_env("SMTP_FROM", None, is_prod)?,
                }),
                None => None,
            },
            federation: load_federation(is_prod)?,
            maintenance: MaintenanceConfig {
                interval_seconds: parse_env("MAINTENANCE_INTERVAL_SECONDS", "3600", is_prod)?,
                telemetry_retention_days: parse_env("TELEMETRY_RETENTION_DAYS", "90", is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.jwt.access_token_expiry_hours <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_HOURS must be positive"
            )));
        }

        if self.session.max_sessions <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_MAX_SESSIONS must be positive"
            )));
        }

        if self.rate_limit.max_attempts <= 0 || self.rate_limit.window_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RATE_LIMIT_MAX_ATTEMPTS and RATE_LIMIT_WINDOW_SECONDS must be positive"
            )));
        }

        if self.blacklist_backend == BlacklistBackend::Redis && self.redis.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BLACKLIST_BACKEND=redis requires REDIS_URL"
            )));
        }

        if self.environment == Environment::Prod && self.jwt.secret.len() < 32 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_SECRET must be at least 32 bytes in production"
            )));
        }

        if self.environment == Environment::Prod {
            if let Some(saml) = &self.federation.saml {
                if saml.allow_idp_initiated {
                    tracing::warn!("IdP-initiated SAML login is enabled in production");
                }
            }
        }

        Ok(())
    }
}

fn load_federation(is_prod: bool) -> Result<FederationConfig, AppError> {
    let base_url = get_env("PUBLIC_BASE_URL", Some("http://localhost:3000"), is_prod)?;

    let mut oauth = Vec::new();
    for provider in ["github", "google", "microsoft", "gitlab"] {
        let prefix = format!("OAUTH_{}", provider.to_uppercase());
        if let Some(client_id) = opt_env(&format!("{}_CLIENT_ID", prefix)) {
            oauth.push(OAuthProviderConfig {
                provider: provider.to_string(),
                client_id,
                client_secret: get_env(&format!("{}_CLIENT_SECRET", prefix), None, is_prod)?,
                base_url: opt_env(&format!("{}_BASE_URL", prefix)),
            });
        }
    }

    let oidc = match opt_env("OIDC_ISSUER") {
        Some(issuer) => Some(OidcConfig {
            issuer,
            client_id: get_env("OIDC_CLIENT_ID", None, is_prod)?,
            client_secret: get_env("OIDC_CLIENT_SECRET", None, is_prod)?,
            scopes: get_env("OIDC_SCOPES", Some("openid,email,profile"), false)?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            mapping: mapping_env("OIDC_ATTRIBUTE_MAP", AttributeMapping::oidc_default())?,
            admin_group: opt_env("OIDC_ADMIN_GROUP"),
            sync_groups: parse_env("OIDC_SYNC_GROUPS", "false", false)?,
        }),
        None => None,
    };

    let saml = match opt_env("SAML_IDP_SSO_URL") {
        Some(idp_sso_url) => {
            let key_path = get_env("SAML_IDP_PUBLIC_KEY_PATH", None, true)?;
            let idp_public_key_pem = std::fs::read_to_string(&key_path)?;
            Some(SamlConfig {
                sp_entity_id: get_env("SAML_SP_ENTITY_ID", Some(&format!("{}/saml/metadata", base_url)), false)?,
                acs_url: get_env("SAML_ACS_URL", Some(&format!("{}/saml/acs", base_url)), false)?,
                idp_entity_id: get_env("SAML_IDP_ENTITY_ID", None, is_prod)?,
                idp_sso_url,
                idp_public_key_pem,
                allow_idp_initiated: parse_env("SAML_ALLOW_IDP_INITIATED", "false", false)?,
                clock_skew_seconds: parse_env("SAML_CLOCK_SKEW_SECONDS", "60", false)?,
                mapping: mapping_env("SAML_ATTRIBUTE_MAP", AttributeMapping::saml_default())?,
                admin_group: opt_env("SAML_ADMIN_GROUP"),
                sync_groups: parse_env("SAML_SYNC_GROUPS", "false", false)?,
            })
        }
        None => None,
    };

    let ldap = match opt_env("LDAP_URL") {
        Some(url) => Some(LdapConfig {
            url,
            bind_dn: get_env("LDAP_BIND_DN", None, is_prod)?,
            bind_password: get_env("LDAP_BIND_PASSWORD", None, is_prod)?,
            base_dn: get_env("LDAP_BASE_DN", None, is_prod)?,
            user_filter: get_env("LDAP_USER_FILTER", Some("(uid={username})"), false)?,
            admin_group: opt_env("LDAP_ADMIN_GROUP"),
            mapping: mapping_env("LDAP_ATTRIBUTE_MAP", AttributeMapping::ldap_default())?,
            sync_groups: parse_env("LDAP_SYNC_GROUPS", "false", false)?,
        }),
        None => None,
    };

    Ok(FederationConfig {
        base_url,
        oauth,
        oidc,
        saml,
        ldap,
        timeout_seconds: parse_env("FEDERATION_TIMEOUT_SECONDS", "10", false)?,
    })
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn opt_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn mapping_env(key: &str, defaults: AttributeMapping) -> Result<AttributeMapping, AppError> {
    match opt_env(key) {
        Some(overrides) => defaults
            .with_overrides(&overrides)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e))),
        None => Ok(defaults),
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl std::str::FromStr for BlacklistBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" => Ok(BlacklistBackend::Postgres),
            "redis" => Ok(BlacklistBackend::Redis),
            _ => Err(format!("Invalid blacklist backend: {}", s)),
        }
    }
}
