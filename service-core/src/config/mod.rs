use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Settings shared by every Hub service process.
///
/// Loaded from an optional `configuration` file and `APP__*` environment variables,
/// after `.env` has been applied.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_service_name() -> String {
    "hub-auth".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_nothing_is_set() {
        temp_env::with_vars_unset(
            ["APP__SERVICE_NAME", "APP__LOG_LEVEL", "APP__OTLP_ENDPOINT"],
            || {
                let config = Config::load().expect("config should load with defaults");
                assert_eq!(config.service_name, "hub-auth");
                assert_eq!(config.log_level, "info");
                assert!(config.otlp_endpoint.is_none());
            },
        );
    }

    #[test]
    fn test_environment_overrides() {
        temp_env::with_vars(
            [
                ("APP__LOG_LEVEL", Some("debug")),
                ("APP__OTLP_ENDPOINT", Some("http://tempo:4317")),
            ],
            || {
                let config = Config::load().expect("config should load");
                assert_eq!(config.log_level, "debug");
                assert_eq!(config.otlp_endpoint.as_deref(), Some("http://tempo:4317"));
            },
        );
    }
}
