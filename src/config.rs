//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.
//! A `.env` file in the working directory is loaded first when present.

use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const URL_VAR: &str = "VITE_SUPABASE_URL";
pub const URL_FALLBACK_VAR: &str = "SUPABASE_URL";
pub const SERVICE_KEY_VAR: &str = "SUPABASE_SERVICE_ROLE_KEY";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
pub const TIMEOUT_VAR: &str = "RLS_HTTP_TIMEOUT_SECS";
pub const EXEC_FUNCTION_VAR: &str = "RLS_EXEC_FUNCTION";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EXEC_FUNCTION: &str = "exec_sql";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Hosted backend endpoint and privileged credentials
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: Url,
    pub service_role_key: String,
}

/// Direct Postgres configuration (optional)
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    pub require_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            max_pool_size: 1,
            require_tls: false,
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub supabase: SupabaseConfig,
    pub database: Option<DatabaseConfig>,
    pub http_timeout: Duration,
    pub exec_function: String,
}

impl Settings {
    /// Load settings from `.env` and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let raw_url = get(URL_VAR)
            .or_else(|| get(URL_FALLBACK_VAR))
            .ok_or_else(|| ConfigError::MissingVar(URL_VAR.to_string()))?;
        let service_role_key =
            get(SERVICE_KEY_VAR).ok_or_else(|| ConfigError::MissingVar(SERVICE_KEY_VAR.to_string()))?;

        let url = Url::parse(raw_url.trim())
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", URL_VAR, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue(format!(
                "{} must be an http(s) URL, got scheme '{}'",
                URL_VAR,
                url.scheme()
            )));
        }

        let database = get(DATABASE_URL_VAR)
            .map(|u| Self::parse_database_url(&u))
            .transpose()?;

        let http_timeout = match get(TIMEOUT_VAR) {
            Some(v) => Duration::from_secs(v.parse().map_err(|_| {
                ConfigError::InvalidValue(format!("{} must be a whole number of seconds", TIMEOUT_VAR))
            })?),
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        let exec_function = get(EXEC_FUNCTION_VAR).unwrap_or_else(|| DEFAULT_EXEC_FUNCTION.to_string());

        Ok(Self {
            supabase: SupabaseConfig {
                url,
                service_role_key: service_role_key.trim().to_string(),
            },
            database,
            http_timeout,
            exec_function,
        })
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(url: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue("Invalid DATABASE_URL format (expected postgresql://...)".to_string())
        })?;

        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            ));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let require_tls = host.ends_with("supabase.co")
            || host.ends_with("supabase.com")
            || host.contains("neon.tech")
            || parsed
                .query_pairs()
                .any(|(k, v)| k == "sslmode" && (v == "require" || v == "verify-full"));

        let database = parsed.path().trim_start_matches('/').to_string();

        Ok(DatabaseConfig {
            host,
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database: if database.is_empty() {
                DatabaseConfig::default().database
            } else {
                database
            },
            max_pool_size: 1,
            require_tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_url_names_the_variable() {
        let err = Settings::from_lookup(lookup(&[(SERVICE_KEY_VAR, "secret")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref v) if v == URL_VAR));
        assert!(err.to_string().contains("VITE_SUPABASE_URL"));
    }

    #[test]
    fn test_missing_key_names_the_variable() {
        let err = Settings::from_lookup(lookup(&[(URL_VAR, "https://abc.supabase.co")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref v) if v == SERVICE_KEY_VAR));
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let err = Settings::from_lookup(lookup(&[
            (URL_VAR, "https://abc.supabase.co"),
            (SERVICE_KEY_VAR, "   "),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(_)));
    }

    #[test]
    fn test_defaults_and_fallback_url() {
        let settings = Settings::from_lookup(lookup(&[
            (URL_FALLBACK_VAR, "https://abc.supabase.co"),
            (SERVICE_KEY_VAR, "secret"),
        ]))
        .unwrap();
        assert_eq!(settings.supabase.url.host_str(), Some("abc.supabase.co"));
        assert_eq!(settings.http_timeout, Duration::from_secs(30));
        assert_eq!(settings.exec_function, "exec_sql");
        assert!(settings.database.is_none());
    }

    #[test]
    fn test_rejects_non_http_url() {
        let err = Settings::from_lookup(lookup(&[
            (URL_VAR, "ftp://abc.supabase.co"),
            (SERVICE_KEY_VAR, "secret"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_database_url_parsing() {
        let settings = Settings::from_lookup(lookup(&[
            (URL_VAR, "https://abc.supabase.co"),
            (SERVICE_KEY_VAR, "secret"),
            (DATABASE_URL_VAR, "postgresql://postgres:pw@db.abc.supabase.co:6543/postgres"),
        ]))
        .unwrap();
        let db = settings.database.unwrap();
        assert_eq!(db.host, "db.abc.supabase.co");
        assert_eq!(db.port, 6543);
        assert_eq!(db.password, "pw");
        assert!(db.require_tls);
    }

    #[test]
    fn test_local_database_url_without_tls() {
        let db = Settings::parse_database_url("postgres://me@localhost/hr").unwrap();
        assert_eq!(db.port, 5432);
        assert_eq!(db.database, "hr");
        assert!(!db.require_tls);
    }
}
