use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::utils::RetryConfig;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::models::Role;

#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store_backend: StoreBackend,
    pub database: DatabaseConfig,
    /// Absent in dev means an in-process cache.
    pub redis: Option<RedisConfig>,
    pub jwt: JwtConfig,
    /// Absent in dev means emails are only logged.
    pub gmail: Option<GmailConfig>,
    pub security: SecurityConfig,
    pub provisioning: ProvisioningConfig,
    pub rate_limit: RateLimitConfig,
    pub store_retry: StoreRetryConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailConfig {
    pub user: String,
    pub app_password: String,
    pub smtp_host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    pub verification_token_ttl_hours: i64,
    /// Minimum gap between verification resends for one account. 0 disables it.
    pub resend_cooldown_seconds: u64,
    pub review_exempt_roles: Vec<Role>,
    /// Prefix for links placed in outgoing emails.
    pub public_base_url: String,
    /// How often to pick up permission matrix versions written by other instances. 0 disables it.
    pub matrix_refresh_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub register_attempts: u32,
    pub register_window_seconds: u64,
    pub resend_attempts: u32,
    pub resend_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreRetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl StoreRetryConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            ..RetryConfig::default()
        }
    }
}

impl PortalConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let store_backend: StoreBackend = parse_env("STORE_BACKEND", Some("postgres"), is_prod)?;
        let needs_database = store_backend == StoreBackend::Postgres;

        let config = PortalConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("portal-auth-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: optional_env("OTLP_ENDPOINT"),
            store_backend,
            database: DatabaseConfig {
                url: get_env(
                    "DATABASE_URL",
                    if needs_database { None } else { Some("") },
                    is_prod && needs_database,
                )?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", Some("1"), is_prod)?,
            },
            redis: if is_prod {
                Some(RedisConfig {
                    url: get_env("REDIS_URL", None, is_prod)?,
                })
            } else {
                optional_env("REDIS_URL").map(|url| RedisConfig { url })
            },
            jwt: JwtConfig {
                private_key_path: get_env("JWT_PRIVATE_KEY_PATH", None, is_prod)?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    Some("15"),
                    is_prod,
                )?,
                refresh_token_expiry_days: parse_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    Some("7"),
                    is_prod,
                )?,
            },
            gmail: match (optional_env("GMAIL_USER"), is_prod) {
                (None, false) => None,
                (user, _) => Some(GmailConfig {
                    user: match user {
                        Some(user) => user,
                        None => get_env("GMAIL_USER", None, is_prod)?,
                    },
                    app_password: get_env("GMAIL_APP_PASSWORD", None, is_prod)?,
                    smtp_host: get_env("SMTP_HOST", Some("smtp.gmail.com"), is_prod)?,
                }),
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
                admin_api_key: get_env("ADMIN_API_KEY", None, true)?,
            },
            provisioning: ProvisioningConfig {
                verification_token_ttl_hours: parse_env(
                    "VERIFICATION_TOKEN_TTL_HOURS",
                    Some("24"),
                    is_prod,
                )?,
                resend_cooldown_seconds: parse_env("RESEND_COOLDOWN_SECONDS", Some("60"), is_prod)?,
                review_exempt_roles: parse_role_list(&get_env(
                    "REVIEW_EXEMPT_ROLES",
                    Some("patient"),
                    is_prod,
                )?)?,
                public_base_url: get_env("PUBLIC_BASE_URL", Some("http://localhost:3000"), is_prod)?
                    .trim_end_matches('/')
                    .to_string(),
                matrix_refresh_seconds: parse_env("MATRIX_REFRESH_SECONDS", Some("30"), is_prod)?,
            },
            rate_limit: RateLimitConfig {
                login_attempts: parse_env("RATE_LIMIT_LOGIN_ATTEMPTS", Some("5"), is_prod)?,
                login_window_seconds: parse_env(
                    "RATE_LIMIT_LOGIN_WINDOW_SECONDS",
                    Some("900"),
                    is_prod,
                )?,
                register_attempts: parse_env("RATE_LIMIT_REGISTER_ATTEMPTS", Some("3"), is_prod)?,
                register_window_seconds: parse_env(
                    "RATE_LIMIT_REGISTER_WINDOW_SECONDS",
                    Some("3600"),
                    is_prod,
                )?,
                resend_attempts: parse_env("RATE_LIMIT_RESEND_ATTEMPTS", Some("5"), is_prod)?,
                resend_window_seconds: parse_env(
                    "RATE_LIMIT_RESEND_WINDOW_SECONDS",
                    Some("3600"),
                    is_prod,
                )?,
                global_ip_limit: parse_env("RATE_LIMIT_GLOBAL_IP_LIMIT", Some("100"), is_prod)?,
                global_ip_window_seconds: parse_env(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    Some("60"),
                    is_prod,
                )?,
            },
            store_retry: StoreRetryConfig {
                max_retries: parse_env("STORE_MAX_RETRIES", Some("3"), is_prod)?,
                initial_backoff_ms: parse_env("STORE_INITIAL_BACKOFF_MS", Some("100"), is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.provisioning.verification_token_ttl_hours <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "VERIFICATION_TOKEN_TTL_HOURS must be positive"
            )));
        }

        if self.provisioning.review_exempt_roles.contains(&Role::Admin) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REVIEW_EXEMPT_ROLES may not contain admin"
            )));
        }

        if self.store_backend == StoreBackend::Postgres && self.database.url.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_URL is required for the postgres store backend"
            )));
        }

        if self.admin_api_key_too_short() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ADMIN_API_KEY must be at least 32 characters"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.store_backend == StoreBackend::Memory {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "STORE_BACKEND=memory is not allowed in production"
                )));
            }
        }

        Ok(())
    }

    fn admin_api_key_too_short(&self) -> bool {
        self.environment == Environment::Prod && self.security.admin_api_key.len() < 32
    }
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

fn parse_env<T>(key: &str, default: Option<&str>, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    get_env(key, default, is_prod)?
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Comma separated role codes. An empty value means no role is exempt.
fn parse_role_list(raw: &str) -> Result<Vec<Role>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Role>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("REVIEW_EXEMPT_ROLES: {}", e))
            })
        })
        .collect()
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(format!("Invalid store backend: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_list_parses_and_skips_blanks() {
        let roles = parse_role_list("patient, nurse,,").unwrap();
        assert_eq!(roles, vec![Role::Patient, Role::Nurse]);
        assert!(parse_role_list("").unwrap().is_empty());
    }

    #[test]
    fn test_role_list_rejects_unknown_codes() {
        assert!(parse_role_list("patient,janitor").is_err());
    }

    #[test]
    fn test_store_backend_parses_case_insensitively() {
        assert_eq!("Memory".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert!("mongo".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_retry_config_carries_store_settings() {
        let retry = StoreRetryConfig {
            max_retries: 5,
            initial_backoff_ms: 20,
        }
        .retry_config();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.initial_backoff, Duration::from_millis(20));
    }
}
