use crate::error::{AppError, AppResult};
use axum::http::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "development" => Some(Self::Development),
            "production" => Some(Self::Production),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Mock,
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetEnforcement {
    Soft,
    Hard,
    None,
}

/// Fully resolved configuration, built once at startup. Validation failure
/// aborts startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub port: u16,
    pub upstream_api_key: String,
    pub upstream_base_url: String,
    pub upstream_default_model: String,
    pub upstream_max_tokens: u32,
    pub cors_origin: String,
    pub log_level: String,
    pub database_url: Option<String>,
    pub budget_enforcement: BudgetEnforcement,
    pub alert_topic_url: Option<String>,
    pub auth_mode: AuthMode,
    pub jwt_secret: Option<String>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        let environment = env_var("APP_ENV")
            .or_else(|| env_var("NODE_ENV"))
            .map(|v| {
                Environment::parse(&v).ok_or_else(|| {
                    config_error(format!(
                        "APP_ENV must be development, production or test (got {v:?})"
                    ))
                })
            })
            .transpose()?
            .unwrap_or(Environment::Development);

        let port = match env_var("PORT") {
            Some(v) => v
                .parse::<u16>()
                .map_err(|_| config_error(format!("PORT must be a port number (got {v:?})")))?,
            None => 3001,
        };

        let upstream_api_key = match env_var("UPSTREAM_API_KEY") {
            Some(v) => v,
            None if environment == Environment::Test => String::new(),
            None => return Err(config_error("UPSTREAM_API_KEY is required")),
        };

        let budget_enforcement = match env_var("TOKEN_BUDGET_ENFORCEMENT").as_deref() {
            Some("soft") | None => BudgetEnforcement::Soft,
            Some("hard") => BudgetEnforcement::Hard,
            Some("none") => BudgetEnforcement::None,
            Some(v) => {
                return Err(config_error(format!(
                    "TOKEN_BUDGET_ENFORCEMENT must be soft, hard or none (got {v:?})"
                )));
            }
        };

        let auth_mode = match env_var("AUTH_MODE").as_deref() {
            Some("mock") => AuthMode::Mock,
            Some("token") => AuthMode::Token,
            Some(v) => {
                return Err(config_error(format!(
                    "AUTH_MODE must be mock or token (got {v:?})"
                )));
            }
            None => match environment {
                Environment::Production => AuthMode::Token,
                _ => AuthMode::Mock,
            },
        };

        let jwt_secret = env_var("JWT_SECRET");
        if auth_mode == AuthMode::Token && jwt_secret.is_none() {
            return Err(config_error("JWT_SECRET is required when AUTH_MODE=token"));
        }

        let upstream_max_tokens = match env_var("UPSTREAM_MAX_TOKENS") {
            Some(v) => v.parse::<u32>().map_err(|_| {
                config_error(format!("UPSTREAM_MAX_TOKENS must be an integer (got {v:?})"))
            })?,
            None => 4096,
        };

        Ok(Self {
            environment,
            port,
            upstream_api_key,
            upstream_base_url: env_var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            upstream_default_model: env_var("UPSTREAM_DEFAULT_MODEL")
                .unwrap_or_else(|| crate::catalog::DEFAULT_MODEL.to_string()),
            upstream_max_tokens,
            cors_origin: env_var("CORS_ORIGIN").unwrap_or_else(|| "*".to_string()),
            log_level: env_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            database_url: env_var("DATABASE_URL"),
            budget_enforcement,
            alert_topic_url: env_var("ALERT_TOPIC_URL"),
            auth_mode,
            jwt_secret,
        })
    }

    /// A config suitable for in-process tests: mock auth, no store, no alerts.
    pub fn for_tests() -> Self {
        Self {
            environment: Environment::Test,
            port: 0,
            upstream_api_key: "test-upstream-key".to_string(),
            upstream_base_url: "http://127.0.0.1:0".to_string(),
            upstream_default_model: crate::catalog::DEFAULT_MODEL.to_string(),
            upstream_max_tokens: 4096,
            cors_origin: "*".to_string(),
            log_level: "info".to_string(),
            database_url: None,
            budget_enforcement: BudgetEnforcement::Soft,
            alert_topic_url: None,
            auth_mode: AuthMode::Mock,
            jwt_secret: Some("test-jwt-secret".to_string()),
        }
    }
}

fn config_error(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "config_invalid", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_known_names_only() {
        assert_eq!(
            Environment::parse("development"),
            Some(Environment::Development)
        );
        assert_eq!(Environment::parse("production"), Some(Environment::Production));
        assert_eq!(Environment::parse("test"), Some(Environment::Test));
        assert_eq!(Environment::parse("staging"), None);
    }

    #[test]
    fn test_config_disables_persistence_and_alerts() {
        let config = Config::for_tests();
        assert!(config.database_url.is_none());
        assert!(config.alert_topic_url.is_none());
        assert_eq!(config.auth_mode, AuthMode::Mock);
    }
}
