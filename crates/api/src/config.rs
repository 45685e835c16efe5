//! API server configuration

use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub allowed_origins: Vec<String>,
    /// Apply embedded migrations on startup
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let bind_address =
            env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let run_migrations = match env::var("RUN_MIGRATIONS") {
            Ok(value) => parse_bool(&value).ok_or(ConfigError::Invalid {
                key: "RUN_MIGRATIONS",
                value,
            })?,
            Err(_) => false,
        };

        Ok(Self {
            database_url,
            bind_address,
            allowed_origins,
            run_migrations,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for key in [
            "DATABASE_URL",
            "BIND_ADDRESS",
            "ALLOWED_ORIGINS",
            "RUN_MIGRATIONS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_database_url_required() {
        clear();
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/rentline");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.allowed_origins.len(), 2);
        assert!(!config.run_migrations);
        clear();
    }

    #[test]
    #[serial]
    fn test_origins_and_migrations_flag() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/rentline");
        env::set_var("ALLOWED_ORIGINS", "https://app.rentline.test, ,https://admin.rentline.test");
        env::set_var("RUN_MIGRATIONS", "true");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.allowed_origins,
            vec!["https://app.rentline.test", "https://admin.rentline.test"]
        );
        assert!(config.run_migrations);

        env::set_var("RUN_MIGRATIONS", "maybe");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { key: "RUN_MIGRATIONS", .. })
        ));
        clear();
    }
}
