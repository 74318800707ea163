use std::time::Duration;

use super::{read_env_variable, read_env_variable_with_default_value};

/// Process-wide configuration, read once from the environment at startup.
///
/// Mirrors the teacher crate's pattern of reading required variables eagerly so that a
/// misconfigured deployment panics during startup instead of during the first device
/// connection (see the `VEHICLE_MANAGEMENT_SERVICE_API_KEY` / `API_BASE_URL` checks the
/// teacher performs at the top of `main`).
#[derive(Debug, Clone)]
pub struct Config {
    pub primary_database_url: String,
    pub db_pool_size: u32,

    pub gt06_port: u16,
    pub teltonika_port: u16,
    pub api_port: u16,

    pub con_timeout: Duration,
    pub socket_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub max_connections_per_port: usize,

    pub secret_key: String,
    pub data_forward_url: String,

    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: i64,

    pub gt06_crc_fallback: bool,

    pub app_env: String,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from the environment, panicking on any missing required variable.
    pub fn from_env() -> Self {
        Config {
            primary_database_url: read_env_variable("PRIMARY_DATABASE_URL"),
            db_pool_size: read_env_variable_with_default_value("DB_POOL_SIZE", 50),

            gt06_port: read_env_variable_with_default_value("GT06_PORT", 5023),
            teltonika_port: read_env_variable_with_default_value("TELTONIKA_PORT", 5024),
            api_port: read_env_variable_with_default_value("API_PORT", 5055),

            con_timeout: Duration::from_millis(read_env_variable_with_default_value("CON_TIME_OUT", 5000)),
            socket_timeout: Duration::from_millis(read_env_variable_with_default_value("SOCKET_TIMEOUT", 300_000)),
            keep_alive_timeout: Duration::from_millis(read_env_variable_with_default_value(
                "KEEP_ALIVE_TIMEOUT",
                120_000,
            )),
            max_connections_per_port: read_env_variable_with_default_value("MAX_CONNECTIONS_PER_PORT", 50_000),

            secret_key: read_env_variable("SECRET_KEY"),
            data_forward_url: read_env_variable("DATA_FORWARD_URL"),

            redis_host: read_env_variable_with_default_value("REDIS_HOST", "localhost".to_string()),
            redis_port: read_env_variable_with_default_value("REDIS_PORT", 6379),
            redis_password: std::env::var("REDIS_PASSWORD").ok().filter(|value| !value.is_empty()),
            redis_db: read_env_variable_with_default_value("REDIS_DB", 0),

            gt06_crc_fallback: read_env_variable_with_default_value("GT06_CRC_FALLBACK", false),

            app_env: read_env_variable_with_default_value("NODE_ENV", "development".to_string()),
            log_level: read_env_variable_with_default_value("LOG_LEVEL", "info".to_string()),
        }
    }

    /// Translates `LOG_LEVEL` into an `RUST_LOG` filter spec, unless the operator has set
    /// `RUST_LOG` explicitly (which always wins).
    pub fn apply_log_level(&self) {
        if std::env::var("RUST_LOG").is_err() {
            let level = match self.log_level.as_str() {
                "verbose" => "debug",
                other => other,
            };
            // Safety: called once at startup before any other thread is spawned.
            unsafe {
                std::env::set_var("RUST_LOG", level);
            }
        }
    }

    /// Builds the Redis connection URL from the individual `REDIS_*` variables.
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_without_password() {
        let config = Config {
            redis_host: "localhost".into(),
            redis_port: 6379,
            redis_password: None,
            redis_db: 0,
            ..test_config()
        };
        assert_eq!(config.redis_url(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_redis_url_with_password() {
        let config = Config {
            redis_host: "localhost".into(),
            redis_port: 6379,
            redis_password: Some("secret".into()),
            redis_db: 2,
            ..test_config()
        };
        assert_eq!(config.redis_url(), "redis://:secret@localhost:6379/2");
    }

    fn test_config() -> Config {
        Config {
            primary_database_url: String::new(),
            db_pool_size: 1,
            gt06_port: 5023,
            teltonika_port: 5024,
            api_port: 5055,
            con_timeout: Duration::from_millis(5000),
            socket_timeout: Duration::from_millis(300_000),
            keep_alive_timeout: Duration::from_millis(120_000),
            max_connections_per_port: 50_000,
            secret_key: String::new(),
            data_forward_url: String::new(),
            redis_host: "localhost".into(),
            redis_port: 6379,
            redis_password: None,
            redis_db: 0,
            gt06_crc_fallback: false,
            app_env: "test".into(),
            log_level: "info".into(),
        }
    }
}
