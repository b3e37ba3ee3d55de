//! Database configuration.

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

/// PostgreSQL configuration loaded from environment variables.
///
/// Variables are prefixed with `POSTGRES_`:
/// - `POSTGRES_HOST`: database host (default "localhost")
/// - `POSTGRES_PORT`: database port (default 5432)
/// - `POSTGRES_USER` / `POSTGRES_PASSWORD`
/// - `POSTGRES_DATABASE`: database name (default "floe")
/// - `POSTGRES_MAX_CONNECTIONS` / `POSTGRES_MIN_CONNECTIONS`
/// - `POSTGRES_ACQUIRE_TIMEOUT`: seconds (default 30)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "floe".to_string()
}

fn default_database() -> String {
    "floe".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// Load configuration from `POSTGRES_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("POSTGRES_").from_env::<DatabaseConfig>()
    }

    /// Build sqlx connect options from this configuration.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}
