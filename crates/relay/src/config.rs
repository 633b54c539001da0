// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool reads its own sizing variables in db/pool.rs.

use std::net::SocketAddr;

pub const DEV_JWT_SECRET: &str = "murmur_local_development_jwt_secret_must_be_32_chars";
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. `None` runs against the in-memory store.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `murmur_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Capacity of each connection's outbound queue. Events beyond it are
    /// dropped for that connection.
    pub outbound_buffer: usize,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `MURMUR_RELAY_HOST` | `0.0.0.0` |
    /// | `MURMUR_RELAY_PORT` | `8080` |
    /// | `MURMUR_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `MURMUR_RELAY_DATABASE_URL` | *(none: in-memory store)* |
    /// | `MURMUR_RELAY_CORS_ORIGINS` | *(none: cors.rs uses dev defaults)* |
    /// | `MURMUR_RELAY_LOG_FILTER` | `info` |
    /// | `MURMUR_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `MURMUR_RELAY_OUTBOUND_BUFFER` | `256` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("MURMUR_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("MURMUR_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("MURMUR_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url = env("MURMUR_RELAY_DATABASE_URL").ok().filter(|url| !url.is_empty());
        let cors_origins = env("MURMUR_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("MURMUR_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("MURMUR_RELAY_LOG_FORMAT").as_deref() {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let outbound_buffer = env("MURMUR_RELAY_OUTBOUND_BUFFER")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|capacity| *capacity > 0)
            .unwrap_or(DEFAULT_OUTBOUND_BUFFER);

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            outbound_buffer,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
