//! Environment-driven configuration for the dargah proxy.
//!
//! Every knob can be set either as a command-line flag or an environment
//! variable; `.env` files are honored by the binary before parsing.

use clap::Parser;

/// Default ceiling for a single wire-protocol frame (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "dargah")]
#[command(about = "Role-aware reverse proxy for PostgreSQL")]
#[command(version)]
pub struct Config {
    /// Address the proxy listens on for PostgreSQL clients
    #[arg(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:5433")]
    pub listen_address: String,

    /// Comma-separated list of upstream PostgreSQL servers (host:port)
    #[arg(
        long,
        env = "SERVERS",
        value_delimiter = ',',
        default_value = "127.0.0.1:5432"
    )]
    pub servers: Vec<String>,

    /// Seconds between upstream health probes
    #[arg(long, env = "PING_INTERVAL", default_value_t = 60)]
    pub ping_interval: u64,

    /// Per-upstream connection pool capacity
    #[arg(long, env = "CONNECTION_POOL_SIZE", default_value_t = 10)]
    pub connection_pool_size: usize,

    /// HMAC key used to verify client bearer tokens
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: String,

    /// Bootstrapped admin username
    #[arg(long, env = "ADMIN_USER", default_value = "admin")]
    pub admin_user: String,

    /// Bootstrapped admin password
    #[arg(long, env = "ADMIN_PASSWORD", default_value = "admin")]
    pub admin_password: String,

    /// Address of the admin HTTP surface
    #[arg(long, env = "HTTP_LISTENER", default_value = "0.0.0.0:8080")]
    pub http_listener: String,

    /// SQLite database holding the audit trail
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:dargah.db")]
    pub database_url: String,

    /// Seconds a session may wait for a pooled backend connection
    #[arg(long, env = "ACQUIRE_TIMEOUT_SECS", default_value_t = 60)]
    pub acquire_timeout_secs: u64,

    /// Largest accepted wire-protocol frame, in bytes
    #[arg(long, env = "MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Configuration suitable for tests: every listener on an ephemeral
    /// port, in-process database, short timeouts.
    pub fn for_tests(servers: Vec<String>, jwt_secret: &str, database_url: &str) -> Self {
        Self {
            listen_address: "127.0.0.1:0".to_string(),
            servers,
            ping_interval: 1,
            connection_pool_size: 2,
            jwt_secret: jwt_secret.to_string(),
            admin_user: "admin".to_string(),
            admin_password: "admin".to_string(),
            http_listener: "127.0.0.1:0".to_string(),
            database_url: database_url.to_string(),
            acquire_timeout_secs: 5,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            log_level: "debug".to_string(),
        }
    }
}
