//! Server configuration.
//!
//! Defaults suit a single local instance. `from_env` reads a `.env` file if
//! present and then the process environment:
//!
//! | Variable                    | Field                 | Default          |
//! |-----------------------------|-----------------------|------------------|
//! | `TANDEM_BIND_ADDR`          | `bind_addr`           | `127.0.0.1:8080` |
//! | `TANDEM_STORAGE_PATH`       | `storage_path`        | in-memory        |
//! | `JWT_SECRET`                | `jwt_secret`          | dev secret       |
//! | `ALLOWED_ORIGINS`           | `allowed_origins`     | `*`              |
//! | `TANDEM_SEND_QUEUE`         | `send_queue_capacity` | 256              |
//! | `TANDEM_MAX_MESSAGE_SIZE`   | `max_message_size`    | 512              |
//! | `TANDEM_PING_INTERVAL_SECS` | `ping_interval`       | 54               |
//! | `TANDEM_PONG_WAIT_SECS`     | `pong_wait`           | 60               |
//! | `TANDEM_WRITE_WAIT_SECS`    | `write_wait`          | 10               |
//! | `TANDEM_EDIT_ATTEMPTS`      | `edit_attempts`       | 3                |
//! | `REDIS_URL`                 | `redis_url`           | none             |
//! | `TANDEM_RELAY_URL`          | `relay_url`           | none             |
//! | `TANDEM_RELAY_BIND`         | `relay_bind_addr`     | none             |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Secret used when `JWT_SECRET` is unset. Never use it outside development.
pub const DEV_JWT_SECRET: &str = "tandem-dev-secret";

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// HS256 secret for credential verification
    pub jwt_secret: String,
    /// Accepted `Origin` values; `*` accepts any
    pub allowed_origins: Vec<String>,
    /// Frames buffered per client before it is treated as too slow
    pub send_queue_capacity: usize,
    /// Largest inbound frame in bytes
    pub max_message_size: usize,
    /// Heartbeat period
    pub ping_interval: Duration,
    /// Idle-read deadline, refreshed by any inbound frame
    pub pong_wait: Duration,
    /// Deadline for a single outbound write
    pub write_wait: Duration,
    /// Tries to commit an edit when versions collide
    pub edit_attempts: u32,
    /// Redis server for cross-instance fan-out; preferred over `relay_url`
    pub redis_url: Option<String>,
    /// Bus relay to join (None = no cross-instance fan-out)
    pub relay_url: Option<String>,
    /// Run an embedded bus relay on this address
    pub relay_bind_addr: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            storage_path: None,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            allowed_origins: vec!["*".to_string()],
            send_queue_capacity: 256,
            max_message_size: 512,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            edit_attempts: 3,
            redis_url: None,
            relay_url: None,
            relay_bind_addr: None,
        }
    }
}

impl ServerConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal in production.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            bind_addr: get("TANDEM_BIND_ADDR").unwrap_or(defaults.bind_addr),
            storage_path: get("TANDEM_STORAGE_PATH").map(PathBuf::from),
            jwt_secret: get("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            allowed_origins: get("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.allowed_origins),
            send_queue_capacity: parse(&get, "TANDEM_SEND_QUEUE")?
                .unwrap_or(defaults.send_queue_capacity),
            max_message_size: parse(&get, "TANDEM_MAX_MESSAGE_SIZE")?
                .unwrap_or(defaults.max_message_size),
            ping_interval: parse(&get, "TANDEM_PING_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.ping_interval),
            pong_wait: parse(&get, "TANDEM_PONG_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.pong_wait),
            write_wait: parse(&get, "TANDEM_WRITE_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.write_wait),
            edit_attempts: parse(&get, "TANDEM_EDIT_ATTEMPTS")?
                .unwrap_or(defaults.edit_attempts),
            redis_url: get("REDIS_URL"),
            relay_url: get("TANDEM_RELAY_URL"),
            relay_bind_addr: get("TANDEM_RELAY_BIND"),
        })
    }

    /// Whether an upgrade from `origin` is accepted. A missing origin
    /// (non-browser client) is always accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin)),
        }
    }

    /// Per-connection settings handed to the pumps.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            send_queue_capacity: self.send_queue_capacity,
            ping_interval: self.ping_interval,
            pong_wait: self.pong_wait,
            write_wait: self.write_wait,
        }
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// Settings for one connection's read and write pumps.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub send_queue_capacity: usize,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ServerConfig::default().connection()
    }
}
