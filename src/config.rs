use std::str::FromStr;
use std::time::Duration;

/// Relay configuration, read from the environment (`.env` supported via
/// `dotenv`). Every knob has a default matching the reference deployment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// Explicit store location; `None` falls through the credential chain.
    pub database_url: Option<String>,
    /// Explicit signing secret; `None` falls through the credential chain.
    pub broadcast_secret: Option<String>,
    /// Base URL of the companion service used for credential bootstrap.
    pub bootstrap_url: Option<String>,
    pub default_room: String,
    pub poll_interval: Duration,
    pub delivery_grace: Duration,
    pub batch_size: i64,
    pub ping_interval: Duration,
    pub reap_interval: Duration,
    pub idle_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Config {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    /// The lookup is injected so tests can run against a fixed
    /// environment instead of the process's.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Config {
        Config {
            bind_addr: lookup("RELAY_BIND").unwrap_or_else(|| "0.0.0.0:8420".to_owned()),
            database_url: lookup("DATABASE_URL"),
            broadcast_secret: lookup("BROADCAST_SECRET"),
            bootstrap_url: lookup("PRIMARY_SERVER_URL"),
            default_room: lookup("DEFAULT_ROOM").unwrap_or_else(|| "lobby".to_owned()),
            poll_interval: Duration::from_millis(parse_or(lookup("OUTBOX_POLL_MS"), 500)),
            delivery_grace: Duration::from_millis(parse_or(lookup("DELIVERY_GRACE_MS"), 1000)),
            batch_size: parse_or(lookup("OUTBOX_BATCH_SIZE"), 100),
            ping_interval: Duration::from_secs(parse_or(lookup("PING_INTERVAL_SECS"), 30)),
            reap_interval: Duration::from_secs(parse_or(lookup("REAP_INTERVAL_SECS"), 60)),
            idle_timeout: Duration::from_secs(parse_or(lookup("IDLE_TIMEOUT_SECS"), 60)),
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
