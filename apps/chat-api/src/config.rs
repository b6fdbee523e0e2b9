use std::time::Duration;

use chat_common::snowflake::MAX_WORKER_ID;

/// Chat API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Redis connection string for the cross-instance relay bus.
    pub redis_url: String,
    /// HMAC secret used to verify bearer tokens.
    pub jwt_secret: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Snowflake worker for message ids; unique per instance.
    pub worker_id: u16,
    /// Gateway tuning shared by every hub session.
    pub hub: HubConfig,
}

/// Settings for the connection hub and its relay bridge.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Identifies this process on the relay bus.
    pub instance_id: String,
    /// The single bus channel all instances publish to and subscribe on.
    pub relay_channel: String,
    /// Outbound mailbox size per session, in envelopes.
    pub mailbox_capacity: usize,
    /// How often the server pings an idle client.
    pub ping_interval: Duration,
    /// Read deadline; any inbound frame (including pongs) refreshes it.
    pub pong_wait: Duration,
    /// Upper bound for a single flush to the socket.
    pub write_wait: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            instance_id: chat_common::id::prefixed_ulid(chat_common::id::prefix::INSTANCE),
            relay_channel: "chat.messages".to_string(),
            mailbox_capacity: 256,
            // Ping slightly before the peer's read deadline would expire.
            ping_interval: pong_wait * 9 / 10,
            pong_wait,
            write_wait: Duration::from_secs(10),
            max_message_bytes: 512,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing or
    /// a value is out of range.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars(lookup);
        let defaults = HubConfig::default();
        let pong_wait = vars.duration_secs("PONG_WAIT_SECS");

        let instance_id = vars.optional("INSTANCE_ID");
        let worker_id = match (vars.optional("WORKER_ID"), &instance_id) {
            (Some(raw), _) => match raw.parse::<u16>() {
                Ok(id) if id <= MAX_WORKER_ID => id,
                _ => panic!("WORKER_ID must be an integer in 0..={MAX_WORKER_ID}, got {raw:?}"),
            },
            // A named instance is one of several sharing the message table.
            (None, Some(_)) => panic!("WORKER_ID env var is required when INSTANCE_ID is set"),
            (None, None) => 0,
        };

        let hub = HubConfig {
            instance_id: instance_id.unwrap_or(defaults.instance_id),
            relay_channel: vars.optional("RELAY_CHANNEL").unwrap_or(defaults.relay_channel),
            mailbox_capacity: vars
                .parsed::<usize>("MAILBOX_CAPACITY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.mailbox_capacity),
            ping_interval: vars
                .duration_secs("PING_INTERVAL_SECS")
                .or_else(|| pong_wait.map(|w| w * 9 / 10))
                .unwrap_or(defaults.ping_interval),
            pong_wait: pong_wait.unwrap_or(defaults.pong_wait),
            write_wait: vars.duration_secs("WRITE_WAIT_SECS").unwrap_or(defaults.write_wait),
            max_message_bytes: vars
                .parsed::<usize>("MAX_MESSAGE_BYTES")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_message_bytes),
        };

        Self {
            database_url: vars.required("DATABASE_URL"),
            redis_url: vars
                .optional("REDIS_URL")
                .unwrap_or_else(|| "redis://localhost:6379/0".to_string()),
            jwt_secret: vars.required("JWT_SECRET"),
            port: vars.parsed("PORT").unwrap_or(8002),
            worker_id,
            hub,
        }
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn required(&self, name: &str) -> String {
        self.optional(name)
            .unwrap_or_else(|| panic!("{name} env var is required"))
    }

    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|s| !s.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.optional(name).and_then(|v| v.parse().ok())
    }

    /// Whole seconds; zero is treated as unset.
    fn duration_secs(&self, name: &str) -> Option<Duration> {
        self.parsed::<u64>(name)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
