use std::path::PathBuf;
use std::time::Duration;

/// Bounded calls made while a dedup lock is held: lock, cooldown check,
/// image write, identity insert, audit append, publish, cooldown write.
const LOCKED_STEPS: u32 = 7;

/// `FACEGATE_REDIS_URL` value selecting the in-process key store.
pub const MEMORY_STORE_URL: &str = "memory://";

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// MQTT broker host (default: localhost).
    pub mqtt_host: String,
    /// MQTT broker TCP port (default: 1883).
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    /// Client id prefix; a random suffix is appended per process.
    pub mqtt_client_prefix: String,
    /// Subscription filter for camera events.
    pub subscribe_topic: String,
    /// Largest MQTT packet accepted or sent; `Snap` events carry whole images.
    pub mqtt_max_packet_bytes: usize,
    /// Redis URL for lock and cooldown keys, or `memory://` for a single listener.
    pub redis_url: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Web root holding `uploads/faces` and `uploads/photos`.
    pub upload_root: PathBuf,
    /// Base URL cameras use to download registration photos.
    pub public_base_url: String,
    /// Dedup lock expiry in seconds.
    pub lock_ttl_secs: u64,
    /// Cooldown window after a registration, in seconds.
    pub cooldown_secs: u64,
    /// Upper bound on each downstream call, in milliseconds. Capped so every
    /// call made under one lock fits inside the lock TTL.
    pub io_timeout_ms: u64,
    /// Maximum messages handled concurrently.
    pub max_in_flight: usize,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = facegate_core::default_data_dir();

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("facegate.db"));

        let upload_root = std::env::var("FACEGATE_UPLOAD_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("public"));

        Self {
            mqtt_host: std::env::var("FACEGATE_MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            mqtt_port: env_parse("FACEGATE_MQTT_PORT", 1883),
            mqtt_username: env_opt("FACEGATE_MQTT_USERNAME"),
            mqtt_password: env_opt("FACEGATE_MQTT_PASSWORD"),
            mqtt_client_prefix: std::env::var("FACEGATE_MQTT_CLIENT_PREFIX")
                .unwrap_or_else(|_| "facegate-listener".to_string()),
            subscribe_topic: std::env::var("FACEGATE_SUBSCRIBE_TOPIC")
                .unwrap_or_else(|_| "mqtt/face/+/+".to_string()),
            mqtt_max_packet_bytes: env_parse("FACEGATE_MQTT_MAX_PACKET_BYTES", 16 * 1024 * 1024),
            redis_url: std::env::var("FACEGATE_REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string()),
            db_path,
            upload_root,
            public_base_url: std::env::var("FACEGATE_PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost".to_string()),
            lock_ttl_secs: env_parse("FACEGATE_LOCK_TTL_SECS", 10),
            cooldown_secs: env_parse("FACEGATE_COOLDOWN_SECS", 300),
            io_timeout_ms: env_parse("FACEGATE_IO_TIMEOUT_MS", 1000),
            max_in_flight: env_parse("FACEGATE_MAX_IN_FLIGHT", 32),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        let requested = Duration::from_millis(self.io_timeout_ms.max(1));
        let cap = self.lock_ttl() / LOCKED_STEPS;
        if requested > cap {
            tracing::warn!(?requested, ?cap, "I/O timeout does not fit the lock TTL; capping it");
            return cap;
        }
        requested
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
