//! Environment-driven daemon configuration.
//!
//! Every knob has a default so a bare `turnbus-daemon` starts against
//! local paths. Values are read once at startup; nothing reloads.

use std::path::PathBuf;
use std::time::Duration;

/// Default idle timeout recorded on thread aggregates, in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: i64 = 900;

/// Default cap applied to per-thread streams on publish.
pub const DEFAULT_TRIM_MAX_LEN: i64 = 100_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP edge binds to.
    pub http_addr: String,
    /// SQLite database path for the durable store.
    pub store_path: PathBuf,
    /// Root directory holding object-store buckets.
    pub object_root: PathBuf,
    pub object_bucket: String,
    /// Key prefix joined onto every object path.
    pub object_prefix: String,
    /// Per-thread stream cap handed to publish; zero disables trimming.
    pub trim_max_len: i64,
    pub dedupe_ttl: Duration,
    pub persister_group: String,
    pub persister_consumer: String,
    pub persister_max_retries: u64,
    pub persister_dlq_stream: String,
    /// Tenant recorded on thread aggregates.
    pub tenant_id: String,
    pub idle_timeout_seconds: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".to_string(),
            store_path: PathBuf::from("turnbus.db"),
            object_root: PathBuf::from("objects"),
            object_bucket: "turnbus".to_string(),
            object_prefix: "turnbus".to_string(),
            trim_max_len: DEFAULT_TRIM_MAX_LEN,
            dedupe_ttl: turnbus_core::streamlog::DEFAULT_DEDUPE_TTL,
            persister_group: "persist".to_string(),
            persister_consumer: default_consumer(),
            persister_max_retries: 5,
            persister_dlq_stream: turnbus_core::streamlog::DEFAULT_DLQ_STREAM.to_string(),
            tenant_id: "default".to_string(),
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
        }
    }
}

impl Config {
    /// Reads configuration from `TURNBUS_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            http_addr: env_or("TURNBUS_HTTP_ADDR", defaults.http_addr),
            store_path: PathBuf::from(env_or(
                "TURNBUS_STORE_PATH",
                defaults.store_path.display().to_string(),
            )),
            object_root: PathBuf::from(env_or(
                "TURNBUS_OBJECT_ROOT",
                defaults.object_root.display().to_string(),
            )),
            object_bucket: env_or("TURNBUS_OBJECT_BUCKET", defaults.object_bucket),
            object_prefix: env_or("TURNBUS_OBJECT_PREFIX", defaults.object_prefix),
            trim_max_len: env_parse_or("TURNBUS_TRIM_MAXLEN", defaults.trim_max_len),
            dedupe_ttl: Duration::from_secs(env_parse_or(
                "TURNBUS_DEDUPE_TTL_SECONDS",
                defaults.dedupe_ttl.as_secs(),
            )),
            persister_group: env_or("TURNBUS_PERSISTER_GROUP", defaults.persister_group),
            persister_consumer: env_or("TURNBUS_PERSISTER_CONSUMER", defaults.persister_consumer),
            persister_max_retries: env_parse_or(
                "TURNBUS_PERSISTER_MAX_RETRIES",
                defaults.persister_max_retries,
            ),
            persister_dlq_stream: env_or(
                "TURNBUS_PERSISTER_DLQ_STREAM",
                defaults.persister_dlq_stream,
            ),
            tenant_id: env_or("TURNBUS_TENANT_ID", defaults.tenant_id),
            idle_timeout_seconds: env_parse_or(
                "TURNBUS_IDLE_TIMEOUT_SECONDS",
                defaults.idle_timeout_seconds,
            ),
        }
    }
}

/// Per-instance consumer identity, `hostname-pid` shaped.
pub fn default_consumer() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("{host}-{}", std::process::id())
}

fn env_or(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
