use std::{path::PathBuf, time::Duration};

const DEFAULT_SUBSCRIBER_BUFFER: usize = 8;
const DEFAULT_TAIL_POLL_MS: u64 = 250;
const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 2_000;
const DEFAULT_HTTP_CACHE_MAX_BYTES: u64 = 256 * 1024 * 1024; // 256 MiB

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Tunables read once from `KESTREL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    pub subscriber_buffer: usize,
    pub tail_poll: Duration,
    pub health_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub http_cache_max_bytes: u64,
    pub bundler_command: String,
    pub node_command: String,
    /// `KESTREL_CACHE=false` rebuilds remote apps on every request.
    pub cache_enabled: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        let home = env_string("KESTREL_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(default_home);
        Self::with_home(home)
    }

    /// Env-derived tunables rooted at an explicit home directory.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            subscriber_buffer: env_usize("KESTREL_SUBSCRIBER_BUFFER")
                .map(|v| v.clamp(1, 1024))
                .unwrap_or(DEFAULT_SUBSCRIBER_BUFFER),
            tail_poll: Duration::from_millis(
                env_u64("KESTREL_TAIL_POLL_MS")
                    .map(|v| v.clamp(10, 10_000))
                    .unwrap_or(DEFAULT_TAIL_POLL_MS),
            ),
            health_timeout: Duration::from_millis(
                env_u64("KESTREL_HEALTH_TIMEOUT_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(DEFAULT_HEALTH_TIMEOUT_MS),
            ),
            keep_alive_interval: Duration::from_millis(
                env_u64("KESTREL_KEEP_ALIVE_INTERVAL_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(DEFAULT_KEEP_ALIVE_INTERVAL_MS),
            ),
            http_cache_max_bytes: env_u64("KESTREL_HTTP_CACHE_MAX_BYTES")
                .map(|v| v.clamp(1024 * 1024, 16 * 1024 * 1024 * 1024))
                .unwrap_or(DEFAULT_HTTP_CACHE_MAX_BYTES),
            bundler_command: env_string("KESTREL_BUNDLER").unwrap_or_else(|| "esbuild".to_string()),
            node_command: env_string("KESTREL_NODE").unwrap_or_else(|| "node".to_string()),
            cache_enabled: env_string("KESTREL_CACHE")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(true),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn process_db_path(&self) -> PathBuf {
        self.data_dir().join("spawned-processes.db")
    }

    pub fn http_cache_path(&self) -> PathBuf {
        self.data_dir().join("http-cache.json")
    }

    pub fn process_logs_dir(&self) -> PathBuf {
        self.home.join("logs").join("processes")
    }

    pub fn app_cache_dir(&self) -> PathBuf {
        self.home.join("apps")
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(std::env::temp_dir).join(".kestrel")
}
