// crates/core/src/config.rs
//! Runtime configuration, resolved from defaults and `ANGEL_*` environment
//! variables. The server binary layers CLI flags on top.

use std::path::PathBuf;
use std::time::Duration;

use crate::paths;

/// How many databases may be ATTACHed to the catalog connection at once.
/// SQLite's compiled-in cap is typically 10.
pub const DEFAULT_ATTACH_CAP: usize = 10;

/// Idle attachments older than this are detached by the housekeeper.
pub const DEFAULT_ATTACH_IDLE_TTL: Duration = Duration::from_secs(10 * 60);

/// Per-path debounce applied to filesystem events before syncing.
pub const DEFAULT_WATCHER_DEBOUNCE: Duration = Duration::from_millis(100);

/// Scan cadence of the polling fallback.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Temporary sessions idle longer than this are eligible for cleanup.
pub const DEFAULT_TEMP_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the on-disk layout; see [`crate::paths`].
    pub data_dir: PathBuf,
    /// Directory holding per-session DB files. Defaults to `<data>/sessions`.
    pub session_dir: PathBuf,
    /// Per-session sandbox root. Defaults to `<data>/sandbox`.
    pub sandbox_dir: PathBuf,
    /// Catalog DB file. Defaults to `<data>/angel.db`.
    pub catalog_path: PathBuf,
    /// Keep the catalog in memory (testing).
    pub in_memory: bool,
    pub attach_cap: usize,
    pub attach_idle_ttl: Duration,
    pub watcher_debounce: Duration,
    pub poll_interval: Duration,
    pub temp_session_ttl: Duration,
}

impl Config {
    /// Build a config rooted at `data_dir` with default knobs.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            session_dir: paths::sessions_dir(&data_dir),
            sandbox_dir: paths::sandbox_dir(&data_dir),
            catalog_path: paths::catalog_path(&data_dir),
            data_dir,
            in_memory: false,
            attach_cap: DEFAULT_ATTACH_CAP,
            attach_idle_ttl: DEFAULT_ATTACH_IDLE_TTL,
            watcher_debounce: DEFAULT_WATCHER_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            temp_session_ttl: DEFAULT_TEMP_SESSION_TTL,
        }
    }

    /// Resolve from the environment. `ANGEL_DATA_DIR` picks the root;
    /// individual paths and knobs can be overridden one by one.
    pub fn from_env() -> Self {
        let data_dir = env_path("ANGEL_DATA_DIR")
            .or_else(paths::default_data_dir)
            .unwrap_or_else(|| PathBuf::from("angel-data"));
        let mut cfg = Self::with_data_dir(data_dir);

        if let Some(p) = env_path("ANGEL_SESSION_DIR") {
            cfg.session_dir = p;
        }
        if let Some(p) = env_path("ANGEL_SANDBOX_DIR") {
            cfg.sandbox_dir = p;
        }
        if let Some(p) = env_path("ANGEL_CATALOG_PATH") {
            cfg.catalog_path = p;
        }
        if std::env::var("ANGEL_IN_MEMORY").map(|v| v == "1" || v == "true").unwrap_or(false) {
            cfg.in_memory = true;
        }
        if let Some(n) = env_parse::<usize>("ANGEL_ATTACH_CAP") {
            cfg.attach_cap = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("ANGEL_ATTACH_IDLE_TTL_SECS") {
            cfg.attach_idle_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("ANGEL_WATCHER_DEBOUNCE_MS") {
            cfg.watcher_debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("ANGEL_POLL_INTERVAL_SECS") {
            cfg.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("ANGEL_TEMP_SESSION_TTL_SECS") {
            cfg.temp_session_ttl = Duration::from_secs(secs);
        }
        cfg
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(v) => match v.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!(key, value = %v, "ignoring unparsable env override");
                None
            }
        },
        Err(_) => None,
    }
}
