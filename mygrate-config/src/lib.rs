//! Loads the agent's INI-style configuration file and exposes it as typed
//! sections, mirroring the section/key layout of the original Python tool
//! rather than inventing a new schema.
//!
//! Resolution order for the config file path: `MYGRATE_CONFIG` env var, then
//! `~/.mygrate.conf`, then `/etc/mygrate.conf`. The first of these that
//! parses successfully wins; finding none is a fatal [`ConfigError::NotFound`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ini::Ini;
use mygrate_errors::ConfigError;
use tracing::debug;

const DEFAULT_BINLOG_INDEX: &str = "/var/log/mysql/mysql-bin.index";
const DEFAULT_TRACKING_DELAY: f64 = 1.0;
const DEFAULT_ERRORS_LOG: &str = "/dev/null";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: u64 = 180;

/// Connection parameters for schema lookup and bulk import, plus the binlog
/// index path, all read from the `[database]` section.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub unix_socket: Option<String>,
    pub binlog_index: PathBuf,
}

/// The `[tracker]` section: where cursor files live and how long to sleep
/// between sweeps.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub tracking_dir: PathBuf,
    pub tracking_delay: f64,
}

/// The `[queue]` section: broker endpoint and retry/error-log policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub broker_url: String,
    pub errors_log: PathBuf,
    pub max_retries: u32,
    pub retry_delay: u64,
}

/// The `[callbacks]` section: `db.table` keys mapped to an opaque
/// module-reference string. Resolving that string into an actual handler is
/// the caller's responsibility (see `mygrate-callbacks`).
pub type CallbacksConfig = BTreeMap<String, String>;

/// The fully loaded, validated configuration for one agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub database: DatabaseConfig,
    pub tracker: TrackerConfig,
    pub queue: QueueConfig,
    pub callbacks: CallbacksConfig,
}

impl AgentConfig {
    /// Locates and parses the configuration file, validating every section.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::resolve_path()?;
        Self::load_from(&path)
    }

    /// Parses a specific file, bypassing the search-path resolution. Exposed
    /// for tests and for tools that accept an explicit `--config` override.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|err| ConfigError::Parse {
            path: path.to_owned(),
            message: err.to_string(),
        })?;

        let database = Self::parse_database(&ini)?;
        let tracker = Self::parse_tracker(&ini)?;
        let queue = Self::parse_queue(&ini)?;
        let callbacks = Self::parse_callbacks(&ini)?;

        debug!(?path, tables = callbacks.len(), "loaded mygrate configuration");

        Ok(AgentConfig {
            database,
            tracker,
            queue,
            callbacks,
        })
    }

    fn resolve_path() -> Result<PathBuf, ConfigError> {
        if let Ok(env_path) = std::env::var("MYGRATE_CONFIG") {
            return Ok(expand_home(&env_path));
        }

        let mut candidates = Vec::new();
        if let Some(home) = home_dir() {
            candidates.push(home.join(".mygrate.conf"));
        }
        candidates.push(PathBuf::from("/etc/mygrate.conf"));

        for candidate in &candidates {
            if candidate.is_file() {
                return Ok(candidate.clone());
            }
        }

        Err(ConfigError::NotFound(candidates))
    }

    fn parse_database(ini: &Ini) -> Result<DatabaseConfig, ConfigError> {
        let section = ini.section(Some("database"));
        let get = |key: &str| section.and_then(|s| s.get(key)).map(str::to_owned);

        let port = match get("port") {
            Some(raw) => Some(raw.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                section: "database".into(),
                key: "port".into(),
                message: format!("{raw:?} is not a valid port number"),
            })?),
            None => None,
        };

        let binlog_index = get("binlog_index")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BINLOG_INDEX));

        Ok(DatabaseConfig {
            host: get("host"),
            port,
            user: get("user"),
            password: get("password"),
            unix_socket: get("unix_socket"),
            binlog_index,
        })
    }

    fn parse_tracker(ini: &Ini) -> Result<TrackerConfig, ConfigError> {
        let section = ini.section(Some("tracker"));
        let get = |key: &str| section.and_then(|s| s.get(key));

        let tracking_dir = match get("tracking_dir") {
            Some(raw) => expand_home(raw),
            None => home_dir()
                .map(|h| h.join(".binlog-tracking"))
                .ok_or_else(|| ConfigError::MissingOption {
                    section: "tracker".into(),
                    key: "tracking_dir".into(),
                })?,
        };

        if !tracking_dir.is_dir() {
            std::fs::create_dir_all(&tracking_dir).map_err(|_| {
                ConfigError::TrackingDirMissing(tracking_dir.clone())
            })?;
        }

        let tracking_delay = match get("tracking_delay") {
            Some(raw) => raw.parse::<f64>().map_err(|_| ConfigError::InvalidValue {
                section: "tracker".into(),
                key: "tracking_delay".into(),
                message: format!("{raw:?} is not a valid float"),
            })?,
            None => DEFAULT_TRACKING_DELAY,
        };

        Ok(TrackerConfig {
            tracking_dir,
            tracking_delay,
        })
    }

    fn parse_queue(ini: &Ini) -> Result<QueueConfig, ConfigError> {
        let section = ini.section(Some("queue"));
        let get = |key: &str| section.and_then(|s| s.get(key));

        let broker_url = get("broker_url")
            .map(str::to_owned)
            .ok_or_else(|| ConfigError::MissingOption {
                section: "queue".into(),
                key: "broker_url".into(),
            })?;

        let errors_log = get("errors_log")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ERRORS_LOG));

        let max_retries = match get("max_retries") {
            Some(raw) => raw.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                section: "queue".into(),
                key: "max_retries".into(),
                message: format!("{raw:?} is not a valid integer"),
            })?,
            None => DEFAULT_MAX_RETRIES,
        };

        let retry_delay = match get("retry_delay") {
            Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                section: "queue".into(),
                key: "retry_delay".into(),
                message: format!("{raw:?} is not a valid integer"),
            })?,
            None => DEFAULT_RETRY_DELAY,
        };

        Ok(QueueConfig {
            broker_url,
            errors_log,
            max_retries,
            retry_delay,
        })
    }

    fn parse_callbacks(ini: &Ini) -> Result<CallbacksConfig, ConfigError> {
        let Some(section) = ini.section(Some("callbacks")) else {
            // An agent with zero registered tables is legal (it just never matches
            // anything); only a missing `[callbacks]` header at all is unusual, but
            // the original tool treats it the same way - an empty binding set.
            return Ok(BTreeMap::new());
        };

        Ok(section
            .iter()
            .map(|(table, module_ref)| (table.to_owned(), module_ref.to_owned()))
            .collect())
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}
