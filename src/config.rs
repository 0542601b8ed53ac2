//! Engine configuration loaded from a TOML file.
//!
//! The engine only reads configuration. Every section is optional and falls
//! back to defaults, so an empty file is a valid configuration:
//!
//! ```toml
//! output_dir = "./download"
//!
//! [downloads]
//! backend = "external"
//! retry_count = 3
//!
//! [fast_download]
//! enabled = true
//! key = "..."
//!
//! [flaresolverr]
//! enabled = true
//! url = "http://localhost:8191"
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::backend::BackendKind;

/// Default per-mirror attempt cap.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default fast download API endpoint.
pub const DEFAULT_FAST_DOWNLOAD_API: &str = "https://annas-archive.org/dyn/api/fast_download.json";

/// Default catalog source.
pub const DEFAULT_SOURCE_BASE_URL: &str = "https://annas-archive.org";

/// Default challenge relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "http://localhost:8191";

const RELAY_TIMEOUT_MIN_SECS: u64 = 10;
const RELAY_TIMEOUT_MAX_SECS: u64 = 300;

const MASK: &str = "********";

/// Host fragments that mark an anchor on the source page as a mirror link.
pub const DEFAULT_MIRROR_PATTERNS: &[&str] = &[
    "libgen.li",
    "libgen.is",
    "libgen.st",
    "library.lol",
    "z-lib",
    "zlibrary",
    "sci-hub",
    "nexusstc",
    "/slow_download/",
];

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {message}")]
    Invalid {
        /// Dotted field name, e.g. `downloads.retry_count`.
        field: &'static str,
        /// What is wrong with the value.
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Where verified artifacts are placed.
    pub output_dir: PathBuf,
    /// Where in-flight `.part` files live. Defaults to `<output_dir>/incomplete`.
    pub incomplete_dir: Option<PathBuf>,
    pub downloads: DownloadSettings,
    pub source: SourceSettings,
    pub fast_download: FastLaneSettings,
    pub flaresolverr: RelaySettings,
    pub external: ExternalSettings,
    pub queue: QueueSettings,
    pub logging: LoggingSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("download"),
            incomplete_dir: None,
            downloads: DownloadSettings::default(),
            source: SourceSettings::default(),
            fast_download: FastLaneSettings::default(),
            flaresolverr: RelaySettings::default(),
            external: ExternalSettings::default(),
            queue: QueueSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Transfer, retry, and scheduling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadSettings {
    /// Preferred backend; the external one falls back to streaming when unreachable.
    pub backend: BackendKind,
    /// Attempts per mirror before advancing to the next one.
    pub retry_count: u32,
    /// First same-mirror backoff delay.
    pub backoff_base_ms: u64,
    /// Upper bound for any single backoff delay.
    pub backoff_max_ms: u64,
    /// How often an active backend transfer is polled.
    pub poll_interval_ms: u64,
    /// Pause between consecutive queue items.
    pub delay_secs: u64,
    /// Attempts for fetching the source page.
    pub resolve_attempts: u32,
    /// Host fragment of a mirror that should be tried first.
    pub prefer_mirror: Option<String>,
    /// Resolve the next queued item while the current transfer runs.
    pub prefetch: bool,
    /// Follow scraped mirror pages to their direct file link.
    pub follow_mirror_pages: bool,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Streaming,
            retry_count: DEFAULT_RETRY_COUNT,
            backoff_base_ms: 1_000,
            backoff_max_ms: 32_000,
            poll_interval_ms: 1_000,
            delay_secs: 0,
            resolve_attempts: 3,
            prefer_mirror: None,
            prefetch: true,
            follow_mirror_pages: true,
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
        }
    }
}

impl DownloadSettings {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Catalog source page settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSettings {
    /// Base URL; item pages live at `{base_url}/md5/{id}`.
    pub base_url: String,
    /// Substrings an anchor `href` must contain to count as a mirror link.
    pub mirror_patterns: Vec<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SOURCE_BASE_URL.to_string(),
            mirror_patterns: DEFAULT_MIRROR_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

/// Fast-lane (membership fast download) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FastLaneSettings {
    pub enabled: bool,
    pub key: Option<String>,
    pub api_url: String,
    pub path_index: u32,
    pub domain_index: u32,
}

impl Default for FastLaneSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            key: None,
            api_url: DEFAULT_FAST_DOWNLOAD_API.to_string(),
            path_index: 0,
            domain_index: 0,
        }
    }
}

impl FastLaneSettings {
    /// Returns the key when the fast lane is enabled and a non-empty key is set.
    #[must_use]
    pub fn active_key(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Challenge relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaySettings {
    pub enabled: bool,
    pub url: String,
    /// Solver timeout; clamped to 10..=300 seconds.
    pub timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: DEFAULT_RELAY_URL.to_string(),
            timeout_secs: 60,
        }
    }
}

impl RelaySettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(
            self.timeout_secs
                .clamp(RELAY_TIMEOUT_MIN_SECS, RELAY_TIMEOUT_MAX_SECS),
        )
    }
}

/// External multi-connection downloader control endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExternalSettings {
    pub host: String,
    pub port: u16,
    pub secret: Option<String>,
}

impl Default for ExternalSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6800,
            secret: None,
        }
    }
}

impl ExternalSettings {
    /// JSON-RPC endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}/jsonrpc", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    /// History records kept before the oldest is evicted.
    pub max_history: usize,
    /// JSON file holding the queue and history between runs.
    pub state_file: Option<PathBuf>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_history: 100,
            state_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: String,
    /// Directory for daily rolling log files; stderr only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl LoggingSettings {
    /// Normalized tracing level name, or `None` when unrecognized.
    #[must_use]
    pub fn normalized_level(&self) -> Option<&'static str> {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "trace" => Some("trace"),
            "debug" => Some("debug"),
            "info" => Some("info"),
            "warn" | "warning" => Some("warn"),
            "error" => Some("error"),
            _ => None,
        }
    }
}

impl EngineConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Loads the file when it exists, otherwise returns defaults.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load) for an existing file.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and URL syntax.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let downloads = &self.downloads;
        if !(1..=10).contains(&downloads.retry_count) {
            return Err(ConfigError::invalid(
                "downloads.retry_count",
                format!("{}. Expected range: 1..=10", downloads.retry_count),
            ));
        }
        if downloads.backoff_max_ms > 600_000 {
            return Err(ConfigError::invalid(
                "downloads.backoff_max_ms",
                format!("{}. Expected range: 0..=600000", downloads.backoff_max_ms),
            ));
        }
        if downloads.backoff_base_ms > downloads.backoff_max_ms {
            return Err(ConfigError::invalid(
                "downloads.backoff_base_ms",
                format!(
                    "{} exceeds downloads.backoff_max_ms ({})",
                    downloads.backoff_base_ms, downloads.backoff_max_ms
                ),
            ));
        }
        if !(10..=60_000).contains(&downloads.poll_interval_ms) {
            return Err(ConfigError::invalid(
                "downloads.poll_interval_ms",
                format!("{}. Expected range: 10..=60000", downloads.poll_interval_ms),
            ));
        }
        if !(1..=10).contains(&downloads.resolve_attempts) {
            return Err(ConfigError::invalid(
                "downloads.resolve_attempts",
                format!("{}. Expected range: 1..=10", downloads.resolve_attempts),
            ));
        }
        validate_timeout_secs("downloads.connect_timeout_secs", downloads.connect_timeout_secs)?;
        validate_timeout_secs("downloads.read_timeout_secs", downloads.read_timeout_secs)?;

        validate_http_url("source.base_url", &self.source.base_url)?;
        if self.source.mirror_patterns.iter().all(|p| p.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "source.mirror_patterns",
                "at least one non-empty pattern is required",
            ));
        }
        validate_http_url("fast_download.api_url", &self.fast_download.api_url)?;
        if self.flaresolverr.enabled {
            validate_http_url("flaresolverr.url", &self.flaresolverr.url)?;
        }
        if self.external.host.trim().is_empty() {
            return Err(ConfigError::invalid("external.host", "must not be empty"));
        }
        if self.external.port == 0 {
            return Err(ConfigError::invalid("external.port", "must not be 0"));
        }
        if !(1..=10_000).contains(&self.queue.max_history) {
            return Err(ConfigError::invalid(
                "queue.max_history",
                format!("{}. Expected range: 1..=10000", self.queue.max_history),
            ));
        }
        if self.logging.normalized_level().is_none() {
            return Err(ConfigError::invalid(
                "logging.level",
                format!(
                    "'{}'. Use one of: trace, debug, info, warn, error",
                    self.logging.level
                ),
            ));
        }
        Ok(())
    }

    /// Directory for in-flight transfers.
    #[must_use]
    pub fn incomplete_dir(&self) -> PathBuf {
        self.incomplete_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join("incomplete"))
    }

    /// Copy with the fast-lane key and external secret replaced by a mask.
    #[must_use]
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        if masked.fast_download.key.is_some() {
            masked.fast_download.key = Some(MASK.to_string());
        }
        if masked.external.secret.is_some() {
            masked.external.secret = Some(MASK.to_string());
        }
        masked
    }

    /// Renders the configuration as TOML with secrets masked.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if a value cannot be represented in TOML.
    pub fn to_masked_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&self.masked())
    }
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value) {
        return Err(ConfigError::invalid(
            field,
            format!("{value}. Expected range: 1..=3600"),
        ));
    }
    Ok(())
}

fn validate_http_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        Ok(url) => Err(ConfigError::invalid(
            field,
            format!("unsupported scheme '{}' in {value}", url.scheme()),
        )),
        Err(e) => Err(ConfigError::invalid(field, format!("'{value}': {e}"))),
    }
}

/// Resolves the default config file path.
///
/// Lookup order:
/// 1. `$XDG_CONFIG_HOME/stacks/config.toml`
/// 2. `$HOME/.config/stacks/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("stacks").join("config.toml"));
    }
    env_var_non_empty_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("stacks")
            .join("config.toml")
    })
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    env::var_os(name).filter(|value| !value.is_empty())
}
