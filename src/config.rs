/// Configuration for tierweave.
///
/// Configuration is a TOML document with a fixed, versioned set of sections.
/// Unknown fields are rejected rather than silently accepted. Every section has
/// defaults, so a missing file or an empty document is a valid configuration.
///
/// # Example
///
/// ```toml
/// version = 1
///
/// [retention]
/// short_term = "30d"
/// working = "90d"
/// long_term = "unlimited"
///
/// [backup]
/// keep_daily = 7
/// keep_weekly = 4
/// keep_monthly = 3
/// ```
use crate::error::{WeaveError, WeaveResult};
use crate::retry::RetryPolicy;
use crate::types::Tier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// The only configuration format version this build understands.
pub const CONFIG_VERSION: u32 = 1;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeaveConfig {
    pub version: u32,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub compression: CompressionConfig,
    pub cache: CacheConfig,
    pub backup: BackupConfig,
    pub integrity: IntegrityConfig,
    pub batch: BatchConfig,
    pub watch: WatchConfig,
}

impl Default for WeaveConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            compression: CompressionConfig::default(),
            cache: CacheConfig::default(),
            backup: BackupConfig::default(),
            integrity: IntegrityConfig::default(),
            batch: BatchConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl WeaveConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> WeaveResult<Self> {
        let config: WeaveConfig =
            toml::from_str(input).map_err(|e| WeaveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> WeaveResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Configuration rooted at a data directory: journal and backups live
    /// underneath it.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let mut config = Self::default();
        config.backup.dir = Some(dir.join("backups"));
        config.storage.data_dir = Some(dir);
        config
    }

    pub fn validate(&self) -> WeaveResult<()> {
        if self.version != CONFIG_VERSION {
            return Err(WeaveError::Config(format!(
                "unsupported config version {} (expected {})",
                self.version, CONFIG_VERSION
            )));
        }
        let c = &self.compression;
        if !(0.0..1.0).contains(&c.min_improvement) {
            return Err(WeaveError::Config(
                "compression.min_improvement must be in [0, 1)".into(),
            ));
        }
        if c.fast_level > 9 || c.max_level > 9 {
            return Err(WeaveError::Config("compression levels must be 0..=9".into()));
        }
        if self.batch.max_workers == 0 {
            return Err(WeaveError::Config("batch.max_workers must be positive".into()));
        }
        if self.integrity.max_retries == 0 {
            return Err(WeaveError::Config("integrity.max_retries must be positive".into()));
        }
        for (name, period) in [
            ("backup.interval", &self.backup.interval),
            ("integrity.check_interval", &self.integrity.check_interval),
            ("watch.poll_interval", &self.watch.poll_interval),
        ] {
            if period.get().is_zero() {
                return Err(WeaveError::Config(format!("{} must be positive", name)));
            }
        }
        for glob in self.watch.patterns.iter().chain(&self.watch.ignore) {
            crate::watch::glob_to_regex(glob)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding the journal; `None` keeps the store in memory
    pub data_dir: Option<PathBuf>,
    /// Append every revision to the on-disk journal
    pub journal: bool,
    pub journal_retry: RetryPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            journal: true,
            journal_retry: RetryPolicy::immediate(3),
        }
    }
}

/// How long records in a tier are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPeriod {
    Limited(Duration),
    Unlimited,
}

impl RetentionPeriod {
    pub fn as_chrono(&self) -> Option<chrono::Duration> {
        match self {
            RetentionPeriod::Limited(d) => chrono::Duration::from_std(*d).ok(),
            RetentionPeriod::Unlimited => None,
        }
    }
}

impl FromStr for RetentionPeriod {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unlimited" | "permanent" | "forever" => Ok(RetentionPeriod::Unlimited),
            other => parse_duration(other).map(RetentionPeriod::Limited),
        }
    }
}

impl fmt::Display for RetentionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPeriod::Unlimited => f.write_str("unlimited"),
            RetentionPeriod::Limited(d) => f.write_str(&format_duration(*d)),
        }
    }
}

impl Serialize for RetentionPeriod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RetentionPeriod {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A duration written as `"500ms"`, `"10s"`, `"15m"`, `"12h"` or `"30d"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn get(&self) -> Duration {
        self.0
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(self.0))
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s)
            .map(HumanDuration)
            .map_err(serde::de::Error::custom)
    }
}

/// Parse a duration string with a single unit suffix.
pub fn parse_duration(input: &str) -> WeaveResult<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| WeaveError::Config(format!("duration '{}' has no unit", input)))?;
    let (digits, unit) = input.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| WeaveError::Config(format!("invalid duration '{}'", input)))?;
    let secs = match unit {
        "ms" => return Ok(Duration::from_millis(amount)),
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3_600,
        "d" => amount * 86_400,
        "w" => amount * 7 * 86_400,
        other => {
            return Err(WeaveError::Config(format!(
                "unknown duration unit '{}' in '{}'",
                other, input
            )));
        }
    };
    Ok(Duration::from_secs(secs))
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_millis() != 0 || secs == 0 {
        format!("{}ms", d.as_millis())
    } else if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Per-tier retention durations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    pub short_term: RetentionPeriod,
    pub working: RetentionPeriod,
    pub long_term: RetentionPeriod,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            short_term: RetentionPeriod::Limited(Duration::from_secs(30 * 86_400)),
            working: RetentionPeriod::Limited(Duration::from_secs(90 * 86_400)),
            long_term: RetentionPeriod::Unlimited,
        }
    }
}

impl RetentionConfig {
    pub fn for_tier(&self, tier: Tier) -> RetentionPeriod {
        match tier {
            Tier::ShortTerm => self.short_term,
            Tier::Working => self.working,
            Tier::LongTerm => self.long_term,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressionConfig {
    /// Values smaller than this are stored raw
    pub threshold_bytes: usize,
    pub fast_level: u32,
    pub max_level: u32,
    /// Minimum fractional size reduction for a compressed result to be kept
    pub min_improvement: f64,
    /// Bound on the decompression cache
    pub cache_entries: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024,
            fast_level: 1,
            max_level: 9,
            min_improvement: 0.1,
            cache_entries: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Total byte budget of the LRU cache
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    /// Where snapshot files and the manifest live; `None` disables backups
    pub dir: Option<PathBuf>,
    /// Secret the encryption key is derived from
    pub passphrase: Option<String>,
    pub interval: HumanDuration,
    pub keep_daily: usize,
    pub keep_weekly: usize,
    pub keep_monthly: usize,
    pub retry: RetryPolicy,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: None,
            passphrase: None,
            interval: HumanDuration::from_secs(86_400),
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntegrityConfig {
    /// Attempts per recovery stage before falling through
    pub max_retries: usize,
    pub check_interval: HumanDuration,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            check_interval: HumanDuration::from_secs(6 * 3_600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub max_workers: usize,
    /// Per-item retry policy; `max_retries` is the batch retry count
    pub retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Glob patterns relative to the watched root, e.g. `**/*.json`
    pub patterns: Vec<String>,
    pub ignore: Vec<String>,
    pub poll_interval: HumanDuration,
    pub recursive: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            patterns: vec!["**/*".into()],
            ignore: vec!["**/.*".into()],
            poll_interval: HumanDuration::from_secs(5),
            recursive: true,
        }
    }
}
