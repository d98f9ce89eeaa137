use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::history::Interval;
use crate::source::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default = "default_boards")]
    pub boards: Vec<BoardConfig>,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_session_secret")]
    pub session_secret: String,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    /// Canonical timezone, expressed as a fixed UTC offset such as `+07:00`.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub dense_window: Option<DenseWindowConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseWindowConfig {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    #[serde(default = "default_dense_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_name_path")]
    pub name_path: String,
    #[serde(default = "default_ratio_path")]
    pub ratio_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_anonymous_cap")]
    pub anonymous_cap: usize,
    #[serde(default)]
    pub require_auth: bool,
    /// Down-sampling step in minutes, keyed by interval token (`"7d" = 30`).
    #[serde(default)]
    pub step_minutes: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub db_path: Option<String>,
    pub session_secret: Option<String>,
    pub utc_offset: Option<String>,
    pub retention_days: Option<u32>,
    pub anonymous_cap: Option<usize>,
    pub interval_secs: Option<u64>,
    pub ingestion_enabled: Option<bool>,
}

impl Config {
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".config/vote-tracker/config.toml")
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(Self::default_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("failed reading config: {}", path.display()))?;
        let parsed: Self = toml::from_str(&data)
            .with_context(|| format!("failed parsing TOML config: {}", path.display()))?;
        Ok(parsed)
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(db_path) = overrides.db_path {
            self.storage.db_path = db_path;
        }
        if let Some(secret) = overrides.session_secret {
            self.server.session_secret = secret;
        }
        if let Some(offset) = overrides.utc_offset {
            self.time.utc_offset = offset;
        }
        if let Some(days) = overrides.retention_days {
            self.storage.retention_days = days;
        }
        if let Some(cap) = overrides.anonymous_cap {
            self.history.anonymous_cap = cap;
        }
        if let Some(secs) = overrides.interval_secs {
            self.ingestion.interval_secs = secs;
        }
        if let Some(enabled) = overrides.ingestion_enabled {
            self.ingestion.enabled = enabled;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.canonical_offset()?;
        if self.boards.is_empty() {
            return Err(anyhow!("at least one [[boards]] entry is required"));
        }
        let mut seen = BTreeSet::new();
        for board in &self.boards {
            if board.id.trim().is_empty() {
                return Err(anyhow!("board id cannot be empty"));
            }
            if !seen.insert(board.id.as_str()) {
                return Err(anyhow!("duplicate board id: {}", board.id));
            }
        }
        if !(1..=MAX_INTERVAL_SECS).contains(&self.ingestion.interval_secs) {
            return Err(anyhow!(
                "ingestion.interval_secs must be between 1 and {MAX_INTERVAL_SECS}"
            ));
        }
        if let Some(window) = &self.ingestion.dense_window {
            if window.end <= window.start {
                return Err(anyhow!("ingestion.dense_window.end must be after start"));
            }
            if !(1..=MAX_INTERVAL_SECS).contains(&window.interval_secs) {
                return Err(anyhow!(
                    "ingestion.dense_window.interval_secs must be between 1 and {MAX_INTERVAL_SECS}"
                ));
            }
        }
        for token in self.history.step_minutes.keys() {
            if Interval::from_token(token).is_none() {
                return Err(anyhow!("unknown interval in history.step_minutes: {token}"));
            }
        }
        Ok(())
    }

    pub fn canonical_offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.time.utc_offset)
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.storage.retention_days))
    }

    pub fn step_for(&self, interval: Interval) -> Option<u32> {
        self.history
            .step_minutes
            .get(interval.as_token())
            .copied()
            .filter(|step| *step > 0)
    }

    pub fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed creating config directory: {}", parent.display())
            })?;
        }
        fs::write(path, Self::default_template())
            .with_context(|| format!("failed writing config template: {}", path.display()))
    }

    pub fn default_template() -> String {
        let template = r#"[server]
host = "127.0.0.1"
port = 3001
# Signs session cookies. Change this before exposing the server.
session_secret = "change-me"
session_ttl_hours = 168

[storage]
db_path = "~/.local/share/vote-tracker/votes.db"
retention_days = 7

[time]
utc_offset = "+07:00"

[ingestion]
enabled = true
interval_secs = 600
timeout_secs = 20

# [ingestion.dense_window]
# start = "2025-01-05T19:00:00+07:00"
# end = "2025-01-05T22:00:00+07:00"
# interval_secs = 60

[ingestion.retry]
max_attempts = 3
base_delay_ms = 4000
max_delay_ms = 10000

[[boards]]
id = "main"
url = "https://yvoting-service.onfan.vn/api/v1/nominations?awardId=49afae89-7cba-481b-9049-28d76f4a2ea8"
name_path = "character.name"
ratio_path = "ratioVotes"

[history]
anonymous_cap = 30
require_auth = false

[history.step_minutes]
"3d" = 10
"7d" = 30
"#;
        template.to_string()
    }
}

impl IngestionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }
}

pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow!("invalid UTC offset"));
    }
    let (sign, rest) = match trimmed.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(anyhow!("UTC offset must start with + or -: {raw}")),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None => (rest, "0"),
    };
    let hours: i32 = hours
        .parse()
        .with_context(|| format!("invalid hours in UTC offset: {raw}"))?;
    let minutes: i32 = minutes
        .parse()
        .with_context(|| format!("invalid minutes in UTC offset: {raw}"))?;
    if hours > 14 || minutes >= 60 {
        return Err(anyhow!("UTC offset out of range: {raw}"));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow!("UTC offset out of range: {raw}"))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            time: TimeConfig::default(),
            ingestion: IngestionConfig::default(),
            boards: default_boards(),
            history: HistoryConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            session_secret: default_session_secret(),
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            dense_window: None,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            anonymous_cap: default_anonymous_cap(),
            require_auth: false,
            step_minutes: BTreeMap::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_session_secret() -> String {
    "change-me".to_string()
}

fn default_session_ttl_hours() -> u32 {
    168
}

fn default_db_path() -> String {
    "~/.local/share/vote-tracker/votes.db".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_utc_offset() -> String {
    "+07:00".to_string()
}

/// Polling steps are aligned within a day, so one day is the longest step.
pub const MAX_INTERVAL_SECS: u64 = 24 * 3600;

fn default_interval_secs() -> u64 {
    600
}

fn default_dense_interval_secs() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    4_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_boards() -> Vec<BoardConfig> {
    vec![BoardConfig {
        id: "main".to_string(),
        url: "https://yvoting-service.onfan.vn/api/v1/nominations?awardId=49afae89-7cba-481b-9049-28d76f4a2ea8".to_string(),
        name_path: default_name_path(),
        ratio_path: default_ratio_path(),
    }]
}

fn default_name_path() -> String {
    "character.name".to_string()
}

fn default_ratio_path() -> String {
    "ratioVotes".to_string()
}

fn default_anonymous_cap() -> usize {
    30
}

fn default_true() -> bool {
    true
}
