pub mod current;
pub mod query;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::snapshot::store::StoreError;

pub use current::{current_by_board, latest_snapshot};
pub use query::{downsample, group_by_minute, run_query};

/// Look-back windows accepted by the history endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    TenMinutes,
    ThirtyMinutes,
    OneHour,
    FiveHours,
    OneDay,
    ThreeDays,
    SevenDays,
}

impl Interval {
    pub const ALL: [Interval; 7] = [
        Interval::TenMinutes,
        Interval::ThirtyMinutes,
        Interval::OneHour,
        Interval::FiveHours,
        Interval::OneDay,
        Interval::ThreeDays,
        Interval::SevenDays,
    ];

    pub const DEFAULT: Interval = Interval::OneDay;

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "10m" => Some(Self::TenMinutes),
            "30m" => Some(Self::ThirtyMinutes),
            "1h" => Some(Self::OneHour),
            "5h" => Some(Self::FiveHours),
            "1d" => Some(Self::OneDay),
            "3d" => Some(Self::ThreeDays),
            "7d" => Some(Self::SevenDays),
            _ => None,
        }
    }

    /// Unknown or missing tokens fall back to one day.
    pub fn parse_or_default(token: Option<&str>) -> Self {
        token.and_then(Self::from_token).unwrap_or(Self::DEFAULT)
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            Self::TenMinutes => "10m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::FiveHours => "5h",
            Self::OneDay => "1d",
            Self::ThreeDays => "3d",
            Self::SevenDays => "7d",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Self::TenMinutes => 10 * 60,
            Self::ThirtyMinutes => 30 * 60,
            Self::OneHour => 60 * 60,
            Self::FiveHours => 5 * 60 * 60,
            Self::OneDay => 24 * 60 * 60,
            Self::ThreeDays => 3 * 24 * 60 * 60,
            Self::SevenDays => 7 * 24 * 60 * 60,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.seconds())
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    Anonymous,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPolicy {
    pub anonymous_cap: usize,
    pub step_minutes: BTreeMap<Interval, u32>,
}

impl HistoryPolicy {
    pub fn from_config(config: &Config) -> Self {
        let step_minutes = Interval::ALL
            .iter()
            .filter_map(|interval| config.step_for(*interval).map(|step| (*interval, step)))
            .collect();
        Self {
            anonymous_cap: config.history.anonymous_cap,
            step_minutes,
        }
    }

    pub fn step_for(&self, interval: Interval) -> Option<u32> {
        self.step_minutes.get(&interval).copied().filter(|s| *s > 0)
    }
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            anonymous_cap: 30,
            step_minutes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub interval: Interval,
    pub board: Option<String>,
    pub candidates: Vec<String>,
    pub limit: Option<usize>,
    pub tier: AccessTier,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("query worker failed: {0}")]
    Worker(String),
}
