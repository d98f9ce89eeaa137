pub mod legacy;
pub mod migrations;
pub mod store;

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::source::CandidateRatio;

/// Timestamps are always held in the canonical offset once read from the store.
pub type Timestamp = DateTime<FixedOffset>;

/// Display format used by every API payload.
pub const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteObservation {
    pub timestamp: Timestamp,
    pub board: String,
    pub candidate_name: String,
    pub percent: f64,
    pub real_percent: Option<f64>,
}

impl VoteObservation {
    pub fn from_ratio(
        timestamp: Timestamp,
        board: impl Into<String>,
        ratio: &CandidateRatio,
    ) -> Self {
        Self {
            timestamp,
            board: board.into(),
            candidate_name: ratio.name.clone(),
            percent: round_percent(ratio.ratio),
            real_percent: Some(ratio.ratio),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePercent {
    pub name: String,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_percent: Option<f64>,
}

impl From<&VoteObservation> for CandidatePercent {
    fn from(obs: &VoteObservation) -> Self {
        Self {
            name: obs.candidate_name.clone(),
            percent: obs.percent,
            real_percent: obs.real_percent,
        }
    }
}

/// Observations sharing one (bucketed) timestamp on one board.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    #[serde(serialize_with = "serialize_display")]
    pub timestamp: Timestamp,
    pub candidates: Vec<CandidatePercent>,
}

pub fn round_percent(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Current wall-clock time in the canonical offset, truncated to whole seconds.
pub fn now_in(offset: FixedOffset) -> Timestamp {
    let now = Utc::now().with_timezone(&offset);
    now.with_nanosecond(0).unwrap_or(now)
}

pub fn to_storage(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

pub fn to_display(ts: &Timestamp) -> String {
    ts.format(DISPLAY_FORMAT).to_string()
}

/// Reads a stored timestamp into the canonical offset. Values carrying an
/// explicit offset are converted; values without one are taken as canonical
/// local time.
pub fn normalize_stored(raw: &str, offset: FixedOffset) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(aware) = DateTime::parse_from_rfc3339(raw) {
        return Some(aware.with_timezone(&offset));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
}

/// Drops seconds and sub-second precision.
pub fn floor_to_minute(ts: &Timestamp) -> Timestamp {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(*ts)
}

fn serialize_display<S: Serializer>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&to_display(ts))
}
