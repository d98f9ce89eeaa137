use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::BoardConfig;
use crate::source::{CandidateRatio, MalformedEntry, UpstreamError, VoteSource};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 6;
const PREVIEW_CHARS: usize = 180;

/// Fetches a board's nomination list over HTTP.
#[derive(Debug, Clone)]
pub struct HttpVoteSource {
    client: Client,
}

impl HttpVoteSource {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS).min(timeout))
            .build()
            .map_err(|err| UpstreamError::Transport {
                url: String::new(),
                message: format!("failed to build HTTP client: {err}"),
            })?;
        Ok(Self { client })
    }

    async fn fetch_json(&self, url: &str) -> Result<Value, UpstreamError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| transport_error(url, err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(url, err))?;
        if !status.is_success() {
            let preview: String = body.chars().take(PREVIEW_CHARS).collect();
            return Err(UpstreamError::Status {
                url: url.to_string(),
                status,
                preview,
            });
        }
        serde_json::from_str(&body).map_err(|err| UpstreamError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl VoteSource for HttpVoteSource {
    async fn fetch(&self, board: &BoardConfig) -> Result<Vec<CandidateRatio>, UpstreamError> {
        let payload = self.fetch_json(&board.url).await?;
        let Some(entries) = candidate_entries(&payload) else {
            return Err(UpstreamError::Decode {
                url: board.url.clone(),
                message: "payload has no candidate list".to_string(),
            });
        };
        let (candidates, skipped) = parse_candidates(entries, &board.name_path, &board.ratio_path);
        for entry in &skipped {
            warn!("board {}: skipping malformed entry {entry}", board.id);
        }
        debug!(
            "board {}: parsed {} candidates ({} skipped)",
            board.id,
            candidates.len(),
            skipped.len()
        );
        Ok(candidates)
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout {
            url: url.to_string(),
        }
    } else {
        UpstreamError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Locates the candidate array: either the payload itself or one of the usual
/// wrapper keys (`data`, `items`, ...), possibly nested one level.
pub fn candidate_entries(value: &Value) -> Option<&Vec<Value>> {
    if let Some(arr) = value.as_array() {
        return Some(arr);
    }
    let object = value.as_object()?;
    for key in ["data", "items", "result", "list", "nominations"] {
        let Some(v) = object_get_case_insensitive(object, key) else {
            continue;
        };
        if let Some(arr) = v.as_array() {
            return Some(arr);
        }
        if let Some(nested) = v.as_object() {
            for nested_key in ["items", "list", "data", "nominations"] {
                if let Some(arr) = object_get_case_insensitive(nested, nested_key)
                    .and_then(Value::as_array)
                {
                    return Some(arr);
                }
            }
        }
    }
    None
}

/// Extracts `(name, ratio)` pairs in payload order. Entries lacking a name or a
/// numeric ratio are returned separately instead of failing the whole payload.
pub fn parse_candidates(
    entries: &[Value],
    name_path: &str,
    ratio_path: &str,
) -> (Vec<CandidateRatio>, Vec<MalformedEntry>) {
    let mut candidates = Vec::with_capacity(entries.len());
    let mut skipped = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let Some(object) = entry.as_object() else {
            skipped.push(MalformedEntry {
                index,
                reason: "not an object".to_string(),
            });
            continue;
        };
        let Some(name) = object_path_value(object, name_path).and_then(as_name) else {
            skipped.push(MalformedEntry {
                index,
                reason: format!("missing `{name_path}`"),
            });
            continue;
        };
        let Some(ratio) = object_path_value(object, ratio_path)
            .and_then(to_f64)
            .filter(|v| v.is_finite())
        else {
            skipped.push(MalformedEntry {
                index,
                reason: format!("missing numeric `{ratio_path}` for {name}"),
            });
            continue;
        };
        candidates.push(CandidateRatio { name, ratio });
    }
    (candidates, skipped)
}

fn as_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn object_path_value<'a>(object: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = object_get_case_insensitive(object, first)?;
    for segment in segments {
        let nested = current.as_object()?;
        current = object_get_case_insensitive(nested, segment)?;
    }
    Some(current)
}

fn object_get_case_insensitive<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).or_else(|| {
        object
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let sanitized = s.trim().replace(',', "").replace('%', "");
            sanitized.parse::<f64>().ok()
        }
        _ => None,
    }
}
