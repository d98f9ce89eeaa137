pub mod http;
pub mod retry;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::BoardConfig;

/// One candidate's share of the vote as reported by the upstream board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRatio {
    pub name: String,
    pub ratio: f64,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("GET {url} returned {status}: {preview}")]
    Status {
        url: String,
        status: StatusCode,
        preview: String,
    },
    #[error("invalid payload from {url}: {message}")]
    Decode { url: String, message: String },
}

impl UpstreamError {
    /// Client errors other than 408/429 will not change on a retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                !status.is_client_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Transport { .. } | Self::Timeout { .. } | Self::Decode { .. } => true,
        }
    }
}

/// A single record in an otherwise valid payload that lacks a usable field.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("entry #{index}: {reason}")]
pub struct MalformedEntry {
    pub index: usize,
    pub reason: String,
}

#[async_trait]
pub trait VoteSource: Send + Sync {
    async fn fetch(&self, board: &BoardConfig) -> Result<Vec<CandidateRatio>, UpstreamError>;
}
