pub mod scheduler;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{BoardConfig, Config};
use crate::snapshot::store::{SnapshotStore, StoreError};
use crate::snapshot::{now_in, to_display, Timestamp, VoteObservation};
use crate::source::http::HttpVoteSource;
use crate::source::retry::RetryingSource;
use crate::source::{CandidateRatio, UpstreamError, VoteSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStage {
    Fetching,
    Transforming,
    Persisting,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardFailure {
    pub board: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub started_at: String,
    pub stage: TickStage,
    pub boards_fetched: Vec<String>,
    pub failures: Vec<BoardFailure>,
    pub rows_written: usize,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed persisting observations: {0}")]
    Persistence(#[from] StoreError),
    #[error("store worker failed: {0}")]
    Worker(String),
}

/// Fetch → transform → persist for every configured board, one tick at a time.
pub struct Pipeline {
    source: Arc<dyn VoteSource>,
    store: SnapshotStore,
    boards: Vec<BoardConfig>,
    retention: chrono::Duration,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn VoteSource>,
        store: SnapshotStore,
        boards: Vec<BoardConfig>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            source,
            store,
            boards,
            retention,
        }
    }

    /// The production wiring: an HTTP source wrapped in the configured retry
    /// budget, over every configured board.
    pub fn from_config(config: &Config, store: SnapshotStore) -> Result<Self, UpstreamError> {
        let http = HttpVoteSource::new(&config.ingestion.user_agent, config.ingestion.timeout())?;
        let source = RetryingSource::new(http, config.ingestion.retry_policy());
        Ok(Self::new(
            Arc::new(source),
            store,
            config.boards.clone(),
            config.retention(),
        ))
    }

    pub async fn run_tick(&self) -> Result<TickReport, IngestError> {
        self.run_tick_at(now_in(self.store.offset())).await
    }

    /// Every observation written by this tick carries `started_at`. A board
    /// whose fetch fails is recorded in the report and skipped; the rows of
    /// the remaining boards are written as a single batch.
    pub async fn run_tick_at(&self, started_at: Timestamp) -> Result<TickReport, IngestError> {
        let mut report = TickReport {
            started_at: to_display(&started_at),
            stage: TickStage::Fetching,
            boards_fetched: Vec::new(),
            failures: Vec::new(),
            rows_written: 0,
        };

        let mut fetched: Vec<(&BoardConfig, Vec<CandidateRatio>)> = Vec::new();
        for board in &self.boards {
            match self.source.fetch(board).await {
                Ok(candidates) => {
                    debug!("board {}: fetched {} candidates", board.id, candidates.len());
                    report.boards_fetched.push(board.id.clone());
                    fetched.push((board, candidates));
                }
                Err(err) => {
                    warn!("board {}: fetch abandoned: {err}", board.id);
                    report.failures.push(BoardFailure {
                        board: board.id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        if fetched.is_empty() {
            report.stage = TickStage::Failed;
            warn!("tick {}: no board could be fetched", report.started_at);
            return Ok(report);
        }

        report.stage = TickStage::Transforming;
        let observations = transform(started_at, &fetched);

        report.stage = TickStage::Persisting;
        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || store.insert_batch(&observations))
            .await
            .map_err(|err| IngestError::Worker(err.to_string()))??;

        report.rows_written = written;
        report.stage = TickStage::Done;
        info!(
            "tick {}: wrote {} rows from {} board(s), {} failed",
            report.started_at,
            written,
            report.boards_fetched.len(),
            report.failures.len()
        );
        Ok(report)
    }

    pub async fn prune(&self) -> Result<usize, IngestError> {
        self.prune_at(now_in(self.store.offset())).await
    }

    /// Deletes observations older than the retention horizon. Runs in its own
    /// transaction, separate from any ingest.
    pub async fn prune_at(&self, now: Timestamp) -> Result<usize, IngestError> {
        let cutoff = now - self.retention;
        let store = self.store.clone();
        let deleted = tokio::task::spawn_blocking(move || store.delete_older_than(&cutoff))
            .await
            .map_err(|err| IngestError::Worker(err.to_string()))??;
        if deleted > 0 {
            info!("retention cleanup removed {deleted} rows older than {}", to_display(&cutoff));
        }
        Ok(deleted)
    }
}

/// Builds co-timestamped observations, keeping the first entry for a
/// candidate name repeated within one board's payload.
pub fn transform(
    timestamp: Timestamp,
    fetched: &[(&BoardConfig, Vec<CandidateRatio>)],
) -> Vec<VoteObservation> {
    let mut out = Vec::new();
    for (board, candidates) in fetched {
        let mut seen = BTreeSet::new();
        for candidate in candidates {
            if !seen.insert(candidate.name.as_str()) {
                warn!("board {}: duplicate candidate {} ignored", board.id, candidate.name);
                continue;
            }
            out.push(VoteObservation::from_ratio(timestamp, board.id.clone(), candidate));
        }
    }
    out
}
