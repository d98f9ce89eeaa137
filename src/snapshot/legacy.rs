//! Import of the flat `history.json` file written by earlier deployments: an
//! array of `{timestamp: "YYYY-MM-DD HH:MM:SS", candidates: [{name, percent}]}`.
//! Timestamps carry no offset and are stored verbatim; the store reads them in
//! the canonical offset.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::params;
use serde::Deserialize;
use tracing::warn;

use crate::snapshot::round_percent;
use crate::snapshot::store::SnapshotStore;

const LEGACY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Deserialize)]
struct LegacyItem {
    timestamp: String,
    #[serde(default)]
    candidates: Vec<LegacyCandidate>,
}

#[derive(Debug, Deserialize)]
struct LegacyCandidate {
    name: Option<String>,
    percent: Option<f64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub snapshots: usize,
    pub rows: usize,
    pub skipped: usize,
}

pub fn import_history_file(
    store: &SnapshotStore,
    path: &Path,
    board: &str,
) -> Result<ImportSummary> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed reading history file: {}", path.display()))?;
    import_history_json(store, &data, board)
        .with_context(|| format!("failed importing history file: {}", path.display()))
}

/// Inserts the whole file as one transaction.
pub fn import_history_json(
    store: &SnapshotStore,
    data: &str,
    board: &str,
) -> Result<ImportSummary> {
    let items: Vec<LegacyItem> = serde_json::from_str(data).context("invalid history JSON")?;
    let mut summary = ImportSummary::default();
    let mut rows: Vec<(String, String, f64)> = Vec::new();
    for item in items {
        if NaiveDateTime::parse_from_str(&item.timestamp, LEGACY_FORMAT).is_err() {
            warn!("skipping history item with bad timestamp: {}", item.timestamp);
            summary.skipped += 1;
            continue;
        }
        summary.snapshots += 1;
        for candidate in item.candidates {
            match (candidate.name, candidate.percent) {
                (Some(name), Some(percent)) if !name.trim().is_empty() => {
                    rows.push((item.timestamp.clone(), name, round_percent(percent)));
                }
                _ => summary.skipped += 1,
            }
        }
    }

    let mut conn = store.pool().get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            r#"
INSERT INTO vote_observations(observed_at, board, candidate_name, percent, real_percent)
VALUES (?1, ?2, ?3, ?4, NULL)
"#,
        )?;
        for (timestamp, name, percent) in &rows {
            stmt.execute(params![timestamp, board, name, percent])?;
        }
    }
    tx.commit()?;
    summary.rows = rows.len();
    Ok(summary)
}
