use std::collections::BTreeMap;

use crate::history::QueryError;
use crate::snapshot::store::SnapshotStore;
use crate::snapshot::{CandidatePercent, Snapshot};

/// All observations at the board's latest timestamp, or `None` when the board
/// has no data yet.
pub fn latest_snapshot(store: &SnapshotStore, board: &str) -> Result<Option<Snapshot>, QueryError> {
    let Some(timestamp) = store.latest(Some(board))? else {
        return Ok(None);
    };
    let candidates = store
        .at(&timestamp, Some(board))?
        .iter()
        .map(CandidatePercent::from)
        .collect();
    Ok(Some(Snapshot {
        timestamp,
        candidates,
    }))
}

/// Latest snapshot for each board. Boards without data map to `None` rather
/// than being left out.
pub fn current_by_board(
    store: &SnapshotStore,
    boards: &[String],
) -> Result<BTreeMap<String, Option<Snapshot>>, QueryError> {
    let mut out = BTreeMap::new();
    for board in boards {
        out.insert(board.clone(), latest_snapshot(store, board)?);
    }
    Ok(out)
}
