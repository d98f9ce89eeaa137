use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{Days, FixedOffset, NaiveDate};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter};
use thiserror::Error;
use tracing::warn;

use crate::snapshot::migrations::BASE_MIGRATION;
use crate::snapshot::{normalize_stored, to_storage, Timestamp, VoteObservation};

pub type DbPool = Pool<SqliteConnectionManager>;

const POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed preparing database location: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only store of vote observations. Each call checks out its own pooled
/// connection; writes run inside a single transaction.
#[derive(Clone)]
pub struct SnapshotStore {
    pool: DbPool,
    offset: FixedOffset,
}

impl SnapshotStore {
    pub fn open(path: &Path, offset: FixedOffset) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")
        });
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;
        let store = Self { pool, offset };
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute_batch(BASE_MIGRATION)?;
        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Inserts every observation or none of them.
    pub fn insert_batch(&self, observations: &[VoteObservation]) -> Result<usize, StoreError> {
        if observations.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
INSERT INTO vote_observations(observed_at, board, candidate_name, percent, real_percent)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
            )?;
            for obs in observations {
                stmt.execute(params![
                    to_storage(&obs.timestamp),
                    obs.board,
                    obs.candidate_name,
                    obs.percent,
                    obs.real_percent
                ])?;
            }
        }
        tx.commit()?;
        Ok(observations.len())
    }

    /// Most recent observation time, optionally scoped to one board.
    pub fn latest(&self, board: Option<&str>) -> Result<Option<Timestamp>, StoreError> {
        let newest_date: Option<String> = {
            let conn = self.pool.get()?;
            conn.query_row(
                "SELECT MAX(substr(observed_at, 1, 10)) FROM vote_observations \
                 WHERE ?1 IS NULL OR board = ?1",
                params![board],
                |row| row.get(0),
            )?
        };
        let Some(newest_date) = newest_date else {
            return Ok(None);
        };
        let floor = NaiveDate::parse_from_str(&newest_date, "%Y-%m-%d")
            .map(date_floor)
            .unwrap_or_default();
        Ok(self
            .distinct_times(board, &floor)?
            .into_values()
            .flatten()
            .max())
    }

    pub fn at(
        &self,
        timestamp: &Timestamp,
        board: Option<&str>,
    ) -> Result<Vec<VoteObservation>, StoreError> {
        let raws: Vec<String> = self
            .distinct_times(board, &date_floor(timestamp.date_naive()))?
            .into_iter()
            .filter(|(_, parsed)| parsed.as_ref() == Some(timestamp))
            .map(|(raw, _)| raw)
            .collect();
        if raws.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; raws.len()].join(", ");
        let mut sql = format!(
            "SELECT observed_at, board, candidate_name, percent, real_percent \
             FROM vote_observations WHERE observed_at IN ({placeholders})"
        );
        let mut args = raws;
        if let Some(board) = board {
            sql.push_str(" AND board = ?");
            args.push(board.to_string());
        }
        sql.push_str(" ORDER BY board, candidate_name, id");
        self.query_observations(&sql, &args)
    }

    /// Observations with `timestamp >= since`, ordered by timestamp ascending
    /// then candidate name.
    pub fn range(
        &self,
        since: &Timestamp,
        board: Option<&str>,
        candidates: Option<&[String]>,
    ) -> Result<Vec<VoteObservation>, StoreError> {
        let mut sql = String::from(
            "SELECT observed_at, board, candidate_name, percent, real_percent \
             FROM vote_observations WHERE observed_at >= ?",
        );
        let mut args: Vec<String> = vec![date_floor(since.date_naive())];
        if let Some(board) = board {
            sql.push_str(" AND board = ?");
            args.push(board.to_string());
        }
        if let Some(names) = candidates.filter(|names| !names.is_empty()) {
            let placeholders = vec!["?"; names.len()].join(", ");
            sql.push_str(&format!(" AND candidate_name IN ({placeholders})"));
            args.extend(names.iter().cloned());
        }
        sql.push_str(" ORDER BY id");

        let mut rows: Vec<VoteObservation> = self
            .query_observations(&sql, &args)?
            .into_iter()
            .filter(|obs| obs.timestamp >= *since)
            .collect();
        rows.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.candidate_name.cmp(&b.candidate_name))
        });
        Ok(rows)
    }

    /// Deletes every observation strictly older than `cutoff`, in one
    /// transaction. Rows whose timestamp cannot be read are deleted too, since
    /// no read or retention pass could ever reach them otherwise.
    pub fn delete_older_than(&self, cutoff: &Timestamp) -> Result<usize, StoreError> {
        let mut unreadable = 0;
        let stale: Vec<String> = self
            .distinct_times(None, "")?
            .into_iter()
            .filter(|(_, parsed)| match parsed {
                Some(ts) => ts < cutoff,
                None => {
                    unreadable += 1;
                    true
                }
            })
            .map(|(raw, _)| raw)
            .collect();
        if unreadable > 0 {
            warn!("removing observations with {unreadable} unparseable timestamp value(s)");
        }
        if stale.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt =
                tx.prepare_cached("DELETE FROM vote_observations WHERE observed_at = ?1")?;
            for raw in &stale {
                deleted += stmt.execute(params![raw])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn boards(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT board FROM vote_observations ORDER BY board")?;
        let boards = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(boards)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM vote_observations", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Raw stored timestamp strings mapped to their normalized value.
    /// Distinct stored timestamps with `observed_at >= floor` (lexically).
    fn distinct_times(
        &self,
        board: Option<&str>,
        floor: &str,
    ) -> Result<BTreeMap<String, Option<Timestamp>>, StoreError> {
        let conn = self.pool.get()?;
        let raws = match board {
            Some(board) => {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT observed_at FROM vote_observations \
                     WHERE board = ?1 AND observed_at >= ?2",
                )?;
                let rows = stmt
                    .query_map(params![board, floor], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT observed_at FROM vote_observations WHERE observed_at >= ?1",
                )?;
                let rows = stmt
                    .query_map(params![floor], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(raws
            .into_iter()
            .map(|raw| {
                let parsed = normalize_stored(&raw, self.offset);
                if parsed.is_none() {
                    warn!("ignoring observation with unparseable timestamp: {raw}");
                }
                (raw, parsed)
            })
            .collect())
    }

    fn query_observations(
        &self,
        sql: &str,
        args: &[String],
    ) -> Result<Vec<VoteObservation>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(raw, board, candidate_name, percent, real_percent)| {
                let timestamp = normalize_stored(&raw, self.offset)?;
                Some(VoteObservation {
                    timestamp,
                    board,
                    candidate_name,
                    percent,
                    real_percent,
                })
            })
            .collect())
    }
}

/// Lexical lower bound on `observed_at` for rows at or after `date`. Every
/// stored format starts with the local `%Y-%m-%d`, and two offsets never
/// differ by two days or more.
fn date_floor(date: NaiveDate) -> String {
    date.checked_sub_days(Days::new(2))
        .map(|floor| floor.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    use super::*;
    use crate::snapshot::to_display;
    use crate::source::CandidateRatio;

    fn ict() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).expect("offset")
    }

    fn open_store() -> (TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::open(&dir.path().join("votes.db"), ict()).expect("open store");
        (dir, store)
    }

    fn t(hour: u32, minute: u32) -> Timestamp {
        ict()
            .with_ymd_and_hms(2025, 1, 5, hour, minute, 0)
            .single()
            .expect("ts")
    }

    fn obs(ts: Timestamp, board: &str, name: &str, ratio: f64) -> VoteObservation {
        VoteObservation::from_ratio(
            ts,
            board,
            &CandidateRatio {
                name: name.to_string(),
                ratio,
            },
        )
    }

    #[test]
    fn range_returns_rows_in_time_order() {
        let (_dir, store) = open_store();
        store
            .insert_batch(&[obs(t(10, 5), "main", "B", 2.0), obs(t(10, 5), "main", "A", 1.0)])
            .expect("insert t2");
        store
            .insert_batch(&[obs(t(10, 0), "main", "A", 3.0)])
            .expect("insert t1");

        let rows = store.range(&t(10, 0), None, None).expect("range");
        let order: Vec<(String, &str)> = rows
            .iter()
            .map(|o| (to_display(&o.timestamp), o.candidate_name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("2025-01-05 10:00:00".to_string(), "A"),
                ("2025-01-05 10:05:00".to_string(), "A"),
                ("2025-01-05 10:05:00".to_string(), "B"),
            ]
        );

        let filtered = store
            .range(&t(10, 1), Some("main"), Some(&["B".to_string()]))
            .expect("filtered range");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].candidate_name, "B");
    }

    #[test]
    fn latest_and_at_are_scoped_by_board() {
        let (_dir, store) = open_store();
        store
            .insert_batch(&[obs(t(9, 0), "A", "x", 50.0), obs(t(9, 0), "B", "y", 60.0)])
            .expect("insert");
        store
            .insert_batch(&[obs(t(9, 10), "A", "x", 55.0)])
            .expect("insert");

        assert_eq!(store.latest(None).expect("latest"), Some(t(9, 10)));
        assert_eq!(store.latest(Some("B")).expect("latest B"), Some(t(9, 0)));
        assert_eq!(store.latest(Some("C")).expect("latest C"), None);

        let rows = store.at(&t(9, 0), Some("B")).expect("at");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].candidate_name, "y");
        assert_eq!(store.boards().expect("boards"), vec!["A", "B"]);
    }

    #[test]
    fn naive_rows_are_read_in_canonical_offset() {
        let (_dir, store) = open_store();
        let conn = store.pool().get().expect("conn");
        conn.execute(
            "INSERT INTO vote_observations(observed_at, board, candidate_name, percent) \
             VALUES ('2025-01-05 09:00:00', 'main', 'legacy', 12.5)",
            [],
        )
        .expect("raw insert");
        drop(conn);
        store
            .insert_batch(&[obs(t(9, 0), "main", "fresh", 1.0)])
            .expect("insert");

        let rows = store.at(&t(9, 0), Some("main")).expect("at");
        let names: Vec<&str> = rows.iter().map(|o| o.candidate_name.as_str()).collect();
        assert_eq!(names, vec!["fresh", "legacy"]);
        assert_eq!(rows[1].real_percent, None);
    }

    #[test]
    fn retention_cleanup_keeps_recent_days() {
        let (_dir, store) = open_store();
        let now = t(12, 0);
        for day in 0..8 {
            let ts = now - ChronoDuration::days(day) - ChronoDuration::hours(1);
            store
                .insert_batch(&[obs(ts, "main", "A", 10.0 + day as f64)])
                .expect("insert");
        }
        let cutoff = now - ChronoDuration::days(7);
        let deleted = store.delete_older_than(&cutoff).expect("cleanup");
        assert_eq!(deleted, 1);

        let rows = store
            .range(&(now - ChronoDuration::days(8)), None, None)
            .expect("range");
        assert_eq!(rows.len(), 7);
        assert!(rows.iter().all(|o| o.timestamp >= cutoff));
        assert_eq!(store.count().expect("count"), 7);
    }

    #[test]
    fn retention_cleanup_removes_unreadable_rows() {
        let (_dir, store) = open_store();
        store
            .insert_batch(&[obs(t(11, 0), "main", "A", 1.0)])
            .expect("insert");
        let conn = store.pool().get().expect("conn");
        conn.execute(
            "INSERT INTO vote_observations(observed_at, board, candidate_name, percent) \
             VALUES ('not a time', 'main', 'ghost', 1.0)",
            [],
        )
        .expect("raw insert");
        drop(conn);
        assert_eq!(store.count().expect("count"), 2);

        let deleted = store.delete_older_than(&t(10, 0)).expect("cleanup");
        assert_eq!(deleted, 1);
        assert_eq!(store.count().expect("count"), 1);
        assert_eq!(store.latest(Some("main")).expect("latest"), Some(t(11, 0)));
    }

    #[test]
    fn reads_skip_days_outside_the_window_but_keep_offset_neighbours() {
        let (_dir, store) = open_store();
        let old = t(12, 0) - ChronoDuration::days(5);
        store
            .insert_batch(&[obs(old, "main", "A", 1.0)])
            .expect("insert old");
        let conn = store.pool().get().expect("conn");
        // 22:30 UTC on Jan 4 is 05:30 on Jan 5 in the canonical offset.
        conn.execute(
            "INSERT INTO vote_observations(observed_at, board, candidate_name, percent) \
             VALUES ('2025-01-04T22:30:00+00:00', 'main', 'B', 2.0)",
            [],
        )
        .expect("raw insert");
        drop(conn);

        let rows = store.range(&t(5, 0), Some("main"), None).expect("range");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].candidate_name, "B");
        assert_eq!(rows[0].timestamp, t(5, 30));
        assert_eq!(store.latest(Some("main")).expect("latest"), Some(t(5, 30)));
        assert_eq!(store.at(&old, Some("main")).expect("at").len(), 1);
    }

    #[test]
    fn failed_batch_leaves_no_rows() {
        let (_dir, store) = open_store();
        let conn = store.pool().get().expect("conn");
        conn.execute_batch(
            "CREATE TRIGGER reject_bad BEFORE INSERT ON vote_observations \
             WHEN NEW.candidate_name = 'bad' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .expect("trigger");
        drop(conn);

        let batch = [
            obs(t(8, 0), "main", "A", 1.0),
            obs(t(8, 0), "main", "bad", 2.0),
        ];
        assert!(store.insert_batch(&batch).is_err());
        assert_eq!(store.count().expect("count"), 0);
    }
}
