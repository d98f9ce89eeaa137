use std::collections::BTreeMap;

use crate::history::{AccessTier, HistoryPolicy, HistoryQuery, QueryError};
use crate::snapshot::store::SnapshotStore;
use crate::snapshot::{floor_to_minute, CandidatePercent, Snapshot, Timestamp, VoteObservation};

/// Runs a history query against the store. Read-only; returns snapshots
/// newest first.
pub fn run_query(
    store: &SnapshotStore,
    policy: &HistoryPolicy,
    query: &HistoryQuery,
    now: Timestamp,
) -> Result<Vec<Snapshot>, QueryError> {
    let since = now - query.interval.duration();
    let filter = (!query.candidates.is_empty()).then_some(query.candidates.as_slice());
    let observations = store.range(&since, query.board.as_deref(), filter)?;

    let mut snapshots = group_by_minute(&observations);
    snapshots.reverse();
    if let Some(step) = policy.step_for(query.interval) {
        snapshots = downsample(snapshots, step);
    }

    match query.tier {
        AccessTier::Anonymous => {
            snapshots.truncate(policy.anonymous_cap);
            for snapshot in &mut snapshots {
                for candidate in &mut snapshot.candidates {
                    candidate.real_percent = None;
                }
            }
        }
        AccessTier::Authenticated => {
            if let Some(limit) = query.limit {
                snapshots.truncate(limit);
            }
        }
    }
    Ok(snapshots)
}

/// Buckets observations by minute, oldest first. Within a bucket the last
/// observation of each candidate wins; candidates are listed by name.
pub fn group_by_minute(observations: &[VoteObservation]) -> Vec<Snapshot> {
    let mut buckets: BTreeMap<Timestamp, BTreeMap<String, CandidatePercent>> = BTreeMap::new();
    for obs in observations {
        buckets
            .entry(floor_to_minute(&obs.timestamp))
            .or_default()
            .insert(obs.candidate_name.clone(), CandidatePercent::from(obs));
    }
    buckets
        .into_iter()
        .map(|(timestamp, candidates)| Snapshot {
            timestamp,
            candidates: candidates.into_values().collect(),
        })
        .collect()
}

/// Thins newest-first snapshots so retained neighbours are at least
/// `step_minutes` apart, keeping the newest snapshot of each run.
pub fn downsample(newest_first: Vec<Snapshot>, step_minutes: u32) -> Vec<Snapshot> {
    let step = chrono::Duration::minutes(i64::from(step_minutes));
    let mut kept: Vec<Snapshot> = Vec::with_capacity(newest_first.len());
    for snapshot in newest_first {
        let keep = kept
            .last()
            .map_or(true, |last| last.timestamp - snapshot.timestamp >= step);
        if keep {
            kept.push(snapshot);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, FixedOffset, TimeZone};
    use tempfile::TempDir;

    use super::*;
    use crate::history::Interval;
    use crate::snapshot::to_display;
    use crate::source::CandidateRatio;

    fn ict() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).expect("offset")
    }

    fn now() -> Timestamp {
        ict()
            .with_ymd_and_hms(2025, 1, 5, 20, 0, 30)
            .single()
            .expect("now")
    }

    fn obs(ts: Timestamp, name: &str, ratio: f64) -> VoteObservation {
        VoteObservation::from_ratio(
            ts,
            "main",
            &CandidateRatio {
                name: name.to_string(),
                ratio,
            },
        )
    }

    fn open_store() -> (TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::open(&dir.path().join("votes.db"), ict()).expect("store");
        (dir, store)
    }

    fn query(interval: Interval, tier: AccessTier) -> HistoryQuery {
        HistoryQuery {
            interval,
            board: Some("main".to_string()),
            candidates: Vec::new(),
            limit: None,
            tier,
        }
    }

    /// One observation per minute for `count` minutes, the newest at `now - 1m`.
    fn seed_minutes(store: &SnapshotStore, count: i64) {
        for i in 1..=count {
            let ts = now() - Duration::minutes(i);
            store
                .insert_batch(&[obs(ts, "A", 10.0 + i as f64 / 100.0)])
                .expect("insert");
        }
    }

    #[test]
    fn empty_window_returns_empty_list() {
        let (_dir, store) = open_store();
        let result = run_query(
            &store,
            &HistoryPolicy::default(),
            &query(Interval::OneHour, AccessTier::Authenticated),
            now(),
        )
        .expect("query");
        assert!(result.is_empty());
    }

    #[test]
    fn one_hour_returns_distinct_minutes_newest_first() {
        let (_dir, store) = open_store();
        seed_minutes(&store, 90);
        let result = run_query(
            &store,
            &HistoryPolicy::default(),
            &query(Interval::OneHour, AccessTier::Authenticated),
            now(),
        )
        .expect("query");
        // since = 19:00:30; the 19:00:30 observation is the oldest that qualifies.
        assert_eq!(result.len(), 60);
        assert_eq!(to_display(&result[0].timestamp), "2025-01-05 19:59:00");
        assert_eq!(to_display(&result[59].timestamp), "2025-01-05 19:00:00");
        assert!(result.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
    }

    #[test]
    fn anonymous_tier_is_capped_and_hides_real_percent() {
        let (_dir, store) = open_store();
        seed_minutes(&store, 90);
        let policy = HistoryPolicy {
            anonymous_cap: 10,
            ..HistoryPolicy::default()
        };
        let mut q = query(Interval::SevenDays, AccessTier::Anonymous);
        q.limit = Some(500);
        let result = run_query(&store, &policy, &q, now()).expect("query");
        assert_eq!(result.len(), 10);
        assert_eq!(to_display(&result[0].timestamp), "2025-01-05 19:59:00");
        assert!(result
            .iter()
            .flat_map(|s| &s.candidates)
            .all(|c| c.real_percent.is_none()));
    }

    #[test]
    fn authenticated_limit_truncates() {
        let (_dir, store) = open_store();
        seed_minutes(&store, 20);
        let mut q = query(Interval::OneDay, AccessTier::Authenticated);
        q.limit = Some(5);
        let result = run_query(&store, &HistoryPolicy::default(), &q, now()).expect("query");
        assert_eq!(result.len(), 5);
        assert!(result[0].candidates[0].real_percent.is_some());
    }

    #[test]
    fn step_keeps_retained_snapshots_apart() {
        let (_dir, store) = open_store();
        seed_minutes(&store, 120);
        let mut policy = HistoryPolicy::default();
        policy.step_minutes.insert(Interval::OneDay, 15);
        let result = run_query(
            &store,
            &policy,
            &query(Interval::OneDay, AccessTier::Authenticated),
            now(),
        )
        .expect("query");
        assert_eq!(result.len(), 8);
        assert!(result
            .windows(2)
            .all(|w| w[0].timestamp - w[1].timestamp >= Duration::minutes(15)));
    }

    #[test]
    fn candidate_filter_applies() {
        let (_dir, store) = open_store();
        let ts = now() - Duration::minutes(5);
        store
            .insert_batch(&[obs(ts, "A", 1.0), obs(ts, "B", 2.0), obs(ts, "C", 3.0)])
            .expect("insert");
        let mut q = query(Interval::TenMinutes, AccessTier::Authenticated);
        q.candidates = vec!["C".to_string(), "A".to_string()];
        let result = run_query(&store, &HistoryPolicy::default(), &q, now()).expect("query");
        let names: Vec<&str> = result[0].candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C"]);
    }

    #[test]
    fn same_minute_observations_merge() {
        let base = ict()
            .with_ymd_and_hms(2025, 1, 5, 10, 0, 5)
            .single()
            .expect("ts");
        let observations = vec![
            obs(base, "A", 1.0),
            obs(base + Duration::seconds(30), "A", 2.0),
            obs(base + Duration::seconds(30), "B", 3.0),
            obs(base + Duration::seconds(60), "A", 4.0),
        ];
        let snapshots = group_by_minute(&observations);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(to_display(&snapshots[0].timestamp), "2025-01-05 10:00:00");
        assert_eq!(snapshots[0].candidates.len(), 2);
        assert_eq!(snapshots[0].candidates[0].percent, 2.0);
    }
}
