use std::sync::Arc;

use chrono::{Duration, FixedOffset, TimeZone};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{IngestionConfig, MAX_INTERVAL_SECS};
use crate::ingest::{Pipeline, TickStage};
use crate::snapshot::{now_in, to_display, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenseWindow {
    pub start: Timestamp,
    pub end: Timestamp,
    pub step: Duration,
}

/// Wall-clock firing rule. Ticks land on multiples of the active step,
/// counted from midnight in the canonical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub base: Duration,
    pub dense: Option<DenseWindow>,
    pub offset: FixedOffset,
}

impl Schedule {
    pub fn from_config(config: &IngestionConfig, offset: FixedOffset) -> Self {
        let dense = config.dense_window.as_ref().map(|window| DenseWindow {
            start: window.start.with_timezone(&offset),
            end: window.end.with_timezone(&offset),
            step: secs(window.interval_secs),
        });
        Self {
            base: secs(config.interval_secs),
            dense,
            offset,
        }
    }

    /// The dense step supersedes the base step inside `[start, end)`.
    pub fn interval_at(&self, now: Timestamp) -> Duration {
        match self.dense {
            Some(window) if window.start <= now && now < window.end => window.step,
            _ => self.base,
        }
    }

    pub fn next_fire_after(&self, now: Timestamp) -> Timestamp {
        let now = now.with_timezone(&self.offset);
        let step = self.interval_at(now).num_seconds().max(1);
        let local = now.naive_local();
        let midnight = local.date().and_hms_opt(0, 0, 0).unwrap_or(local);
        let elapsed = (local - midnight).num_seconds();
        let next_local = midnight + Duration::seconds((elapsed / step + 1) * step);
        let aligned = self
            .offset
            .from_local_datetime(&next_local)
            .single()
            .unwrap_or(now + Duration::seconds(step));

        match self.dense {
            Some(window) if now < window.start && window.start < aligned => window.start,
            _ => aligned,
        }
    }
}

/// Steps are clamped to `[1s, 1 day]`; out-of-range configs never panic here.
fn secs(value: u64) -> Duration {
    let clamped = value.clamp(1, MAX_INTERVAL_SECS);
    i64::try_from(clamped)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(|| Duration::days(1))
}

/// Fires pipeline ticks on a [`Schedule`]. At most one tick runs at a time;
/// a firing that finds the previous tick still running is skipped.
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    schedule: Schedule,
    running: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, schedule: Schedule) -> Self {
        Self {
            pipeline,
            schedule,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Starts a tick in the background unless one is already in flight.
    /// Errors are logged and never reach the timer loop.
    pub fn fire(&self) -> Option<JoinHandle<()>> {
        let Ok(guard) = self.running.clone().try_lock_owned() else {
            warn!("previous tick still running, skipping this firing");
            return None;
        };
        let pipeline = self.pipeline.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            match pipeline.run_tick().await {
                Ok(report) if report.stage == TickStage::Failed => {
                    warn!("tick {} failed: no board fetched", report.started_at)
                }
                Ok(_) => {}
                Err(err) => error!("tick abandoned: {err}"),
            }
            if let Err(err) = pipeline.prune().await {
                error!("retention cleanup failed: {err}");
            }
        }))
    }

    pub fn spawn(self, run_at_startup: bool) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "scheduler started: every {}s{}",
                self.schedule.base.num_seconds(),
                self.schedule
                    .dense
                    .map(|w| format!(
                        ", every {}s between {} and {}",
                        w.step.num_seconds(),
                        to_display(&w.start),
                        to_display(&w.end)
                    ))
                    .unwrap_or_default()
            );
            if run_at_startup {
                let _ = self.fire();
            }
            loop {
                let now = now_in(self.schedule.offset);
                let next = self.schedule.next_fire_after(now);
                debug!("next tick at {}", to_display(&next));
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                let _ = self.fire();
            }
        })
    }
}
