//! Daily report jobs, one tokio task per seller.

use crate::dispatch::ReportDispatcher;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, Timelike, Utc};
use serde::Serialize;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{error, info};
use uuid::Uuid;

pub const FIRST_SLOT_HOUR: u32 = 7;
pub const LAST_SLOT_HOUR: u32 = 22;
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 3;

pub fn default_utc_offset() -> FixedOffset {
    FixedOffset::east_opt(DEFAULT_UTC_OFFSET_HOURS * 3600).unwrap_or_else(|| Utc.fix())
}

pub fn utc_offset_from_env() -> FixedOffset {
    std::env::var("NOTIFY_UTC_OFFSET_HOURS")
        .ok()
        .and_then(|v| v.trim().parse::<i32>().ok())
        .filter(|h| (-12..=14).contains(h))
        .and_then(|h| FixedOffset::east_opt(h * 3600))
        .unwrap_or_else(default_utc_offset)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("`{0}` is not a notification slot; use HH:00 between 07:00 and 22:00")]
    InvalidSlot(String),
}

/// Local time of day a seller's report goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct NotifyAt(NaiveTime);

impl NotifyAt {
    pub fn hour(hour: u32) -> Result<Self, ScheduleError> {
        if !(FIRST_SLOT_HOUR..=LAST_SLOT_HOUR).contains(&hour) {
            return Err(ScheduleError::InvalidSlot(format!("{hour:02}:00")));
        }
        NaiveTime::from_hms_opt(hour, 0, 0)
            .map(Self)
            .ok_or_else(|| ScheduleError::InvalidSlot(format!("{hour:02}:00")))
    }

    pub fn time(&self) -> NaiveTime {
        self.0
    }
}

impl FromStr for NotifyAt {
    type Err = ScheduleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidSlot(raw.to_string());
        let time = NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| invalid())?;
        if time.minute() != 0 {
            return Err(invalid());
        }
        Self::hour(time.hour()).map_err(|_| invalid())
    }
}

impl fmt::Display for NotifyAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

/// Every slot a seller may pick, in order.
pub fn notify_times() -> Vec<NotifyAt> {
    (FIRST_SLOT_HOUR..=LAST_SLOT_HOUR)
        .filter_map(|hour| NotifyAt::hour(hour).ok())
        .collect()
}

/// Next instant the slot occurs after `now` in `offset`'s local time.
/// With `skip_today` the result is never on the current local day.
pub fn next_fire(
    now: DateTime<Utc>,
    at: NotifyAt,
    offset: FixedOffset,
    skip_today: bool,
) -> DateTime<Utc> {
    let local_now = now.with_timezone(&offset).naive_local();
    let mut candidate = local_now.date().and_time(at.time());
    if skip_today || candidate <= local_now {
        candidate += Duration::days(1);
    }
    let utc = candidate - Duration::seconds(i64::from(offset.local_minus_utc()));
    DateTime::<Utc>::from_naive_utc_and_offset(utc, Utc)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Running,
    Completed {
        run_id: Uuid,
        has_changes: bool,
        delivered: usize,
    },
    Skipped,
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: Uuid,
    pub seller_id: i64,
    pub notify_at: NotifyAt,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub state: JobState,
}

type Statuses = Arc<Mutex<HashMap<i64, JobInfo>>>;

#[derive(Clone)]
pub struct Scheduler {
    dispatcher: ReportDispatcher,
    offset: FixedOffset,
    statuses: Statuses,
    cancels: Arc<Mutex<HashMap<i64, watch::Sender<bool>>>>,
}

impl Scheduler {
    pub fn new(dispatcher: ReportDispatcher, offset: FixedOffset) -> Self {
        Self {
            dispatcher,
            offset,
            statuses: Arc::default(),
            cancels: Arc::default(),
        }
    }

    /// Start (or replace) the seller's daily job. With `run_now` the job
    /// runs once immediately and the first scheduled run is tomorrow.
    pub async fn schedule(&self, seller_id: i64, at: NotifyAt, run_now: bool) -> JobInfo {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Some(previous) = self.cancels.lock().await.insert(seller_id, cancel_tx) {
            let _ = previous.send(true);
        }

        let job_id = Uuid::new_v4();
        let info = JobInfo {
            job_id,
            seller_id,
            notify_at: at,
            next_run: Some(next_fire(Utc::now(), at, self.offset, run_now)),
            last_run: None,
            state: JobState::Scheduled,
        };
        self.statuses.lock().await.insert(seller_id, info.clone());
        info!(
            target = "logistics_watch.scheduler",
            seller_id,
            %job_id,
            notify_at = %at,
            "job scheduled"
        );

        let job = JobRunner {
            dispatcher: self.dispatcher.clone(),
            statuses: self.statuses.clone(),
            offset: self.offset,
            seller_id,
            job_id,
            at,
        };
        tokio::spawn(job.run(cancel_rx, run_now));
        info
    }

    /// Stop future runs; a run already in flight completes.
    pub async fn cancel(&self, seller_id: i64) -> bool {
        let sender = self.cancels.lock().await.remove(&seller_id);
        self.statuses.lock().await.remove(&seller_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(true);
                info!(target = "logistics_watch.scheduler", seller_id, "job cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, seller_id: i64) -> Option<JobInfo> {
        self.statuses.lock().await.get(&seller_id).cloned()
    }

    pub async fn active(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.statuses.lock().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.seller_id);
        jobs
    }

    pub fn dispatcher(&self) -> &ReportDispatcher {
        &self.dispatcher
    }
}

struct JobRunner {
    dispatcher: ReportDispatcher,
    statuses: Statuses,
    offset: FixedOffset,
    seller_id: i64,
    job_id: Uuid,
    at: NotifyAt,
}

impl JobRunner {
    async fn run(self, mut cancel: watch::Receiver<bool>, run_now: bool) {
        if run_now {
            self.fire().await;
        }
        let mut skip_today = run_now;
        loop {
            let next = next_fire(Utc::now(), self.at, self.offset, skip_today);
            skip_today = false;
            self.update(|info| info.next_run = Some(next)).await;

            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.changed() => break,
            }
            if *cancel.borrow() {
                break;
            }
            self.fire().await;
        }
        info!(
            target = "logistics_watch.scheduler",
            seller_id = self.seller_id,
            job_id = %self.job_id,
            "job stopped"
        );
    }

    async fn fire(&self) {
        self.update(|info| info.state = JobState::Running).await;
        let state = match self.dispatcher.dispatch(self.seller_id).await {
            Ok(Some(delivery)) => JobState::Completed {
                run_id: delivery.run_id,
                has_changes: delivery.has_changes,
                delivered: delivery.delivered,
            },
            Ok(None) => JobState::Skipped,
            Err(err) => {
                error!(
                    target = "logistics_watch.scheduler",
                    seller_id = self.seller_id,
                    stage = err.stage(),
                    error = %err,
                    "scheduled run failed"
                );
                JobState::Failed {
                    error: err.detail().to_string(),
                    stage: Some(err.stage().to_string()),
                }
            }
        };
        let finished = Utc::now();
        self.update(move |info| {
            info.state = state;
            info.last_run = Some(finished);
        })
        .await;
    }

    /// Apply `change` if this runner's job is still the seller's current one.
    async fn update(&self, change: impl FnOnce(&mut JobInfo)) {
        let mut guard = self.statuses.lock().await;
        if let Some(info) = guard.get_mut(&self.seller_id)
            && info.job_id == self.job_id
        {
            change(info);
        }
    }
}
