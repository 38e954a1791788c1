//! In-process job scheduler
//!
//! Each service owns one [`Scheduler`]. Jobs are registered while the
//! service is being built and started when the service finishes loading;
//! unloading the service aborts every job loop. Job failures are logged,
//! never propagated.

use std::sync::Arc;

use chrono::{Datelike, NaiveTime, Utc, Weekday};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// When a job runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed interval, first run one interval after start.
    Every(Duration),
    /// Once a day at the given UTC time.
    DailyAt(NaiveTime),
    /// Once a week, on the given weekday at the given UTC time.
    At { weekday: Weekday, time: NaiveTime },
}

impl Schedule {
    /// Time until the next fire, from the wall clock.
    fn until_next(&self) -> Duration {
        match *self {
            Schedule::Every(interval) => interval,
            Schedule::DailyAt(time) => until_calendar(None, time),
            Schedule::At { weekday, time } => until_calendar(Some(weekday), time),
        }
    }
}

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
struct Job {
    name: String,
    schedule: Schedule,
    func: JobFn,
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<Vec<Job>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job<F, Fut>(&self, name: impl Into<String>, schedule: Schedule, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = Job {
            name: name.into(),
            schedule,
            func: Arc::new(move || f().boxed()),
        };
        self.jobs.lock().push(job);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Spawn one loop per registered job. Idempotent while running.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        for job in self.jobs.lock().iter().cloned() {
            handles.push(tokio::spawn(run_job(job)));
        }
    }

    /// Abort every job loop.
    pub fn stop(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_job(job: Job) {
    loop {
        tokio::time::sleep(job.schedule.until_next()).await;

        tracing::info!(job = %job.name, "scheduled job started");
        match (job.func)().await {
            Ok(()) => tracing::info!(job = %job.name, "scheduled job completed"),
            Err(error) => {
                tracing::error!(job = %job.name, %error, "scheduled job failed");
            }
        }
    }
}

/// Delay until the next occurrence of `time`, restricted to `weekday`
/// when given. Scans at most a week ahead.
fn until_calendar(weekday: Option<Weekday>, time: NaiveTime) -> Duration {
    let now = Utc::now();
    let mut date = now.date_naive();
    for _ in 0..8 {
        let day_matches = weekday.map(|w| date.weekday() == w).unwrap_or(true);
        if day_matches {
            let candidate = date.and_time(time).and_utc();
            if candidate > now {
                return (candidate - now).to_std().unwrap_or(Duration::ZERO);
            }
        }
        date = date + chrono::Duration::days(1);
    }
    Duration::ZERO
}
