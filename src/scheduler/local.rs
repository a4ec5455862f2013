//! In-process job scheduler on tokio timers.

use super::{
    BackoffCriteria, DeviceConditions, JobConstraints, JobHandler, JobOutcome, JobScheduler,
    PeriodicJob,
};
use crate::retry::add_jitter;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-name state that outlives individual schedules
struct JobSlot {
    /// Prevents overlapping runs when a schedule is replaced mid-run
    run_lock: Arc<Mutex<()>>,
    running: Arc<watch::Sender<bool>>,
    /// Cancels the current schedule loop, if any
    schedule: Option<CancellationToken>,
    /// Installed periodic job and the start of its current period
    periodic: Option<(PeriodicJob, PeriodStart)>,
    /// Handed to handler runs; only fired by `cancel` or shutdown
    work: CancellationToken,
}

/// Start of the current period, moved forward after every periodic run
type PeriodStart = Arc<std::sync::Mutex<Instant>>;

/// Everything a schedule loop needs, detached from the scheduler
#[derive(Clone)]
struct JobContext {
    name: String,
    handler: Arc<dyn JobHandler>,
    conditions: watch::Receiver<DeviceConditions>,
    run_lock: Arc<Mutex<()>>,
    running: Arc<watch::Sender<bool>>,
    work: CancellationToken,
}

/// [`JobScheduler`] backed by tokio tasks
///
/// Handlers are registered by job name before scheduling. Constraints are
/// evaluated against the [`DeviceConditions`] fed through
/// [`update_conditions`](Self::update_conditions).
pub struct TokioJobScheduler {
    handlers: Mutex<HashMap<String, Arc<dyn JobHandler>>>,
    slots: Mutex<HashMap<String, JobSlot>>,
    conditions_tx: watch::Sender<DeviceConditions>,
    shutdown: CancellationToken,
}

impl TokioJobScheduler {
    /// Create a scheduler assuming `initial` device conditions
    pub fn new(initial: DeviceConditions) -> Self {
        let (conditions_tx, _) = watch::channel(initial);
        Self {
            handlers: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            conditions_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register the handler that runs when job `name` fires
    pub async fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        debug!(job = %name, "Registered job handler");
        self.handlers.lock().await.insert(name, handler);
    }

    /// Report new device conditions
    pub fn update_conditions(&self, conditions: DeviceConditions) {
        self.conditions_tx.send_replace(conditions);
    }

    /// Current device conditions
    pub fn conditions(&self) -> DeviceConditions {
        *self.conditions_tx.borrow()
    }

    /// Subscribe to device condition changes
    pub fn watch_conditions(&self) -> watch::Receiver<DeviceConditions> {
        self.conditions_tx.subscribe()
    }

    /// Stop every schedule and signal all in-flight runs
    pub fn shutdown(&self) {
        info!("Job scheduler shutting down");
        self.shutdown.cancel();
    }

    async fn handler(&self, name: &str) -> Result<Arc<dyn JobHandler>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.handlers
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Scheduler(format!("no handler registered for job '{}'", name)))
    }

    /// Install a new schedule in `slot`, replacing any previous one
    ///
    /// Returns the context and schedule token for the caller to spawn a loop with.
    fn replace_schedule(
        &self,
        name: &str,
        handler: Arc<dyn JobHandler>,
        slot: &mut JobSlot,
    ) -> (JobContext, CancellationToken) {
        if let Some(previous) = slot.schedule.take() {
            previous.cancel();
        }
        slot.periodic = None;
        let schedule = self.shutdown.child_token();
        slot.schedule = Some(schedule.clone());

        let ctx = JobContext {
            name: name.to_string(),
            handler,
            conditions: self.conditions_tx.subscribe(),
            run_lock: slot.run_lock.clone(),
            running: slot.running.clone(),
            work: slot.work.clone(),
        };
        (ctx, schedule)
    }

    fn new_slot(&self) -> JobSlot {
        let (running, _) = watch::channel(false);
        JobSlot {
            run_lock: Arc::new(Mutex::new(())),
            running: Arc::new(running),
            schedule: None,
            periodic: None,
            work: self.shutdown.child_token(),
        }
    }
}

#[async_trait]
impl JobScheduler for TokioJobScheduler {
    async fn schedule_periodic(&self, job: PeriodicJob) -> Result<()> {
        if job.interval.is_zero() {
            return Err(Error::Scheduler(format!(
                "periodic job '{}' needs a non-zero interval",
                job.name
            )));
        }

        let handler = self.handler(&job.name).await?;
        let mut slots = self.slots.lock().await;
        let slot = slots
            .entry(job.name.clone())
            .or_insert_with(|| self.new_slot());

        // Period already under way for a live schedule of this name
        let live_period = match (&slot.schedule, &slot.periodic) {
            (Some(schedule), Some((current, started))) if !schedule.is_cancelled() => {
                if *current == job {
                    debug!(job = %job.name, "Periodic job unchanged, keeping schedule");
                    return Ok(());
                }
                Some(started.clone())
            }
            _ => None,
        };
        let elapsed = live_period
            .as_ref()
            .map(|started| lock_period(started).elapsed())
            .unwrap_or_default();
        let started =
            live_period.unwrap_or_else(|| Arc::new(std::sync::Mutex::new(Instant::now())));

        let (ctx, schedule) = self.replace_schedule(&job.name, handler, slot);
        slot.periodic = Some((job.clone(), started.clone()));
        info!(
            job = %job.name,
            interval_secs = job.interval.as_secs(),
            flex_secs = job.flex.as_secs(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Scheduled periodic job"
        );
        let first_delay = next_period_delay(job.interval, job.flex).saturating_sub(elapsed);
        tokio::spawn(periodic_loop(ctx, job, schedule, first_delay, started));
        Ok(())
    }

    async fn schedule_one_shot(
        &self,
        name: &str,
        constraints: JobConstraints,
        backoff: BackoffCriteria,
    ) -> Result<()> {
        let handler = self.handler(name).await?;
        let mut slots = self.slots.lock().await;
        let slot = slots
            .entry(name.to_string())
            .or_insert_with(|| self.new_slot());
        let (ctx, schedule) = self.replace_schedule(name, handler, slot);
        info!(job = %name, "Scheduled one-shot job");
        tokio::spawn(one_shot_loop(ctx, constraints, backoff, schedule));
        Ok(())
    }

    async fn cancel(&self, name: &str) -> Result<()> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(name) {
            if let Some(schedule) = slot.schedule.take() {
                schedule.cancel();
            }
            slot.periodic = None;
            slot.work.cancel();
            slot.work = self.shutdown.child_token();
            info!(job = %name, "Cancelled job");
        }
        Ok(())
    }

    async fn is_running(&self, name: &str) -> bool {
        self.slots
            .lock()
            .await
            .get(name)
            .is_some_and(|slot| *slot.running.borrow())
    }

    async fn running_stream(&self, name: &str) -> BoxStream<'static, bool> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .entry(name.to_string())
            .or_insert_with(|| self.new_slot());
        WatchStream::new(slot.running.subscribe()).boxed()
    }
}

impl JobContext {
    /// Wait until `constraints` hold; `false` if the schedule was cancelled first
    async fn wait_for_constraints(
        &mut self,
        constraints: &JobConstraints,
        schedule: &CancellationToken,
    ) -> bool {
        let mut logged = false;
        loop {
            let violation = constraints.violation(&self.conditions.borrow_and_update());
            let Some(reason) = violation else {
                return true;
            };
            if !logged {
                debug!(job = %self.name, reason = %reason, "Waiting for job constraints");
                logged = true;
            }

            tokio::select! {
                _ = schedule.cancelled() => return false,
                changed = self.conditions.changed() => {
                    if changed.is_err() {
                        // Conditions can no longer change
                        schedule.cancelled().await;
                        return false;
                    }
                }
            }
        }
    }

    /// Run the handler once; `None` if the schedule was cancelled before it started
    async fn run(&self, schedule: &CancellationToken) -> Option<JobOutcome> {
        let _guard = tokio::select! {
            _ = schedule.cancelled() => return None,
            guard = self.run_lock.clone().lock_owned() => guard,
        };
        if schedule.is_cancelled() {
            return None;
        }

        debug!(job = %self.name, "Job started");
        self.running.send_replace(true);
        let outcome = self.handler.run(self.work.clone()).await;
        self.running.send_replace(false);
        debug!(job = %self.name, outcome = ?outcome, "Job finished");

        Some(outcome)
    }
}

/// Delay before the next periodic run: somewhere inside the flex window at the
/// end of the period
fn next_period_delay(interval: Duration, flex: Duration) -> Duration {
    let flex = flex.min(interval);
    let flex_ms = u64::try_from(flex.as_millis()).unwrap_or(u64::MAX);
    let offset = if flex_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=flex_ms)
    };
    interval.saturating_sub(flex) + Duration::from_millis(offset)
}

fn lock_period(started: &PeriodStart) -> std::sync::MutexGuard<'_, Instant> {
    started.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn sleep_or_cancel(delay: Duration, schedule: &CancellationToken) -> bool {
    tokio::select! {
        _ = schedule.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn periodic_loop(
    mut ctx: JobContext,
    job: PeriodicJob,
    schedule: CancellationToken,
    first_delay: Duration,
    started: PeriodStart,
) {
    let mut attempt = 0u32;
    let mut delay = first_delay;

    loop {
        if !sleep_or_cancel(delay, &schedule).await {
            break;
        }
        if !ctx.wait_for_constraints(&job.constraints, &schedule).await {
            break;
        }
        let Some(outcome) = ctx.run(&schedule).await else {
            break;
        };
        *lock_period(&started) = Instant::now();

        delay = match outcome {
            JobOutcome::Retry => {
                attempt += 1;
                let backoff = add_jitter(job.backoff.delay(attempt));
                debug!(job = %job.name, attempt, delay_ms = backoff.as_millis() as u64, "Job asked for retry");
                backoff
            }
            JobOutcome::Success => {
                attempt = 0;
                next_period_delay(job.interval, job.flex)
            }
            JobOutcome::Failure => {
                warn!(job = %job.name, "Periodic job run failed, waiting for next period");
                attempt = 0;
                next_period_delay(job.interval, job.flex)
            }
        };
    }

    debug!(job = %job.name, "Periodic schedule ended");
}

async fn one_shot_loop(
    mut ctx: JobContext,
    constraints: JobConstraints,
    backoff: BackoffCriteria,
    schedule: CancellationToken,
) {
    let mut attempt = 0u32;

    loop {
        if !ctx.wait_for_constraints(&constraints, &schedule).await {
            break;
        }
        match ctx.run(&schedule).await {
            Some(JobOutcome::Retry) => {
                attempt += 1;
                let delay = add_jitter(backoff.delay(attempt));
                if !sleep_or_cancel(delay, &schedule).await {
                    break;
                }
            }
            Some(JobOutcome::Failure) => {
                warn!(job = %ctx.name, "One-shot job failed");
                break;
            }
            Some(JobOutcome::Success) | None => break,
        }
    }

    debug!(job = %ctx.name, "One-shot schedule ended");
}
