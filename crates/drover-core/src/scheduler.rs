//! Named periodic tasks with a single-flight guard, linear-backoff retries and
//! one-level chaining.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::AppError;
use crate::schedule::Schedule;

/// What a successful task run produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskOutput {
    /// Number of items the run found or processed. Chains only fire when non-zero.
    pub items: usize,
}

impl TaskOutput {
    pub fn items(items: usize) -> Self {
        Self { items }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Result of [`JobScheduler::run_guarded`] when the body did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(TaskOutput),
    /// Another run of the same task was already in flight; the body was not invoked.
    Skipped,
}

/// Attempts per run and linear backoff between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Wait after failed attempt `attempt` (1-indexed): `base_delay * attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl From<&SchedulerConfig> for RetryPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay)
    }
}

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<TaskOutput, AppError>> + Send + Sync>;

#[derive(Debug, Clone)]
struct Chain {
    next: String,
    delay: Option<Duration>,
}

/// Everything needed to register a task.
pub struct TaskSpec {
    name: String,
    body: TaskFn,
    schedule: Option<Schedule>,
    retry: Option<RetryPolicy>,
    chain: Option<Chain>,
}

impl TaskSpec {
    /// A task with no schedule; it only runs when invoked or chained to.
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput, AppError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(move || Box::pin(body())),
            schedule: None,
            retry: None,
            chain: None,
        }
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Override the scheduler-wide retry policy for this task.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// After a successful run with at least one item, run `next` after
    /// `delay` (or the configured chain delay). The chained run never chains
    /// further.
    pub fn then(mut self, next: impl Into<String>, delay: Option<Duration>) -> Self {
        self.chain = Some(Chain {
            next: next.into(),
            delay,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-task bookkeeping, readable through [`JobScheduler::get_record`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobRecord {
    pub name: String,
    pub schedule: Option<String>,
    pub running: bool,
    /// Attempts made by the current or most recent run.
    pub attempts: u32,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    /// Most recent failure. Not cleared by later successes.
    pub last_error: Option<String>,
    /// Whether the most recently finished run failed.
    pub last_run_failed: bool,
    pub success_count: u64,
    pub failure_count: u64,
    /// Failed attempts across all runs, including ones later retried successfully.
    pub failed_attempts: u64,
    pub skipped_count: u64,
    pub last_items: usize,
    pub avg_duration_ms: f64,
}

impl JobRecord {
    fn new(name: &str, schedule: Option<&Schedule>) -> Self {
        Self {
            name: name.to_string(),
            schedule: schedule.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    fn record_duration(&mut self, elapsed: Duration) {
        let n = (self.success_count + self.failure_count) as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_duration_ms = (self.avg_duration_ms * (n - 1.0) + ms) / n;
    }
}

/// Events emitted by the scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    Registered {
        task: &'a str,
        schedule: Option<&'a Schedule>,
    },
    LoopStarted {
        task: &'a str,
    },
    RunStarted {
        task: &'a str,
    },
    RunSkipped {
        task: &'a str,
    },
    AttemptFailed {
        task: &'a str,
        attempt: u32,
        max_attempts: u32,
        error: &'a AppError,
        retry_in: Option<Duration>,
    },
    RunCompleted {
        task: &'a str,
        items: usize,
        duration: Duration,
    },
    RunFailed {
        task: &'a str,
        error: &'a AppError,
    },
    ChainScheduled {
        task: &'a str,
        next: &'a str,
        delay: Duration,
    },
    ChainFailed {
        task: &'a str,
        error: &'a AppError,
    },
    LoopStopped {
        task: &'a str,
    },
}

/// Trait for receiving scheduler events (decoupled logging).
pub trait SchedulerReporter: Send + Sync {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl SchedulerReporter for TracingReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::Registered { task, schedule } => match schedule {
                Some(schedule) => tracing::info!(task, %schedule, "Task registered"),
                None => tracing::info!(task, "Task registered (manual)"),
            },
            SchedulerEvent::LoopStarted { task } => {
                tracing::debug!(task, "Firing loop started");
            }
            SchedulerEvent::RunStarted { task } => {
                tracing::info!(task, "Task run started");
            }
            SchedulerEvent::RunSkipped { task } => {
                tracing::debug!(task, "Task already running, skipped");
            }
            SchedulerEvent::AttemptFailed {
                task,
                attempt,
                max_attempts,
                error,
                retry_in,
            } => {
                let retry_in_ms = retry_in.map(|d| d.as_millis() as u64);
                tracing::warn!(task, attempt, max_attempts, %error, ?retry_in_ms, "Task attempt failed");
            }
            SchedulerEvent::RunCompleted {
                task,
                items,
                duration,
            } => {
                tracing::info!(task, items, duration_ms = duration.as_millis() as u64, "Task run completed");
            }
            SchedulerEvent::RunFailed { task, error } => {
                tracing::error!(task, %error, "Task run failed");
            }
            SchedulerEvent::ChainScheduled { task, next, delay } => {
                tracing::info!(task, next, delay_ms = delay.as_millis() as u64, "Chained task scheduled");
            }
            SchedulerEvent::ChainFailed { task, error } => {
                tracing::warn!(task, %error, "Chained task failed");
            }
            SchedulerEvent::LoopStopped { task } => {
                tracing::debug!(task, "Firing loop stopped");
            }
        }
    }
}

struct TaskEntry {
    body: TaskFn,
    schedule: Option<Schedule>,
    retry: Option<RetryPolicy>,
    chain: Option<Chain>,
    record: JobRecord,
}

struct SchedulerInner {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    config: SchedulerConfig,
    reporter: Arc<dyn SchedulerReporter>,
    started: AtomicBool,
}

impl SchedulerInner {
    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned scheduler lock");
            poisoned.into_inner()
        })
    }

    fn update_record(&self, name: &str, f: impl FnOnce(&mut JobRecord)) {
        if let Some(entry) = self.lock_tasks().get_mut(name) {
            f(&mut entry.record);
        }
    }
}

/// Clears a task's running flag however its run ends, including when the
/// run's future is dropped mid-flight.
struct RunningGuard {
    inner: Arc<SchedulerInner>,
    name: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.update_record(&self.name, |record| record.running = false);
    }
}

/// What `begin_run` decided under the lock.
enum RunStart {
    Skip,
    Go {
        body: TaskFn,
        policy: RetryPolicy,
        chain: Option<Chain>,
    },
}

/// Registry and runner for named tasks.
///
/// Cloning is cheap; clones share the same task table.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_reporter(config, Arc::new(TracingReporter))
    }

    pub fn with_reporter(config: SchedulerConfig, reporter: Arc<dyn SchedulerReporter>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: Mutex::new(HashMap::new()),
                config,
                reporter,
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register a task that fires on `schedule`.
    pub fn register<F, Fut>(&self, name: &str, body: F, schedule: Schedule) -> Result<(), AppError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput, AppError>> + Send + 'static,
    {
        self.register_task(TaskSpec::new(name, body).schedule(schedule))
    }

    pub fn register_task(&self, spec: TaskSpec) -> Result<(), AppError> {
        let TaskSpec {
            name,
            body,
            schedule,
            retry,
            chain,
        } = spec;

        {
            let mut tasks = self.inner.lock_tasks();
            if tasks.contains_key(&name) {
                return Err(AppError::DuplicateTask(name));
            }
            let record = JobRecord::new(&name, schedule.as_ref());
            tasks.insert(
                name.clone(),
                TaskEntry {
                    body,
                    schedule: schedule.clone(),
                    retry,
                    chain,
                    record,
                },
            );
        }

        self.inner.reporter.report(SchedulerEvent::Registered {
            task: &name,
            schedule: schedule.as_ref(),
        });
        Ok(())
    }

    /// Run `name` unless a run is already in flight.
    ///
    /// The body goes through the task's retry policy. On success, a chained
    /// task (if any) is spawned after its delay when the run produced items.
    pub async fn run_guarded(&self, name: &str) -> Result<RunOutcome, AppError> {
        self.run_inner(name.to_string(), true).await
    }

    fn run_inner(
        &self,
        name: String,
        allow_chain: bool,
    ) -> BoxFuture<'static, Result<RunOutcome, AppError>> {
        let this = self.clone();
        Box::pin(async move {
            let (body, policy, chain) = match this.begin_run(&name)? {
                RunStart::Skip => {
                    this.inner
                        .reporter
                        .report(SchedulerEvent::RunSkipped { task: &name });
                    return Ok(RunOutcome::Skipped);
                }
                RunStart::Go {
                    body,
                    policy,
                    chain,
                } => (body, policy, chain),
            };
            let _guard = RunningGuard {
                inner: Arc::clone(&this.inner),
                name: name.clone(),
            };

            this.inner
                .reporter
                .report(SchedulerEvent::RunStarted { task: &name });
            let started = Instant::now();
            let result = this
                .run_with_retry(&name, || body(), policy.max_attempts, policy.base_delay)
                .await;
            let elapsed = started.elapsed();

            match result {
                Ok(output) => {
                    this.inner.update_record(&name, |record| {
                        record.success_count += 1;
                        record.last_run_failed = false;
                        record.last_items = output.items;
                        record.last_finished_at = Some(Utc::now());
                        record.record_duration(elapsed);
                    });
                    this.inner.reporter.report(SchedulerEvent::RunCompleted {
                        task: &name,
                        items: output.items,
                        duration: elapsed,
                    });

                    if let Some(chain) = chain.filter(|_| allow_chain && output.items > 0) {
                        this.spawn_chain(&name, chain);
                    }
                    Ok(RunOutcome::Completed(output))
                }
                Err(error) => {
                    this.inner.update_record(&name, |record| {
                        record.failure_count += 1;
                        record.last_run_failed = true;
                        record.last_finished_at = Some(Utc::now());
                        record.record_duration(elapsed);
                    });
                    this.inner.reporter.report(SchedulerEvent::RunFailed {
                        task: &name,
                        error: &error,
                    });
                    Err(error)
                }
            }
        })
    }

    /// Check-and-set of the running flag, done before the run's first await.
    fn begin_run(&self, name: &str) -> Result<RunStart, AppError> {
        let mut tasks = self.inner.lock_tasks();
        let entry = tasks
            .get_mut(name)
            .ok_or_else(|| AppError::UnknownTask(name.to_string()))?;

        if entry.record.running {
            entry.record.skipped_count += 1;
            return Ok(RunStart::Skip);
        }

        entry.record.running = true;
        entry.record.attempts = 0;
        entry.record.last_started_at = Some(Utc::now());
        Ok(RunStart::Go {
            body: Arc::clone(&entry.body),
            policy: entry
                .retry
                .unwrap_or_else(|| RetryPolicy::from(&self.inner.config)),
            chain: entry.chain.clone(),
        })
    }

    fn spawn_chain(&self, from: &str, chain: Chain) {
        let delay = chain.delay.unwrap_or(self.inner.config.chain_delay);
        self.inner.reporter.report(SchedulerEvent::ChainScheduled {
            task: from,
            next: &chain.next,
            delay,
        });

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(error) = this.run_inner(chain.next.clone(), false).await {
                this.inner.reporter.report(SchedulerEvent::ChainFailed {
                    task: &chain.next,
                    error: &error,
                });
            }
        });
    }

    /// Attempt `body` up to `max_attempts` times (at least once), waiting
    /// `base_delay * attempt` after each failure. Attempts and failures are
    /// recorded on `name`'s [`JobRecord`].
    ///
    /// When every attempt fails the last error is returned wrapped in
    /// [`AppError::RetryExhausted`].
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        name: &str,
        mut body: F,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if !self.inner.lock_tasks().contains_key(name) {
            return Err(AppError::UnknownTask(name.to_string()));
        }
        let policy = RetryPolicy::new(max_attempts.max(1), base_delay);

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.inner
                .update_record(name, |record| record.attempts = attempt);

            let error = match body().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let last = attempt >= policy.max_attempts;
            let retry_in = (!last).then(|| policy.delay_for_attempt(attempt));
            self.inner.update_record(name, |record| {
                record.failed_attempts += 1;
                record.last_error = Some(error.to_string());
            });
            self.inner.reporter.report(SchedulerEvent::AttemptFailed {
                task: name,
                attempt,
                max_attempts: policy.max_attempts,
                error: &error,
                retry_in,
            });

            match retry_in {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(AppError::RetryExhausted {
                        task: name.to_string(),
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }
            }
        }
    }

    /// Snapshot of every task's record, sorted by name.
    pub fn get_status(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .inner
            .lock_tasks()
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn get_record(&self, name: &str) -> Option<JobRecord> {
        self.inner
            .lock_tasks()
            .get(name)
            .map(|entry| entry.record.clone())
    }

    /// Spawn one firing loop per scheduled task. Each tick spawns a guarded
    /// run, so ticks that land while a run is in flight are skipped. Loops
    /// end when `cancel` fires; runs already in flight finish on their own.
    ///
    /// Loops are spawned once per scheduler. Later calls return no handles.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Scheduler already started, not spawning firing loops again");
            return Vec::new();
        }
        let scheduled: Vec<(String, Schedule)> = self
            .inner
            .lock_tasks()
            .iter()
            .filter_map(|(name, entry)| entry.schedule.clone().map(|s| (name.clone(), s)))
            .collect();

        scheduled
            .into_iter()
            .map(|(name, schedule)| {
                let this = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { this.fire_loop(name, schedule, cancel).await })
            })
            .collect()
    }

    async fn fire_loop(&self, name: String, schedule: Schedule, cancel: CancellationToken) {
        self.inner
            .reporter
            .report(SchedulerEvent::LoopStarted { task: &name });

        // Ticks are laid out on the wall clock but slept on the tokio clock,
        // anchored once so that late wakeups do not accumulate drift.
        let (origin, origin_at) = (Instant::now(), Utc::now());
        let mut cursor = origin_at;
        while let Some(next) = schedule.next_after(cursor) {
            let offset = (next - origin_at).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                () = tokio::time::sleep_until(origin + offset) => {}
                () = cancel.cancelled() => break,
            }
            cursor = next;
            // Failures are already reported and recorded by the run itself.
            let run = self.run_inner(name.clone(), true);
            tokio::spawn(async move {
                let _ = run.await;
            });
        }

        self.inner
            .reporter
            .report(SchedulerEvent::LoopStopped { task: &name });
    }
}
