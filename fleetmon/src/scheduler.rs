//! Cron-driven dispatch. Owns the registered schedule jobs, filters the
//! server fleet per schedule, caps concurrent executions per server, retries
//! failed executions with bounded backoff, and keeps bounded execution
//! history. Cron occurrences are evaluated in UTC.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use cron::Schedule as CronSchedule;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::events::{EventBus, ServerEvent};
use crate::executors::{
    CommandExecutor, ExecutionContext, ExecutionOutcome, ServerMonitoringExecutor,
};
use crate::models::{
    ExecutionStatus, ScheduleConfig, ScheduleExecutionResult, ScheduleStats, ScheduledCommand,
    ServerInfo,
};
use crate::repositories::ServerRepo;
use crate::sessions::SessionRegistry;

const HISTORY_LIMIT: usize = 100;
const EXECUTION_BACKOFF_BASE_MS: u64 = 1000;
const EXECUTION_BACKOFF_CAP_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("schedule {0} not found")]
    ScheduleNotFound(String),
    #[error("schedule {0} is already registered")]
    ScheduleAlreadyExists(String),
    #[error("invalid cron expression '{0}': {1}")]
    InvalidCronExpression(String, String),
    #[error("schedule {0} carries an unknown or invalid command")]
    InvalidCommand(String),
    #[error("schedule {0} execution failed: {1}")]
    ExecutionFailed(String, String),
    #[error("server {0} is not available")]
    ServerNotAvailable(i64),
    #[error("scheduler is not started")]
    SchedulerNotStarted,
}

struct ScheduleJob {
    command: ScheduledCommand,
    cron: CronSchedule,
    stats: ScheduleStats,
    history: VecDeque<ScheduleExecutionResult>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ExecutionGates {
    in_flight: HashSet<(i64, String)>,
    per_server: HashMap<i64, usize>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub registered_schedules: usize,
    pub total_executions: u64,
    pub failed_executions: u64,
}

pub struct CommandScheduler {
    config: ScheduleConfig,
    executors: HashMap<&'static str, Arc<dyn CommandExecutor>>,
    servers: Arc<dyn ServerRepo>,
    sessions: Arc<SessionRegistry>,
    monitoring: Arc<ServerMonitoringExecutor>,
    events: EventBus,
    jobs: Mutex<HashMap<String, ScheduleJob>>,
    gates: StdMutex<ExecutionGates>,
    running: AtomicBool,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl CommandScheduler {
    /// The monitoring executor is constructed by the composition root and
    /// handed in; the scheduler registers it in its executor table and
    /// drives it from the `SERVER_AUTHENTICATED` bridge.
    pub fn new(
        config: ScheduleConfig,
        servers: Arc<dyn ServerRepo>,
        sessions: Arc<SessionRegistry>,
        events: EventBus,
        monitoring: Arc<ServerMonitoringExecutor>,
    ) -> Self {
        let mut scheduler = Self {
            config,
            executors: HashMap::new(),
            servers,
            sessions,
            monitoring: monitoring.clone(),
            events,
            jobs: Mutex::new(HashMap::new()),
            gates: StdMutex::new(ExecutionGates::default()),
            running: AtomicBool::new(false),
            event_task: Mutex::new(None),
        };
        scheduler.register_executor(monitoring);
        scheduler
    }

    pub fn register_executor(&mut self, executor: Arc<dyn CommandExecutor>) {
        self.executors.insert(executor.executor_type(), executor);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Scheduler disabled by configuration");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Scheduler already started");
            return;
        }

        for schedule in self.config.schedules.clone() {
            if !schedule.enabled {
                debug!("Schedule {} is disabled, not registering", schedule.id);
                continue;
            }
            let id = schedule.id.clone();
            if let Err(e) = self.register_schedule(schedule).await {
                warn!("Skipping schedule {}: {}", id, e);
            }
        }
        self.start_pending_tasks().await;
        self.spawn_event_bridge().await;

        let registered = self.jobs.lock().await.len();
        info!("Scheduler started with {} schedule(s)", registered);
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.event_task.lock().await.take() {
            handle.abort();
        }

        let mut jobs = self.jobs.lock().await;
        for (id, job) in jobs.iter_mut() {
            if let Some(task) = job.task.take() {
                task.abort();
                debug!("Stopped cron task for schedule {}", id);
            }
        }
        jobs.clear();

        let mut gates = self.gates.lock().expect("execution gates poisoned");
        gates.in_flight.clear();
        gates.per_server.clear();

        info!("Scheduler stopped");
    }

    /// Registers one schedule. A duplicate id is an admin error; a schedule
    /// that fails cron/executor/validation checks is skipped with a warning
    /// so a single malformed entry cannot take the daemon down.
    pub async fn register_schedule(
        self: &Arc<Self>,
        schedule: ScheduledCommand,
    ) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&schedule.id) {
            return Err(SchedulerError::ScheduleAlreadyExists(schedule.id));
        }

        let cron = match normalize_cron(&schedule.cron_expression) {
            Ok(cron) => cron,
            Err(e) => {
                warn!("Schedule {} not registered: {}", schedule.id, e);
                return Ok(());
            }
        };

        let Some(executor) = self.executors.get(schedule.command.type_name()) else {
            warn!(
                "Schedule {} not registered: no executor for type '{}'",
                schedule.id,
                schedule.command.type_name()
            );
            return Ok(());
        };
        if !executor.validate(&schedule) {
            warn!(
                "Schedule {} not registered: executor rejected its configuration",
                schedule.id
            );
            return Ok(());
        }

        let mut job = ScheduleJob {
            cron,
            stats: ScheduleStats::default(),
            history: VecDeque::new(),
            task: None,
            command: schedule,
        };
        if self.is_running() {
            job.task = Some(self.spawn_cron_task(job.command.id.clone(), job.cron.clone()));
        }
        debug!("Registered schedule {}", job.command.id);
        jobs.insert(job.command.id.clone(), job);
        Ok(())
    }

    /// One pass over the eligible fleet, without consulting the cron
    /// calendar.
    pub async fn execute_schedule_now(
        self: &Arc<Self>,
        schedule_id: &str,
    ) -> Result<Vec<ScheduleExecutionResult>, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::SchedulerNotStarted);
        }
        self.execute_schedule(schedule_id).await
    }

    async fn execute_schedule(
        self: &Arc<Self>,
        schedule_id: &str,
    ) -> Result<Vec<ScheduleExecutionResult>, SchedulerError> {
        let (schedule, executor) = {
            let jobs = self.jobs.lock().await;
            let job = jobs
                .get(schedule_id)
                .ok_or_else(|| SchedulerError::ScheduleNotFound(schedule_id.to_owned()))?;
            let executor = self
                .executors
                .get(job.command.command.type_name())
                .cloned()
                .ok_or_else(|| SchedulerError::InvalidCommand(schedule_id.to_owned()))?;
            (job.command.clone(), executor)
        };

        let started_at = Utc::now();
        let servers = self
            .servers
            .find_active_servers_with_rcon()
            .await
            .map_err(|e| SchedulerError::ExecutionFailed(schedule_id.to_owned(), e.to_string()))?;

        let eligible: Vec<ServerInfo> = servers
            .into_iter()
            .filter(|server| self.should_execute_on_server(server, &schedule))
            .collect();
        let runnable: Vec<ServerInfo> = eligible
            .into_iter()
            .filter(|server| self.try_reserve(server.server_id, &schedule.id))
            .collect();
        debug!(
            "Schedule {} firing on {} server(s)",
            schedule.id,
            runnable.len()
        );

        let results = join_all(
            runnable
                .into_iter()
                .map(|server| self.execute_on_server(server, schedule.clone(), executor.clone())),
        )
        .await;

        let finished_at = Utc::now();
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(schedule_id) {
            job.stats.total += 1;
            let all_succeeded = results
                .iter()
                .all(|r| r.status == ExecutionStatus::Success);
            if all_succeeded {
                job.stats.successful += 1;
            } else {
                job.stats.failed += 1;
            }
            job.stats.last_execution_start = Some(started_at);
            job.stats.last_execution_end = Some(finished_at);
            job.stats.last_execution_duration_ms =
                Some((finished_at - started_at).num_milliseconds().max(0) as u64);

            let retention_floor =
                finished_at - ChronoDuration::hours(self.config.history_retention_hours as i64);
            job.history.retain(|r| r.end_time >= retention_floor);
            job.history.extend(results.iter().cloned());
            while job.history.len() > HISTORY_LIMIT {
                job.history.pop_front();
            }
        }

        Ok(results)
    }

    /// Server filter gate: whitelist, then blacklist, then player bounds
    /// (from the live session registry), then game/tag narrowing.
    fn should_execute_on_server(&self, server: &ServerInfo, schedule: &ScheduledCommand) -> bool {
        match &schedule.server_filter {
            None => true,
            Some(filter) => {
                let current_players =
                    self.sessions.server_session_count(server.server_id) as u32;
                filter.matches(server, current_players)
            }
        }
    }

    /// Concurrency gate: rejects when the same schedule is already running
    /// on the server, or the server is saturated across all schedules.
    /// Reservation and check are one atomic step.
    fn try_reserve(&self, server_id: i64, schedule_id: &str) -> bool {
        let mut gates = self.gates.lock().expect("execution gates poisoned");
        let key = (server_id, schedule_id.to_owned());
        if gates.in_flight.contains(&key) {
            debug!(
                "Schedule {} already executing on server {}",
                schedule_id, server_id
            );
            return false;
        }
        let count = gates.per_server.entry(server_id).or_insert(0);
        if *count >= self.config.max_concurrent_per_server {
            debug!(
                "Server {} is saturated ({} concurrent schedules)",
                server_id, count
            );
            return false;
        }
        *count += 1;
        gates.in_flight.insert(key);
        true
    }

    fn release(&self, server_id: i64, schedule_id: &str) {
        let mut gates = self.gates.lock().expect("execution gates poisoned");
        gates.in_flight.remove(&(server_id, schedule_id.to_owned()));
        if let Some(count) = gates.per_server.get_mut(&server_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                gates.per_server.remove(&server_id);
            }
        }
    }

    async fn execute_on_server(
        &self,
        server: ServerInfo,
        schedule: ScheduledCommand,
        executor: Arc<dyn CommandExecutor>,
    ) -> ScheduleExecutionResult {
        let start_time = Utc::now();
        let started = Instant::now();
        let server_id = server.server_id;

        let max_retries = schedule.max_retries.unwrap_or(self.config.default_max_retries);
        let retry_on_failure = schedule
            .retry_on_failure
            .unwrap_or(self.config.default_retry_on_failure);
        let timeout_ms = schedule.timeout_ms.unwrap_or(self.config.default_timeout_ms);

        let context = ExecutionContext {
            server,
            schedule: schedule.clone(),
        };

        let mut errors = Vec::new();
        let mut outcome: Option<ExecutionOutcome> = None;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match timeout(
                Duration::from_millis(timeout_ms),
                executor.execute(&context),
            )
            .await
            {
                Ok(Ok(result)) => {
                    outcome = Some(result);
                    break;
                }
                Ok(Err(e)) => errors.push(e.to_string()),
                Err(_) => errors.push(format!("execution timed out after {}ms", timeout_ms)),
            }

            if !retry_on_failure || attempt > max_retries {
                break;
            }
            let backoff = execution_backoff(attempt);
            debug!(
                "Schedule {} on server {} retrying in {:?} (attempt {})",
                schedule.id, server_id, backoff, attempt
            );
            sleep(backoff).await;
        }

        self.release(server_id, &schedule.id);

        let end_time = Utc::now();
        let (status, counts) = match outcome {
            Some(counts) => (ExecutionStatus::Success, counts),
            None => (
                ExecutionStatus::Failed,
                ExecutionOutcome {
                    servers_processed: 1,
                    commands_sent: 0,
                },
            ),
        };

        ScheduleExecutionResult {
            execution_id: format!(
                "{}-{}-{}",
                schedule.id,
                server_id,
                start_time.timestamp_millis()
            ),
            schedule_id: schedule.id,
            server_id,
            start_time,
            end_time,
            duration_ms: started.elapsed().as_millis() as u64,
            status,
            servers_processed: counts.servers_processed,
            commands_sent: counts.commands_sent,
            errors: (!errors.is_empty()).then_some(errors),
        }
    }

    async fn start_pending_tasks(self: &Arc<Self>) {
        let mut jobs = self.jobs.lock().await;
        let pending: Vec<(String, CronSchedule)> = jobs
            .iter()
            .filter(|(_, job)| job.task.is_none())
            .map(|(id, job)| (id.clone(), job.cron.clone()))
            .collect();
        for (id, cron) in pending {
            let task = self.spawn_cron_task(id.clone(), cron);
            if let Some(job) = jobs.get_mut(&id) {
                job.task = Some(task);
            }
        }
    }

    fn spawn_cron_task(self: &Arc<Self>, schedule_id: String, cron: CronSchedule) -> JoinHandle<()> {
        let scheduler = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(next) = cron.upcoming(Utc).next() else {
                    debug!("Schedule {} has no future occurrences", schedule_id);
                    break;
                };
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_millis(0));
                sleep(wait).await;

                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                if !scheduler.is_running() {
                    break;
                }
                if let Err(e) = scheduler.execute_schedule(&schedule_id).await {
                    warn!("Schedule {} execution failed: {}", schedule_id, e);
                }
            }
        })
    }

    /// Forwards `SERVER_AUTHENTICATED` into an immediate monitor connect on
    /// the next tick; bridge failures are logged and never propagated.
    async fn spawn_event_bridge(self: &Arc<Self>) {
        let mut receiver = self.events.subscribe();
        let monitoring = self.monitoring.clone();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(ServerEvent::Authenticated { server_id }) => {
                        let monitoring = monitoring.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                monitoring.connect_to_server_immediately(server_id).await
                            {
                                warn!(
                                    "Immediate connect for server {} failed: {}",
                                    server_id, e
                                );
                            }
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event bridge lagged, {} event(s) dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *self.event_task.lock().await = Some(handle);
    }

    /// Admin path: run one schedule against one specific server.
    pub async fn execute_schedule_on_server(
        self: &Arc<Self>,
        schedule_id: &str,
        server_id: i64,
    ) -> Result<ScheduleExecutionResult, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::SchedulerNotStarted);
        }
        let (schedule, executor) = {
            let jobs = self.jobs.lock().await;
            let job = jobs
                .get(schedule_id)
                .ok_or_else(|| SchedulerError::ScheduleNotFound(schedule_id.to_owned()))?;
            let executor = self
                .executors
                .get(job.command.command.type_name())
                .cloned()
                .ok_or_else(|| SchedulerError::InvalidCommand(schedule_id.to_owned()))?;
            (job.command.clone(), executor)
        };

        let server = self
            .servers
            .find_by_id(server_id)
            .await
            .map_err(|e| SchedulerError::ExecutionFailed(schedule_id.to_owned(), e.to_string()))?
            .filter(|s| s.active && s.has_rcon)
            .ok_or(SchedulerError::ServerNotAvailable(server_id))?;
        if !self.try_reserve(server_id, &schedule.id) {
            return Err(SchedulerError::ServerNotAvailable(server_id));
        }

        Ok(self.execute_on_server(server, schedule, executor).await)
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Option<ScheduledCommand> {
        self.jobs
            .lock()
            .await
            .get(schedule_id)
            .map(|job| job.command.clone())
    }

    pub async fn get_all_schedules(&self) -> Vec<ScheduledCommand> {
        self.jobs
            .lock()
            .await
            .values()
            .map(|job| job.command.clone())
            .collect()
    }

    pub async fn get_schedule_stats(&self, schedule_id: &str) -> Option<ScheduleStats> {
        self.jobs
            .lock()
            .await
            .get(schedule_id)
            .map(|job| job.stats.clone())
    }

    pub async fn get_execution_history(
        &self,
        schedule_id: &str,
        limit: usize,
    ) -> Vec<ScheduleExecutionResult> {
        self.jobs
            .lock()
            .await
            .get(schedule_id)
            .map(|job| job.history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_scheduler_stats(&self) -> SchedulerStats {
        let jobs = self.jobs.lock().await;
        SchedulerStats {
            running: self.is_running(),
            registered_schedules: jobs.len(),
            total_executions: jobs.values().map(|j| j.stats.total).sum(),
            failed_executions: jobs.values().map(|j| j.stats.failed).sum(),
        }
    }
}

/// Accepts 5-field (minute-resolution) and 6-field (second-resolution)
/// expressions; 5-field ones are pinned to second zero.
fn normalize_cron(expression: &str) -> Result<CronSchedule, SchedulerError> {
    let normalized = match expression.split_whitespace().count() {
        5 => format!("0 {}", expression),
        6 => expression.to_owned(),
        n => {
            return Err(SchedulerError::InvalidCronExpression(
                expression.to_owned(),
                format!("expected 5 or 6 fields, found {}", n),
            ))
        }
    };
    CronSchedule::from_str(&normalized).map_err(|e| {
        SchedulerError::InvalidCronExpression(expression.to_owned(), e.to_string())
    })
}

fn execution_backoff(attempt: u32) -> Duration {
    let exp = EXECUTION_BACKOFF_BASE_MS.saturating_mul(1u64 << (attempt - 1).min(16));
    Duration::from_millis(exp.min(EXECUTION_BACKOFF_CAP_MS))
}
