//! Job scheduler — owns the background loops of a running foreman.
//!
//! One cancellation token is shared by the health, task, chat, and cleanup
//! loops. Stopping cancels it, aborts the loops, and kills every tracked
//! CLI process.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chats::ChatProcessor;
use crate::cli::HealthChecker;
use crate::jobs::cleanup::run_cleanup;
use crate::jobs::pool::{QueueHandler, WorkerPool};
use crate::jobs::registry::ProcessRegistry;
use crate::store::Database;
use crate::tasks::TaskProcessor;

/// Intervals for the scheduled jobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub health_interval: Duration,
    pub cleanup_interval: Duration,
    pub queue_retention: chrono::Duration,
    pub work_dir: PathBuf,
}

impl From<&crate::config::ForemanConfig> for SchedulerConfig {
    fn from(config: &crate::config::ForemanConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            health_interval: config.health_interval,
            cleanup_interval: config.cleanup_interval,
            queue_retention: config.queue_retention,
            work_dir: config.work_dir.clone(),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Starts and stops the foreman's background jobs.
pub struct JobScheduler {
    store: Arc<dyn Database>,
    health: Arc<HealthChecker>,
    tasks: Arc<WorkerPool<TaskProcessor>>,
    chats: Arc<WorkerPool<ChatProcessor>>,
    processes: ProcessRegistry,
    config: SchedulerConfig,
    running: Mutex<Option<Running>>,
}

impl JobScheduler {
    /// `processes` must be the registry the processors register into.
    pub fn new(
        store: Arc<dyn Database>,
        health: Arc<HealthChecker>,
        tasks: Arc<TaskProcessor>,
        chats: Arc<ChatProcessor>,
        processes: ProcessRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            health,
            tasks: Arc::new(WorkerPool::new(tasks)),
            chats: Arc::new(WorkerPool::new(chats)),
            processes,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn task_processor(&self) -> &Arc<TaskProcessor> {
        self.tasks.handler()
    }

    fn state(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state().is_some()
    }

    /// Start every job. Does nothing if already running.
    pub fn start(&self) {
        let mut state = self.state();
        if state.is_some() {
            debug!("Scheduler already running");
            return;
        }

        let cancel = CancellationToken::new();
        let handles = vec![
            spawn_health_loop(
                Arc::clone(&self.health),
                self.config.health_interval,
                cancel.clone(),
            ),
            spawn_queue_loop(Arc::clone(&self.tasks), self.config.poll_interval, cancel.clone()),
            spawn_queue_loop(Arc::clone(&self.chats), self.config.poll_interval, cancel.clone()),
            spawn_cleanup_loop(
                Arc::clone(&self.store),
                self.config.clone(),
                cancel.clone(),
            ),
        ];
        *state = Some(Running { cancel, handles });

        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            health_secs = self.config.health_interval.as_secs(),
            cleanup_secs = self.config.cleanup_interval.as_secs(),
            "Scheduler started"
        );
    }

    /// Stop every job and kill running CLI processes. Does nothing if idle.
    pub fn stop(&self) {
        let Some(running) = self.state().take() else {
            debug!("Scheduler not running");
            return;
        };
        running.cancel.cancel();
        for handle in &running.handles {
            handle.abort();
        }
        let killed = self.processes.kill_all();
        info!(killed, "Scheduler stopped");
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_health_loop(
    health: Arc<HealthChecker>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            health.check_all().await;
        }
    })
}

/// Each tick runs on its own task so a slow workspace never delays the next.
fn spawn_queue_loop<H: QueueHandler>(
    pool: Arc<WorkerPool<H>>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pool.run_tick(&cancel).await;
            });
        }
    })
}

fn spawn_cleanup_loop(
    store: Arc<dyn Database>,
    config: SchedulerConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.cleanup_interval);
        // Skip immediate first tick
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = run_cleanup(&store, &config.work_dir, config.queue_retention).await {
                warn!(error = %e, "Cleanup failed");
            }
        }
    })
}
