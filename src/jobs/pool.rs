//! Per-workspace worker pool shared by the task and chat processors.
//!
//! Each tick finds workspaces with queued work and starts one worker per
//! workspace that has none. A worker claims and fully processes items one
//! at a time until pickup returns nothing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ProcessorError;
use crate::jobs::registry::{WorkerGuard, WorkerRegistry};
use crate::store::Database;
use crate::tasks::model::{QueueItem, QueueKind, QueueStatus};

/// Processing logic for one queue kind.
#[async_trait]
pub trait QueueHandler: Send + Sync + 'static {
    fn kind(&self) -> QueueKind;

    fn store(&self) -> &Arc<dyn Database>;

    /// Claim and fully process `item`. A lost claim returns `Ok(())`.
    async fn process_queue_item(
        &self,
        item: &QueueItem,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessorError>;

    /// Record a processing error (mark the item failed, tell the user).
    async fn handle_failure(&self, item: &QueueItem, error: &ProcessorError);
}

/// Runs at most one worker per workspace for a [`QueueHandler`].
pub struct WorkerPool<H: QueueHandler> {
    handler: Arc<H>,
    workers: WorkerRegistry,
}

impl<H: QueueHandler> WorkerPool<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            workers: WorkerRegistry::new(),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    /// One scheduler tick. Never fails; returns the number of workers started.
    ///
    /// Waits for the workers it started to settle, so callers should run each
    /// tick on its own task.
    pub async fn run_tick(&self, cancel: &CancellationToken) -> usize {
        if cancel.is_cancelled() {
            return 0;
        }
        let kind = self.handler.kind();

        let workspaces = match self
            .handler
            .store()
            .find_workspaces_with_queued_items(kind)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to find workspaces with queued work");
                return 0;
            }
        };

        let mut spawned = Vec::new();
        for workspace_id in workspaces {
            let Some(guard) = self.workers.try_register(workspace_id) else {
                continue;
            };
            debug!(kind = %kind, workspace_id = %workspace_id, "Starting worker");
            let handler = Arc::clone(&self.handler);
            let cancel = cancel.clone();
            spawned.push((
                workspace_id,
                tokio::spawn(run_worker(handler, guard, cancel)),
            ));
        }

        let count = spawned.len();
        let (ids, handles): (Vec<Uuid>, Vec<_>) = spawned.into_iter().unzip();
        let results = futures::future::join_all(handles).await;
        for (workspace_id, result) in ids.into_iter().zip(results) {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(kind = %kind, workspace_id = %workspace_id, "Worker panicked");
                }
            }
        }
        count
    }
}

/// Claim-and-process loop for one workspace.
///
/// The registration is released when `guard` drops, whichever way this ends.
async fn run_worker<H: QueueHandler>(
    handler: Arc<H>,
    guard: WorkerGuard,
    cancel: CancellationToken,
) {
    let kind = handler.kind();
    let workspace_id = guard.workspace_id();
    let mut processed = 0usize;

    loop {
        if cancel.is_cancelled() {
            debug!(kind = %kind, workspace_id = %workspace_id, "Worker cancelled");
            break;
        }

        let item = match handler
            .store()
            .pick_next_queue_item(kind, workspace_id)
            .await
        {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(e) => {
                warn!(kind = %kind, workspace_id = %workspace_id, error = %e, "Pickup failed");
                break;
            }
        };

        if let Err(e) = handler.process_queue_item(&item, &cancel).await {
            warn!(
                kind = %kind,
                item_id = %item.id,
                owner_id = %item.owner_id,
                error = %e,
                "Queue item failed"
            );
            if !was_claimed(handler.store(), kind, &item).await {
                // Never claimed: leave it queued for the next tick.
                break;
            }
            handler.handle_failure(&item, &e).await;
        }
        processed += 1;
    }

    if processed > 0 {
        info!(kind = %kind, workspace_id = %workspace_id, processed, "Worker finished");
    }
    drop(guard);
}

/// Whether `item` left `queued`, i.e. the failure happened after the claim.
async fn was_claimed(store: &Arc<dyn Database>, kind: QueueKind, item: &QueueItem) -> bool {
    match store.get_queue_item(kind, item.id).await {
        Ok(Some(current)) => current.status != QueueStatus::Queued,
        Ok(None) => false,
        Err(e) => {
            warn!(kind = %kind, item_id = %item.id, error = %e, "Failed to reload queue item");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::error::DatabaseError;
    use crate::store::LibSqlBackend;
    use crate::tasks::model::Task;
    use crate::workspaces::model::Workspace;

    /// Handler that claims, records overlap, and completes.
    struct RecordingHandler {
        store: Arc<dyn Database>,
        running: Mutex<Vec<Uuid>>,
        max_concurrent_per_workspace: Mutex<usize>,
        processed: Mutex<Vec<Uuid>>,
        /// Owners whose processing errors out before the claim.
        fail_unclaimed: Mutex<Vec<Uuid>>,
        failures: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl QueueHandler for RecordingHandler {
        fn kind(&self) -> QueueKind {
            QueueKind::Task
        }

        fn store(&self) -> &Arc<dyn Database> {
            &self.store
        }

        async fn process_queue_item(
            &self,
            item: &QueueItem,
            _cancel: &CancellationToken,
        ) -> Result<(), ProcessorError> {
            if self.fail_unclaimed.lock().unwrap().contains(&item.owner_id) {
                return Err(DatabaseError::Query("database is locked".into()).into());
            }
            let Some(item) = self.store.claim_queue_item(QueueKind::Task, item.id).await? else {
                return Ok(());
            };
            {
                let mut running = self.running.lock().unwrap();
                running.push(item.workspace_id);
                let same = running.iter().filter(|w| **w == item.workspace_id).count();
                let mut max = self.max_concurrent_per_workspace.lock().unwrap();
                *max = (*max).max(same);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            {
                let mut running = self.running.lock().unwrap();
                if let Some(pos) = running.iter().position(|w| *w == item.workspace_id) {
                    running.remove(pos);
                }
            }
            self.store
                .update_queue_item_status(QueueKind::Task, item.id, QueueStatus::Completed)
                .await?;
            self.processed.lock().unwrap().push(item.owner_id);
            Ok(())
        }

        async fn handle_failure(&self, item: &QueueItem, _error: &ProcessorError) {
            self.failures.lock().unwrap().push(item.owner_id);
        }
    }

    async fn setup(workspaces: usize, tasks_each: usize) -> (Arc<RecordingHandler>, Vec<Task>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut tasks = Vec::new();
        for w in 0..workspaces {
            let ws = Workspace::new(format!("ws-{w}"));
            db.create_workspace(&ws).await.unwrap();
            for t in 0..tasks_each {
                let task = Task::new(ws.id, format!("task-{t}"));
                db.create_task(&task).await.unwrap();
                tasks.push(task);
            }
        }
        let handler = Arc::new(RecordingHandler {
            store: db,
            running: Mutex::new(Vec::new()),
            max_concurrent_per_workspace: Mutex::new(0),
            processed: Mutex::new(Vec::new()),
            fail_unclaimed: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        });
        (handler, tasks)
    }

    #[tokio::test]
    async fn tick_drains_every_workspace_one_item_at_a_time() {
        let (handler, tasks) = setup(3, 3).await;
        let pool = WorkerPool::new(handler.clone());

        let started = pool.run_tick(&CancellationToken::new()).await;
        assert_eq!(started, 3);
        assert_eq!(handler.processed.lock().unwrap().len(), tasks.len());
        assert_eq!(*handler.max_concurrent_per_workspace.lock().unwrap(), 1);
        assert!(pool.workers().is_empty());
    }

    #[tokio::test]
    async fn overlapping_ticks_never_double_schedule_a_workspace() {
        let (handler, tasks) = setup(1, 4).await;
        let pool = Arc::new(WorkerPool::new(handler.clone()));
        let cancel = CancellationToken::new();

        let ticks = (0..4).map(|_| {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run_tick(&cancel).await })
        });
        let started: usize = futures::future::join_all(ticks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .sum();

        assert!(started >= 1);
        assert_eq!(*handler.max_concurrent_per_workspace.lock().unwrap(), 1);
        assert_eq!(handler.processed.lock().unwrap().len(), tasks.len());
    }

    #[tokio::test]
    async fn cancelled_tick_starts_nothing() {
        let (handler, _) = setup(1, 1).await;
        let pool = WorkerPool::new(handler.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(pool.run_tick(&cancel).await, 0);
        assert!(handler.processed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_before_claim_leaves_item_queued() {
        let (handler, tasks) = setup(1, 1).await;
        let task = &tasks[0];
        handler.fail_unclaimed.lock().unwrap().push(task.id);
        let pool = WorkerPool::new(handler.clone());

        assert_eq!(pool.run_tick(&CancellationToken::new()).await, 1);
        assert!(handler.failures.lock().unwrap().is_empty());
        assert!(pool.workers().is_empty());
        let item = handler
            .store
            .active_queue_item(QueueKind::Task, task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.status, QueueStatus::Queued);

        // The next tick picks it up again.
        handler.fail_unclaimed.lock().unwrap().clear();
        pool.run_tick(&CancellationToken::new()).await;
        assert_eq!(handler.processed.lock().unwrap().as_slice(), &[task.id]);
    }

    #[tokio::test]
    async fn in_progress_item_counts_as_claimed() {
        let (handler, tasks) = setup(1, 1).await;
        let task = &tasks[0];
        let item = handler
            .store
            .active_queue_item(QueueKind::Task, task.id)
            .await
            .unwrap()
            .unwrap();
        handler
            .store
            .claim_queue_item(QueueKind::Task, item.id)
            .await
            .unwrap()
            .unwrap();

        assert!(was_claimed(&handler.store, QueueKind::Task, &item).await);
    }
}
