//! Task processor — turns claimed task queue items into agent loop runs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::AgentInvoker;
use crate::config::ProcessorConfig;
use crate::error::ProcessorError;
use crate::jobs::pool::QueueHandler;
use crate::jobs::registry::ProcessRegistry;
use crate::store::Database;
use crate::tasks::agent_loop::{AgentLoop, AgentLoopDeps, LoopOutcome};
use crate::tasks::model::{
    ActorType, CommentAuthor, CommentOptions, NewTaskLog, QueueItem, QueueKind, QueueStatus,
    TaskStatus, events,
};
use crate::workspaces::{WorkTarget, resolve_working_dir};

/// Processes task queue items for one process.
pub struct TaskProcessor {
    store: Arc<dyn Database>,
    processes: ProcessRegistry,
    agent_loop: AgentLoop,
    config: ProcessorConfig,
}

impl TaskProcessor {
    pub fn new(
        store: Arc<dyn Database>,
        invoker: Arc<dyn AgentInvoker>,
        processes: ProcessRegistry,
        config: ProcessorConfig,
    ) -> Self {
        let agent_loop = AgentLoop::new(
            AgentLoopDeps {
                store: Arc::clone(&store),
                invoker,
                processes: processes.clone(),
            },
            config.max_passes,
            config.invocation_timeout,
        );
        Self {
            store,
            processes,
            agent_loop,
            config,
        }
    }

    /// Complete `item_id` unless something else (e.g. a cancel) already
    /// finalised it.
    async fn complete_if_running(&self, item_id: Uuid) -> Result<(), ProcessorError> {
        let current = self.store.get_queue_item(QueueKind::Task, item_id).await?;
        if current.is_some_and(|i| i.status == QueueStatus::InProgress) {
            self.store
                .update_queue_item_status(QueueKind::Task, item_id, QueueStatus::Completed)
                .await?;
        }
        Ok(())
    }

    /// Move the task to review if it is still being worked on.
    async fn move_to_review(&self, task_id: Uuid) -> Result<(), ProcessorError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(ProcessorError::TaskNotFound(task_id))?;
        if task.status.is_actionable() {
            self.store
                .update_task_status(task_id, TaskStatus::InReview, ActorType::System, None)
                .await?;
        }
        Ok(())
    }

    /// Explicitly cancel a task.
    ///
    /// Kills its running CLI process, fails its active queue item, moves the
    /// task to `in_review`, and logs `task_cancelled`.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<(), ProcessorError> {
        if self.store.get_task(task_id).await?.is_none() {
            return Err(ProcessorError::TaskNotFound(task_id));
        }

        let killed = self.processes.kill(task_id);
        let active = self
            .store
            .active_queue_item(QueueKind::Task, task_id)
            .await?;
        if let Some(item) = &active {
            self.store
                .update_queue_item_status(QueueKind::Task, item.id, QueueStatus::Failed)
                .await?;
        }
        self.store
            .update_task_status(task_id, TaskStatus::InReview, ActorType::User, None)
            .await?;
        self.store
            .add_task_log(NewTaskLog {
                task_id,
                event_type: events::TASK_CANCELLED,
                actor_type: ActorType::User,
                actor_id: None,
                metadata: Some(serde_json::json!({
                    "process_killed": killed,
                    "queue_item_id": active.map(|i| i.id.to_string()),
                })),
            })
            .await?;

        info!(task_id = %task_id, process_killed = killed, "Task cancelled");
        Ok(())
    }
}

#[async_trait]
impl QueueHandler for TaskProcessor {
    fn kind(&self) -> QueueKind {
        QueueKind::Task
    }

    fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    async fn process_queue_item(
        &self,
        item: &QueueItem,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessorError> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let Some(item) = self.store.claim_queue_item(QueueKind::Task, item.id).await? else {
            debug!(item_id = %item.id, "Queue item claimed elsewhere");
            return Ok(());
        };

        let task = self
            .store
            .get_task(item.owner_id)
            .await?
            .ok_or(ProcessorError::TaskNotFound(item.owner_id))?;
        let workspace = self
            .store
            .get_workspace(task.workspace_id)
            .await?
            .ok_or(ProcessorError::WorkspaceNotFound(task.workspace_id))?;

        if task.status == TaskStatus::Todo {
            self.store
                .update_task_status(task.id, TaskStatus::InProgress, ActorType::System, None)
                .await?;
        }
        self.store
            .demote_other_in_progress_tasks(workspace.id, task.id)
            .await?;

        let agents = self.store.list_agents(workspace.id).await?;
        if agents.is_empty() {
            info!(task_id = %task.id, workspace_id = %workspace.id, "No agents configured, moving task to review");
            self.move_to_review(task.id).await?;
            self.complete_if_running(item.id).await?;
            return Ok(());
        }

        let working_dir =
            resolve_working_dir(&workspace, &self.config.work_dir, WorkTarget::Task(task.id))
                .await?;

        info!(
            task_id = %task.id,
            item_id = %item.id,
            agents = agents.len(),
            priority = item.is_priority,
            "Processing task"
        );
        let outcome = self
            .agent_loop
            .run(&workspace, task.id, &agents, &working_dir, cancel)
            .await?;

        match outcome {
            LoopOutcome::Cancelled => {
                info!(task_id = %task.id, item_id = %item.id, "Task processing cancelled");
                return Ok(());
            }
            LoopOutcome::NothingToDo { passes } | LoopOutcome::IterationLimit { passes } => {
                debug!(task_id = %task.id, passes, "Agent loop finished without a review request");
                self.move_to_review(task.id).await?;
            }
            LoopOutcome::ReviewRequested { .. } | LoopOutcome::Interrupted { .. } => {}
        }
        self.complete_if_running(item.id).await?;
        info!(task_id = %task.id, outcome = ?outcome, "Task item completed");
        Ok(())
    }

    async fn handle_failure(&self, item: &QueueItem, failure: &ProcessorError) {
        // Fail first so the comment below can enqueue a fresh item.
        if let Err(e) = self
            .store
            .update_queue_item_status(QueueKind::Task, item.id, QueueStatus::Failed)
            .await
        {
            error!(item_id = %item.id, error = %e, "Failed to mark queue item failed");
        }

        let failures = self
            .store
            .count_consecutive_failures(QueueKind::Task, item.owner_id)
            .await
            .unwrap_or(0);
        let cap = self.config.max_consecutive_failures;
        let give_up = cap > 0 && failures >= cap;

        let content = if give_up {
            format!(
                "Processing failed: {failure}\n\nStopped retrying after {failures} consecutive failures."
            )
        } else {
            format!("Processing failed: {failure}")
        };
        if let Err(e) = self
            .store
            .add_task_comment(
                item.owner_id,
                CommentAuthor::System,
                &content,
                CommentOptions { enqueue: !give_up },
            )
            .await
        {
            warn!(task_id = %item.owner_id, error = %e, "Failed to record failure comment");
            return;
        }

        if give_up {
            warn!(task_id = %item.owner_id, failures, "Retry limit reached, moving task to review");
            if let Err(e) = self
                .store
                .update_task_status(item.owner_id, TaskStatus::InReview, ActorType::System, None)
                .await
            {
                warn!(task_id = %item.owner_id, error = %e, "Failed to move task to review");
            }
        }
    }
}
