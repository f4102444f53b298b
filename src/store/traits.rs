//! Unified `Database` trait — single async interface for all persistence.
//!
//! The queue section is the concurrency-critical part: every cross-worker
//! decision is a single compare-and-swap statement against the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::chats::model::{Chat, ChatMessage, ChatRole};
use crate::error::DatabaseError;
use crate::tasks::model::{
    ActorType, CommentAuthor, CommentOptions, NewTaskLog, QueueItem, QueueKind, QueueStatus, Task,
    TaskComment, TaskLog, TaskStatus,
};
use crate::workspaces::model::{Agent, AgentUpdate, Workspace, WorkspaceUpdate};

/// Backend-agnostic database trait covering workspaces, tasks, chats, and queues.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Workspaces & agents ─────────────────────────────────────────

    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), DatabaseError>;

    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, DatabaseError>;

    /// Apply a partial update. Returns false if the workspace does not exist.
    async fn update_workspace(
        &self,
        id: Uuid,
        update: &WorkspaceUpdate,
    ) -> Result<bool, DatabaseError>;

    async fn create_agent(&self, agent: &Agent) -> Result<(), DatabaseError>;

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError>;

    /// Agents of a workspace in execution order.
    async fn list_agents(&self, workspace_id: Uuid) -> Result<Vec<Agent>, DatabaseError>;

    /// Apply a partial update. Returns false if the agent does not exist.
    async fn update_agent(&self, id: Uuid, update: &AgentUpdate) -> Result<bool, DatabaseError>;

    async fn delete_agent(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Rewrite `order` so `agent_ids` run in the given sequence.
    ///
    /// Ids that do not belong to the workspace are ignored.
    async fn reorder_agents(
        &self,
        workspace_id: Uuid,
        agent_ids: &[Uuid],
    ) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a task, log `task_created`, and enqueue it.
    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    /// Change a task's status and log `status_changed`.
    ///
    /// A regression into `todo` enqueues the task when it has no active item.
    /// Returns the previous status, or `None` if the task does not exist.
    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        actor: ActorType,
        actor_id: Option<Uuid>,
    ) -> Result<Option<TaskStatus>, DatabaseError>;

    /// Force every other `in_progress` task of the workspace back to `todo`.
    ///
    /// Demoted tasks are not re-enqueued. Returns the number demoted.
    async fn demote_other_in_progress_tasks(
        &self,
        workspace_id: Uuid,
        except_task_id: Uuid,
    ) -> Result<usize, DatabaseError>;

    /// Flag (or unflag) the task's active queue item as priority.
    async fn set_task_priority(&self, task_id: Uuid, priority: bool) -> Result<(), DatabaseError>;

    /// Add a comment and log `comment_added`.
    ///
    /// With `options.enqueue`, a task without an active queue item gets one.
    async fn add_task_comment(
        &self,
        task_id: Uuid,
        author: CommentAuthor,
        content: &str,
        options: CommentOptions,
    ) -> Result<TaskComment, DatabaseError>;

    async fn list_task_comments(&self, task_id: Uuid) -> Result<Vec<TaskComment>, DatabaseError>;

    async fn add_task_log(&self, log: NewTaskLog) -> Result<(), DatabaseError>;

    async fn list_task_logs(&self, task_id: Uuid) -> Result<Vec<TaskLog>, DatabaseError>;

    // ── Chats ───────────────────────────────────────────────────────

    async fn create_chat(&self, chat: &Chat) -> Result<(), DatabaseError>;

    async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, DatabaseError>;

    async fn rename_chat(&self, id: Uuid, title: &str) -> Result<bool, DatabaseError>;

    /// Append a message; with `options.enqueue` the chat gets a queue item
    /// when it has no active one.
    async fn add_chat_message(
        &self,
        chat_id: Uuid,
        role: ChatRole,
        content: &str,
        options: CommentOptions,
    ) -> Result<ChatMessage, DatabaseError>;

    async fn list_chat_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>, DatabaseError>;

    // ── Queue ───────────────────────────────────────────────────────

    /// Insert a `queued` item unless the owner already has an active one.
    async fn enqueue(
        &self,
        kind: QueueKind,
        owner_id: Uuid,
        workspace_id: Uuid,
        is_priority: bool,
    ) -> Result<Option<QueueItem>, DatabaseError>;

    async fn get_queue_item(
        &self,
        kind: QueueKind,
        id: Uuid,
    ) -> Result<Option<QueueItem>, DatabaseError>;

    /// The owner's `queued` or `in_progress` item, if any.
    async fn active_queue_item(
        &self,
        kind: QueueKind,
        owner_id: Uuid,
    ) -> Result<Option<QueueItem>, DatabaseError>;

    /// Distinct workspaces with a `queued` item whose owner is actionable.
    async fn find_workspaces_with_queued_items(
        &self,
        kind: QueueKind,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    /// Three-tier pickup: priority, then sticky continuation, then LIFO.
    async fn pick_next_queue_item(
        &self,
        kind: QueueKind,
        workspace_id: Uuid,
    ) -> Result<Option<QueueItem>, DatabaseError>;

    /// Compare-and-swap `queued → in_progress`. `None` means another worker won.
    async fn claim_queue_item(
        &self,
        kind: QueueKind,
        id: Uuid,
    ) -> Result<Option<QueueItem>, DatabaseError>;

    async fn update_queue_item_status(
        &self,
        kind: QueueKind,
        id: Uuid,
        status: QueueStatus,
    ) -> Result<(), DatabaseError>;

    /// Crash recovery: every `in_progress` item goes back to `queued`.
    async fn reset_in_progress_queue_items(&self, kind: QueueKind) -> Result<usize, DatabaseError>;

    /// Number of `failed` items since the owner's last `completed` one.
    async fn count_consecutive_failures(
        &self,
        kind: QueueKind,
        owner_id: Uuid,
    ) -> Result<u32, DatabaseError>;

    /// Delete terminal items last touched before `cutoff`, keeping the most
    /// recent terminal item of each workspace.
    async fn delete_terminal_queue_items_before(
        &self,
        kind: QueueKind,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &serde_json::Value)
    -> Result<(), DatabaseError>;
}
