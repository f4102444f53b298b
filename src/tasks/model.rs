//! Task data model — tasks, queue items, comments, and audit logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(Self::Todo),
            "in_progress" => Some(Self::InProgress),
            "in_review" => Some(Self::InReview),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    /// Only tasks in these states have their queue items picked up.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::Todo | Self::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work agents act on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub summary: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(workspace_id: Uuid, summary: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            summary: summary.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }
}

/// Which queue a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Task,
    Chat,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Task => "task",
            Self::Chat => "chat",
        })
    }
}

/// Status of a queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Completed and failed rows are immutable history.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of pending, in-flight, or finished work for a task or chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub kind: QueueKind,
    /// Task id or chat id, depending on `kind`.
    pub owner_id: Uuid,
    pub workspace_id: Uuid,
    pub status: QueueStatus,
    pub is_priority: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who wrote a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum CommentAuthor {
    User,
    Agent(Uuid),
    System,
}

impl CommentAuthor {
    pub fn actor_type(&self) -> ActorType {
        match self {
            Self::User => ActorType::User,
            Self::Agent(_) => ActorType::Agent,
            Self::System => ActorType::System,
        }
    }

    pub fn agent_id(&self) -> Option<Uuid> {
        match self {
            Self::Agent(id) => Some(*id),
            _ => None,
        }
    }
}

/// A comment on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub author: CommentAuthor,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Options for adding a comment.
#[derive(Debug, Clone, Copy)]
pub struct CommentOptions {
    /// Enqueue the task when it has no active queue item.
    pub enqueue: bool,
}

impl Default for CommentOptions {
    fn default() -> Self {
        Self { enqueue: true }
    }
}

/// Kind of actor behind a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Agent,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Self::User,
            "agent" => Self::Agent,
            _ => Self::System,
        }
    }
}

/// Well-known task log event types.
pub mod events {
    pub const TASK_CREATED: &str = "task_created";
    pub const STATUS_CHANGED: &str = "status_changed";
    pub const COMMENT_ADDED: &str = "comment_added";
    pub const AGENT_STARTED: &str = "agent_started";
    pub const AGENT_FINISHED: &str = "agent_finished";
    pub const TASK_CANCELLED: &str = "task_cancelled";
    pub const TASK_PRIORITIZED: &str = "task_prioritized";
    pub const TASK_DEPRIORITIZED: &str = "task_deprioritized";
}

/// Append-only audit entry for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: Uuid,
    pub task_id: Uuid,
    pub event_type: String,
    pub actor_type: ActorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A log entry waiting to be written.
#[derive(Debug, Clone)]
pub struct NewTaskLog {
    pub task_id: Uuid,
    pub event_type: &'static str,
    pub actor_type: ActorType,
    pub actor_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

impl NewTaskLog {
    pub fn system(task_id: Uuid, event_type: &'static str) -> Self {
        Self {
            task_id,
            event_type,
            actor_type: ActorType::System,
            actor_id: None,
            metadata: None,
        }
    }

    pub fn agent(task_id: Uuid, agent_id: Uuid, event_type: &'static str) -> Self {
        Self {
            task_id,
            event_type,
            actor_type: ActorType::Agent,
            actor_id: Some(agent_id),
            metadata: None,
        }
    }

    /// Builder: attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_in_todo() {
        let task = Task::new(Uuid::new_v4(), "Fix login");
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(task.description.is_empty());
    }

    #[test]
    fn only_todo_and_in_progress_are_actionable() {
        assert!(TaskStatus::Todo.is_actionable());
        assert!(TaskStatus::InProgress.is_actionable());
        assert!(!TaskStatus::InReview.is_actionable());
        assert!(!TaskStatus::Done.is_actionable());
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::Done,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("cancelled"), None);
    }

    #[test]
    fn terminal_queue_statuses() {
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(!QueueStatus::Queued.is_terminal());
        assert!(!QueueStatus::InProgress.is_terminal());
    }

    #[test]
    fn comment_author_maps_to_actor() {
        let agent = Uuid::new_v4();
        assert_eq!(CommentAuthor::Agent(agent).actor_type(), ActorType::Agent);
        assert_eq!(CommentAuthor::Agent(agent).agent_id(), Some(agent));
        assert_eq!(CommentAuthor::System.actor_type(), ActorType::System);
        assert_eq!(CommentAuthor::User.agent_id(), None);
    }
}
