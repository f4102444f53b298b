//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Queue operations are
//! parameterised by [`QueueKind`]; the task and chat queues share one
//! schema shape and differ only in the owner column and the filter that
//! decides whether an owner is still actionable.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::chats::model::{Chat, ChatMessage, ChatRole};
use crate::cli::CliType;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tasks::model::{
    ActorType, CommentAuthor, CommentOptions, NewTaskLog, QueueItem, QueueKind, QueueStatus, Task,
    TaskComment, TaskLog, TaskStatus, events,
};
use crate::workspaces::model::{Agent, AgentUpdate, WorkingDirMode, Workspace, WorkspaceUpdate};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_queue_item(
        &self,
        kind: QueueKind,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Option<QueueItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_queue_item(&row, kind)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op} row: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width RFC 3339 so text order is time order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    fmt_ts(Utc::now())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("{field} parse: {e}")))
}

fn get_text(row: &libsql::Row, idx: i32, field: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok().filter(|s| !s.is_empty())
}

async fn collect<T>(
    mut rows: libsql::Rows,
    op: &str,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => out.push(map(&row)?),
            Ok(None) => return Ok(out),
            Err(e) => return Err(DatabaseError::Query(format!("{op} row: {e}"))),
        }
    }
}

// ── Queue table shapes ──────────────────────────────────────────────

/// Table-level differences between the task and chat queues.
struct QueueTable {
    table: &'static str,
    owner: &'static str,
    /// Join restricting rows to owners that may still be worked on.
    actionable_join: &'static str,
}

impl QueueTable {
    fn of(kind: QueueKind) -> Self {
        match kind {
            QueueKind::Task => Self {
                table: "task_queue",
                owner: "task_id",
                actionable_join: "JOIN tasks o ON o.id = q.task_id AND o.status IN ('todo', 'in_progress')",
            },
            QueueKind::Chat => Self {
                table: "chat_queue",
                owner: "chat_id",
                actionable_join: "JOIN chats o ON o.id = q.chat_id",
            },
        }
    }

    /// Column list in `row_to_queue_item` order, qualified with alias `q`.
    fn columns(&self) -> String {
        format!(
            "q.id, q.{}, q.workspace_id, q.status, q.is_priority, q.created_at, q.updated_at",
            self.owner
        )
    }
}

fn row_to_queue_item(row: &libsql::Row, kind: QueueKind) -> Result<QueueItem, DatabaseError> {
    let status_str = get_text(row, 3, "queue.status")?;
    Ok(QueueItem {
        id: parse_uuid(&get_text(row, 0, "queue.id")?, "queue.id")?,
        kind,
        owner_id: parse_uuid(&get_text(row, 1, "queue.owner")?, "queue.owner")?,
        workspace_id: parse_uuid(&get_text(row, 2, "queue.workspace_id")?, "queue.workspace_id")?,
        status: QueueStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown queue status '{status_str}'"))
        })?,
        is_priority: row.get::<i64>(4).unwrap_or(0) != 0,
        created_at: parse_datetime(&get_text(row, 5, "queue.created_at")?),
        updated_at: parse_datetime(&get_text(row, 6, "queue.updated_at")?),
    })
}

// ── Row mapping ─────────────────────────────────────────────────────

const WORKSPACE_COLUMNS: &str =
    "id, name, instruction, working_dir_mode, static_path, chat_cli_type, created_at, updated_at";

const AGENT_COLUMNS: &str =
    "id, workspace_id, name, instruction, cli_type, sort_order, created_at, updated_at";

const TASK_COLUMNS: &str = "id, workspace_id, summary, description, status, created_at, updated_at";

const COMMENT_COLUMNS: &str = "id, task_id, author_type, author_id, content, created_at";

const LOG_COLUMNS: &str = "id, task_id, event_type, actor_type, actor_id, metadata, created_at";

const CHAT_COLUMNS: &str = "id, workspace_id, title, created_at, updated_at";

const CHAT_MESSAGE_COLUMNS: &str = "id, chat_id, role, content, created_at";

fn row_to_workspace(row: &libsql::Row) -> Result<Workspace, DatabaseError> {
    let cli_str = get_text(row, 5, "workspace.chat_cli_type")?;
    Ok(Workspace {
        id: parse_uuid(&get_text(row, 0, "workspace.id")?, "workspace.id")?,
        name: get_text(row, 1, "workspace.name")?,
        instruction: row.get::<String>(2).unwrap_or_default(),
        working_dir_mode: WorkingDirMode::parse(&get_text(row, 3, "workspace.working_dir_mode")?),
        static_path: get_opt_text(row, 4),
        chat_cli_type: CliType::parse(&cli_str).unwrap_or(CliType::Claude),
        created_at: parse_datetime(&get_text(row, 6, "workspace.created_at")?),
        updated_at: parse_datetime(&get_text(row, 7, "workspace.updated_at")?),
    })
}

fn row_to_agent(row: &libsql::Row) -> Result<Agent, DatabaseError> {
    let cli_str = get_text(row, 4, "agent.cli_type")?;
    Ok(Agent {
        id: parse_uuid(&get_text(row, 0, "agent.id")?, "agent.id")?,
        workspace_id: parse_uuid(&get_text(row, 1, "agent.workspace_id")?, "agent.workspace_id")?,
        name: get_text(row, 2, "agent.name")?,
        instruction: row.get::<String>(3).unwrap_or_default(),
        cli_type: CliType::parse(&cli_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown cli type '{cli_str}'"))
        })?,
        order: row.get::<i64>(5).unwrap_or(0),
        created_at: parse_datetime(&get_text(row, 6, "agent.created_at")?),
        updated_at: parse_datetime(&get_text(row, 7, "agent.updated_at")?),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let status_str = get_text(row, 4, "task.status")?;
    Ok(Task {
        id: parse_uuid(&get_text(row, 0, "task.id")?, "task.id")?,
        workspace_id: parse_uuid(&get_text(row, 1, "task.workspace_id")?, "task.workspace_id")?,
        summary: get_text(row, 2, "task.summary")?,
        description: row.get::<String>(3).unwrap_or_default(),
        status: TaskStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown task status '{status_str}'"))
        })?,
        created_at: parse_datetime(&get_text(row, 5, "task.created_at")?),
        updated_at: parse_datetime(&get_text(row, 6, "task.updated_at")?),
    })
}

fn row_to_comment(row: &libsql::Row) -> Result<TaskComment, DatabaseError> {
    let author = match get_text(row, 2, "comment.author_type")?.as_str() {
        "user" => CommentAuthor::User,
        "agent" => match get_opt_text(row, 3) {
            Some(id) => CommentAuthor::Agent(parse_uuid(&id, "comment.author_id")?),
            None => CommentAuthor::System,
        },
        _ => CommentAuthor::System,
    };
    Ok(TaskComment {
        id: parse_uuid(&get_text(row, 0, "comment.id")?, "comment.id")?,
        task_id: parse_uuid(&get_text(row, 1, "comment.task_id")?, "comment.task_id")?,
        author,
        content: get_text(row, 4, "comment.content")?,
        created_at: parse_datetime(&get_text(row, 5, "comment.created_at")?),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<TaskLog, DatabaseError> {
    let actor_id = match get_opt_text(row, 4) {
        Some(id) => Some(parse_uuid(&id, "log.actor_id")?),
        None => None,
    };
    Ok(TaskLog {
        id: parse_uuid(&get_text(row, 0, "log.id")?, "log.id")?,
        task_id: parse_uuid(&get_text(row, 1, "log.task_id")?, "log.task_id")?,
        event_type: get_text(row, 2, "log.event_type")?,
        actor_type: ActorType::parse(&get_text(row, 3, "log.actor_type")?),
        actor_id,
        metadata: get_opt_text(row, 5).and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&get_text(row, 6, "log.created_at")?),
    })
}

fn row_to_chat(row: &libsql::Row) -> Result<Chat, DatabaseError> {
    Ok(Chat {
        id: parse_uuid(&get_text(row, 0, "chat.id")?, "chat.id")?,
        workspace_id: parse_uuid(&get_text(row, 1, "chat.workspace_id")?, "chat.workspace_id")?,
        title: row.get::<String>(2).unwrap_or_default(),
        created_at: parse_datetime(&get_text(row, 3, "chat.created_at")?),
        updated_at: parse_datetime(&get_text(row, 4, "chat.updated_at")?),
    })
}

fn row_to_chat_message(row: &libsql::Row) -> Result<ChatMessage, DatabaseError> {
    Ok(ChatMessage {
        id: parse_uuid(&get_text(row, 0, "message.id")?, "message.id")?,
        chat_id: parse_uuid(&get_text(row, 1, "message.chat_id")?, "message.chat_id")?,
        role: ChatRole::parse(&get_text(row, 2, "message.role")?),
        content: get_text(row, 3, "message.content")?,
        created_at: parse_datetime(&get_text(row, 4, "message.created_at")?),
    })
}

fn author_columns(author: &CommentAuthor) -> (&'static str, Option<String>) {
    match author {
        CommentAuthor::User => ("user", None),
        CommentAuthor::Agent(id) => ("agent", Some(id.to_string())),
        CommentAuthor::System => ("system", None),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Workspaces & agents ─────────────────────────────────────────

    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO workspaces ({WORKSPACE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    workspace.id.to_string(),
                    workspace.name.as_str(),
                    workspace.instruction.as_str(),
                    workspace.working_dir_mode.as_str(),
                    workspace.static_path.as_deref(),
                    workspace.chat_cli_type.as_str(),
                    fmt_ts(workspace.created_at),
                    fmt_ts(workspace.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_workspace: {e}")))?;
        debug!(id = %workspace.id, "Workspace created");
        Ok(())
    }

    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_workspace: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_workspace(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_workspace row: {e}"))),
        }
    }

    async fn update_workspace(
        &self,
        id: Uuid,
        update: &WorkspaceUpdate,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE workspaces SET name = COALESCE(?1, name), instruction = COALESCE(?2, instruction), updated_at = ?3 WHERE id = ?4",
                params![
                    update.name.as_deref(),
                    update.instruction.as_deref(),
                    now_ts(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_workspace: {e}")))?;
        Ok(count > 0)
    }

    async fn create_agent(&self, agent: &Agent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO agents ({AGENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    agent.id.to_string(),
                    agent.workspace_id.to_string(),
                    agent.name.as_str(),
                    agent.instruction.as_str(),
                    agent.cli_type.as_str(),
                    agent.order,
                    fmt_ts(agent.created_at),
                    fmt_ts(agent.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_agent: {e}")))?;
        debug!(id = %agent.id, workspace_id = %agent.workspace_id, "Agent created");
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_agent: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_agent(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_agent row: {e}"))),
        }
    }

    async fn list_agents(&self, workspace_id: Uuid) -> Result<Vec<Agent>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE workspace_id = ?1 ORDER BY sort_order ASC, created_at ASC"),
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_agents: {e}")))?;
        collect(rows, "list_agents", row_to_agent).await
    }

    async fn update_agent(&self, id: Uuid, update: &AgentUpdate) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE agents SET name = COALESCE(?1, name), instruction = COALESCE(?2, instruction), cli_type = COALESCE(?3, cli_type), updated_at = ?4 WHERE id = ?5",
                params![
                    update.name.as_deref(),
                    update.instruction.as_deref(),
                    update.cli_type.map(|c| c.as_str()),
                    now_ts(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_agent: {e}")))?;
        Ok(count > 0)
    }

    async fn delete_agent(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM agents WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_agent: {e}")))?;
        Ok(count > 0)
    }

    async fn reorder_agents(
        &self,
        workspace_id: Uuid,
        agent_ids: &[Uuid],
    ) -> Result<(), DatabaseError> {
        let now = now_ts();
        for (position, agent_id) in agent_ids.iter().enumerate() {
            self.conn()
                .execute(
                    "UPDATE agents SET sort_order = ?1, updated_at = ?2 WHERE id = ?3 AND workspace_id = ?4",
                    params![
                        position as i64,
                        now.as_str(),
                        agent_id.to_string(),
                        workspace_id.to_string(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("reorder_agents: {e}")))?;
        }
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    task.id.to_string(),
                    task.workspace_id.to_string(),
                    task.summary.as_str(),
                    task.description.as_str(),
                    task.status.as_str(),
                    fmt_ts(task.created_at),
                    fmt_ts(task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        self.add_task_log(NewTaskLog {
            task_id: task.id,
            event_type: events::TASK_CREATED,
            actor_type: ActorType::User,
            actor_id: None,
            metadata: None,
        })
        .await?;
        self.enqueue(QueueKind::Task, task.id, task.workspace_id, false)
            .await?;
        debug!(id = %task.id, "Task created");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY updated_at ASC"),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_status: {e}")))?;
        collect(rows, "list_tasks_by_status", row_to_task).await
    }

    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        actor: ActorType,
        actor_id: Option<Uuid>,
    ) -> Result<Option<TaskStatus>, DatabaseError> {
        let Some(task) = self.get_task(id).await? else {
            return Ok(None);
        };
        let previous = task.status;

        self.conn()
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_status: {e}")))?;

        if previous != status {
            self.add_task_log(NewTaskLog {
                task_id: id,
                event_type: events::STATUS_CHANGED,
                actor_type: actor,
                actor_id,
                metadata: Some(serde_json::json!({
                    "from": previous.as_str(),
                    "to": status.as_str(),
                })),
            })
            .await?;
        }

        if status == TaskStatus::Todo && previous != TaskStatus::Todo {
            self.enqueue(QueueKind::Task, id, task.workspace_id, false)
                .await?;
        }
        Ok(Some(previous))
    }

    async fn demote_other_in_progress_tasks(
        &self,
        workspace_id: Uuid,
        except_task_id: Uuid,
    ) -> Result<usize, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT id FROM tasks WHERE workspace_id = ?1 AND status = 'in_progress' AND id != ?2",
                params![workspace_id.to_string(), except_task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("demote_other_in_progress_tasks: {e}")))?;
        let ids = collect(rows, "demote_other_in_progress_tasks", |row| {
            parse_uuid(&get_text(row, 0, "task.id")?, "task.id")
        })
        .await?;

        let mut demoted = 0;
        for id in ids {
            let count = self
                .conn()
                .execute(
                    "UPDATE tasks SET status = 'todo', updated_at = ?1 WHERE id = ?2 AND status = 'in_progress'",
                    params![now_ts(), id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("demote task: {e}")))?;
            if count == 0 {
                continue;
            }
            demoted += 1;
            self.add_task_log(
                NewTaskLog::system(id, events::STATUS_CHANGED).with_metadata(serde_json::json!({
                    "from": TaskStatus::InProgress.as_str(),
                    "to": TaskStatus::Todo.as_str(),
                    "reason": "demoted",
                    "active_task_id": except_task_id.to_string(),
                })),
            )
            .await?;
        }

        if demoted > 0 {
            debug!(workspace_id = %workspace_id, count = demoted, "Demoted in_progress tasks");
        }
        Ok(demoted)
    }

    async fn set_task_priority(&self, task_id: Uuid, priority: bool) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE task_queue SET is_priority = ?1, updated_at = ?2 WHERE task_id = ?3 AND status IN ('queued', 'in_progress')",
                params![priority as i64, now_ts(), task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_task_priority: {e}")))?;

        let event = if priority {
            events::TASK_PRIORITIZED
        } else {
            events::TASK_DEPRIORITIZED
        };
        self.add_task_log(NewTaskLog {
            task_id,
            event_type: event,
            actor_type: ActorType::User,
            actor_id: None,
            metadata: None,
        })
        .await
    }

    async fn add_task_comment(
        &self,
        task_id: Uuid,
        author: CommentAuthor,
        content: &str,
        options: CommentOptions,
    ) -> Result<TaskComment, DatabaseError> {
        let Some(task) = self.get_task(task_id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "task".to_string(),
                id: task_id.to_string(),
            });
        };

        let comment = TaskComment {
            id: Uuid::new_v4(),
            task_id,
            author,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let (author_type, author_id) = author_columns(&author);

        self.conn()
            .execute(
                &format!("INSERT INTO task_comments ({COMMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    comment.id.to_string(),
                    task_id.to_string(),
                    author_type,
                    author_id,
                    content,
                    fmt_ts(comment.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_task_comment: {e}")))?;

        self.add_task_log(NewTaskLog {
            task_id,
            event_type: events::COMMENT_ADDED,
            actor_type: author.actor_type(),
            actor_id: author.agent_id(),
            metadata: Some(serde_json::json!({ "comment_id": comment.id.to_string() })),
        })
        .await?;

        if options.enqueue {
            self.enqueue(QueueKind::Task, task_id, task.workspace_id, false)
                .await?;
        }
        Ok(comment)
    }

    async fn list_task_comments(&self, task_id: Uuid) -> Result<Vec<TaskComment>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {COMMENT_COLUMNS} FROM task_comments WHERE task_id = ?1 ORDER BY created_at ASC, rowid ASC"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_task_comments: {e}")))?;
        collect(rows, "list_task_comments", row_to_comment).await
    }

    async fn add_task_log(&self, log: NewTaskLog) -> Result<(), DatabaseError> {
        let metadata = match &log.metadata {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        self.conn()
            .execute(
                &format!("INSERT INTO task_logs ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    Uuid::new_v4().to_string(),
                    log.task_id.to_string(),
                    log.event_type,
                    log.actor_type.as_str(),
                    log.actor_id.map(|id| id.to_string()),
                    metadata,
                    now_ts(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_task_log: {e}")))?;
        Ok(())
    }

    async fn list_task_logs(&self, task_id: Uuid) -> Result<Vec<TaskLog>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {LOG_COLUMNS} FROM task_logs WHERE task_id = ?1 ORDER BY created_at ASC, rowid ASC"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_task_logs: {e}")))?;
        collect(rows, "list_task_logs", row_to_log).await
    }

    // ── Chats ───────────────────────────────────────────────────────

    async fn create_chat(&self, chat: &Chat) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO chats ({CHAT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    chat.id.to_string(),
                    chat.workspace_id.to_string(),
                    chat.title.as_str(),
                    fmt_ts(chat.created_at),
                    fmt_ts(chat.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_chat: {e}")))?;
        Ok(())
    }

    async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_chat: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_chat(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_chat row: {e}"))),
        }
    }

    async fn rename_chat(&self, id: Uuid, title: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE chats SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title, now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("rename_chat: {e}")))?;
        Ok(count > 0)
    }

    async fn add_chat_message(
        &self,
        chat_id: Uuid,
        role: ChatRole,
        content: &str,
        options: CommentOptions,
    ) -> Result<ChatMessage, DatabaseError> {
        let Some(chat) = self.get_chat(chat_id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "chat".to_string(),
                id: chat_id.to_string(),
            });
        };

        let message = ChatMessage {
            id: Uuid::new_v4(),
            chat_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.conn()
            .execute(
                &format!("INSERT INTO chat_messages ({CHAT_MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    message.id.to_string(),
                    chat_id.to_string(),
                    role.as_str(),
                    content,
                    fmt_ts(message.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_chat_message: {e}")))?;

        if options.enqueue {
            self.enqueue(QueueKind::Chat, chat_id, chat.workspace_id, false)
                .await?;
        }
        Ok(message)
    }

    async fn list_chat_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {CHAT_MESSAGE_COLUMNS} FROM chat_messages WHERE chat_id = ?1 ORDER BY created_at ASC, rowid ASC"),
                params![chat_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_chat_messages: {e}")))?;
        collect(rows, "list_chat_messages", row_to_chat_message).await
    }

    // ── Queue ───────────────────────────────────────────────────────

    async fn enqueue(
        &self,
        kind: QueueKind,
        owner_id: Uuid,
        workspace_id: Uuid,
        is_priority: bool,
    ) -> Result<Option<QueueItem>, DatabaseError> {
        let t = QueueTable::of(kind);
        let id = Uuid::new_v4();
        let count = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO {table} (id, {owner}, workspace_id, status, is_priority, created_at, updated_at) \
                     SELECT ?1, ?2, ?3, 'queued', ?4, ?5, ?5 \
                     WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {owner} = ?2 AND status IN ('queued', 'in_progress'))",
                    table = t.table,
                    owner = t.owner,
                ),
                params![
                    id.to_string(),
                    owner_id.to_string(),
                    workspace_id.to_string(),
                    is_priority as i64,
                    now_ts(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        if count == 0 {
            return Ok(None);
        }
        debug!(kind = %kind, owner_id = %owner_id, item_id = %id, "Queue item created");
        self.get_queue_item(kind, id).await
    }

    async fn get_queue_item(
        &self,
        kind: QueueKind,
        id: Uuid,
    ) -> Result<Option<QueueItem>, DatabaseError> {
        let t = QueueTable::of(kind);
        self.query_queue_item(
            kind,
            &format!("SELECT {} FROM {} q WHERE q.id = ?1", t.columns(), t.table),
            params![id.to_string()],
            "get_queue_item",
        )
        .await
    }

    async fn active_queue_item(
        &self,
        kind: QueueKind,
        owner_id: Uuid,
    ) -> Result<Option<QueueItem>, DatabaseError> {
        let t = QueueTable::of(kind);
        self.query_queue_item(
            kind,
            &format!(
                "SELECT {} FROM {} q WHERE q.{} = ?1 AND q.status IN ('queued', 'in_progress') LIMIT 1",
                t.columns(),
                t.table,
                t.owner
            ),
            params![owner_id.to_string()],
            "active_queue_item",
        )
        .await
    }

    async fn find_workspaces_with_queued_items(
        &self,
        kind: QueueKind,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let t = QueueTable::of(kind);
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT DISTINCT q.workspace_id FROM {} q {} WHERE q.status = 'queued'",
                    t.table, t.actionable_join
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_workspaces_with_queued_items: {e}")))?;
        collect(rows, "find_workspaces_with_queued_items", |row| {
            parse_uuid(&get_text(row, 0, "queue.workspace_id")?, "queue.workspace_id")
        })
        .await
    }

    async fn pick_next_queue_item(
        &self,
        kind: QueueKind,
        workspace_id: Uuid,
    ) -> Result<Option<QueueItem>, DatabaseError> {
        let t = QueueTable::of(kind);
        let cols = t.columns();
        let ws = workspace_id.to_string();

        // 1. Priority
        let priority = self
            .query_queue_item(
                kind,
                &format!(
                    "SELECT {cols} FROM {} q {} \
                     WHERE q.workspace_id = ?1 AND q.status = 'queued' AND q.is_priority = 1 \
                     ORDER BY q.updated_at DESC, q.rowid DESC LIMIT 1",
                    t.table, t.actionable_join
                ),
                params![ws.as_str()],
                "pick_next_queue_item priority",
            )
            .await?;
        if priority.is_some() {
            return Ok(priority);
        }

        // 2. Stickiness: continue whatever owner was worked on last
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {} FROM {} WHERE workspace_id = ?1 AND status IN ('completed', 'failed') \
                     ORDER BY updated_at DESC, rowid DESC LIMIT 1",
                    t.owner, t.table
                ),
                params![ws.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pick_next_queue_item last: {e}")))?;
        let last_owner = match rows.next().await {
            Ok(Some(row)) => Some(get_text(&row, 0, "queue.owner")?),
            Ok(None) => None,
            Err(e) => {
                return Err(DatabaseError::Query(format!(
                    "pick_next_queue_item last row: {e}"
                )));
            }
        };
        if let Some(owner_id) = last_owner {
            let sticky = self
                .query_queue_item(
                    kind,
                    &format!(
                        "SELECT {cols} FROM {} q {} \
                         WHERE q.workspace_id = ?1 AND q.{} = ?2 AND q.status = 'queued' \
                         ORDER BY q.updated_at DESC, q.rowid DESC LIMIT 1",
                        t.table, t.actionable_join, t.owner
                    ),
                    params![ws.as_str(), owner_id],
                    "pick_next_queue_item sticky",
                )
                .await?;
            if sticky.is_some() {
                return Ok(sticky);
            }
        }

        // 3. LIFO
        self.query_queue_item(
            kind,
            &format!(
                "SELECT {cols} FROM {} q {} \
                 WHERE q.workspace_id = ?1 AND q.status = 'queued' \
                 ORDER BY q.updated_at DESC, q.rowid DESC LIMIT 1",
                t.table, t.actionable_join
            ),
            params![ws.as_str()],
            "pick_next_queue_item lifo",
        )
        .await
    }

    async fn claim_queue_item(
        &self,
        kind: QueueKind,
        id: Uuid,
    ) -> Result<Option<QueueItem>, DatabaseError> {
        let t = QueueTable::of(kind);
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE {} SET status = 'in_progress', updated_at = ?1 WHERE id = ?2 AND status = 'queued'",
                    t.table
                ),
                params![now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_queue_item: {e}")))?;

        if count == 0 {
            return Ok(None);
        }
        self.get_queue_item(kind, id).await
    }

    async fn update_queue_item_status(
        &self,
        kind: QueueKind,
        id: Uuid,
        status: QueueStatus,
    ) -> Result<(), DatabaseError> {
        let t = QueueTable::of(kind);
        self.conn()
            .execute(
                &format!("UPDATE {} SET status = ?1, updated_at = ?2 WHERE id = ?3", t.table),
                params![status.as_str(), now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_queue_item_status: {e}")))?;
        Ok(())
    }

    async fn reset_in_progress_queue_items(&self, kind: QueueKind) -> Result<usize, DatabaseError> {
        let t = QueueTable::of(kind);
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE {} SET status = 'queued', updated_at = ?1 WHERE status = 'in_progress'",
                    t.table
                ),
                params![now_ts()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_in_progress_queue_items: {e}")))?;
        Ok(count as usize)
    }

    async fn count_consecutive_failures(
        &self,
        kind: QueueKind,
        owner_id: Uuid,
    ) -> Result<u32, DatabaseError> {
        let t = QueueTable::of(kind);
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT status FROM {} WHERE {} = ?1 AND status IN ('completed', 'failed') \
                     ORDER BY updated_at DESC, rowid DESC",
                    t.table, t.owner
                ),
                params![owner_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_consecutive_failures: {e}")))?;
        let statuses = collect(rows, "count_consecutive_failures", |row| {
            get_text(row, 0, "queue.status")
        })
        .await?;

        Ok(statuses.iter().take_while(|s| s.as_str() == "failed").count() as u32)
    }

    async fn delete_terminal_queue_items_before(
        &self,
        kind: QueueKind,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let t = QueueTable::of(kind);
        let count = self
            .conn()
            .execute(
                &format!(
                    "DELETE FROM {table} WHERE status IN ('completed', 'failed') AND updated_at < ?1 \
                     AND id NOT IN ( \
                         SELECT (SELECT k.id FROM {table} k \
                                 WHERE k.workspace_id = w.workspace_id AND k.status IN ('completed', 'failed') \
                                 ORDER BY k.updated_at DESC, k.rowid DESC LIMIT 1) \
                         FROM (SELECT DISTINCT workspace_id FROM {table} WHERE status IN ('completed', 'failed')) w \
                     )",
                    table = t.table
                ),
                params![fmt_ts(cutoff)],
            )
            .await
            .map_err(|e| {
                DatabaseError::Query(format!("delete_terminal_queue_items_before: {e}"))
            })?;
        Ok(count as usize)
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value_str, now_ts()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }
}
