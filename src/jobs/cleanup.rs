//! Periodic cleanup of old queue history and finished working directories.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;
use crate::tasks::model::{QueueKind, TaskStatus};
use crate::workspaces::model::{WorkingDirMode, Workspace};
use crate::workspaces::{WorkTarget, ephemeral_dir};

/// What one cleanup run removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub task_items: usize,
    pub chat_items: usize,
    pub directories: usize,
}

/// Delete terminal queue items older than `retention` and the ephemeral
/// working directories of `done` tasks.
pub async fn run_cleanup(
    store: &Arc<dyn Database>,
    work_dir: &Path,
    retention: chrono::Duration,
) -> Result<CleanupReport, DatabaseError> {
    let cutoff = Utc::now() - retention;
    let mut report = CleanupReport {
        task_items: store
            .delete_terminal_queue_items_before(QueueKind::Task, cutoff)
            .await?,
        chat_items: store
            .delete_terminal_queue_items_before(QueueKind::Chat, cutoff)
            .await?,
        directories: 0,
    };

    let mut workspaces: HashMap<Uuid, Option<Workspace>> = HashMap::new();
    for task in store.list_tasks_by_status(TaskStatus::Done).await? {
        let workspace = match workspaces.get(&task.workspace_id) {
            Some(ws) => ws.clone(),
            None => {
                let ws = store.get_workspace(task.workspace_id).await?;
                workspaces.insert(task.workspace_id, ws.clone());
                ws
            }
        };
        // Static directories belong to the user.
        if !workspace.is_some_and(|ws| ws.working_dir_mode == WorkingDirMode::Ephemeral) {
            continue;
        }

        let dir = ephemeral_dir(work_dir, WorkTarget::Task(task.id));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(task_id = %task.id, dir = %dir.display(), "Removed working directory");
                report.directories += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(task_id = %task.id, dir = %dir.display(), error = %e, "Failed to remove working directory");
            }
        }
    }

    info!(
        task_items = report.task_items,
        chat_items = report.chat_items,
        directories = report.directories,
        "Cleanup finished"
    );
    Ok(report)
}
