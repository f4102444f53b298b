//! Workspaces, their agents, and working-directory resolution.

pub mod model;

pub use model::{Agent, AgentUpdate, WorkingDirMode, Workspace, WorkspaceUpdate};

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::ProcessorError;

/// What a working directory is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkTarget {
    Task(Uuid),
    Chat(Uuid),
}

/// Directory an ephemeral-mode workspace uses for `target`.
pub fn ephemeral_dir(work_root: &Path, target: WorkTarget) -> PathBuf {
    match target {
        WorkTarget::Task(id) => work_root.join("tasks").join(id.to_string()),
        WorkTarget::Chat(id) => work_root.join("chats").join(id.to_string()),
    }
}

/// Resolve (and create, if needed) the `cwd` for an agent subprocess.
///
/// The directory is shared by every agent that works on the same task or
/// chat; nothing here ever deletes it.
pub async fn resolve_working_dir(
    workspace: &Workspace,
    work_root: &Path,
    target: WorkTarget,
) -> Result<PathBuf, ProcessorError> {
    let dir = match workspace.working_dir_mode {
        WorkingDirMode::Static => match workspace.static_path.as_deref() {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => {
                return Err(ProcessorError::WorkingDir {
                    path: String::new(),
                    reason: format!("workspace {} is static but has no path", workspace.id),
                });
            }
        },
        WorkingDirMode::Ephemeral => ephemeral_dir(work_root, target),
    };

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ProcessorError::WorkingDir {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(dir)
}
