//! Workspace and agent data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cli::CliType;

/// Where a workspace's agents run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingDirMode {
    /// A fresh directory per task/chat under the configured work root.
    Ephemeral,
    /// Every task/chat runs in the workspace's `static_path`.
    Static,
}

impl WorkingDirMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::Static => "static",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "static" => Self::Static,
            _ => Self::Ephemeral,
        }
    }
}

/// A workspace groups tasks, chats, and an ordered agent pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    /// Instruction text shared by every agent in the workspace.
    #[serde(default)]
    pub instruction: String,
    pub working_dir_mode: WorkingDirMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_path: Option<String>,
    /// CLI used to answer chat turns.
    pub chat_cli_type: CliType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// Create an ephemeral-mode workspace.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            instruction: String::new(),
            working_dir_mode: WorkingDirMode::Ephemeral,
            static_path: None,
            chat_cli_type: CliType::Claude,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the workspace-level instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Builder: run everything in a fixed directory.
    pub fn with_static_path(mut self, path: impl Into<String>) -> Self {
        self.working_dir_mode = WorkingDirMode::Static;
        self.static_path = Some(path.into());
        self
    }

    /// Builder: choose the chat CLI.
    pub fn with_chat_cli(mut self, cli: CliType) -> Self {
        self.chat_cli_type = cli;
        self
    }
}

/// One agent in a workspace's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub instruction: String,
    pub cli_type: CliType,
    /// Position in the pipeline; lower runs first.
    pub order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        workspace_id: Uuid,
        name: impl Into<String>,
        instruction: impl Into<String>,
        cli_type: CliType,
        order: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.into(),
            instruction: instruction.into(),
            cli_type,
            order,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied to an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub cli_type: Option<CliType>,
}

/// Partial update applied to a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub instruction: Option<String>,
}
