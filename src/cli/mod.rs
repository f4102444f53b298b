//! Agent CLI integration — binary resolution, the scratch-file protocol,
//! subprocess invocation, output schemas, and health checks.
//!
//! - `binary` — settings → environment → PATH resolution
//! - `prompt` — builds the scratch input file contents
//! - `schema` — typed output contracts and validation
//! - `invoke` — spawns one CLI run (timeout, cancel, cleanup)
//! - `health` — periodic availability/version checks

pub mod binary;
pub mod health;
pub mod invoke;
pub mod prompt;
pub mod schema;

pub use binary::BinaryResolver;
pub use health::{CliHealth, HealthChecker, HealthStatus};
pub use invoke::{
    AgentInvoker, CliInvoker, Invocation, InvocationKind, InvocationRequest, ProcessHandle,
};
pub use schema::{AgentOutput, ChatAction, ChatOutput, TaskAction, TaskOutput};

use serde::{Deserialize, Serialize};

/// Supported agent command-line tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliType {
    Claude,
    Codex,
    Gemini,
}

impl CliType {
    /// Every supported CLI, in check order.
    pub const ALL: [CliType; 3] = [CliType::Claude, CliType::Codex, CliType::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// Executable name looked up on PATH.
    pub fn binary_name(&self) -> &'static str {
        self.as_str()
    }

    /// Environment variable overriding the binary location.
    pub fn env_var(&self) -> &'static str {
        match self {
            Self::Claude => "CLAUDE_CLI_PATH",
            Self::Codex => "CODEX_CLI_PATH",
            Self::Gemini => "GEMINI_CLI_PATH",
        }
    }

    /// Settings key overriding the binary location.
    pub fn setting_key(&self) -> String {
        format!("cli_path.{}", self.as_str())
    }
}

impl std::fmt::Display for CliType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
