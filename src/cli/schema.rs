//! Structured output contracts for agent CLIs.
//!
//! Every CLI run must print exactly one JSON document. Some CLIs wrap the
//! payload (`structured_output`, `response`, `result`), sometimes as a
//! JSON-encoded string; [`parse_output`] unwraps those before validating.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cli::CliType;
use crate::cli::invoke::InvocationKind;
use crate::error::CliError;
use crate::tasks::model::TaskStatus;

/// Wrapper fields that may carry the real payload.
const WRAPPER_FIELDS: &[&str] = &["structured_output", "response", "result"];

/// How many wrapper layers are peeled before giving up.
const MAX_UNWRAP_DEPTH: usize = 3;

/// One action an agent takes on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskAction {
    /// Nothing to do this turn.
    Skip,
    /// Post a comment on the task.
    Comment { content: String },
    /// Request a status change. Only `in_review` is accepted.
    ChangeStatus { status: TaskStatus },
}

/// Output of a task-agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub actions: Vec<TaskAction>,
}

/// One action the chat CLI takes on the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatAction {
    CreateAgent {
        name: String,
        #[serde(default)]
        instruction: String,
        cli_type: CliType,
        #[serde(default)]
        order: Option<i64>,
    },
    UpdateAgent {
        agent_id: Uuid,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        instruction: Option<String>,
        #[serde(default)]
        cli_type: Option<CliType>,
    },
    DeleteAgent {
        agent_id: Uuid,
    },
    ReorderAgents {
        agent_ids: Vec<Uuid>,
    },
    UpdateWorkspace {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        instruction: Option<String>,
    },
    RenameChat {
        title: String,
    },
}

/// Output of a chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatOutput {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub actions: Vec<ChatAction>,
}

/// Validated output of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutput {
    Task(TaskOutput),
    Chat(ChatOutput),
}

/// JSON schema handed to CLIs for task runs.
pub fn task_output_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["actions"],
        "properties": {
            "actions": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["type"],
                    "properties": {
                        "type": { "type": "string", "enum": ["skip", "comment", "change_status"] },
                        "content": { "type": "string" },
                        "status": { "type": "string", "enum": ["in_review"] }
                    }
                }
            }
        }
    })
}

/// JSON schema handed to CLIs for chat turns.
pub fn chat_output_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "message": { "type": "string" },
            "actions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["type"],
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": [
                                "create_agent", "update_agent", "delete_agent",
                                "reorder_agents", "update_workspace", "rename_chat"
                            ]
                        },
                        "agent_id": { "type": "string" },
                        "agent_ids": { "type": "array", "items": { "type": "string" } },
                        "name": { "type": "string" },
                        "instruction": { "type": "string" },
                        "cli_type": { "type": "string", "enum": ["claude", "codex", "gemini"] },
                        "order": { "type": "integer" },
                        "title": { "type": "string" }
                    }
                }
            }
        }
    })
}

/// Schema for `kind`.
pub fn schema_for(kind: InvocationKind) -> Value {
    match kind {
        InvocationKind::Task => task_output_schema(),
        InvocationKind::Chat => chat_output_schema(),
    }
}

/// Parse, unwrap and validate raw CLI stdout.
pub fn parse_output(kind: InvocationKind, stdout: &str) -> Result<AgentOutput, CliError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyOutput);
    }

    let value = parse_json_text(trimmed)?;
    let payload = unwrap_payload(value)?;

    match kind {
        InvocationKind::Task => {
            let output: TaskOutput = serde_json::from_value(payload)
                .map_err(|e| CliError::SchemaViolation(e.to_string()))?;
            validate_task_output(&output)?;
            Ok(AgentOutput::Task(output))
        }
        InvocationKind::Chat => {
            let output: ChatOutput = serde_json::from_value(payload)
                .map_err(|e| CliError::SchemaViolation(e.to_string()))?;
            validate_chat_output(&output)?;
            Ok(AgentOutput::Chat(output))
        }
    }
}

fn parse_json_text(text: &str) -> Result<Value, CliError> {
    let text = strip_code_fence(text);
    serde_json::from_str(text).map_err(|e| CliError::MalformedJson(e.to_string()))
}

/// Strip a surrounding Markdown code fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let t = text.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn is_payload(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.contains_key("actions") || o.contains_key("message"))
}

fn unwrap_payload(mut value: Value) -> Result<Value, CliError> {
    for _ in 0..MAX_UNWRAP_DEPTH {
        if is_payload(&value) {
            return Ok(value);
        }
        let inner = match value.as_object() {
            Some(obj) => WRAPPER_FIELDS.iter().find_map(|f| obj.get(*f)).cloned(),
            None => None,
        };
        value = match inner {
            Some(Value::String(s)) => parse_json_text(&s)?,
            Some(v) => v,
            None => return Ok(value),
        };
    }
    Ok(value)
}

fn validate_task_output(output: &TaskOutput) -> Result<(), CliError> {
    if output.actions.is_empty() {
        return Err(CliError::SchemaViolation(
            "actions must contain at least one entry".to_string(),
        ));
    }
    for action in &output.actions {
        match action {
            TaskAction::Comment { content } if content.trim().is_empty() => {
                return Err(CliError::SchemaViolation(
                    "comment content must not be empty".to_string(),
                ));
            }
            TaskAction::ChangeStatus { status } if *status != TaskStatus::InReview => {
                return Err(CliError::SchemaViolation(format!(
                    "agents may only move a task to in_review, not {status}"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_chat_output(output: &ChatOutput) -> Result<(), CliError> {
    let has_message = output
        .message
        .as_deref()
        .is_some_and(|m| !m.trim().is_empty());
    if !has_message && output.actions.is_empty() {
        return Err(CliError::SchemaViolation(
            "chat output needs a message or at least one action".to_string(),
        ));
    }
    for action in &output.actions {
        match action {
            ChatAction::CreateAgent { name, .. } if name.trim().is_empty() => {
                return Err(CliError::SchemaViolation(
                    "create_agent requires a name".to_string(),
                ));
            }
            ChatAction::RenameChat { title } if title.trim().is_empty() => {
                return Err(CliError::SchemaViolation(
                    "rename_chat requires a title".to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}
