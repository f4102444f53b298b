//! Scratch input files for agent CLIs.
//!
//! The CLI receives a short prompt pointing at a Markdown file that carries
//! the full context; history entries are written one JSON object per line.

use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::chats::model::{Chat, ChatMessage};
use crate::cli::invoke::InvocationKind;
use crate::tasks::model::{CommentAuthor, Task, TaskComment, TaskLog};
use crate::workspaces::model::{Agent, Workspace};

/// Everything an agent sees when working on a task.
pub struct TaskPrompt<'a> {
    pub workspace: &'a Workspace,
    pub agent: &'a Agent,
    /// The full ordered pipeline, including `agent`.
    pub agents: &'a [Agent],
    pub task: &'a Task,
    pub comments: &'a [TaskComment],
    pub logs: &'a [TaskLog],
}

/// Everything the chat CLI sees for one turn.
pub struct ChatPrompt<'a> {
    pub workspace: &'a Workspace,
    pub agents: &'a [Agent],
    pub chat: &'a Chat,
    pub messages: &'a [ChatMessage],
}

/// Command-line prompt that points the CLI at its scratch file.
pub fn command_prompt(input_path: &Path, kind: InvocationKind) -> String {
    let subject = match kind {
        InvocationKind::Task => "the task you are working on",
        InvocationKind::Chat => "the conversation you are answering",
    };
    format!(
        "Read {} for {subject}. Follow the instructions in that file and reply with a single JSON document matching the required schema, with no other text.",
        input_path.display()
    )
}

impl TaskPrompt<'_> {
    /// Render the scratch file contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        write_section(&mut out, "Workspace instructions", &self.workspace.instruction);

        let _ = writeln!(out, "# Your role: {}\n", self.agent.name);
        let _ = writeln!(out, "{}\n", non_empty(&self.agent.instruction));

        let _ = writeln!(out, "# Agents in this workspace\n");
        for peer in self.agents {
            let marker = if peer.id == self.agent.id { " (you)" } else { "" };
            let _ = writeln!(out, "- {}{marker}", peer.name);
        }
        out.push('\n');

        let _ = writeln!(out, "# Task\n");
        let _ = writeln!(out, "## Summary\n\n{}\n", self.task.summary);
        let _ = writeln!(out, "## Description\n\n{}\n", non_empty(&self.task.description));
        let _ = writeln!(out, "Status: {}\n", self.task.status);

        let _ = writeln!(out, "# History\n");
        for line in self.history_lines() {
            let _ = writeln!(out, "{line}");
        }
        out.push('\n');

        let _ = writeln!(out, "# Response\n");
        out.push_str(
            "Reply with {\"actions\": [...]}. Each action is one of:\n\
             - {\"type\": \"skip\"} when there is nothing for you to do\n\
             - {\"type\": \"comment\", \"content\": \"...\"} to report work or ask a question\n\
             - {\"type\": \"change_status\", \"status\": \"in_review\"} when the task is ready for a human\n",
        );
        out
    }

    /// Comments and log events merged in time order, one JSON object each.
    fn history_lines(&self) -> Vec<String> {
        let mut entries: Vec<(DateTime<Utc>, serde_json::Value)> = Vec::new();

        for comment in self.comments {
            let (author, author_name) = match comment.author {
                CommentAuthor::User => ("user", None),
                CommentAuthor::System => ("system", None),
                CommentAuthor::Agent(id) => ("agent", self.agent_name(id)),
            };
            entries.push((
                comment.created_at,
                serde_json::json!({
                    "kind": "comment",
                    "author": author,
                    "agent": author_name,
                    "content": comment.content,
                    "at": fmt_time(comment.created_at),
                }),
            ));
        }

        for log in self.logs {
            entries.push((
                log.created_at,
                serde_json::json!({
                    "kind": "event",
                    "event": log.event_type,
                    "actor": log.actor_type.as_str(),
                    "agent": log.actor_id.and_then(|id| self.agent_name(id)),
                    "metadata": log.metadata,
                    "at": fmt_time(log.created_at),
                }),
            ));
        }

        entries.sort_by_key(|(at, _)| *at);
        entries.into_iter().map(|(_, v)| v.to_string()).collect()
    }

    fn agent_name(&self, id: Uuid) -> Option<&str> {
        self.agents
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.name.as_str())
    }
}

impl ChatPrompt<'_> {
    /// Render the scratch file contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Workspace: {}\n", self.workspace.name);
        write_section(&mut out, "Workspace instructions", &self.workspace.instruction);

        let _ = writeln!(out, "# Agents\n");
        if self.agents.is_empty() {
            out.push_str("(none yet)\n");
        }
        for agent in self.agents {
            let line = serde_json::json!({
                "id": agent.id,
                "name": agent.name,
                "cli_type": agent.cli_type,
                "order": agent.order,
                "instruction": agent.instruction,
            });
            let _ = writeln!(out, "{line}");
        }
        out.push('\n');

        let title = if self.chat.title.trim().is_empty() {
            "(untitled)"
        } else {
            self.chat.title.as_str()
        };
        let _ = writeln!(out, "# Conversation: {title}\n");
        for message in self.messages {
            let line = serde_json::json!({
                "role": message.role.as_str(),
                "content": message.content,
                "at": fmt_time(message.created_at),
            });
            let _ = writeln!(out, "{line}");
        }
        out.push('\n');

        let _ = writeln!(out, "# Response\n");
        out.push_str(
            "Reply with {\"message\": \"...\", \"actions\": [...]}. Actions configure the workspace: \
             create_agent, update_agent, delete_agent, reorder_agents, update_workspace, rename_chat. \
             Leave actions empty when you only answer.\n",
        );
        out
    }
}

fn write_section(out: &mut String, heading: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }
    let _ = writeln!(out, "# {heading}\n\n{}\n", body.trim());
}

fn non_empty(s: &str) -> &str {
    if s.trim().is_empty() { "(none)" } else { s }
}

fn fmt_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}
