//! Chat processor — answers queued chat turns with the workspace's chat CLI
//! and applies the workspace changes it asks for.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chats::model::ChatRole;
use crate::cli::prompt::ChatPrompt;
use crate::cli::{AgentInvoker, AgentOutput, ChatAction, InvocationKind, InvocationRequest};
use crate::config::ProcessorConfig;
use crate::error::{CliError, ProcessorError};
use crate::jobs::pool::QueueHandler;
use crate::jobs::registry::ProcessRegistry;
use crate::store::Database;
use crate::tasks::model::{CommentOptions, QueueItem, QueueKind, QueueStatus};
use crate::workspaces::model::{Agent, AgentUpdate, Workspace, WorkspaceUpdate};
use crate::workspaces::{WorkTarget, resolve_working_dir};

const NO_ENQUEUE: CommentOptions = CommentOptions { enqueue: false };

/// Processes chat queue items.
pub struct ChatProcessor {
    store: Arc<dyn Database>,
    invoker: Arc<dyn AgentInvoker>,
    processes: ProcessRegistry,
    config: ProcessorConfig,
}

impl ChatProcessor {
    pub fn new(
        store: Arc<dyn Database>,
        invoker: Arc<dyn AgentInvoker>,
        processes: ProcessRegistry,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            invoker,
            processes,
            config,
        }
    }

    /// Apply one action. Agent ids must belong to `workspace`.
    async fn apply_action(
        &self,
        workspace: &Workspace,
        chat_id: Uuid,
        action: ChatAction,
    ) -> Result<(), ProcessorError> {
        match action {
            ChatAction::CreateAgent {
                name,
                instruction,
                cli_type,
                order,
            } => {
                let order = match order {
                    Some(order) => order,
                    None => next_order(&self.store.list_agents(workspace.id).await?),
                };
                let agent = Agent::new(workspace.id, name, instruction, cli_type, order);
                self.store.create_agent(&agent).await?;
                info!(workspace_id = %workspace.id, agent_id = %agent.id, name = %agent.name, "Chat created agent");
            }
            ChatAction::UpdateAgent {
                agent_id,
                name,
                instruction,
                cli_type,
            } => {
                self.owned_agent(workspace, agent_id).await?;
                let update = AgentUpdate {
                    name,
                    instruction,
                    cli_type,
                };
                self.store.update_agent(agent_id, &update).await?;
            }
            ChatAction::DeleteAgent { agent_id } => {
                self.owned_agent(workspace, agent_id).await?;
                self.store.delete_agent(agent_id).await?;
                info!(workspace_id = %workspace.id, agent_id = %agent_id, "Chat deleted agent");
            }
            ChatAction::ReorderAgents { agent_ids } => {
                self.store.reorder_agents(workspace.id, &agent_ids).await?;
            }
            ChatAction::UpdateWorkspace { name, instruction } => {
                self.store
                    .update_workspace(workspace.id, &WorkspaceUpdate { name, instruction })
                    .await?;
            }
            ChatAction::RenameChat { title } => {
                self.store.rename_chat(chat_id, &title).await?;
            }
        }
        Ok(())
    }

    async fn owned_agent(&self, workspace: &Workspace, agent_id: Uuid) -> Result<Agent, ProcessorError> {
        match self.store.get_agent(agent_id).await? {
            Some(agent) if agent.workspace_id == workspace.id => Ok(agent),
            _ => Err(ProcessorError::InvalidAction(format!(
                "agent {agent_id} is not part of this workspace"
            ))),
        }
    }
}

fn next_order(agents: &[Agent]) -> i64 {
    agents.iter().map(|a| a.order).max().map_or(0, |max| max + 1)
}

#[async_trait]
impl QueueHandler for ChatProcessor {
    fn kind(&self) -> QueueKind {
        QueueKind::Chat
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
        let Some(item) = self.store.claim_queue_item(QueueKind::Chat, item.id).await? else {
            debug!(item_id = %item.id, "Chat item claimed elsewhere");
            return Ok(());
        };

        let chat = self
            .store
            .get_chat(item.owner_id)
            .await?
            .ok_or(ProcessorError::ChatNotFound(item.owner_id))?;
        let workspace = self
            .store
            .get_workspace(chat.workspace_id)
            .await?
            .ok_or(ProcessorError::WorkspaceNotFound(chat.workspace_id))?;
        let agents = self.store.list_agents(workspace.id).await?;
        let messages = self.store.list_chat_messages(chat.id).await?;
        let working_dir =
            resolve_working_dir(&workspace, &self.config.work_dir, WorkTarget::Chat(chat.id))
                .await?;

        let input = ChatPrompt {
            workspace: &workspace,
            agents: &agents,
            chat: &chat,
            messages: &messages,
        }
        .render();

        let processes = self.processes.clone();
        let owner = chat.id;
        let request = InvocationRequest::new(
            workspace.chat_cli_type,
            InvocationKind::Chat,
            working_dir,
            input,
        )
        .with_timeout(self.config.invocation_timeout)
        .on_spawn(move |handle| processes.register(owner, handle));

        info!(chat_id = %chat.id, item_id = %item.id, cli = %workspace.chat_cli_type, "Processing chat");
        let result = self.invoker.invoke(request, cancel.clone()).await;
        self.processes.unregister(chat.id);

        let output = match result.outcome {
            Ok(AgentOutput::Chat(output)) => output,
            Ok(AgentOutput::Task(_)) => {
                return Err(CliError::SchemaViolation("expected chat output".to_string()).into());
            }
            Err(CliError::Cancelled) => {
                info!(chat_id = %chat.id, "Chat processing cancelled");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(message) = output.message.as_deref().filter(|m| !m.trim().is_empty()) {
            self.store
                .add_chat_message(chat.id, ChatRole::Assistant, message, NO_ENQUEUE)
                .await?;
        }

        let mut rejected = Vec::new();
        for action in output.actions {
            if let Err(e) = self.apply_action(&workspace, chat.id, action).await {
                warn!(chat_id = %chat.id, error = %e, "Chat action rejected");
                rejected.push(e.to_string());
            }
        }
        if !rejected.is_empty() {
            self.store
                .add_chat_message(
                    chat.id,
                    ChatRole::System,
                    &format!("Some actions could not be applied:\n- {}", rejected.join("\n- ")),
                    NO_ENQUEUE,
                )
                .await?;
        }

        self.store
            .update_queue_item_status(QueueKind::Chat, item.id, QueueStatus::Completed)
            .await?;
        info!(chat_id = %chat.id, duration_ms = result.duration_ms, "Chat item completed");
        Ok(())
    }

    async fn handle_failure(&self, item: &QueueItem, failure: &ProcessorError) {
        if let Err(e) = self
            .store
            .update_queue_item_status(QueueKind::Chat, item.id, QueueStatus::Failed)
            .await
        {
            error!(item_id = %item.id, error = %e, "Failed to mark chat item failed");
        }
        // Chats wait for the user's next message rather than retrying.
        if let Err(e) = self
            .store
            .add_chat_message(
                item.owner_id,
                ChatRole::System,
                &format!("Processing failed: {failure}"),
                NO_ENQUEUE,
            )
            .await
        {
            warn!(chat_id = %item.owner_id, error = %e, "Failed to record chat failure");
        }
    }
}
