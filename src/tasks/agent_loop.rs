//! Agent loop executor — runs a workspace's agent pipeline against one task.
//!
//! A pass invokes every agent in order. Any comment during a pass earns
//! another pass; a pass with no comments, a request for review, or the
//! pass ceiling ends the loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::prompt::TaskPrompt;
use crate::cli::{AgentInvoker, AgentOutput, InvocationKind, InvocationRequest, TaskAction};
use crate::error::{CliError, ProcessorError};
use crate::jobs::registry::ProcessRegistry;
use crate::store::Database;
use crate::tasks::model::{
    ActorType, CommentAuthor, CommentOptions, NewTaskLog, Task, TaskStatus, events,
};
use crate::workspaces::model::{Agent, Workspace};

/// How an agent loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// An agent moved the task to `in_review`.
    ReviewRequested { passes: u32 },
    /// A full pass produced no comments.
    NothingToDo { passes: u32 },
    /// The pass ceiling was hit while agents kept commenting.
    IterationLimit { passes: u32 },
    /// The task left `todo`/`in_progress` while the loop was running.
    Interrupted { passes: u32 },
    /// Cancelled by the token or a kill switch. Nothing was finalised.
    Cancelled,
}

/// Result of one agent's turn within a pass.
enum TurnResult {
    Commented,
    Quiet,
    Review,
    Cancelled,
}

/// Shared dependencies of the executor.
pub struct AgentLoopDeps {
    pub store: Arc<dyn Database>,
    pub invoker: Arc<dyn AgentInvoker>,
    pub processes: ProcessRegistry,
}

/// Runs the agent pipeline for a single claimed task.
pub struct AgentLoop {
    deps: AgentLoopDeps,
    max_passes: u32,
    invocation_timeout: Option<Duration>,
}

impl AgentLoop {
    pub fn new(deps: AgentLoopDeps, max_passes: u32, invocation_timeout: Option<Duration>) -> Self {
        Self {
            deps,
            max_passes: max_passes.max(1),
            invocation_timeout,
        }
    }

    fn store(&self) -> &Arc<dyn Database> {
        &self.deps.store
    }

    /// Run passes until the loop ends.
    ///
    /// Status bookkeeping for `NothingToDo` and `IterationLimit` (moving the
    /// task to review, completing the queue item) is left to the caller.
    pub async fn run(
        &self,
        workspace: &Workspace,
        task_id: uuid::Uuid,
        agents: &[Agent],
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, ProcessorError> {
        for pass in 1..=self.max_passes {
            let mut comment_added = false;

            for listed in agents {
                if cancel.is_cancelled() {
                    return Ok(LoopOutcome::Cancelled);
                }

                let task = self
                    .store()
                    .get_task(task_id)
                    .await?
                    .ok_or(ProcessorError::TaskNotFound(task_id))?;
                if !task.status.is_actionable() {
                    info!(task_id = %task_id, status = %task.status, "Task left the active states, stopping agent loop");
                    return Ok(LoopOutcome::Interrupted { passes: pass });
                }

                // Agents may be edited or deleted while the loop runs.
                let Some(agent) = self.store().get_agent(listed.id).await? else {
                    debug!(agent_id = %listed.id, "Agent deleted mid-loop, skipping");
                    continue;
                };

                match self
                    .run_turn(workspace, &task, &agent, agents, working_dir, pass, cancel)
                    .await?
                {
                    TurnResult::Commented => comment_added = true,
                    TurnResult::Quiet => {}
                    TurnResult::Review => {
                        info!(task_id = %task_id, agent = %agent.name, pass, "Agent requested review");
                        return Ok(LoopOutcome::ReviewRequested { passes: pass });
                    }
                    TurnResult::Cancelled => return Ok(LoopOutcome::Cancelled),
                }
            }

            if !comment_added {
                debug!(task_id = %task_id, pass, "Pass produced no comments");
                return Ok(LoopOutcome::NothingToDo { passes: pass });
            }
        }

        warn!(task_id = %task_id, max_passes = self.max_passes, "Agent loop hit the pass ceiling");
        self.store()
            .add_task_comment(
                task_id,
                CommentAuthor::System,
                &format!(
                    "Stopped after {} passes: the agents kept commenting without requesting review.",
                    self.max_passes
                ),
                CommentOptions { enqueue: false },
            )
            .await?;
        Ok(LoopOutcome::IterationLimit {
            passes: self.max_passes,
        })
    }

    /// Invoke one agent and apply its actions.
    #[allow(clippy::too_many_arguments)]
    async fn run_turn(
        &self,
        workspace: &Workspace,
        task: &Task,
        agent: &Agent,
        agents: &[Agent],
        working_dir: &Path,
        pass: u32,
        cancel: &CancellationToken,
    ) -> Result<TurnResult, ProcessorError> {
        let comments = self.store().list_task_comments(task.id).await?;
        let logs = self.store().list_task_logs(task.id).await?;
        let input = TaskPrompt {
            workspace,
            agent,
            agents,
            task,
            comments: &comments,
            logs: &logs,
        }
        .render();

        self.store()
            .add_task_log(
                NewTaskLog::agent(task.id, agent.id, events::AGENT_STARTED)
                    .with_metadata(serde_json::json!({ "pass": pass, "cli": agent.cli_type })),
            )
            .await?;

        let processes = self.deps.processes.clone();
        let owner = task.id;
        let request = InvocationRequest::new(
            agent.cli_type,
            InvocationKind::Task,
            working_dir.to_path_buf(),
            input,
        )
        .with_timeout(self.invocation_timeout)
        .on_spawn(move |handle| processes.register(owner, handle));

        let result = self.deps.invoker.invoke(request, cancel.clone()).await;
        self.deps.processes.unregister(task.id);

        self.store()
            .add_task_log(
                NewTaskLog::agent(task.id, agent.id, events::AGENT_FINISHED).with_metadata(
                    serde_json::json!({
                        "pass": pass,
                        "duration_ms": result.duration_ms,
                        "exit_code": result.exit_code,
                        "success": result.is_success(),
                    }),
                ),
            )
            .await?;

        let output = match result.outcome {
            Ok(AgentOutput::Task(output)) => output,
            Ok(AgentOutput::Chat(_)) => {
                let err = CliError::SchemaViolation("expected task output".to_string());
                return self.record_failure(task, agent, &err).await;
            }
            Err(CliError::Cancelled) => return Ok(TurnResult::Cancelled),
            Err(err) => return self.record_failure(task, agent, &err).await,
        };

        let mut turn = TurnResult::Quiet;
        for action in output.actions {
            match action {
                TaskAction::Skip => {}
                TaskAction::Comment { content } => {
                    self.store()
                        .add_task_comment(
                            task.id,
                            CommentAuthor::Agent(agent.id),
                            &content,
                            CommentOptions { enqueue: false },
                        )
                        .await?;
                    turn = TurnResult::Commented;
                }
                TaskAction::ChangeStatus { status } => {
                    // Validated upstream; only in_review reaches here.
                    debug_assert_eq!(status, TaskStatus::InReview);
                    self.store()
                        .update_task_status(
                            task.id,
                            TaskStatus::InReview,
                            ActorType::Agent,
                            Some(agent.id),
                        )
                        .await?;
                    return Ok(TurnResult::Review);
                }
            }
        }
        Ok(turn)
    }

    /// An invocation failure becomes a system comment and counts as activity.
    async fn record_failure(
        &self,
        task: &Task,
        agent: &Agent,
        err: &CliError,
    ) -> Result<TurnResult, ProcessorError> {
        warn!(task_id = %task.id, agent = %agent.name, error = %err, "Agent invocation failed");
        self.store()
            .add_task_comment(
                task.id,
                CommentAuthor::System,
                &format!("Agent \"{}\" failed: {err}", agent.name),
                CommentOptions { enqueue: false },
            )
            .await?;
        Ok(TurnResult::Commented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CliType;
    use crate::store::LibSqlBackend;
    use crate::tasks::model::QueueKind;
    use crate::testing::{ScriptedInvoker, Step};

    struct Fixture {
        db: Arc<LibSqlBackend>,
        invoker: Arc<ScriptedInvoker>,
        workspace: Workspace,
        agents: Vec<Agent>,
        task: Task,
        dir: tempfile::TempDir,
    }

    async fn fixture(agent_count: usize, script: Vec<Step>) -> Fixture {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let workspace = Workspace::new("demo");
        db.create_workspace(&workspace).await.unwrap();

        let mut agents = Vec::new();
        for i in 0..agent_count {
            let agent = Agent::new(workspace.id, format!("agent-{i}"), "work", CliType::Claude, i as i64);
            db.create_agent(&agent).await.unwrap();
            agents.push(agent);
        }

        let task = Task::new(workspace.id, "Fix login");
        db.create_task(&task).await.unwrap();
        db.update_task_status(task.id, TaskStatus::InProgress, ActorType::System, None)
            .await
            .unwrap();

        Fixture {
            db,
            invoker: Arc::new(ScriptedInvoker::new(script)),
            workspace,
            agents,
            task,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Fixture {
        fn executor(&self, max_passes: u32) -> AgentLoop {
            AgentLoop::new(
                AgentLoopDeps {
                    store: self.db.clone(),
                    invoker: self.invoker.clone(),
                    processes: ProcessRegistry::new(),
                },
                max_passes,
                None,
            )
        }

        async fn run(&self, max_passes: u32) -> LoopOutcome {
            self.executor(max_passes)
                .run(
                    &self.workspace,
                    self.task.id,
                    &self.agents,
                    self.dir.path(),
                    &CancellationToken::new(),
                )
                .await
                .unwrap()
        }

        async fn status(&self) -> TaskStatus {
            self.db.get_task(self.task.id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn review_request_stops_the_pass() {
        let f = fixture(3, vec![Step::comment("implemented"), Step::review()]).await;
        let outcome = f.run(100).await;

        assert_eq!(outcome, LoopOutcome::ReviewRequested { passes: 1 });
        assert_eq!(f.invoker.call_count(), 2, "third agent never runs");
        assert_eq!(f.status().await, TaskStatus::InReview);
    }

    #[tokio::test]
    async fn quiet_pass_ends_the_loop() {
        let f = fixture(2, vec![Step::skip(), Step::skip()]).await;
        assert_eq!(f.run(100).await, LoopOutcome::NothingToDo { passes: 1 });
        assert_eq!(f.invoker.call_count(), 2);
    }

    #[tokio::test]
    async fn comment_earns_another_pass() {
        let f = fixture(
            2,
            vec![Step::comment("first"), Step::skip(), Step::skip(), Step::skip()],
        )
        .await;
        assert_eq!(f.run(100).await, LoopOutcome::NothingToDo { passes: 2 });
        assert_eq!(f.invoker.call_count(), 4);

        let comments = f.db.list_task_comments(f.task.id).await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].author, CommentAuthor::Agent(f.agents[0].id));
    }

    #[tokio::test]
    async fn ceiling_stops_chatty_agents() {
        let f = fixture(1, (0..10).map(|_| Step::comment("again")).collect()).await;
        assert_eq!(f.run(3).await, LoopOutcome::IterationLimit { passes: 3 });
        assert_eq!(f.invoker.call_count(), 3);

        let comments = f.db.list_task_comments(f.task.id).await.unwrap();
        let last = comments.last().unwrap();
        assert_eq!(last.author, CommentAuthor::System);
        assert!(last.content.contains("3 passes"));
    }

    #[tokio::test]
    async fn invocation_failure_becomes_system_comment() {
        let f = fixture(
            1,
            vec![Step::error(CliError::EmptyOutput), Step::skip()],
        )
        .await;
        assert_eq!(f.run(100).await, LoopOutcome::NothingToDo { passes: 2 });

        let comments = f.db.list_task_comments(f.task.id).await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].author, CommentAuthor::System);
        assert!(comments[0].content.contains("no output"));
    }

    #[tokio::test]
    async fn deleted_agent_is_skipped() {
        let f = fixture(2, vec![Step::skip()]).await;
        f.db.delete_agent(f.agents[0].id).await.unwrap();

        assert_eq!(f.run(100).await, LoopOutcome::NothingToDo { passes: 1 });
        assert_eq!(f.invoker.call_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_invocation_leaves_no_trace() {
        let f = fixture(1, vec![Step::error(CliError::Cancelled)]).await;
        assert_eq!(f.run(100).await, LoopOutcome::Cancelled);
        assert!(f.db.list_task_comments(f.task.id).await.unwrap().is_empty());
        assert_eq!(f.status().await, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_invoking() {
        let f = fixture(1, vec![Step::skip()]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = f
            .executor(100)
            .run(&f.workspace, f.task.id, &f.agents, f.dir.path(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, LoopOutcome::Cancelled);
        assert_eq!(f.invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn invocations_are_bracketed_by_logs() {
        let f = fixture(1, vec![Step::skip()]).await;
        f.run(100).await;

        let kinds: Vec<String> = f
            .db
            .list_task_logs(f.task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.event_type)
            .filter(|e| e.starts_with("agent_"))
            .collect();
        assert_eq!(kinds, vec![events::AGENT_STARTED, events::AGENT_FINISHED]);
    }

    #[tokio::test]
    async fn externally_moved_task_interrupts_loop() {
        let f = fixture(2, vec![Step::comment("working")]).await;
        f.db.update_task_status(f.task.id, TaskStatus::Done, ActorType::User, None)
            .await
            .unwrap();

        assert_eq!(f.run(100).await, LoopOutcome::Interrupted { passes: 1 });
        assert_eq!(f.invoker.call_count(), 0);
        // Untouched by the loop.
        assert!(
            f.db.active_queue_item(QueueKind::Task, f.task.id)
                .await
                .unwrap()
                .is_some()
        );
    }
}
