//! Integration tests for the task/chat queues.
//!
//! Each test builds a real in-memory store, the processors, and a mock
//! invoker (or a fake CLI script on unix), then drives work through the
//! public worker-pool and scheduler entry points.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use agent_foreman::chats::{Chat, ChatProcessor, ChatRole};
use agent_foreman::cli::{
    AgentInvoker, AgentOutput, ChatOutput, CliType, Invocation, InvocationKind,
    InvocationRequest, TaskAction, TaskOutput,
};
use agent_foreman::config::ProcessorConfig;
use agent_foreman::jobs::{JobScheduler, ProcessRegistry, SchedulerConfig, WorkerPool};
use agent_foreman::store::{Database, LibSqlBackend};
use agent_foreman::tasks::model::{ActorType, CommentAuthor, CommentOptions, events};
use agent_foreman::tasks::{QueueKind, QueueStatus, Task, TaskProcessor, TaskStatus};
use agent_foreman::workspaces::{Agent, Workspace};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Mock invoker ────────────────────────────────────────────────────────

/// Replays task actions in order; chat turns always answer "ok".
struct MockInvoker {
    replies: Mutex<Vec<Vec<TaskAction>>>,
    inputs: Mutex<Vec<String>>,
}

impl MockInvoker {
    fn new(mut replies: Vec<Vec<TaskAction>>) -> Self {
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            inputs: Mutex::new(Vec::new()),
        }
    }

    fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentInvoker for MockInvoker {
    async fn invoke(&self, request: InvocationRequest, _cancel: CancellationToken) -> Invocation {
        self.inputs.lock().unwrap().push(request.input.clone());
        let output = match request.kind {
            InvocationKind::Task => {
                let actions = self
                    .replies
                    .lock()
                    .unwrap()
                    .pop()
                    .unwrap_or_else(|| vec![TaskAction::Skip]);
                AgentOutput::Task(TaskOutput { actions })
            }
            InvocationKind::Chat => AgentOutput::Chat(ChatOutput {
                message: Some("ok".to_string()),
                actions: Vec::new(),
            }),
        };
        Invocation {
            outcome: Ok(output),
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
        }
    }
}

fn comment(text: &str) -> Vec<TaskAction> {
    vec![TaskAction::Comment {
        content: text.to_string(),
    }]
}

fn review() -> Vec<TaskAction> {
    vec![TaskAction::ChangeStatus {
        status: TaskStatus::InReview,
    }]
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    db: Arc<LibSqlBackend>,
    tasks: Arc<TaskProcessor>,
    chats: Arc<ChatProcessor>,
    processes: ProcessRegistry,
    config: ProcessorConfig,
    workspace: Workspace,
    work: tempfile::TempDir,
}

async fn harness(invoker: Arc<dyn AgentInvoker>, agents: &[(&str, CliType)]) -> Harness {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let workspace = Workspace::new("integration").with_instruction("Keep changes small.");
    db.create_workspace(&workspace).await.unwrap();
    for (i, (name, cli)) in agents.iter().enumerate() {
        let agent = Agent::new(workspace.id, *name, format!("You are the {name}."), *cli, i as i64);
        db.create_agent(&agent).await.unwrap();
    }

    let work = tempfile::tempdir().unwrap();
    let config = ProcessorConfig {
        max_passes: 10,
        invocation_timeout: Some(Duration::from_secs(5)),
        max_consecutive_failures: 3,
        work_dir: work.path().to_path_buf(),
    };
    let processes = ProcessRegistry::new();
    let tasks = Arc::new(TaskProcessor::new(
        db.clone(),
        invoker.clone(),
        processes.clone(),
        config.clone(),
    ));
    let chats = Arc::new(ChatProcessor::new(
        db.clone(),
        invoker,
        processes.clone(),
        config.clone(),
    ));
    Harness {
        db,
        tasks,
        chats,
        processes,
        config,
        workspace,
        work,
    }
}

impl Harness {
    async fn new_task(&self, summary: &str) -> Task {
        let task = Task::new(self.workspace.id, summary);
        self.db.create_task(&task).await.unwrap();
        task
    }

    async fn status(&self, task: &Task) -> TaskStatus {
        self.db.get_task(task.id).await.unwrap().unwrap().status
    }

    async fn tick(&self) -> usize {
        let pool = WorkerPool::new(self.tasks.clone());
        timeout(TEST_TIMEOUT, pool.run_tick(&CancellationToken::new()))
            .await
            .expect("tick hung")
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn pipeline_passes_until_an_agent_requests_review() {
    let invoker = Arc::new(MockInvoker::new(vec![
        comment("implemented"),
        comment("needs a test"),
        comment("added test"),
        review(),
    ]));
    let h = harness(
        invoker.clone(),
        &[("coder", CliType::Codex), ("reviewer", CliType::Claude)],
    )
    .await;
    let task = h.new_task("Add login throttling").await;

    assert_eq!(h.tick().await, 1);

    assert_eq!(h.status(&task).await, TaskStatus::InReview);
    let inputs = invoker.inputs();
    assert_eq!(inputs.len(), 4);
    assert!(inputs[0].contains("Add login throttling"));
    assert!(inputs[0].contains("Keep changes small."));
    assert!(inputs[3].contains("added test"), "later turns see earlier comments");

    let comments = h.db.list_task_comments(task.id).await.unwrap();
    assert_eq!(comments.len(), 3);
    assert!(comments.iter().all(|c| matches!(c.author, CommentAuthor::Agent(_))));

    let logs = h.db.list_task_logs(task.id).await.unwrap();
    let started = logs
        .iter()
        .filter(|l| l.event_type == events::AGENT_STARTED)
        .count();
    let finished = logs
        .iter()
        .filter(|l| l.event_type == events::AGENT_FINISHED)
        .count();
    assert_eq!((started, finished), (4, 4));
    assert_eq!(logs[0].event_type, events::TASK_CREATED);

    assert!(
        h.db.active_queue_item(QueueKind::Task, task.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn zero_agent_workspace_passes_tasks_straight_to_review() {
    let h = harness(Arc::new(MockInvoker::new(vec![])), &[]).await;
    let task = h.new_task("Nothing to run").await;

    h.tick().await;
    assert_eq!(h.status(&task).await, TaskStatus::InReview);
}

#[tokio::test]
async fn crash_recovery_requeues_in_flight_items() {
    let h = harness(Arc::new(MockInvoker::new(vec![review()])), &[("solo", CliType::Claude)]).await;
    let task = h.new_task("Interrupted work").await;

    // Simulate a process that died mid-item.
    let item = h
        .db
        .active_queue_item(QueueKind::Task, task.id)
        .await
        .unwrap()
        .unwrap();
    h.db.claim_queue_item(QueueKind::Task, item.id).await.unwrap();
    assert_eq!(h.tick().await, 0, "in-flight items are not picked up");

    let reset = h
        .db
        .reset_in_progress_queue_items(QueueKind::Task)
        .await
        .unwrap();
    assert_eq!(reset, 1);

    h.tick().await;
    assert_eq!(h.status(&task).await, TaskStatus::InReview);
    let item = h
        .db
        .get_queue_item(QueueKind::Task, item.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.status, QueueStatus::Completed);
}

#[tokio::test]
async fn reviewed_task_waits_until_moved_back_to_todo() {
    let h = harness(
        Arc::new(MockInvoker::new(vec![review(), review()])),
        &[("solo", CliType::Claude)],
    )
    .await;
    let task = h.new_task("Two rounds").await;
    h.tick().await;
    assert_eq!(h.status(&task).await, TaskStatus::InReview);

    // Feedback on a task under review queues it, but it is not actionable yet.
    h.db.add_task_comment(
        task.id,
        CommentAuthor::User,
        "Please also handle the mobile flow",
        CommentOptions::default(),
    )
    .await
    .unwrap();
    assert!(
        h.db.find_workspaces_with_queued_items(QueueKind::Task)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(h.tick().await, 0);

    h.db.update_task_status(task.id, TaskStatus::Todo, ActorType::User, None)
        .await
        .unwrap();
    assert_eq!(h.tick().await, 1);
    assert_eq!(h.status(&task).await, TaskStatus::InReview);
}

#[tokio::test]
async fn priority_item_jumps_the_queue() {
    let invoker = Arc::new(MockInvoker::new(vec![review(), review(), review()]));
    let h = harness(invoker.clone(), &[("solo", CliType::Claude)]).await;
    let urgent = h.new_task("urgent fix").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.new_task("newer chore").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.new_task("newest chore").await;

    h.db.set_task_priority(urgent.id, true).await.unwrap();
    h.tick().await;

    let inputs = invoker.inputs();
    assert_eq!(inputs.len(), 3);
    assert!(inputs[0].contains("urgent fix"));
    assert!(inputs[1].contains("newest chore"));
    assert!(inputs[2].contains("newer chore"));
}

#[tokio::test]
async fn chat_message_is_answered() {
    let h = harness(Arc::new(MockInvoker::new(vec![])), &[]).await;
    let chat = Chat::new(h.workspace.id, "Setup");
    h.db.create_chat(&chat).await.unwrap();
    h.db.add_chat_message(chat.id, ChatRole::User, "hello", CommentOptions::default())
        .await
        .unwrap();

    let pool = WorkerPool::new(h.chats.clone());
    timeout(TEST_TIMEOUT, pool.run_tick(&CancellationToken::new()))
        .await
        .unwrap();

    let messages = h.db.list_chat_messages(chat.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, ChatRole::Assistant);
    assert_eq!(messages[1].content, "ok");
    assert!(h.work.path().join("chats").join(chat.id.to_string()).is_dir());
}

#[tokio::test]
async fn scheduler_drives_queued_work() {
    let h = harness(Arc::new(MockInvoker::new(vec![review()])), &[("solo", CliType::Claude)]).await;
    let task = h.new_task("Scheduled").await;

    let health = Arc::new(agent_foreman::cli::HealthChecker::new(
        agent_foreman::cli::BinaryResolver::with_store(h.db.clone()),
        Duration::from_secs(1),
    ));
    let scheduler = JobScheduler::new(
        h.db.clone(),
        health,
        h.tasks.clone(),
        h.chats.clone(),
        h.processes.clone(),
        SchedulerConfig {
            poll_interval: Duration::from_millis(10),
            health_interval: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
            queue_retention: chrono::Duration::days(7),
            work_dir: h.config.work_dir.clone(),
        },
    );
    scheduler.start();

    let reached = timeout(TEST_TIMEOUT, async {
        while h.status(&task).await != TaskStatus::InReview {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    scheduler.stop();
    assert!(reached.is_ok(), "task never reached review");
}

// ── Real subprocess ─────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn fake_cli_script_completes_a_task() {
    use std::os::unix::fs::PermissionsExt;

    use agent_foreman::cli::{BinaryResolver, CliInvoker};

    let bin = tempfile::tempdir().unwrap();
    let script = bin.path().join("fake-codex");
    std::fs::write(
        &script,
        "#!/bin/sh\nprintf '%s\\n' '{\"result\":\"{\\\"actions\\\":[{\\\"type\\\":\\\"change_status\\\",\\\"status\\\":\\\"in_review\\\"}]}\"}'\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    store
        .set_setting(
            "cli_path.codex",
            &serde_json::json!(script.display().to_string()),
        )
        .await
        .unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let invoker = Arc::new(
        CliInvoker::new(BinaryResolver::with_store(store.clone()))
            .with_scratch_dir(scratch.path().to_path_buf()),
    );

    let workspace = Workspace::new("real");
    store.create_workspace(&workspace).await.unwrap();
    store
        .create_agent(&Agent::new(workspace.id, "coder", "", CliType::Codex, 0))
        .await
        .unwrap();
    let task = Task::new(workspace.id, "Run the script");
    store.create_task(&task).await.unwrap();

    let work = tempfile::tempdir().unwrap();
    let processor = Arc::new(TaskProcessor::new(
        store.clone(),
        invoker,
        ProcessRegistry::new(),
        ProcessorConfig {
            work_dir: work.path().to_path_buf(),
            ..ProcessorConfig::default()
        },
    ));
    let pool = WorkerPool::new(processor);
    timeout(TEST_TIMEOUT, pool.run_tick(&CancellationToken::new()))
        .await
        .unwrap();

    let task = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InReview);
    assert!(work.path().join("tasks").join(task.id.to_string()).is_dir());
    assert!(
        std::fs::read_dir(scratch.path()).unwrap().next().is_none(),
        "scratch files are removed"
    );
}
