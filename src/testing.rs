//! Test doubles shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cli::{
    AgentInvoker, AgentOutput, ChatAction, ChatOutput, CliType, Invocation, InvocationKind,
    InvocationRequest, ProcessHandle, TaskAction, TaskOutput,
};
use crate::error::CliError;
use crate::tasks::model::TaskStatus;

/// One scripted invocation result.
pub enum Step {
    Output(AgentOutput),
    Error(CliError),
    /// Block until cancelled or killed, like a long-running CLI.
    Hang,
    /// Sleep, then return the inner step.
    Delay(Duration, Box<Step>),
}

impl Step {
    pub fn skip() -> Self {
        Self::Output(AgentOutput::Task(TaskOutput {
            actions: vec![TaskAction::Skip],
        }))
    }

    pub fn comment(content: &str) -> Self {
        Self::Output(AgentOutput::Task(TaskOutput {
            actions: vec![TaskAction::Comment {
                content: content.to_string(),
            }],
        }))
    }

    pub fn review() -> Self {
        Self::Output(AgentOutput::Task(TaskOutput {
            actions: vec![TaskAction::ChangeStatus {
                status: TaskStatus::InReview,
            }],
        }))
    }

    pub fn chat(message: &str, actions: Vec<ChatAction>) -> Self {
        Self::Output(AgentOutput::Chat(ChatOutput {
            message: Some(message.to_string()),
            actions,
        }))
    }

    pub fn error(err: CliError) -> Self {
        Self::Error(err)
    }

    pub fn delayed(self, by: Duration) -> Self {
        Self::Delay(by, Box::new(self))
    }
}

/// What a scripted invocation was asked to do.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub cli: CliType,
    pub kind: InvocationKind,
    pub input: String,
}

/// [`AgentInvoker`] that replays a script instead of spawning processes.
///
/// Once the script runs out every call answers `skip` (or an empty chat
/// reply for chat invocations).
pub struct ScriptedInvoker {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedInvoker {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next_step(&self, kind: InvocationKind) -> Step {
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| match kind {
            InvocationKind::Task => Step::skip(),
            InvocationKind::Chat => Step::chat("ok", Vec::new()),
        })
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(&self, mut request: InvocationRequest, cancel: CancellationToken) -> Invocation {
        let started = std::time::Instant::now();
        self.calls.lock().unwrap().push(RecordedCall {
            cli: request.cli,
            kind: request.kind,
            input: request.input.clone(),
        });

        let handle = ProcessHandle::new(None);
        if let Some(callback) = request.on_spawn.take() {
            callback(handle.clone());
        }

        let mut step = self.next_step(request.kind);
        loop {
            match step {
                Step::Delay(by, inner) => {
                    tokio::select! {
                        _ = tokio::time::sleep(by) => step = *inner,
                        _ = cancel.cancelled() => { step = Step::Error(CliError::Cancelled); }
                        _ = handle.killed() => { step = Step::Error(CliError::Cancelled); }
                    }
                }
                Step::Hang => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = handle.killed() => {}
                    }
                    step = Step::Error(CliError::Cancelled);
                }
                Step::Output(_) | Step::Error(_) => break,
            }
        }

        let outcome = match step {
            Step::Output(output) => Ok(output),
            Step::Error(err) => Err(err),
            Step::Hang | Step::Delay(..) => Err(CliError::Cancelled),
        };
        Invocation {
            exit_code: outcome.as_ref().ok().map(|_| 0),
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}
