//! One agent CLI run as a subprocess.
//!
//! Provides controlled invocation with:
//! - Scratch input (and schema) files removed on every exit path
//! - Timeout enforcement
//! - Cancellation through a token or a per-process kill switch
//! - Output parsing and schema validation

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::binary::BinaryResolver;
use crate::cli::prompt::command_prompt;
use crate::cli::schema::{AgentOutput, parse_output, schema_for};
use crate::cli::CliType;
use crate::error::CliError;

/// Maximum captured size per stream (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Which output contract an invocation must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Task,
    Chat,
}

/// Called once the subprocess is running.
pub type SpawnCallback = Box<dyn FnOnce(ProcessHandle) + Send>;

/// Handle to a running CLI process, used to force-kill it from outside.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_switch: CancellationToken,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            kill_switch: CancellationToken::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the owning invocation to kill the process.
    pub fn kill(&self) {
        self.kill_switch.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.kill_switch.is_cancelled()
    }

    /// Resolves once [`kill`](Self::kill) has been called.
    pub async fn killed(&self) {
        self.kill_switch.cancelled().await
    }
}

/// Everything needed to run one CLI invocation.
pub struct InvocationRequest {
    pub cli: CliType,
    pub kind: InvocationKind,
    /// Subprocess `cwd`. Never removed by the adapter.
    pub working_dir: PathBuf,
    /// Scratch file contents (see `cli::prompt`).
    pub input: String,
    pub timeout: Option<Duration>,
    pub on_spawn: Option<SpawnCallback>,
}

impl InvocationRequest {
    pub fn new(cli: CliType, kind: InvocationKind, working_dir: PathBuf, input: String) -> Self {
        Self {
            cli,
            kind,
            working_dir,
            input,
            timeout: None,
            on_spawn: None,
        }
    }

    /// Builder: set the timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder: register a callback receiving the process handle.
    pub fn on_spawn(mut self, callback: impl FnOnce(ProcessHandle) + Send + 'static) -> Self {
        self.on_spawn = Some(Box::new(callback));
        self
    }
}

/// Result of one invocation. Errors are values; nothing escapes the adapter.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub outcome: Result<AgentOutput, CliError>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl Invocation {
    fn failed(error: CliError, started: Instant) -> Self {
        Self {
            outcome: Err(error),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Runs agent CLIs. Implemented by [`CliInvoker`]; tests substitute stubs.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest, cancel: CancellationToken) -> Invocation;
}

/// Subprocess-backed [`AgentInvoker`].
#[derive(Clone)]
pub struct CliInvoker {
    resolver: BinaryResolver,
    /// Where scratch files go (system temp dir if `None`).
    scratch_dir: Option<PathBuf>,
}

/// Scratch files alive for the duration of one invocation.
struct ScratchFiles {
    input: NamedTempFile,
    schema: Option<NamedTempFile>,
}

/// How the wait ended.
enum WaitEnd {
    Exited(std::process::ExitStatus),
    Cancelled,
    TimedOut(Duration),
}

impl CliInvoker {
    pub fn new(resolver: BinaryResolver) -> Self {
        Self {
            resolver,
            scratch_dir: None,
        }
    }

    /// Builder: place scratch files in `dir`.
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = Some(dir);
        self
    }

    fn scratch_file(&self, suffix: &str) -> Result<NamedTempFile, CliError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("foreman-").suffix(suffix);
        let file = match &self.scratch_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        file.map_err(|e| CliError::Input(format!("create scratch file: {e}")))
    }

    fn write_scratch(&self, request: &InvocationRequest) -> Result<ScratchFiles, CliError> {
        let schema = schema_for(request.kind);
        let schema_text = serde_json::to_string_pretty(&schema)
            .map_err(|e| CliError::Input(format!("serialize schema: {e}")))?;

        let mut input = self.scratch_file(".md")?;
        write!(
            input,
            "{}\n# Output schema\n\n```json\n{schema_text}\n```\n",
            request.input
        )
        .map_err(|e| CliError::Input(format!("write input file: {e}")))?;

        let schema_file = if request.cli == CliType::Codex {
            let mut file = self.scratch_file(".json")?;
            file.write_all(schema_text.as_bytes())
                .map_err(|e| CliError::Input(format!("write schema file: {e}")))?;
            Some(file)
        } else {
            None
        };

        Ok(ScratchFiles {
            input,
            schema: schema_file,
        })
    }
}

/// CLI-specific arguments for a non-interactive, structured-output run.
fn build_args(
    cli: CliType,
    kind: InvocationKind,
    scratch: &ScratchFiles,
) -> Result<Vec<String>, CliError> {
    let prompt = command_prompt(scratch.input.path(), kind);
    let args = match cli {
        CliType::Claude => {
            let schema = serde_json::to_string(&schema_for(kind))
                .map_err(|e| CliError::Input(format!("serialize schema: {e}")))?;
            vec![
                "-p".to_string(),
                prompt,
                "--output-format".to_string(),
                "json".to_string(),
                "--json-schema".to_string(),
                schema,
                "--dangerously-skip-permissions".to_string(),
            ]
        }
        CliType::Codex => {
            let schema_path = scratch
                .schema
                .as_ref()
                .map(|f| f.path().display().to_string())
                .ok_or_else(|| CliError::Input("missing schema file".to_string()))?;
            vec![
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "--dangerously-bypass-approvals-and-sandbox".to_string(),
                "--output-schema".to_string(),
                schema_path,
                prompt,
            ]
        }
        CliType::Gemini => vec![
            "-p".to_string(),
            prompt,
            "--output-format".to_string(),
            "json".to_string(),
            "--yolo".to_string(),
        ],
    };
    Ok(args)
}

fn spawn_cli(
    binary: &Path,
    args: &[String],
    working_dir: &Path,
    cli: CliType,
) -> Result<Child, CliError> {
    Command::new(binary)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CliError::Spawn {
            cli,
            reason: e.to_string(),
        })
}

/// Drain a pipe on its own task so a chatty child never blocks on a full pipe.
///
/// Returns everything the child wrote; only the copies kept on
/// [`Invocation`] are truncated.
fn drain<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Race the child's exit against cancellation, the kill switch and the timeout.
async fn wait_for_exit(
    child: &mut Child,
    cancel: &CancellationToken,
    kill_switch: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<WaitEnd, CliError> {
    let deadline = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    let end = tokio::select! {
        status = child.wait() => {
            return status
                .map(WaitEnd::Exited)
                .map_err(|e| CliError::Wait(e.to_string()));
        }
        _ = cancel.cancelled() => WaitEnd::Cancelled,
        _ = kill_switch.cancelled() => WaitEnd::Cancelled,
        _ = deadline => WaitEnd::TimedOut(timeout.unwrap_or_default()),
    };

    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill CLI process");
    }
    Ok(end)
}

#[async_trait]
impl AgentInvoker for CliInvoker {
    async fn invoke(&self, mut request: InvocationRequest, cancel: CancellationToken) -> Invocation {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Invocation::failed(CliError::Cancelled, started);
        }

        let binary = match self.resolver.resolve(request.cli).await {
            Ok(path) => path,
            Err(e) => return Invocation::failed(e, started),
        };
        // Dropped (and deleted) when this function returns.
        let scratch = match self.write_scratch(&request) {
            Ok(files) => files,
            Err(e) => return Invocation::failed(e, started),
        };
        let args = match build_args(request.cli, request.kind, &scratch) {
            Ok(args) => args,
            Err(e) => return Invocation::failed(e, started),
        };

        let mut child = match spawn_cli(&binary, &args, &request.working_dir, request.cli) {
            Ok(child) => child,
            Err(e) => return Invocation::failed(e, started),
        };
        let handle = ProcessHandle::new(child.id());
        debug!(cli = %request.cli, pid = ?handle.pid(), cwd = %request.working_dir.display(), "CLI spawned");
        if let Some(callback) = request.on_spawn.take() {
            callback(handle.clone());
        }

        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain(child.stderr.take());

        let end = wait_for_exit(&mut child, &cancel, &handle.kill_switch, request.timeout).await;
        let status = match end {
            Ok(WaitEnd::Exited(status)) => status,
            Ok(WaitEnd::Cancelled) => {
                stdout_task.abort();
                stderr_task.abort();
                info!(cli = %request.cli, "CLI invocation cancelled");
                return Invocation::failed(CliError::Cancelled, started);
            }
            Ok(WaitEnd::TimedOut(limit)) => {
                stdout_task.abort();
                stderr_task.abort();
                warn!(cli = %request.cli, timeout_secs = limit.as_secs(), "CLI invocation timed out");
                return Invocation::failed(CliError::TimedOut(limit), started);
            }
            Err(e) => {
                stdout_task.abort();
                stderr_task.abort();
                return Invocation::failed(e, started);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let code = status.code().unwrap_or(-1);

        let outcome = if code != 0 {
            Err(CliError::NonZeroExit {
                code,
                stderr: truncate_output(stderr.trim()),
            })
        } else {
            parse_output(request.kind, &stdout)
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => debug!(cli = %request.cli, duration_ms, "CLI invocation succeeded"),
            Err(e) => warn!(cli = %request.cli, duration_ms, error = %e, "CLI invocation failed"),
        }

        drop(scratch);
        Invocation {
            outcome,
            exit_code: Some(code),
            stdout: truncate_output(&stdout),
            stderr: truncate_output(&stderr),
            duration_ms,
        }
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
pub(crate) fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_keeps_head_and_tail() {
        let big = "a".repeat(MAX_OUTPUT_SIZE) + &"b".repeat(100);
        let out = truncate_output(&big);
        assert!(out.starts_with('a'));
        assert!(out.ends_with('b'));
        assert!(out.contains("[truncated 100 bytes]"));
    }

    #[test]
    fn process_handle_kill_switch() {
        let handle = ProcessHandle::new(Some(42));
        let clone = handle.clone();
        assert!(!handle.is_killed());
        clone.kill();
        assert!(handle.is_killed());
        assert_eq!(handle.pid(), Some(42));
    }

    #[cfg(unix)]
    mod subprocess {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::{Arc, Mutex};

        use super::*;
        use crate::cli::schema::{TaskAction, TaskOutput};
        use crate::store::{Database, LibSqlBackend};

        struct Harness {
            invoker: CliInvoker,
            scratch: tempfile::TempDir,
            work: tempfile::TempDir,
            _bin: tempfile::TempDir,
        }

        /// Install `body` as a fake `claude` binary via the settings override.
        async fn harness(body: &str) -> Harness {
            let bin = tempfile::tempdir().unwrap();
            let script = bin.path().join("fake-claude");
            std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

            let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
            db.set_setting(
                "cli_path.claude",
                &serde_json::json!(script.display().to_string()),
            )
            .await
            .unwrap();

            let scratch = tempfile::tempdir().unwrap();
            let invoker = CliInvoker::new(BinaryResolver::with_store(db))
                .with_scratch_dir(scratch.path().to_path_buf());
            Harness {
                invoker,
                scratch,
                work: tempfile::tempdir().unwrap(),
                _bin: bin,
            }
        }

        impl Harness {
            fn request(&self) -> InvocationRequest {
                InvocationRequest::new(
                    CliType::Claude,
                    InvocationKind::Task,
                    self.work.path().to_path_buf(),
                    "# Task\n\nDo it.\n".to_string(),
                )
            }

            fn scratch_is_empty(&self) -> bool {
                std::fs::read_dir(self.scratch.path()).unwrap().next().is_none()
            }
        }

        #[tokio::test]
        async fn valid_output_is_parsed_and_scratch_removed() {
            let h = harness(r#"echo '{"actions":[{"type":"skip"}]}'"#).await;
            let result = h.invoker.invoke(h.request(), CancellationToken::new()).await;

            assert_eq!(
                result.outcome.unwrap(),
                AgentOutput::Task(TaskOutput {
                    actions: vec![TaskAction::Skip]
                })
            );
            assert_eq!(result.exit_code, Some(0));
            assert!(h.scratch_is_empty());
            assert!(h.work.path().exists(), "working dir must survive");
        }

        #[tokio::test]
        async fn large_output_is_parsed_in_full() {
            let content = "x".repeat(70_000);
            let body = format!(
                r#"printf '%s\n' '{{"actions":[{{"type":"comment","content":"{content}"}}]}}'"#
            );
            let h = harness(&body).await;
            let result = h.invoker.invoke(h.request(), CancellationToken::new()).await;

            assert_eq!(
                result.outcome.unwrap(),
                AgentOutput::Task(TaskOutput {
                    actions: vec![TaskAction::Comment { content }]
                })
            );
            assert!(result.stdout.len() < 70_000, "kept stdout is truncated");
            assert!(result.stdout.contains("[truncated"));
        }

        #[tokio::test]
        async fn non_zero_exit_reports_stderr() {
            let h = harness("echo 'rate limited' >&2\nexit 3").await;
            let result = h.invoker.invoke(h.request(), CancellationToken::new()).await;

            assert_eq!(
                result.outcome.unwrap_err(),
                CliError::NonZeroExit {
                    code: 3,
                    stderr: "rate limited".to_string()
                }
            );
            assert!(h.scratch_is_empty());
        }

        #[tokio::test]
        async fn empty_stdout_is_a_failure() {
            let h = harness("exit 0").await;
            let result = h.invoker.invoke(h.request(), CancellationToken::new()).await;
            assert_eq!(result.outcome.unwrap_err(), CliError::EmptyOutput);
        }

        #[tokio::test]
        async fn cancellation_kills_the_process() {
            let h = harness("exec sleep 30").await;
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });

            let started = Instant::now();
            let result = h.invoker.invoke(h.request(), cancel).await;
            assert_eq!(result.outcome.unwrap_err(), CliError::Cancelled);
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(h.scratch_is_empty());
        }

        #[tokio::test]
        async fn timeout_kills_the_process() {
            let h = harness("exec sleep 30").await;
            let request = h.request().with_timeout(Some(Duration::from_millis(200)));
            let result = h.invoker.invoke(request, CancellationToken::new()).await;

            assert!(matches!(result.outcome.unwrap_err(), CliError::TimedOut(_)));
            assert!(h.scratch_is_empty());
        }

        #[tokio::test]
        async fn kill_switch_from_spawn_callback() {
            let h = harness("exec sleep 30").await;
            let captured: Arc<Mutex<Option<ProcessHandle>>> = Arc::new(Mutex::new(None));
            let slot = captured.clone();
            let request = h.request().on_spawn(move |handle| {
                *slot.lock().unwrap() = Some(handle);
            });

            let killer = captured.clone();
            tokio::spawn(async move {
                loop {
                    let spawned = killer.lock().unwrap().clone();
                    if let Some(handle) = spawned {
                        handle.kill();
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            });

            let result = h.invoker.invoke(request, CancellationToken::new()).await;
            assert_eq!(result.outcome.unwrap_err(), CliError::Cancelled);
            assert!(captured.lock().unwrap().as_ref().unwrap().pid().is_some());
        }

        #[tokio::test]
        async fn already_cancelled_never_spawns() {
            let h = harness("touch spawned").await;
            let cancel = CancellationToken::new();
            cancel.cancel();

            let result = h.invoker.invoke(h.request(), cancel).await;
            assert_eq!(result.outcome.unwrap_err(), CliError::Cancelled);
            assert!(!h.work.path().join("spawned").exists());
        }

        #[tokio::test]
        async fn missing_binary_is_a_spawn_error() {
            let h = harness("exit 0").await;
            let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
            db.set_setting("cli_path.claude", &serde_json::json!("/nonexistent/claude"))
                .await
                .unwrap();
            let invoker = CliInvoker::new(BinaryResolver::with_store(db))
                .with_scratch_dir(h.scratch.path().to_path_buf());

            let result = invoker.invoke(h.request(), CancellationToken::new()).await;
            assert!(matches!(result.outcome.unwrap_err(), CliError::Spawn { .. }));
            assert!(h.scratch_is_empty());
        }
    }
}
