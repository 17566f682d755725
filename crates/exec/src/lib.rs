#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `exec` runs a shell command on the remote host in the background and
//! tracks it through a `pending -> running -> {completed, failed, timeout}`
//! state machine, streaming output lines to the notification bus as they
//! arrive and recording the full transcript for later retrieval.
//!
//! # Design
//!
//! [`CommandExecutor::submit`] allocates an id, records a `pending` entry, and
//! spawns the actual execution onto the async runtime so the caller gets the
//! id back immediately rather than blocking for the command's lifetime.
//! Execution itself spawns the process through a shell (`sh -c` / `cmd /C`),
//! reads stdout and stderr concurrently on their own tasks so a command that
//! only writes to one stream cannot stall the other, and appends each line to
//! a shared transcript while publishing it on the bus.
//!
//! # Invariants
//!
//! - A command's state only moves forward:
//!   `pending -> running -> (completed | failed | timeout)`. Once terminal,
//!   it does not change again.
//! - On timeout the process is asked to terminate (`SIGTERM` on Unix) and
//!   given a one second grace period before being killed outright; the
//!   recorded state is `timeout` regardless of which signal actually ended
//!   it.
//! - The transcript accumulates output in the order lines were read from
//!   each stream; interleaving between stdout and stderr is best-effort, not
//!   guaranteed.
//!
//! # Errors
//!
//! Spawn failures (missing binary, permission denied) move the command
//! directly to `failed` with the underlying error text appended to its
//! transcript rather than returning an error from `submit`, since the caller
//! has already been handed an id to poll.
//!
//! # See also
//!
//! - [`notify_bus`] for the `command_output` / `command_completed` events
//!   this crate publishes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify_bus::{Message, NotifyBus, Stream as BusStream};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Grace period between asking a timed-out process to terminate and killing
/// it outright.
const TERMINATION_GRACE: Duration = Duration::from_secs(1);

/// Exit code recorded for a timed-out command, matching the GNU `timeout`
/// convention. A signal-terminated process reports no exit code of its own
/// (`status.code()` is `None` on Unix), so this is synthesized rather than
/// observed.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Lifecycle state of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Accepted but not yet spawned.
    Pending,
    /// Spawned and running.
    Running,
    /// Exited on its own before the timeout elapsed.
    Completed,
    /// Could not be spawned, or exited the reader/wait machinery abnormally.
    Failed,
    /// Exceeded its timeout and was terminated.
    Timeout,
}

impl CommandState {
    fn as_wire_str(self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Running => "running",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
            CommandState::Timeout => "timeout",
        }
    }
}

/// Parameters for a single command submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Shell command line, passed to `sh -c` (or the platform equivalent).
    pub command: String,
    /// Directory to run the command in; created if it does not exist.
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    /// Extra environment variables layered on top of the inherited ones.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Seconds to allow before escalating to termination. `None` waits
    /// indefinitely.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_working_directory() -> String {
    ".".to_owned()
}

/// A snapshot of a command's current status and transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatus {
    /// Id returned by [`CommandExecutor::submit`].
    pub command_id: String,
    /// Current lifecycle state.
    pub state: CommandState,
    /// When the command was spawned, if it has been.
    pub start_time: Option<DateTime<Utc>>,
    /// When the command reached a terminal state, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// Process exit code, if one was observed.
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr transcript collected so far.
    pub output: String,
}

struct CommandRecord {
    state: CommandState,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    output: String,
}

impl CommandRecord {
    fn pending() -> Self {
        Self {
            state: CommandState::Pending,
            start_time: None,
            end_time: None,
            exit_code: None,
            output: String::new(),
        }
    }
}

/// Registry of in-flight and completed commands for one server process.
///
/// Backed by [`DashMap`] rather than a single `Mutex<HashMap<_>>` so that
/// concurrent submissions and status polls do not serialise behind one
/// server-wide lock.
#[derive(Clone)]
pub struct CommandExecutor {
    bus: NotifyBus,
    records: Arc<DashMap<String, Arc<Mutex<CommandRecord>>>>,
}

impl CommandExecutor {
    /// Creates an executor that publishes output and completion events onto
    /// `bus`.
    #[must_use]
    pub fn new(bus: NotifyBus) -> Self {
        Self {
            bus,
            records: Arc::new(DashMap::new()),
        }
    }

    /// Accepts `request`, returning its id immediately. Execution happens on
    /// a spawned task; poll [`CommandExecutor::status`] for progress.
    pub async fn submit(&self, request: CommandRequest) -> String {
        let command_id = uuid::Uuid::new_v4().to_string();
        let record = Arc::new(Mutex::new(CommandRecord::pending()));
        self.records.insert(command_id.clone(), Arc::clone(&record));

        tracing::debug!(command_id = %command_id, command = %request.command, "command submitted");

        let bus = self.bus.clone();
        let id_for_task = command_id.clone();
        tokio::spawn(async move {
            run(id_for_task, request, record, bus).await;
        });

        command_id
    }

    /// Returns the current status of `command_id`, or `None` if no such
    /// command was ever submitted to this executor.
    pub async fn status(&self, command_id: &str) -> Option<CommandStatus> {
        let record = self.records.get(command_id)?.clone();
        let record = record.lock().await;
        Some(CommandStatus {
            command_id: command_id.to_owned(),
            state: record.state,
            start_time: record.start_time,
            end_time: record.end_time,
            exit_code: record.exit_code,
            output: record.output.clone(),
        })
    }
}

async fn run(command_id: String, request: CommandRequest, record: Arc<Mutex<CommandRecord>>, bus: NotifyBus) {
    if let Err(source) = tokio::fs::create_dir_all(&request.working_directory).await {
        fail(&record, &bus, &command_id, format!("failed to create working directory: {source}")).await;
        return;
    }

    let mut command = Command::new(shell_binary());
    command.arg(shell_flag()).arg(&request.command);
    command.current_dir(&request.working_directory);
    for (key, value) in &request.environment {
        command.env(key, value);
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            fail(&record, &bus, &command_id, format!("failed to start command: {source}")).await;
            return;
        }
    };

    {
        let mut guard = record.lock().await;
        guard.state = CommandState::Running;
        guard.start_time = Some(Utc::now());
    }

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let stdout_task = tokio::spawn(read_lines(stdout, BusStream::Stdout, command_id.clone(), Arc::clone(&record), bus.clone()));
    let stderr_task = tokio::spawn(read_lines(stderr, BusStream::Stderr, command_id.clone(), Arc::clone(&record), bus.clone()));

    let (state, exit_code) = wait_with_timeout(&mut child, request.timeout_seconds).await;

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let mut guard = record.lock().await;
    guard.state = state;
    guard.exit_code = exit_code;
    guard.end_time = Some(Utc::now());
    drop(guard);

    bus.publish(Message::CommandCompleted {
        command_id,
        status: state.as_wire_str().to_owned(),
        exit_code,
    });
}

async fn wait_with_timeout(child: &mut Child, timeout_seconds: Option<u64>) -> (CommandState, Option<i32>) {
    let Some(timeout_seconds) = timeout_seconds else {
        return match child.wait().await {
            Ok(status) => (CommandState::Completed, status.code()),
            Err(_) => (CommandState::Failed, None),
        };
    };

    match tokio::time::timeout(Duration::from_secs(timeout_seconds), child.wait()).await {
        Ok(Ok(status)) => (CommandState::Completed, status.code()),
        Ok(Err(_)) => (CommandState::Failed, None),
        Err(_) => {
            request_termination(child);
            tokio::time::sleep(TERMINATION_GRACE).await;
            match child.try_wait() {
                Ok(Some(status)) => (CommandState::Timeout, Some(status.code().unwrap_or(TIMEOUT_EXIT_CODE))),
                _ => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    (CommandState::Timeout, Some(TIMEOUT_EXIT_CODE))
                }
            }
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}

async fn read_lines<R>(stream: R, which: BusStream, command_id: String, record: Arc<Mutex<CommandRecord>>, bus: NotifyBus)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut with_newline = line.clone();
        with_newline.push('\n');
        record.lock().await.output.push_str(&with_newline);
        bus.publish(Message::CommandOutput {
            command_id: command_id.clone(),
            stream: which,
            content: line,
        });
    }
}

async fn fail(record: &Arc<Mutex<CommandRecord>>, bus: &NotifyBus, command_id: &str, message: String) {
    tracing::warn!(command_id = %command_id, %message, "command failed");

    let mut guard = record.lock().await;
    guard.state = CommandState::Failed;
    guard.output.push_str(&message);
    guard.output.push('\n');
    guard.end_time = Some(Utc::now());
    drop(guard);

    bus.publish(Message::CommandCompleted {
        command_id: command_id.to_owned(),
        status: CommandState::Failed.as_wire_str().to_owned(),
        exit_code: None,
    });
}

#[cfg(unix)]
fn shell_binary() -> &'static str {
    "sh"
}

#[cfg(unix)]
fn shell_flag() -> &'static str {
    "-c"
}

#[cfg(windows)]
fn shell_binary() -> &'static str {
    "cmd"
}

#[cfg(windows)]
fn shell_flag() -> &'static str {
    "/C"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, working_directory: &str) -> CommandRequest {
        CommandRequest {
            command: command.to_owned(),
            working_directory: working_directory.to_owned(),
            environment: HashMap::new(),
            timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn successful_command_reaches_completed_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(NotifyBus::new());
        let id = executor
            .submit(request("echo hello", dir.path().to_str().unwrap()))
            .await;

        let status = poll_until_terminal(&executor, &id).await;
        assert_eq!(status.state, CommandState::Completed);
        assert_eq!(status.exit_code, Some(0));
        assert!(status.output.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_still_completed_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(NotifyBus::new());
        let id = executor
            .submit(request("exit 7", dir.path().to_str().unwrap()))
            .await;

        let status = poll_until_terminal(&executor, &id).await;
        assert_eq!(status.state, CommandState::Completed);
        assert_eq!(status.exit_code, Some(7));
    }

    #[tokio::test]
    async fn timeout_escalates_to_timeout_state() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(NotifyBus::new());
        let mut req = request("sleep 5", dir.path().to_str().unwrap());
        req.timeout_seconds = Some(1);
        let id = executor.submit(req).await;

        let status = poll_until_terminal(&executor, &id).await;
        assert_eq!(status.state, CommandState::Timeout);
        assert!(status.exit_code.is_some_and(|code| code != 0));
    }

    #[tokio::test]
    async fn missing_working_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        let executor = CommandExecutor::new(NotifyBus::new());
        let id = executor
            .submit(request("echo ok", nested.to_str().unwrap()))
            .await;

        let status = poll_until_terminal(&executor, &id).await;
        assert_eq!(status.state, CommandState::Completed);
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn unknown_command_id_has_no_status() {
        let executor = CommandExecutor::new(NotifyBus::new());
        assert!(executor.status("does-not-exist").await.is_none());
    }

    async fn poll_until_terminal(executor: &CommandExecutor, id: &str) -> CommandStatus {
        loop {
            let status = executor.status(id).await.unwrap();
            if matches!(
                status.state,
                CommandState::Completed | CommandState::Failed | CommandState::Timeout
            ) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
