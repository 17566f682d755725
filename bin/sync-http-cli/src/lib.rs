#![deny(unsafe_code)]

//! # Overview
//!
//! `sync_http_cli` is the command-line front-end for the sync-http protocol:
//! directory listing, single-file get/put, whole-workspace block-delta sync,
//! remote command execution, and the patch-sync verbs (`git-init`,
//! `git-status`, `git-sync`, `git-resolve`).
//!
//! # Design
//!
//! [`run`] parses arguments with `clap` and dispatches to one of the verb
//! handlers below; each either drives [`sync_http_client::SyncClient`] for
//! bulk transfer, a local [`patchsync::PatchSyncEngine`] for the client side
//! of patch-sync, or a direct `reqwest` call for the simpler single-file and
//! command-execution verbs. Diagnostics go to the caller's `stderr` writer;
//! `run` never calls `std::process::exit` itself so it stays testable.
//!
//! # Errors
//!
//! Every verb reports failure as a non-zero status from [`run`]; the server's
//! `{error, message}` body is rendered verbatim when present.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand, ValueEnum};
use notify_bus::NotifyBus;
use patchsync::{ConflictEntry, PatchSyncEngine, Resolution, ResolutionChoice, SyncStatus};
use serde::{Deserialize, Serialize};
use sync_http_client::SyncClient;

const MAX_EXIT_CODE: i32 = u8::MAX as i32;
const DEFAULT_CACHE_FILE: &str = ".sync_http_cache.json";

#[derive(Parser)]
#[command(name = "sync-http-cli", version, about = "Client for the sync-http remote workspace protocol")]
struct Cli {
    /// Base URL of the sync-http server.
    #[arg(long, env = "SYNC_HTTP_SERVER_URL", default_value = "http://127.0.0.1:7878")]
    server: String,
    /// Local workspace root this client synchronises.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List a remote directory.
    List {
        /// Directory path, relative to the remote workspace root.
        path: String,
    },
    /// Fetch a remote file's content.
    Get {
        /// File path, relative to the remote workspace root.
        path: String,
        /// Write content here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write a local file's content to the server, as a whole-file transfer.
    Put {
        /// Destination path, relative to the remote workspace root.
        path: String,
        /// Local file to read.
        file: PathBuf,
    },
    /// Sync the workspace (or given paths) to the server via block-delta transport.
    Sync {
        /// Specific paths to sync; the whole workspace root if empty.
        paths: Vec<PathBuf>,
    },
    /// Discard the local metadata cache without contacting the server.
    Clean,
    /// Run a shell command on the remote host and wait for it to finish.
    Exec {
        /// Shell command line.
        command: String,
        /// Working directory on the remote host.
        #[arg(long)]
        dir: Option<String>,
        /// Seconds before the remote escalates to termination.
        #[arg(long)]
        timeout: Option<u64>,
        /// Extra `KEY=VALUE` environment variables; may be repeated.
        #[arg(long = "env", value_parser = parse_env_kv)]
        env: Vec<(String, String)>,
    },
    /// Initialise (or re-initialise) both the local and remote version-controlled workspaces.
    GitInit {
        /// Discard any existing repository first.
        #[arg(long)]
        force: bool,
    },
    /// Report the remote's patch-sync status.
    GitStatus,
    /// Build a patch bundle from local changes and apply it on the remote.
    GitSync,
    /// Resolve one outstanding conflict.
    GitResolve {
        /// Conflicting path.
        path: String,
        /// Which content to keep.
        #[arg(long, value_enum)]
        choice: ResolveChoiceArg,
        /// Local file holding merged content; required when `--choice merged`.
        #[arg(long)]
        merged_file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResolveChoiceArg {
    Local,
    Remote,
    Merged,
}

impl From<ResolveChoiceArg> for ResolutionChoice {
    fn from(value: ResolveChoiceArg) -> Self {
        match value {
            ResolveChoiceArg::Local => ResolutionChoice::Local,
            ResolveChoiceArg::Remote => ResolutionChoice::Remote,
            ResolveChoiceArg::Merged => ResolutionChoice::Merged,
        }
    }
}

fn parse_env_kv(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

/// Parses `arguments` and runs the requested verb, writing human-readable
/// output to `stdout` and diagnostics to `stderr`.
///
/// Returns the process exit status: `0` on success, non-zero on any failure.
pub async fn run<I, S, Out, Err>(arguments: I, stdout: &mut Out, stderr: &mut Err) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
    Out: Write,
    Err: Write,
{
    let cli = match Cli::try_parse_from(arguments) {
        Ok(cli) => cli,
        Err(clap_err) => {
            return if clap_err.use_stderr() {
                let _ = write!(stderr, "{clap_err}");
                2
            } else {
                let _ = write!(stdout, "{clap_err}");
                0
            };
        }
    };

    match dispatch(&cli, stdout).await {
        Ok(()) => 0,
        Err(message) => {
            let _ = writeln!(stderr, "error: {message}");
            1
        }
    }
}

/// Clamps `status` into a valid process exit code.
#[must_use]
pub fn exit_code_from(status: i32) -> std::process::ExitCode {
    let clamped = status.clamp(0, MAX_EXIT_CODE);
    std::process::ExitCode::from(clamped as u8)
}

async fn dispatch<Out: Write>(cli: &Cli, stdout: &mut Out) -> Result<(), String> {
    match &cli.command {
        Command::List { path } => list(cli, path, stdout).await,
        Command::Get { path, out } => get(cli, path, out.as_deref(), stdout).await,
        Command::Put { path, file } => put(cli, path, file).await,
        Command::Sync { paths } => sync(cli, paths, stdout).await,
        Command::Clean => clean(cli, stdout).await,
        Command::Exec { command, dir, timeout, env } => exec(cli, command, dir.as_deref(), *timeout, env, stdout).await,
        Command::GitInit { force } => git_init(cli, *force, stdout).await,
        Command::GitStatus => git_status(cli, stdout).await,
        Command::GitSync => git_sync(cli, stdout).await,
        Command::GitResolve { path, choice, merged_file } => git_resolve(cli, path, (*choice).into(), merged_file.as_deref(), stdout).await,
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn server_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    format!("server returned HTTP {status}: {body}")
}

#[derive(Deserialize)]
struct DirEntryDto {
    name: String,
    kind: String,
    size: Option<u64>,
}

async fn list<Out: Write>(cli: &Cli, path: &str, stdout: &mut Out) -> Result<(), String> {
    let response = http_client()
        .get(format!("{}/api/v1/files", cli.server))
        .query(&[("path", path)])
        .send()
        .await
        .map_err(|source| source.to_string())?;

    if !response.status().is_success() {
        return Err(server_error(response).await);
    }

    let entries: Vec<DirEntryDto> = response.json().await.map_err(|source| source.to_string())?;
    for entry in entries {
        match entry.size {
            Some(size) => { let _ = writeln!(stdout, "{}\t{}\t{size}", entry.kind, entry.name); }
            None => { let _ = writeln!(stdout, "{}\t{}", entry.kind, entry.name); }
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct ReadContentDto {
    content: String,
}

async fn get<Out: Write>(cli: &Cli, path: &str, out: Option<&std::path::Path>, stdout: &mut Out) -> Result<(), String> {
    let response = http_client()
        .get(format!("{}/api/v1/files/content", cli.server))
        .query(&[("path", path)])
        .send()
        .await
        .map_err(|source| source.to_string())?;

    if !response.status().is_success() {
        return Err(server_error(response).await);
    }

    let body: ReadContentDto = response.json().await.map_err(|source| source.to_string())?;
    let bytes = BASE64.decode(&body.content).map_err(|source| source.to_string())?;

    match out {
        Some(dest) => std::fs::write(dest, bytes).map_err(|source| source.to_string()),
        None => stdout.write_all(&bytes).map_err(|source| source.to_string()),
    }
}

#[derive(Serialize)]
struct WriteContentRequest {
    path: String,
    content: String,
}

async fn put(cli: &Cli, path: &str, file: &std::path::Path) -> Result<(), String> {
    let bytes = std::fs::read(file).map_err(|source| source.to_string())?;
    let response = http_client()
        .put(format!("{}/api/v1/files/content", cli.server))
        .json(&WriteContentRequest {
            path: path.to_owned(),
            content: BASE64.encode(bytes),
        })
        .send()
        .await
        .map_err(|source| source.to_string())?;

    if !response.status().is_success() {
        return Err(server_error(response).await);
    }
    Ok(())
}

async fn sync<Out: Write>(cli: &Cli, paths: &[PathBuf], stdout: &mut Out) -> Result<(), String> {
    let client = connect(cli).await?;
    let report = client.sync_all(paths).await.map_err(|source| source.to_string())?;

    for path in &report.synced {
        let _ = writeln!(stdout, "synced\t{path}");
    }
    for (path, reason) in &report.failed {
        let _ = writeln!(stdout, "failed\t{path}\t{reason}");
    }
    if !report.failed.is_empty() {
        return Err(format!("{} file(s) failed to sync", report.failed.len()));
    }
    Ok(())
}

async fn clean<Out: Write>(cli: &Cli, stdout: &mut Out) -> Result<(), String> {
    let client = connect(cli).await?;
    client.clean().await.map_err(|source| source.to_string())?;
    let _ = writeln!(stdout, "local cache cleared");
    Ok(())
}

async fn connect(cli: &Cli) -> Result<SyncClient, String> {
    let cache_file = cli.workspace.join(DEFAULT_CACHE_FILE);
    SyncClient::connect(cli.server.clone(), cli.workspace.clone(), cache_file)
        .await
        .map_err(|source| source.to_string())
}

async fn exec<Out: Write>(
    cli: &Cli,
    command: &str,
    dir: Option<&str>,
    timeout: Option<u64>,
    env: &[(String, String)],
    stdout: &mut Out,
) -> Result<(), String> {
    let response = http_client()
        .post(format!("{}/api/v1/commands", cli.server))
        .json(&exec::CommandRequest {
            command: command.to_owned(),
            working_directory: dir.unwrap_or(".").to_owned(),
            environment: env.iter().cloned().collect(),
            timeout_seconds: timeout,
        })
        .send()
        .await
        .map_err(|source| source.to_string())?;

    if !response.status().is_success() {
        return Err(server_error(response).await);
    }

    #[derive(Deserialize)]
    struct SubmitResponse {
        command_id: String,
    }
    let submitted: SubmitResponse = response.json().await.map_err(|source| source.to_string())?;

    loop {
        let status: exec::CommandStatus = http_client()
            .get(format!("{}/api/v1/commands/{}", cli.server, submitted.command_id))
            .send()
            .await
            .map_err(|source| source.to_string())?
            .json()
            .await
            .map_err(|source| source.to_string())?;

        if matches!(status.state, exec::CommandState::Completed | exec::CommandState::Failed | exec::CommandState::Timeout) {
            let _ = write!(stdout, "{}", status.output);
            return match status.state {
                exec::CommandState::Completed if status.exit_code.unwrap_or(0) == 0 => Ok(()),
                other => Err(format!("command ended in state {other:?} (exit code {:?})", status.exit_code)),
            };
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

fn local_engine(cli: &Cli) -> PatchSyncEngine {
    PatchSyncEngine::new(cli.workspace.clone(), NotifyBus::new())
}

async fn git_init<Out: Write>(cli: &Cli, force: bool, stdout: &mut Out) -> Result<(), String> {
    local_engine(cli).init(force).await.map_err(|source| source.to_string())?;

    #[derive(Serialize)]
    struct InitRequest {
        force: bool,
    }
    let response = http_client()
        .post(format!("{}/api/v1/sync/init", cli.server))
        .json(&InitRequest { force })
        .send()
        .await
        .map_err(|source| source.to_string())?;
    if !response.status().is_success() {
        return Err(server_error(response).await);
    }

    let _ = writeln!(stdout, "initialised local and remote version-controlled workspaces");
    Ok(())
}

async fn git_status<Out: Write>(cli: &Cli, stdout: &mut Out) -> Result<(), String> {
    let response = http_client()
        .get(format!("{}/api/v1/sync/status", cli.server))
        .send()
        .await
        .map_err(|source| source.to_string())?;
    if !response.status().is_success() {
        return Err(server_error(response).await);
    }
    let status: SyncStatus = response.json().await.map_err(|source| source.to_string())?;
    let _ = writeln!(
        stdout,
        "last_sync_commit={:?} has_pending_changes={} changed_paths={} untracked_paths={}",
        status.last_sync_commit,
        status.has_pending_changes,
        status.changed_paths.len(),
        status.untracked_paths.len(),
    );
    Ok(())
}

async fn git_sync<Out: Write>(cli: &Cli, stdout: &mut Out) -> Result<(), String> {
    let engine = local_engine(cli);
    let Some(bundle) = engine.build_bundle().await.map_err(|source| source.to_string())? else {
        let _ = writeln!(stdout, "nothing to sync");
        return Ok(());
    };

    let response = http_client()
        .post(format!("{}/api/v1/sync/patch", cli.server))
        .json(&bundle)
        .send()
        .await
        .map_err(|source| source.to_string())?;

    let status = response.status();
    if status == reqwest::StatusCode::CONFLICT {
        let conflicts: ConflictEntryList = response.json().await.map_err(|source| source.to_string())?;
        for entry in conflicts.conflicts() {
            let _ = writeln!(stdout, "conflict\t{}", entry.path);
        }
        return Err("remote reported conflicts; resolve them with git-resolve".to_owned());
    }
    if !status.is_success() {
        return Err(server_error(response).await);
    }

    let _ = writeln!(stdout, "patch applied");
    Ok(())
}

#[derive(Deserialize)]
struct ConflictEntryList {
    outcome: String,
    data: Option<Vec<ConflictEntry>>,
}

impl ConflictEntryList {
    fn conflicts(&self) -> Vec<&ConflictEntry> {
        if self.outcome == "conflicts" {
            self.data.iter().flatten().collect()
        } else {
            Vec::new()
        }
    }
}

async fn git_resolve<Out: Write>(
    cli: &Cli,
    path: &str,
    choice: ResolutionChoice,
    merged_file: Option<&std::path::Path>,
    stdout: &mut Out,
) -> Result<(), String> {
    let merged_bytes = match merged_file {
        Some(file) => Some(std::fs::read(file).map_err(|source| source.to_string())?),
        None => None,
    };

    #[derive(Serialize)]
    struct ResolveRequest {
        resolutions: Vec<Resolution>,
    }
    let response = http_client()
        .post(format!("{}/api/v1/sync/resolve", cli.server))
        .json(&ResolveRequest {
            resolutions: vec![Resolution {
                path: path.to_owned(),
                choice,
                merged_bytes,
            }],
        })
        .send()
        .await
        .map_err(|source| source.to_string())?;

    let status = response.status();
    if !status.is_success() && status != reqwest::StatusCode::CONFLICT {
        return Err(server_error(response).await);
    }

    let _ = writeln!(stdout, "resolution submitted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_kv_splits_on_first_equals() {
        assert_eq!(parse_env_kv("FOO=bar=baz").unwrap(), ("FOO".to_owned(), "bar=baz".to_owned()));
    }

    #[test]
    fn parse_env_kv_rejects_missing_equals() {
        assert!(parse_env_kv("FOO").is_err());
    }

    #[test]
    fn exit_code_from_clamps_to_u8_range() {
        assert_eq!(exit_code_from(300), std::process::ExitCode::from(255));
        assert_eq!(exit_code_from(-1), std::process::ExitCode::from(0));
        assert_eq!(exit_code_from(1), std::process::ExitCode::from(1));
    }

    #[test]
    fn conflict_entry_list_reports_conflicts() {
        let list: ConflictEntryList = serde_json::from_str(
            r#"{"outcome":"conflicts","data":[{"path":"a.txt","remote_current_bytes":[1,2,3]}]}"#,
        )
        .unwrap();
        assert_eq!(list.conflicts().len(), 1);
        assert_eq!(list.conflicts()[0].path, "a.txt");
    }

    #[test]
    fn cli_parses_exec_with_repeated_env_flags() {
        let cli = Cli::try_parse_from([
            "sync-http-cli",
            "exec",
            "echo hi",
            "--env",
            "A=1",
            "--env",
            "B=2",
        ])
        .unwrap();
        match cli.command {
            Command::Exec { env, .. } => {
                assert_eq!(env, vec![("A".to_owned(), "1".to_owned()), ("B".to_owned(), "2".to_owned())]);
            }
            other => panic!("expected Exec, got {other:?}"),
        }
    }
}
