#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `patchsync` is the git-backed alternative to block-delta sync: both ends
//! keep a version-controlled working tree, and synchronisation moves a
//! [`PatchBundle`] — a unified diff plus any file content the diff cannot
//! represent — relative to a shared *sync point* commit.
//!
//! # Design
//!
//! Every operation that touches the repository shells out to the `git`
//! binary as a subprocess with an explicit argv (never shell string
//! interpolation, never a git library): this keeps the engine's correctness
//! independent of git's internal APIs and matches the black-box boundary the
//! rest of this system draws around version control. A sync point is any
//! commit whose message carries [`SYNC_MARKER`]; [`PatchSyncEngine::init`]
//! creates the first one, and every successful bundle application or
//! conflict resolution creates the next.
//!
//! # Invariants
//!
//! - Applying `patch_text` and then overlaying every `binary_files` entry
//!   onto the tree at `base_commit` reproduces the sender's working tree
//!   exactly. Because `git diff` never mentions untracked files, every
//!   untracked file's bytes are captured in `binary_files` regardless of
//!   whether the content is text or binary — diverging here from a narrower
//!   upstream implementation that only captured untracked files it detected
//!   as binary, which left new text files unsynced (see `DESIGN.md`).
//! - [`PatchSyncEngine::apply_bundle`] never mutates the tree when the patch
//!   cannot apply cleanly; it returns [`ApplyOutcome::Conflicts`] instead.
//! - Applying a bundle twice against the same `base_commit` either no-ops
//!   (tree already matches) or surfaces conflicts; it never silently
//!   double-applies.
//!
//! # Errors
//!
//! [`Error::DirtyTree`] and [`Error::UnknownBase`] are the two expected
//! rejection paths from [`PatchSyncEngine::apply_bundle`]; [`Error::GitFailed`]
//! covers any other non-zero exit from the `git` binary.
//!
//! # See also
//!
//! - [`fileservice`] for the block-delta mode this one coexists with.
//! - [`notify_bus`] for the `file_changed` events bundle application emits.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify_bus::{Message, NotifyBus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

/// Commit-message marker identifying a sync-point commit.
pub const SYNC_MARKER: &str = "SYNC-HTTP-POINT";

const DEFAULT_IGNORE: &str = "\
.sync_http_cache.json
.git/
.DS_Store
*.swp
*.swo
__pycache__/
.idea/
.vscode/
";

/// Errors produced by patch-sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure reading or writing a file.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// Could not spawn the `git` binary at all.
    #[error("failed to spawn git: {0}")]
    Spawn(#[source] io::Error),
    /// A `git` invocation exited non-zero unexpectedly.
    #[error("git {args:?} failed: {stderr}")]
    GitFailed {
        /// Arguments passed to `git`.
        args: Vec<String>,
        /// Captured stderr.
        stderr: String,
    },
    /// A bundle was applied against a tree with uncommitted changes.
    #[error("working tree has uncommitted changes")]
    DirtyTree,
    /// A bundle's `base_commit` does not exist in this repository.
    #[error("base commit {0} is not reachable")]
    UnknownBase(String),
}

/// Content of one file the textual diff in a [`PatchBundle`] cannot
/// represent (new, untracked content).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryFile {
    /// Path relative to the repository root.
    pub path: String,
    /// Raw file content.
    pub bytes: Vec<u8>,
}

/// The unit of transport for patch-sync mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchBundle {
    /// Sync-point commit both ends agree on.
    pub base_commit: String,
    /// Unified diff of tracked-file changes relative to `base_commit`.
    pub patch_text: String,
    /// Content of untracked files, captured verbatim.
    pub binary_files: Vec<BinaryFile>,
    /// Informational list of new paths included in the bundle.
    pub untracked_paths: Vec<String>,
}

/// Outcome of [`PatchSyncEngine::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Last known sync-point commit, if the repository has been initialised.
    pub last_sync_commit: Option<String>,
    /// Timestamp of that commit.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Whether the working tree has uncommitted changes.
    pub has_pending_changes: bool,
    /// Paths modified since the last sync point.
    pub changed_paths: Vec<String>,
    /// Untracked paths present in the working tree.
    pub untracked_paths: Vec<String>,
}

/// A file the server could not cleanly apply a patch to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictEntry {
    /// Path relative to the repository root.
    pub path: String,
    /// The server's own current content for this path, so a client can
    /// choose to keep it.
    pub remote_current_bytes: Vec<u8>,
}

/// How the caller wants a [`ConflictEntry`] resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    /// Keep the local (current server) content.
    Local,
    /// Take the remote (sender's) content the conflict entry saved.
    Remote,
    /// Use caller-supplied merged content.
    Merged,
}

/// One resolution submitted to [`PatchSyncEngine::resolve`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// Path being resolved.
    pub path: String,
    /// Which content to keep.
    pub choice: ResolutionChoice,
    /// Required when `choice == Merged`.
    pub merged_bytes: Option<Vec<u8>>,
}

/// Result of applying a bundle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The bundle applied cleanly; the tree now has a new sync point.
    Applied {
        /// The commit id of the new sync point.
        commit_id: String,
    },
    /// The bundle could not apply cleanly. The tree was not modified.
    Conflicts(
        /// Paths the server could not apply cleanly.
        Vec<ConflictEntry>,
    ),
}

/// Result of [`PatchSyncEngine::resolve`].
#[derive(Debug, Clone, Serialize)]
pub struct ResolveOutcome {
    /// Set once every conflict has been resolved and a commit made.
    pub commit_id: Option<String>,
    /// Conflicts still outstanding.
    pub remaining_conflicts: Vec<ConflictEntry>,
}

/// A version-controlled working tree and its outstanding conflict set.
///
/// The conflict set is [`DashMap`]-backed so concurrent `resolve` and
/// `status`-style reads don't serialise behind one server-wide lock.
pub struct PatchSyncEngine {
    repo_root: PathBuf,
    bus: NotifyBus,
    conflicts: DashMap<String, ConflictEntry>,
}

impl PatchSyncEngine {
    /// Opens an engine rooted at `repo_root`. Does not require a repository
    /// to already exist there; call [`PatchSyncEngine::init`] first.
    #[must_use]
    pub fn new(repo_root: impl Into<PathBuf>, bus: NotifyBus) -> Self {
        Self {
            repo_root: repo_root.into(),
            bus,
            conflicts: DashMap::new(),
        }
    }

    /// Ensures a repository exists at the engine's root, creating one with
    /// an initial sync point if absent. `force` discards any prior
    /// repository first. Used symmetrically by both the client (`init`) and
    /// the server (`init_remote`) roles described in the protocol.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::GitFailed`] or [`Error::Spawn`] from any of the
    /// underlying `git` invocations.
    pub async fn init(&self, force: bool) -> Result<(), Error> {
        let git_dir = self.repo_root.join(".git");

        if force && git_dir.exists() {
            tokio::fs::remove_dir_all(&git_dir)
                .await
                .map_err(|source| io_err(&git_dir, source))?;
        }

        tokio::fs::create_dir_all(&self.repo_root)
            .await
            .map_err(|source| io_err(&self.repo_root, source))?;

        if git_dir.exists() {
            return Ok(());
        }

        self.run_git_ok(&["init"]).await?;
        self.run_git_ok(&["config", "user.name", "sync-http"]).await?;
        self.run_git_ok(&["config", "user.email", "sync-http@localhost"]).await?;

        let ignore_path = self.repo_root.join(".gitignore");
        tokio::fs::write(&ignore_path, DEFAULT_IGNORE)
            .await
            .map_err(|source| io_err(&ignore_path, source))?;
        self.run_git_ok(&["add", ".gitignore"]).await?;
        self.run_git_ok(&["commit", "-m", "initial commit"]).await?;

        self.create_sync_point("initial sync point").await?;
        Ok(())
    }

    /// Reports the current sync status of the working tree.
    ///
    /// # Errors
    ///
    /// Propagates failures from the underlying `git` invocations.
    pub async fn status(&self) -> Result<SyncStatus, Error> {
        let last_sync_commit = self.last_sync_point().await?;

        let last_sync_time = if let Some(commit) = &last_sync_commit {
            let show = self.run_git(&["show", "-s", "--format=%cI", commit]).await?;
            let text = String::from_utf8_lossy(&show.stdout).trim().to_owned();
            DateTime::parse_from_rfc3339(&text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        } else {
            None
        };

        let porcelain = self.run_git(&["status", "--porcelain"]).await?;
        let stdout = String::from_utf8_lossy(&porcelain.stdout);

        let mut changed_paths = Vec::new();
        let mut untracked_paths = Vec::new();
        for line in stdout.lines() {
            if let Some(path) = line.strip_prefix("?? ") {
                untracked_paths.push(path.to_owned());
            } else if line.len() > 3 {
                changed_paths.push(line[3..].trim().to_owned());
            }
        }

        Ok(SyncStatus {
            last_sync_commit,
            last_sync_time,
            has_pending_changes: !stdout.trim().is_empty(),
            changed_paths,
            untracked_paths,
        })
    }

    /// Builds a [`PatchBundle`] relative to the last sync point, or `None`
    /// if the working tree has no changes to send.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownBase`] if no sync point exists yet (call
    /// [`PatchSyncEngine::init`] first).
    pub async fn build_bundle(&self) -> Result<Option<PatchBundle>, Error> {
        let base_commit = self
            .last_sync_point()
            .await?
            .ok_or_else(|| Error::UnknownBase("<none>".to_owned()))?;

        let porcelain = self.run_git(&["status", "--porcelain"]).await?;
        if porcelain.stdout.is_empty() {
            return Ok(None);
        }

        let diff = self.run_git(&["diff", "--binary", &base_commit]).await?;
        let patch_text = String::from_utf8_lossy(&diff.stdout).into_owned();

        let mut untracked_paths = Vec::new();
        let mut binary_files = Vec::new();
        for line in String::from_utf8_lossy(&porcelain.stdout).lines() {
            if let Some(path) = line.strip_prefix("?? ") {
                untracked_paths.push(path.to_owned());
                let full = self.repo_root.join(path);
                if full.is_file() {
                    let bytes = tokio::fs::read(&full).await.map_err(|source| io_err(&full, source))?;
                    binary_files.push(BinaryFile {
                        path: path.to_owned(),
                        bytes,
                    });
                }
            }
        }

        if patch_text.is_empty() && binary_files.is_empty() {
            return Ok(None);
        }

        Ok(Some(PatchBundle {
            base_commit,
            patch_text,
            binary_files,
            untracked_paths,
        }))
    }

    /// Applies `bundle` to the working tree.
    ///
    /// # Errors
    ///
    /// [`Error::DirtyTree`] if the tree has uncommitted changes;
    /// [`Error::UnknownBase`] if `bundle.base_commit` does not exist here.
    pub async fn apply_bundle(&self, bundle: &PatchBundle) -> Result<ApplyOutcome, Error> {
        let porcelain = self.run_git(&["status", "--porcelain"]).await?;
        if !porcelain.stdout.is_empty() {
            return Err(Error::DirtyTree);
        }

        let base_ref = format!("{}^{{commit}}", bundle.base_commit);
        let exists = self.run_git(&["cat-file", "-e", &base_ref]).await?;
        if !exists.status.success() {
            return Err(Error::UnknownBase(bundle.base_commit.clone()));
        }

        if bundle.patch_text.is_empty() {
            self.write_binary_files(bundle).await?;
            let commit_id = self.create_sync_point("applied remote changes").await?;
            self.emit_file_changed(bundle);
            return Ok(ApplyOutcome::Applied { commit_id });
        }

        use std::io::Write as _;
        let mut patch_file = tempfile::Builder::new()
            .suffix(".patch")
            .tempfile()
            .map_err(|source| Error::Io {
                path: "<tempfile>".to_owned(),
                source,
            })?;
        patch_file
            .write_all(bundle.patch_text.as_bytes())
            .map_err(|source| Error::Io {
                path: patch_file.path().to_string_lossy().into_owned(),
                source,
            })?;
        let patch_path = patch_file.path().to_string_lossy().into_owned();

        let check = self.run_git(&["apply", "--check", &patch_path]).await?;
        if !check.status.success() {
            let stderr = String::from_utf8_lossy(&check.stderr).into_owned();
            let conflicts = self.record_conflicts(&stderr).await?;
            return Ok(ApplyOutcome::Conflicts(conflicts));
        }

        let apply = self.run_git(&["apply", &patch_path]).await?;
        if !apply.status.success() {
            return Err(Error::GitFailed {
                args: vec!["apply".to_owned(), patch_path],
                stderr: String::from_utf8_lossy(&apply.stderr).into_owned(),
            });
        }

        self.write_binary_files(bundle).await?;
        let commit_id = self.create_sync_point("applied remote changes").await?;
        self.emit_file_changed(bundle);

        Ok(ApplyOutcome::Applied { commit_id })
    }

    /// Resolves outstanding conflicts. Once every tracked conflict is
    /// resolved, commits and returns the new sync point; otherwise reports
    /// what remains.
    ///
    /// # Errors
    ///
    /// Propagates `git` invocation failures while staging resolved content.
    pub async fn resolve(&self, resolutions: Vec<Resolution>) -> Result<ResolveOutcome, Error> {
        for resolution in resolutions {
            let Some(entry) = self.conflicts.get(&resolution.path).map(|e| e.clone()) else {
                continue;
            };

            match resolution.choice {
                ResolutionChoice::Remote => {
                    let full = self.repo_root.join(&resolution.path);
                    write_file(&full, &entry.remote_current_bytes).await?;
                }
                ResolutionChoice::Local => {}
                ResolutionChoice::Merged => {
                    let full = self.repo_root.join(&resolution.path);
                    write_file(&full, &resolution.merged_bytes.unwrap_or_default()).await?;
                }
            }

            self.run_git_ok(&["add", &resolution.path]).await?;
            self.conflicts.remove(&resolution.path);
        }

        if self.conflicts.is_empty() {
            let commit_id = self.create_sync_point("resolved conflicts").await?;
            Ok(ResolveOutcome {
                commit_id: Some(commit_id),
                remaining_conflicts: Vec::new(),
            })
        } else {
            let remaining = self.conflicts.iter().map(|e| e.value().clone()).collect();
            Ok(ResolveOutcome {
                commit_id: None,
                remaining_conflicts: remaining,
            })
        }
    }

    /// Returns every outstanding conflict, unresolved since the last
    /// [`PatchSyncEngine::apply_bundle`] or [`PatchSyncEngine::resolve`] call.
    #[must_use]
    pub fn conflicts(&self) -> Vec<ConflictEntry> {
        self.conflicts.iter().map(|e| e.value().clone()).collect()
    }

    /// Discards uncommitted changes, clears outstanding conflicts, and
    /// advances the sync point.
    ///
    /// # Errors
    ///
    /// Propagates `git` invocation failures.
    pub async fn clean(&self) -> Result<(), Error> {
        self.run_git_ok(&["reset", "--hard", "HEAD"]).await?;
        self.conflicts.clear();
        self.create_sync_point("clean sync point").await?;
        Ok(())
    }

    async fn write_binary_files(&self, bundle: &PatchBundle) -> Result<(), Error> {
        for file in &bundle.binary_files {
            let full = self.repo_root.join(&file.path);
            write_file(&full, &file.bytes).await?;
        }
        Ok(())
    }

    fn emit_file_changed(&self, bundle: &PatchBundle) {
        for file in &bundle.binary_files {
            self.bus.publish(Message::FileChanged {
                path: file.path.clone(),
                action: "patch".to_owned(),
            });
        }
    }

    async fn record_conflicts(&self, check_stderr: &str) -> Result<Vec<ConflictEntry>, Error> {
        let mut entries = Vec::new();
        for path in parse_conflict_paths(check_stderr) {
            let full = self.repo_root.join(&path);
            let bytes = tokio::fs::read(&full).await.unwrap_or_default();
            let entry = ConflictEntry {
                path: path.clone(),
                remote_current_bytes: bytes,
            };
            self.conflicts.insert(path, entry.clone());
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn create_sync_point(&self, message: &str) -> Result<String, Error> {
        self.run_git_ok(&["add", "-A"]).await?;

        let full_message = format!("{message} [{SYNC_MARKER}]");
        let commit = self.run_git(&["commit", "-m", &full_message]).await?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&commit.stdout),
            String::from_utf8_lossy(&commit.stderr)
        );
        if !commit.status.success() && !combined.contains("nothing to commit") {
            return Err(Error::GitFailed {
                args: vec!["commit".to_owned()],
                stderr: combined,
            });
        }

        let head = self.run_git(&["rev-parse", "HEAD"]).await?;
        if !head.status.success() {
            return Err(Error::GitFailed {
                args: vec!["rev-parse".to_owned(), "HEAD".to_owned()],
                stderr: String::from_utf8_lossy(&head.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&head.stdout).trim().to_owned())
    }

    async fn last_sync_point(&self) -> Result<Option<String>, Error> {
        let log = self
            .run_git(&["log", "--grep", SYNC_MARKER, "--format=%H", "-n", "1"])
            .await?;
        let hash = String::from_utf8_lossy(&log.stdout).trim().to_owned();
        if log.status.success() && !hash.is_empty() {
            return Ok(Some(hash));
        }

        let init = self.run_git(&["rev-list", "--max-parents=0", "HEAD"]).await?;
        let hash = String::from_utf8_lossy(&init.stdout).trim().to_owned();
        if init.status.success() && !hash.is_empty() {
            return Ok(Some(hash));
        }

        Ok(None)
    }

    async fn run_git(&self, args: &[&str]) -> Result<Output, Error> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(Error::Spawn)
    }

    async fn run_git_ok(&self, args: &[&str]) -> Result<Output, Error> {
        let output = self.run_git(args).await?;
        if !output.status.success() {
            return Err(Error::GitFailed {
                args: args.iter().map(|s| (*s).to_owned()).collect(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }
}

fn parse_conflict_paths(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("error: patch failed: ")?;
            rest.split(':').next().map(str::to_owned)
        })
        .collect()
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| io_err(parent, source))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| io_err(path, source))
}

fn io_err(path: &Path, source: io::Error) -> Error {
    Error::Io {
        path: path.to_string_lossy().into_owned(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(dir: &Path) -> PatchSyncEngine {
        PatchSyncEngine::new(dir, NotifyBus::new())
    }

    #[tokio::test]
    async fn init_creates_repository_with_sync_point() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.init(false).await.unwrap();

        assert!(dir.path().join(".git").is_dir());
        let status = eng.status().await.unwrap();
        assert!(status.last_sync_commit.is_some());
        assert!(!status.has_pending_changes);
    }

    #[tokio::test]
    async fn init_is_idempotent_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.init(false).await.unwrap();
        let first = eng.status().await.unwrap().last_sync_commit;
        eng.init(false).await.unwrap();
        let second = eng.status().await.unwrap().last_sync_commit;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn build_bundle_is_none_with_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.init(false).await.unwrap();
        assert!(eng.build_bundle().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn build_bundle_captures_new_untracked_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.init(false).await.unwrap();

        tokio::fs::write(dir.path().join("new.txt"), b"hello").await.unwrap();

        let bundle = eng.build_bundle().await.unwrap().unwrap();
        assert_eq!(bundle.untracked_paths, vec!["new.txt".to_owned()]);
        assert_eq!(bundle.binary_files.len(), 1);
        assert_eq!(bundle.binary_files[0].bytes, b"hello");
    }

    #[tokio::test]
    async fn apply_bundle_round_trips_a_tracked_edit() {
        let sender_dir = tempfile::tempdir().unwrap();
        let sender = engine(sender_dir.path());
        sender.init(false).await.unwrap();
        tokio::fs::write(sender_dir.path().join("a.txt"), b"v1\n").await.unwrap();
        sender.create_sync_point("seed").await.unwrap();

        tokio::fs::write(sender_dir.path().join("a.txt"), b"v2\n").await.unwrap();
        let bundle = sender.build_bundle().await.unwrap().unwrap();

        let receiver_dir = tempfile::tempdir().unwrap();
        let receiver = engine(receiver_dir.path());
        receiver.init(false).await.unwrap();
        tokio::fs::write(receiver_dir.path().join("a.txt"), b"v1\n").await.unwrap();
        receiver.create_sync_point("seed").await.unwrap();

        let outcome = receiver.apply_bundle(&bundle).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        let content = tokio::fs::read(receiver_dir.path().join("a.txt")).await.unwrap();
        assert_eq!(content, b"v2\n");
    }

    #[tokio::test]
    async fn apply_bundle_rejects_dirty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.init(false).await.unwrap();
        tokio::fs::write(dir.path().join("dirty.txt"), b"uncommitted").await.unwrap();

        let bundle = PatchBundle {
            base_commit: "HEAD".to_owned(),
            patch_text: String::new(),
            binary_files: vec![],
            untracked_paths: vec![],
        };
        let err = eng.apply_bundle(&bundle).await.unwrap_err();
        assert!(matches!(err, Error::DirtyTree));
    }

    #[tokio::test]
    async fn apply_bundle_rejects_unknown_base() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.init(false).await.unwrap();

        let bundle = PatchBundle {
            base_commit: "0".repeat(40),
            patch_text: String::new(),
            binary_files: vec![],
            untracked_paths: vec![],
        };
        let err = eng.apply_bundle(&bundle).await.unwrap_err();
        assert!(matches!(err, Error::UnknownBase(_)));
    }

    #[tokio::test]
    async fn conflicting_patch_reports_conflicts_without_mutating_tree() {
        let sender_dir = tempfile::tempdir().unwrap();
        let sender = engine(sender_dir.path());
        sender.init(false).await.unwrap();
        tokio::fs::write(sender_dir.path().join("a.txt"), b"base\n").await.unwrap();
        let base = sender.create_sync_point("seed").await.unwrap();
        tokio::fs::write(sender_dir.path().join("a.txt"), b"sender change\n").await.unwrap();
        let bundle = sender.build_bundle().await.unwrap().unwrap();
        assert_eq!(bundle.base_commit, base);

        let receiver_dir = tempfile::tempdir().unwrap();
        let receiver = engine(receiver_dir.path());
        receiver.init(false).await.unwrap();
        tokio::fs::write(receiver_dir.path().join("a.txt"), b"base\n").await.unwrap();
        receiver.create_sync_point("seed").await.unwrap();
        tokio::fs::write(receiver_dir.path().join("a.txt"), b"receiver change\n").await.unwrap();
        receiver.create_sync_point("receiver edit").await.unwrap();

        let outcome = receiver.apply_bundle(&bundle).await.unwrap();
        match outcome {
            ApplyOutcome::Conflicts(entries) => assert_eq!(entries[0].path, "a.txt"),
            other => panic!("expected conflicts, got {other:?}"),
        }
        let content = tokio::fs::read(receiver_dir.path().join("a.txt")).await.unwrap();
        assert_eq!(content, b"receiver change\n");
    }

    #[tokio::test]
    async fn resolve_with_remote_choice_restores_saved_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.init(false).await.unwrap();

        eng.conflicts.insert(
            "a.txt".to_owned(),
            ConflictEntry {
                path: "a.txt".to_owned(),
                remote_current_bytes: b"remote content".to_vec(),
            },
        );
        tokio::fs::write(dir.path().join("a.txt"), b"local content").await.unwrap();

        let outcome = eng
            .resolve(vec![Resolution {
                path: "a.txt".to_owned(),
                choice: ResolutionChoice::Remote,
                merged_bytes: None,
            }])
            .await
            .unwrap();

        assert!(outcome.commit_id.is_some());
        assert!(outcome.remaining_conflicts.is_empty());
        let content = tokio::fs::read(dir.path().join("a.txt")).await.unwrap();
        assert_eq!(content, b"remote content");
    }

    #[tokio::test]
    async fn clean_discards_uncommitted_changes() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.init(false).await.unwrap();
        tokio::fs::write(dir.path().join(".gitignore"), b"dirty").await.unwrap();

        eng.clean().await.unwrap();
        let status = eng.status().await.unwrap();
        assert!(!status.has_pending_changes);
    }
}
