#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `sync_http_client` ties together the CAS view ([`fingerprint`]), the
//! on-disk metadata cache ([`cache`]), the delta planner ([`delta`]), and an
//! HTTP transport into the two operations the CLI calls directly:
//! [`SyncClient::sync_all`] and [`SyncClient::clean`].
//!
//! # Design
//!
//! [`SyncClient::connect`] queries the server's root endpoint once to learn
//! its advertised capabilities and picks an initial transport mode from
//! them. From then on [`SyncClient::sync_all`] always prefers block-delta
//! transport; if the server ever answers a delta request with 404
//! (`Unsupported`), the client permanently downgrades to whole-file
//! transport for the rest of the session and logs the downgrade exactly
//! once, per the degradation contract this crate implements.
//!
//! # Invariants
//!
//! - After a successful [`SyncClient::sync_all`], every synced path's local
//!   and remote cache views share the same `whole_digest`.
//! - [`SyncClient::clean`] never makes a network call; it only discards the
//!   local cache.
//!
//! # Errors
//!
//! See [`Error`]. Per-file failures within a batch do not abort the batch;
//! they are reported in the returned [`SyncReport`].
//!
//! # See also
//!
//! - [`fileservice`] for the server-side counterpart of these operations.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use cache::MetadataCache;
use delta::codec::{self, DeltaPayload};
use delta::DeltaPlan;
use fingerprint::FileFingerprint;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors produced by client sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP transport itself failed (connection refused, timeout, TLS).
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// Failure loading or flushing the local metadata cache.
    #[error(transparent)]
    Cache(#[from] cache::Error),
    /// Failure reading a local file while building a plan.
    #[error(transparent)]
    Delta(#[from] delta::Error),
    /// Failure fingerprinting a local file.
    #[error(transparent)]
    Fingerprint(#[from] fingerprint::Error),
    /// Underlying I/O failure walking the workspace.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being read.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The server answered with an unexpected non-success status.
    #[error("server returned HTTP {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },
}

/// The server's advertised capabilities, from `GET /`.
#[derive(Debug, Clone, Deserialize)]
pub struct RootInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
    /// Whether block-delta sync endpoints are present.
    pub delta_sync_supported: bool,
    /// Whether patch-sync endpoints are present.
    pub git_sync_supported: bool,
}

#[derive(Debug, Clone, Serialize)]
struct BatchRequestItem {
    path: String,
    payload: DeltaPayload,
}

#[derive(Debug, Serialize)]
struct BatchRequest {
    items: Vec<BatchRequestItem>,
}

#[derive(Debug, Deserialize)]
struct BatchResponseItem {
    path: String,
    fingerprint: Option<FileFingerprint>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    items: Vec<BatchResponseItem>,
}

/// Outcome of one [`SyncClient::sync_all`] call.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Paths that synced successfully.
    pub synced: Vec<String>,
    /// Paths that failed, paired with a human-readable reason.
    pub failed: Vec<(String, String)>,
}

/// Ties the CAS view, cache, and planner into HTTP calls against one server.
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    workspace_root: PathBuf,
    cache: Mutex<MetadataCache>,
    delta_supported: Mutex<bool>,
}

impl SyncClient {
    /// Connects to `base_url`, loading the local cache from `cache_file` and
    /// querying the server's advertised capabilities.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Http`] if the root endpoint cannot be reached, or
    /// [`Error::Cache`] if the cache file exists but cannot be parsed.
    pub async fn connect(
        base_url: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
        cache_file: impl Into<PathBuf>,
    ) -> Result<Self, Error> {
        let base_url = base_url.into();
        let http = reqwest::Client::new();
        let cache = MetadataCache::load(cache_file)?;

        let root: RootInfo = http
            .get(&base_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !root.delta_sync_supported {
            tracing::warn!(server = %root.name, "server does not advertise delta sync; starting in full-transfer mode");
        }

        Ok(Self {
            http,
            base_url,
            workspace_root: workspace_root.into(),
            cache: Mutex::new(cache),
            delta_supported: Mutex::new(root.delta_sync_supported),
        })
    }

    /// Syncs every file under `paths` (or the whole workspace root if
    /// `paths` is empty) to the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] only for transport-level failures; individual
    /// file failures are reported inside the returned [`SyncReport`].
    pub async fn sync_all(&self, paths: &[PathBuf]) -> Result<SyncReport, Error> {
        let roots: Vec<PathBuf> = if paths.is_empty() {
            vec![self.workspace_root.clone()]
        } else {
            paths.to_vec()
        };

        let mut files = Vec::new();
        for root in roots {
            walk(&root, &mut files)?;
        }

        let mut payloads = Vec::with_capacity(files.len());
        {
            let mut cache = self.cache.lock().await;
            let use_delta = *self.delta_supported.lock().await;

            for file in &files {
                let rel = relative_to(&self.workspace_root, file);
                let local = cache.refresh_local(&file.to_string_lossy())?.clone();
                let remote = cache.get_remote(&rel).cloned();

                let mut kind = delta::classify(&local, remote.as_ref());
                if !use_delta {
                    kind = match kind {
                        delta::PlanKind::None => delta::PlanKind::None,
                        _ => delta::PlanKind::Full,
                    };
                }

                let plan = DeltaPlan::build(kind, file, &local)?;
                payloads.push(BatchRequestItem {
                    path: rel,
                    payload: codec::encode(&plan),
                });
            }
        }

        if payloads.is_empty() {
            return Ok(SyncReport::default());
        }

        let response = self.post_batch(payloads).await?;

        let mut report = SyncReport::default();
        let mut cache = self.cache.lock().await;
        for item in response.items {
            match item.fingerprint {
                Some(fingerprint) => {
                    cache.update_remote(fingerprint);
                    report.synced.push(item.path);
                }
                None => {
                    report.failed.push((item.path, item.error.unwrap_or_else(|| "unknown error".to_owned())));
                }
            }
        }
        cache.flush()?;

        Ok(report)
    }

    /// Posts one batch, degrading to full-transfer mode and retrying once if
    /// the server answers the delta endpoint with 404 (`Unsupported`).
    async fn post_batch(&self, items: Vec<BatchRequestItem>) -> Result<BatchResponse, Error> {
        let use_delta = *self.delta_supported.lock().await;
        let response = self.post_batch_once(&items, use_delta).await?;

        if use_delta && response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::warn!(
                "server does not support the delta sync endpoint; downgrading to full transfer for the rest of this session"
            );
            *self.delta_supported.lock().await = false;
            let retried = self.post_batch_once(&items, false).await?;
            return Self::into_batch_response(retried).await;
        }

        Self::into_batch_response(response).await
    }

    async fn post_batch_once(&self, items: &[BatchRequestItem], use_delta: bool) -> Result<reqwest::Response, Error> {
        let endpoint = if use_delta {
            "/api/v1/files/delta_sync"
        } else {
            "/api/v1/files/sync"
        };
        Ok(self
            .http
            .post(format!("{}{endpoint}", self.base_url))
            .json(&BatchRequest { items: items.to_vec() })
            .send()
            .await?)
    }

    async fn into_batch_response(response: reqwest::Response) -> Result<BatchResponse, Error> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Server { status, message });
        }
        Ok(response.json().await?)
    }

    /// Clears the local metadata cache. Does not contact the server.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Cache`] if flushing the now-empty cache fails.
    pub async fn clean(&self) -> Result<(), Error> {
        let mut cache = self.cache.lock().await;
        cache.clear();
        cache.flush()?;
        Ok(())
    }
}

fn relative_to(root: &Path, file: &Path) -> String {
    file.strip_prefix(root)
        .unwrap_or(file)
        .to_string_lossy()
        .replace('\\', "/")
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
    if dir.is_file() {
        out.push(dir.to_path_buf());
        return Ok(());
    }

    let entries = std::fs::read_dir(dir).map_err(|source| Error::Io {
        path: dir.to_string_lossy().into_owned(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| Error::Io {
            path: dir.to_string_lossy().into_owned(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().is_some_and(|n| n == ".git") {
                continue;
            }
            walk(&path, out)?;
        } else {
            out.push(path);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_to_strips_workspace_root_and_normalises_separators() {
        let root = Path::new("/ws");
        let file = Path::new("/ws/sub/a.txt");
        assert_eq!(relative_to(root, file), "sub/a.txt");
    }

    #[test]
    fn walk_finds_nested_files_and_skips_git_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"2").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/index"), b"ignored").unwrap();

        let mut files = Vec::new();
        walk(dir.path(), &mut files).unwrap();

        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.ends_with("a.txt")));
        assert!(files.iter().any(|f| f.ends_with("sub/b.txt")));
    }

    #[test]
    fn batch_request_item_serialises_path_alongside_payload() {
        let plan = DeltaPlan::None {
            size: 0,
            whole_digest: "d41d8cd98f00b204e9800998ecf8427e".to_owned(),
        };
        let item = BatchRequestItem {
            path: "a.txt".to_owned(),
            payload: codec::encode(&plan),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["path"], "a.txt");
        assert_eq!(json["payload"]["delta_type"], "none");
    }
}
