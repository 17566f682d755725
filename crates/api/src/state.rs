use std::sync::Arc;

use exec::CommandExecutor;
use fileservice::FileService;
use notify_bus::NotifyBus;
use patchsync::PatchSyncEngine;

/// Shared state handed to every handler via [`axum::extract::State`].
#[derive(Clone)]
pub struct AppState {
    pub(crate) files: Arc<FileService>,
    pub(crate) patch_sync: Arc<PatchSyncEngine>,
    pub(crate) commands: CommandExecutor,
    pub(crate) bus: NotifyBus,
    /// Applied to a submission that omits `timeout_seconds`.
    pub(crate) default_command_timeout_seconds: u64,
}

impl AppState {
    /// Builds application state rooted at `workspace`, loading (or creating)
    /// the server-side fingerprint cache at `cache_file`.
    ///
    /// # Errors
    ///
    /// Returns [`fileservice::Error`] if `cache_file` exists but cannot be
    /// parsed.
    pub fn new(
        workspace: impl Into<std::path::PathBuf>,
        cache_file: impl Into<std::path::PathBuf>,
        default_command_timeout_seconds: u64,
    ) -> Result<Self, fileservice::Error> {
        let workspace = workspace.into();
        let bus = NotifyBus::new();
        let files = FileService::new(workspace.clone(), bus.clone(), cache_file)?;
        let patch_sync = PatchSyncEngine::new(workspace, bus.clone());
        let commands = CommandExecutor::new(bus.clone());

        Ok(Self {
            files: Arc::new(files),
            patch_sync: Arc::new(patch_sync),
            commands,
            bus,
            default_command_timeout_seconds,
        })
    }
}
