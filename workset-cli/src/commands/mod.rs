//! CLI command implementations

pub mod init;
pub mod merged;
pub mod repo;
pub mod rm;
pub mod safety;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use workset_core::{CallContext, Config, GitPort, Workspace};

pub use init::InitArgs;
pub use merged::MergedArgs;
pub use repo::RepoArgs;
pub use rm::RmArgs;
pub use safety::SafetyArgs;
pub use status::StatusArgs;

/// Shared state handed to every command
pub struct AppContext {
    pub config: Config,
    pub git: Arc<dyn GitPort>,
    pub verbose: bool,
}

impl AppContext {
    /// Workspace root from `--workspace`, `WORKSET_ROOT` or the config file,
    /// else the nearest ancestor of the current directory holding a workspace
    pub fn workspace_root(&self) -> anyhow::Result<PathBuf> {
        if let Some(root) = &self.config.defaults.workspace_root {
            return Ok(root.clone());
        }
        let cwd = std::env::current_dir()?;
        Ok(Workspace::find_root(&cwd)?)
    }
}

/// Run blocking git work off the async runtime, cancelling it on Ctrl-C
///
/// Cancellation is cooperative: the work observes the context at its next
/// check and git subprocesses are killed.
pub async fn run_blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CallContext) -> workset_core::Result<T> + Send + 'static,
{
    let ctx = CallContext::new();
    let worker_ctx = ctx.clone();
    let mut task = tokio::task::spawn_blocking(move || f(&worker_ctx));

    tokio::select! {
        joined = &mut task => Ok(joined??),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling");
            ctx.cancel();
            Ok(task.await??)
        }
    }
}
