//! Rm command - delete a workspace and detach its worktrees

use clap::Args;
use workset_core::ops::{self, RemoveWorkspaceInput};

use super::{run_blocking, AppContext};

/// Delete the workspace directory
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Skip the safety check and keep going past cleanup errors
    #[arg(short, long)]
    force: bool,

    /// Allow branches whose content is already in base (squash merges)
    #[arg(long)]
    allow_content_merged: bool,

    /// Use remote-tracking refs as they are instead of fetching first
    #[arg(long)]
    no_fetch: bool,
}

impl RmArgs {
    /// Execute the rm command
    pub async fn execute(&self, app: &AppContext) -> anyhow::Result<()> {
        let root = app.workspace_root()?;
        let defaults = app.config.defaults.clone();
        let git = app.git.clone();
        let fetch_timeout = Some(app.config.git.fetch_timeout);
        let force = self.force;
        let allow_content_merged = self.allow_content_merged;
        let fetch_remotes = !self.no_fetch;
        let target = root.clone();

        let removed = run_blocking(move |ctx| {
            ops::remove_workspace(
                ctx,
                &RemoveWorkspaceInput {
                    workspace_root: &target,
                    defaults: &defaults,
                    git: git.as_ref(),
                    force,
                    allow_content_merged,
                    fetch_remotes,
                    fetch_timeout,
                },
            )
        })
        .await;

        let removed = match removed {
            Ok(removed) => removed,
            Err(e) => {
                if let Some(workset_core::Error::Unsafe { details, .. }) = e.downcast_ref() {
                    eprintln!("Refusing to delete {}:", root.display());
                    for line in details {
                        eprintln!("  {line}");
                    }
                    eprintln!("Use --force to delete anyway.");
                }
                return Err(e);
            }
        };

        println!("Deleted workspace {}", root.display());
        if app.verbose {
            for path in &removed.detached_worktrees {
                println!("  Detached worktree: {}", path.display());
            }
        }
        Ok(())
    }
}
