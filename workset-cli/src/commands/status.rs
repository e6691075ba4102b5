//! Status command - dirty/missing state of every repository

use clap::Args;
use workset_core::ops;

use super::{run_blocking, AppContext};

/// Show the worktree state of each repository on the current branch
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print as JSON
    #[arg(long)]
    json: bool,
}

impl StatusArgs {
    /// Execute the status command
    pub async fn execute(&self, app: &AppContext) -> anyhow::Result<()> {
        let root = app.workspace_root()?;
        let defaults = app.config.defaults.clone();
        let git = app.git.clone();

        let statuses =
            run_blocking(move |ctx| ops::status(ctx, &root, &defaults, git.as_ref())).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            return Ok(());
        }

        if statuses.is_empty() {
            println!("No repos in workspace.");
            return Ok(());
        }
        for status in &statuses {
            let state = match (&status.error, status.missing, status.dirty) {
                (Some(err), _, _) => format!("error: {err}"),
                (None, true, _) => "missing".to_string(),
                (None, false, true) => "dirty".to_string(),
                (None, false, false) => "clean".to_string(),
            };
            println!("{:<20} {}", status.name, state);
            if app.verbose {
                println!("  {}", status.path.display());
            }
        }
        Ok(())
    }
}
