//! Init command - create a workspace

use std::path::PathBuf;

use clap::Args;
use workset_core::Workspace;

use super::AppContext;

/// Create a workspace
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory to create the workspace in (defaults to --workspace or the
    /// current directory)
    path: Option<PathBuf>,

    /// Workspace name (defaults to the directory name)
    #[arg(short, long)]
    name: Option<String>,

    /// Branch to start on (defaults to the configured base branch)
    #[arg(short, long)]
    branch: Option<String>,
}

impl InitArgs {
    /// Execute the init command
    pub async fn execute(&self, app: &AppContext) -> anyhow::Result<()> {
        let root = match (&self.path, &app.config.defaults.workspace_root) {
            (Some(path), _) => path.clone(),
            (None, Some(root)) => root.clone(),
            (None, None) => std::env::current_dir()?,
        };
        let name = self
            .name
            .clone()
            .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "workspace".to_string());

        let ws = Workspace::init(
            &root,
            &name,
            self.branch.as_deref(),
            &app.config.defaults,
        )?;

        println!("Initialized workspace '{}'", ws.config.name);
        println!("  Root:   {}", ws.root.display());
        println!("  Branch: {}", ws.state.current_branch);
        Ok(())
    }
}
