//! Merged command - ask whether a branch already landed in a base ref

use std::path::PathBuf;

use clap::Args;

use super::{run_blocking, AppContext};

/// Check ancestry and content containment of a branch in a base ref
#[derive(Args, Debug)]
pub struct MergedArgs {
    /// Branch (or any revision) to check
    branch: String,

    /// Base revision, e.g. refs/remotes/origin/main
    base: String,

    /// Repository to read refs from (defaults to the current directory)
    #[arg(long)]
    repo_path: Option<PathBuf>,
}

impl MergedArgs {
    /// Execute the merged command
    pub async fn execute(&self, app: &AppContext) -> anyhow::Result<()> {
        let repo = match &self.repo_path {
            Some(path) => path.clone(),
            None => std::env::current_dir()?,
        };
        let git = app.git.clone();
        let branch = self.branch.clone();
        let base = self.base.clone();

        let (ancestor, content) = run_blocking(move |ctx| {
            let ancestor = git.is_ancestor(&repo, &branch, &base)?;
            // Ancestry implies containment
            let content = ancestor || git.is_content_merged(ctx, &repo, &branch, &base)?;
            Ok((ancestor, content))
        })
        .await?;

        let yes_no = |b: bool| if b { "yes" } else { "no" };
        println!("{} -> {}", self.branch, self.base);
        println!("  ancestor:       {}", yes_no(ancestor));
        println!("  content merged: {}", yes_no(content));

        if !content {
            anyhow::bail!("{} is not merged into {}", self.branch, self.base);
        }
        Ok(())
    }
}
