//! Safety command - report whether branch worktrees can be deleted

use clap::Args;
use workset_core::{
    check_repo_safety, check_workspace_safety, BranchSafety, RepoSafetyInput, SafetySummary,
    Workspace, WorkspaceSafetyInput, WorkspaceSafetyReport,
};

use super::{run_blocking, AppContext};

/// Report dirty, unmerged and unpushed branch worktrees
#[derive(Args, Debug)]
pub struct SafetyArgs {
    /// Only check this repository
    #[arg(short, long)]
    repo: Option<String>,

    /// Use remote-tracking refs as they are instead of fetching first
    #[arg(long)]
    no_fetch: bool,

    /// Run the content-merge check on unmerged branches (finds squash
    /// merges and cherry-picks)
    #[arg(long)]
    content_check: bool,

    /// Print the full report as JSON
    #[arg(long)]
    json: bool,
}

impl SafetyArgs {
    /// Execute the safety command
    pub async fn execute(&self, app: &AppContext) -> anyhow::Result<()> {
        let root = app.workspace_root()?;
        let defaults = app.config.defaults.clone();
        let git = app.git.clone();
        let repo_filter = self.repo.clone();
        let fetch_remotes = !self.no_fetch;
        let fetch_timeout = Some(app.config.git.fetch_timeout);
        let content_check = self.content_check;

        let report = run_blocking(move |ctx| {
            let mut report = match repo_filter {
                Some(name) => {
                    let ws = Workspace::load(&root, &defaults)?;
                    let repo = ws.repo(&name).ok_or_else(|| {
                        workset_core::Error::Config(format!("repo '{name}' not found in workspace"))
                    })?;
                    let repo_report = check_repo_safety(
                        ctx,
                        &RepoSafetyInput {
                            workspace_root: &root,
                            repo,
                            defaults: &defaults,
                            git: git.as_ref(),
                            fetch_remotes,
                            fetch_timeout,
                        },
                    )?;
                    WorkspaceSafetyReport {
                        root: root.clone(),
                        repos: vec![repo_report],
                    }
                }
                None => check_workspace_safety(
                    ctx,
                    &WorkspaceSafetyInput {
                        workspace_root: &root,
                        defaults: &defaults,
                        git: git.as_ref(),
                        fetch_remotes,
                        fetch_timeout,
                    },
                )?,
            };
            if content_check {
                report.confirm_content_merged(ctx, git.as_ref())?;
            }
            Ok(report)
        })
        .await?;

        let summary = report.summary();
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report, &summary, app.verbose);
        }

        if summary.blocks_removal(self.content_check) {
            anyhow::bail!("workspace has work that would be lost on removal");
        }
        Ok(())
    }
}

fn branch_flags(branch: &BranchSafety) -> Vec<&'static str> {
    let mut flags = Vec::new();
    if branch.missing {
        flags.push("missing");
    }
    if branch.dirty {
        flags.push("dirty");
    }
    if branch.unmerged {
        flags.push(match branch.content_merged {
            Some(true) => "content-merged",
            _ => "unmerged",
        });
    }
    if branch.unpushed {
        flags.push("unpushed");
    }
    flags
}

fn print_report(report: &WorkspaceSafetyReport, summary: &SafetySummary, verbose: bool) {
    println!("Workspace: {}", report.root.display());
    for repo in &report.repos {
        println!();
        println!(
            "{} (base {}/{}, push {})",
            repo.repo_name, repo.base_remote, repo.base_branch, repo.write_remote
        );
        if repo.branches.is_empty() {
            println!("  (no worktrees)");
            continue;
        }
        for branch in &repo.branches {
            let flags = branch_flags(branch);
            let state = if flags.is_empty() {
                "safe".to_string()
            } else {
                flags.join(", ")
            };
            println!("  {:<30} {}", branch.branch, state);
            if verbose {
                println!("    {}", branch.path.display());
                if let Some(reason) = &branch.unmerged_reason {
                    println!("    {reason}");
                }
            }
        }
    }

    if !summary.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &summary.warnings {
            println!("  {warning}");
        }
    }
    if !summary.unmerged.is_empty() {
        println!();
        println!("Unmerged:");
        for line in summary.unmerged_details() {
            println!("  {line}");
        }
    }
}
