//! Repo commands - add and remove workspace repositories

use clap::{Args, Subcommand};
use workset_core::config::RepoSource;
use workset_core::ops::{self, AddRepoInput, RemoteUpdate, RemoveRepoInput};

use super::{run_blocking, AppContext};

/// Repository management commands
#[derive(Args, Debug)]
pub struct RepoArgs {
    #[command(subcommand)]
    pub command: RepoCommand,
}

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// Add a repository and check it out on the workspace branch
    Add {
        /// Clone URL, local repository path, or alias from the config file
        source: String,

        /// Repo name (derived from the source if not specified)
        #[arg(short, long)]
        name: Option<String>,

        /// Directory name inside each branch directory
        #[arg(long)]
        repo_dir: Option<String>,

        /// Remote to clone under and compare against
        #[arg(long)]
        remote: Option<String>,

        /// Branch the work is merged into
        #[arg(short, long)]
        base: Option<String>,
    },

    /// Remove a repository from the workspace
    #[command(visible_alias = "remove")]
    Rm {
        /// Repo name
        name: String,

        /// Also delete the repo's branch worktrees
        #[arg(long)]
        delete_worktrees: bool,

        /// Also delete the bare store (managed repos only)
        #[arg(long)]
        delete_local: bool,

        /// Skip the safety check
        #[arg(short, long)]
        force: bool,

        /// Allow branches whose content is already in base (squash merges)
        #[arg(long)]
        allow_content_merged: bool,

        /// Use remote-tracking refs as they are instead of fetching first
        #[arg(long)]
        no_fetch: bool,
    },

    /// Change the remotes or branches a repository is compared against
    Remotes {
        /// Repo name
        name: String,

        /// Remote the work is merged into
        #[arg(long)]
        base_remote: Option<String>,

        /// Remote the work is pushed to
        #[arg(long)]
        write_remote: Option<String>,

        /// Branch the work is merged into
        #[arg(long)]
        base_branch: Option<String>,

        /// Default branch on the write remote
        #[arg(long)]
        write_branch: Option<String>,
    },
}

impl RepoArgs {
    /// Execute the repo command
    pub async fn execute(&self, app: &AppContext) -> anyhow::Result<()> {
        match &self.command {
            RepoCommand::Add {
                source,
                name,
                repo_dir,
                remote,
                base,
            } => {
                add_repo(
                    app,
                    source,
                    name.clone(),
                    repo_dir.clone(),
                    remote.clone(),
                    base.clone(),
                )
                .await
            }
            RepoCommand::Rm {
                name,
                delete_worktrees,
                delete_local,
                force,
                allow_content_merged,
                no_fetch,
            } => {
                remove_repo(
                    app,
                    name,
                    RemoveFlags {
                        delete_worktrees: *delete_worktrees,
                        delete_local: *delete_local,
                        force: *force,
                        allow_content_merged: *allow_content_merged,
                        fetch_remotes: !*no_fetch,
                    },
                )
                .await
            }
            RepoCommand::Remotes {
                name,
                base_remote,
                write_remote,
                base_branch,
                write_branch,
            } => {
                let update = RemoteUpdate {
                    base_remote: base_remote.clone(),
                    write_remote: write_remote.clone(),
                    base_branch: base_branch.clone(),
                    write_branch: write_branch.clone(),
                };
                update_remotes(app, name, &update)
            }
        }
    }
}

fn update_remotes(app: &AppContext, name: &str, update: &RemoteUpdate) -> anyhow::Result<()> {
    let root = app.workspace_root()?;
    let config = ops::update_repo_remotes(&root, name, &app.config.defaults, update)?;
    let Some(repo) = config.repo(name) else {
        anyhow::bail!("repo '{name}' missing after update");
    };
    let remotes = &repo.remotes;
    println!("Updated repo '{name}'");
    println!(
        "  Base:  {}/{}",
        remotes.base.name, remotes.base.default_branch
    );
    if remotes.write.default_branch.is_empty() {
        println!("  Write: {}", remotes.write.name);
    } else {
        println!(
            "  Write: {}/{}",
            remotes.write.name, remotes.write.default_branch
        );
    }
    Ok(())
}

async fn add_repo(
    app: &AppContext,
    source: &str,
    mut name: Option<String>,
    repo_dir: Option<String>,
    mut remote: Option<String>,
    mut base: Option<String>,
) -> anyhow::Result<()> {
    let root = app.workspace_root()?;

    // Aliases supply a source plus per-repo remote settings
    let source = match app.config.repos.get(source) {
        Some(alias) => {
            let resolved = match alias.source() {
                Some(RepoSource::Path(path)) => path.display().to_string(),
                Some(RepoSource::Url(url)) => url.to_string(),
                None => anyhow::bail!("repo alias '{source}' has neither url nor path"),
            };
            name.get_or_insert_with(|| source.to_string());
            if remote.is_none() {
                remote = alias.remote.clone();
            }
            if base.is_none() {
                base = alias.default_branch.clone();
            }
            resolved
        }
        None => source.to_string(),
    };

    let defaults = app.config.defaults.clone();
    let git = app.git.clone();
    let added = run_blocking(move |ctx| {
        ops::add_repo(
            ctx,
            &AddRepoInput {
                workspace_root: &root,
                source: &source,
                name: name.as_deref(),
                repo_dir: repo_dir.as_deref(),
                remote: remote.as_deref(),
                default_branch: base.as_deref(),
                defaults: &defaults,
                git: git.as_ref(),
            },
        )
    })
    .await?;

    println!("Added repo '{}'", added.repo.name);
    if let Some(store) = &added.repo.local_path {
        let kind = if added.repo.managed { "bare store" } else { "local repo" };
        println!("  Source:   {} ({kind})", store.display());
    }
    println!(
        "  Base:     {}/{}",
        added.repo.remotes.base.name, added.repo.remotes.base.default_branch
    );
    let note = if added.created_worktree { "" } else { " (existing)" };
    println!("  Worktree: {}{note}", added.worktree_path.display());
    Ok(())
}

struct RemoveFlags {
    delete_worktrees: bool,
    delete_local: bool,
    force: bool,
    allow_content_merged: bool,
    fetch_remotes: bool,
}

async fn remove_repo(app: &AppContext, name: &str, flags: RemoveFlags) -> anyhow::Result<()> {
    let root = app.workspace_root()?;
    let defaults = app.config.defaults.clone();
    let git = app.git.clone();
    let repo_name = name.to_string();
    let fetch_timeout = Some(app.config.git.fetch_timeout);

    let removed = run_blocking(move |ctx| {
        ops::remove_repo(
            ctx,
            &RemoveRepoInput {
                workspace_root: &root,
                name: &repo_name,
                defaults: &defaults,
                git: git.as_ref(),
                delete_worktrees: flags.delete_worktrees,
                delete_local: flags.delete_local,
                force: flags.force,
                allow_content_merged: flags.allow_content_merged,
                fetch_remotes: flags.fetch_remotes,
                fetch_timeout,
            },
        )
    })
    .await;

    let removed = match removed {
        Ok(removed) => removed,
        Err(e) => {
            if let Some(workset_core::Error::Unsafe { details, .. }) = e.downcast_ref() {
                eprintln!("Refusing to remove '{name}':");
                for line in details {
                    eprintln!("  {line}");
                }
                eprintln!("Use --force to remove anyway.");
            }
            return Err(e);
        }
    };

    println!("Removed repo '{name}'");
    for path in &removed.removed_worktrees {
        println!("  Deleted worktree: {}", path.display());
    }
    if let Some(store) = &removed.deleted_store {
        println!("  Deleted store:    {}", store.display());
    }
    Ok(())
}
