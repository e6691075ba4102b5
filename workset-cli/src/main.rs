//! Workset CLI - Command line interface for workset
//!
//! Multi-repo worktree workspaces with merge-safety checks.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use workset_core::config::RepoSource;
use workset_core::{git, Config, GitBackendKind};

use commands::{AppContext, InitArgs, MergedArgs, RepoArgs, RmArgs, SafetyArgs, StatusArgs};

/// Workset: one branch, many repositories
#[derive(Parser, Debug)]
#[command(name = "workset")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace root (overrides config; discovered from the current
    /// directory when unset)
    #[arg(short, long, global = true, env = "WORKSET_ROOT")]
    workspace: Option<PathBuf>,

    /// Git backend: cli or libgit2 (overrides config and env)
    #[arg(long, global = true, env = "WORKSET_GIT_BACKEND")]
    backend: Option<GitBackendKind>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version information
    Version,

    /// Create a workspace
    Init(InitArgs),

    /// Report whether branch worktrees are safe to delete
    Safety(SafetyArgs),

    /// Check whether a branch's content is already in a base ref
    Merged(MergedArgs),

    /// Add, remove or re-point repositories
    Repo(RepoArgs),

    /// Delete the workspace after a safety check
    Rm(RmArgs),

    /// Show dirty/missing state of each repository
    #[command(visible_alias = "st")]
    Status(StatusArgs),

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = Config::load_with_overrides(cli.workspace.clone(), cli.backend)?;

    if cli.verbose {
        tracing::info!(
            backend = ?config.git.backend,
            workspace_root = ?config.defaults.workspace_root,
            "Configuration loaded"
        );
    }

    let app = AppContext {
        git: git::backend(&config.git),
        config,
        verbose: cli.verbose,
    };

    match cli.command {
        Some(Commands::Version) => {
            println!("workset {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init(args)) => args.execute(&app).await?,
        Some(Commands::Safety(args)) => args.execute(&app).await?,
        Some(Commands::Merged(args)) => args.execute(&app).await?,
        Some(Commands::Repo(args)) => args.execute(&app).await?,
        Some(Commands::Rm(args)) => args.execute(&app).await?,
        Some(Commands::Status(args)) => args.execute(&app).await?,
        Some(Commands::Config) => print_config(&app.config),
        None => {
            println!("Workset - Multi-repo worktree workspaces");
            println!();
            println!("Use --help for usage information");
        }
    }

    Ok(())
}

fn print_config(config: &Config) {
    println!("Workset Configuration");
    println!("=====================");
    println!();
    println!("Defaults:");
    println!("  base_branch:   {}", config.defaults.base_branch);
    println!("  base_remote:   {}", config.defaults.remotes.base);
    println!("  write_remote:  {}", config.defaults.remotes.write);
    match &config.defaults.workspace_root {
        Some(root) => println!("  workspace:     {}", root.display()),
        None => println!("  workspace:     (discovered)"),
    }
    println!();
    println!("Git:");
    println!("  backend:         {:?}", config.git.backend);
    println!("  git_path:        {}", config.git.git_path);
    println!("  command_timeout: {:?}", config.git.command_timeout);
    println!("  fetch_timeout:   {:?}", config.git.fetch_timeout);
    if !config.repos.is_empty() {
        println!();
        println!("Repo aliases:");
        for (name, alias) in &config.repos {
            let source = match alias.source() {
                Some(RepoSource::Path(path)) => path.display().to_string(),
                Some(RepoSource::Url(url)) => url.to_string(),
                None => "(no source)".to_string(),
            };
            println!("  {name}: {source}");
        }
    }
    println!();
    if let Some(path) = Config::default_config_path() {
        println!("Config file: {}", path.display());
        if path.exists() {
            println!("  (exists)");
        } else {
            println!("  (not found - using defaults)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_repo_rm() {
        let cli = Cli::try_parse_from([
            "workset",
            "--backend",
            "libgit2",
            "repo",
            "rm",
            "api",
            "--delete-worktrees",
            "--allow-content-merged",
        ])
        .unwrap();
        assert_eq!(cli.backend, Some(GitBackendKind::Libgit2));
        assert!(matches!(cli.command, Some(Commands::Repo(_))));
    }

    #[test]
    fn test_parse_repo_remotes_and_rm() {
        let cli = Cli::try_parse_from([
            "workset",
            "repo",
            "remotes",
            "api",
            "--write-remote",
            "fork",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Repo(_))));

        let cli = Cli::try_parse_from(["workset", "-w", "/tmp/ws", "rm", "--force"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Rm(_))));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Cli::try_parse_from(["workset", "--backend", "svn", "status"]).is_err());
    }
}
