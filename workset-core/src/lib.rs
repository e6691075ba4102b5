//! Workset Core - Multi-repo worktree workspaces
//!
//! This crate manages workspaces that check out several repositories on the
//! same branch side by side, and decides whether a branch's work is safe to
//! delete (clean, merged and pushed).

pub mod config;
pub mod error;
pub mod git;
pub mod layout;
pub mod ops;
pub mod safety;
pub mod workspace;

pub use config::{Config, Defaults, GitBackendKind, GitSettings};
pub use error::{Error, Result};
pub use git::{CallContext, CliGit, GitPort, Libgit2};
pub use safety::{
    check_repo_safety, check_workspace_safety, BranchSafety, RepoSafetyInput, RepoSafetyReport,
    SafetySummary, WorkspaceSafetyInput, WorkspaceSafetyReport,
};
pub use workspace::{RepoConfig, Workspace};
