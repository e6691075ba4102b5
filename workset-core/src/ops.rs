//! Workspace operations: adding, removing and inspecting repositories
//!
//! Removal follows one rule throughout: a worktree directory is deleted only
//! after its admin entry has been detached from the owning repository.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{looks_like_local_path, repo_name_from_url, Defaults};
use crate::git::{parse_gitdir_file, CallContext, GitPort, WorktreeAddOptions};
use crate::layout;
use crate::safety::{
    check_repo_safety, check_workspace_safety, RepoSafetyInput, RepoSafetyReport,
    WorkspaceSafetyInput, WorkspaceSafetyReport,
};
use crate::workspace::{RemoteSpec, Remotes, RepoConfig, Workspace, WorkspaceConfig};
use crate::{Error, Result};

/// Inputs to [`add_repo`]
pub struct AddRepoInput<'a> {
    pub workspace_root: &'a Path,
    /// Clone URL or local repository path
    pub source: &'a str,
    /// Repo name; derived from `source` when `None`
    pub name: Option<&'a str>,
    /// Directory name inside each branch dir; the repo name when `None`
    pub repo_dir: Option<&'a str>,
    /// Remote to clone under and merge into; the default base remote when `None`
    pub remote: Option<&'a str>,
    /// Base branch; the default base branch when `None`
    pub default_branch: Option<&'a str>,
    pub defaults: &'a Defaults,
    pub git: &'a dyn GitPort,
}

/// Result of [`add_repo`]
#[derive(Debug, Clone)]
pub struct AddedRepo {
    pub repo: RepoConfig,
    pub worktree_path: PathBuf,
    /// False when an existing worktree was adopted
    pub created_worktree: bool,
}

/// Add a repository to a workspace and check it out on the current branch
pub fn add_repo(ctx: &CallContext, input: &AddRepoInput<'_>) -> Result<AddedRepo> {
    let source = input.source.trim();
    if source.is_empty() {
        return Err(Error::Config("repo url or local path required".to_string()));
    }
    let name = match input.name.filter(|n| !n.trim().is_empty()) {
        Some(n) => n.trim().to_string(),
        None => repo_name_from_url(source).ok_or_else(|| {
            Error::Config(format!("cannot derive a repo name from '{source}'"))
        })?,
    };

    let root = input.workspace_root;
    let mut ws = Workspace::load(root, input.defaults)?;
    if ws.repo(&name).is_some() {
        return Err(Error::Config(format!(
            "repo '{name}' already exists in workspace"
        )));
    }

    let remote = input
        .remote
        .filter(|r| !r.is_empty())
        .unwrap_or(&input.defaults.remotes.base)
        .to_string();
    let default_branch = input
        .default_branch
        .filter(|b| !b.is_empty())
        .unwrap_or(&input.defaults.base_branch)
        .to_string();
    let target_branch = if ws.state.current_branch.is_empty() {
        default_branch.clone()
    } else {
        ws.state.current_branch.clone()
    };

    let (store, managed) = if looks_like_local_path(source) {
        let path = fs::canonicalize(expand_home(source)).map_err(|e| {
            Error::Config(format!("local repo not found at {source}: {e}"))
        })?;
        if !input.git.is_repo(&path)? && !path.join("HEAD").is_file() {
            return Err(Error::Config(format!(
                "local repo not found at {}",
                path.display()
            )));
        }
        if input.git.current_branch(&path)?.as_deref() == Some(target_branch.as_str())
            && path.join(".git").exists()
        {
            return Err(Error::Config(format!(
                "branch '{}' is already checked out in {}; a branch can only be in one worktree",
                target_branch,
                path.display()
            )));
        }
        (path, false)
    } else {
        let store = layout::repo_store_path(root, &name);
        if store.exists() {
            debug!(store = %store.display(), "Reusing existing bare store");
        } else {
            info!(url = source, store = %store.display(), "Cloning bare store");
            input.git.clone_bare(ctx, source, &store, &remote)?;
        }
        (store, true)
    };

    let repo = RepoConfig {
        repo_dir: input
            .repo_dir
            .filter(|d| !d.is_empty())
            .unwrap_or(&name)
            .to_string(),
        name,
        managed,
        local_path: Some(store.clone()),
        remotes: Remotes {
            base: RemoteSpec {
                name: remote.clone(),
                default_branch: default_branch.clone(),
            },
            write: RemoteSpec {
                name: remote.clone(),
                default_branch: String::new(),
            },
        },
    };

    let worktree_path = layout::repo_worktree_path(root, &target_branch, &repo.repo_dir);
    let created_worktree = if worktree_path.exists() {
        let owned_by_store = match worktree_admin_from_path(&worktree_path)? {
            // A user checkout owns its worktrees through its .git dir
            Some((owner, _)) => {
                same_path(&owner, &store) || same_path(&owner, &store.join(".git"))
            }
            None => false,
        };
        if !owned_by_store || !input.git.is_repo(&worktree_path)? {
            return Err(Error::Config(format!(
                "{} exists but is not a worktree of {}",
                worktree_path.display(),
                store.display()
            )));
        }
        false
    } else {
        let start_remote = if input.git.remote_exists(&store, &remote)? {
            remote.clone()
        } else {
            String::new()
        };
        layout::write_branch_meta(root, &target_branch)?;
        input.git.worktree_add(
            ctx,
            &WorktreeAddOptions {
                repo_path: store.clone(),
                worktree_path: worktree_path.clone(),
                worktree_name: layout::worktree_name(&target_branch),
                branch_name: target_branch.clone(),
                start_remote,
                start_branch: default_branch,
            },
        )?;
        true
    };

    ws.config.repos.push(repo.clone());
    ws.save_config()?;
    info!(repo = %repo.name, branch = %target_branch, path = %worktree_path.display(), "Added repo");

    Ok(AddedRepo {
        repo,
        worktree_path,
        created_worktree,
    })
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches(['/', '\\'])),
        _ => PathBuf::from(path),
    }
}

/// Inputs to [`remove_repo`]
pub struct RemoveRepoInput<'a> {
    pub workspace_root: &'a Path,
    pub name: &'a str,
    pub defaults: &'a Defaults,
    pub git: &'a dyn GitPort,
    /// Remove every branch worktree of the repo
    pub delete_worktrees: bool,
    /// Delete the bare store; only allowed for managed repos
    pub delete_local: bool,
    /// Skip the safety check
    pub force: bool,
    /// Let squash-merged or cherry-picked branches through after a
    /// content-merge check
    pub allow_content_merged: bool,
    /// Fetch remotes before the safety check
    pub fetch_remotes: bool,
    pub fetch_timeout: Option<Duration>,
}

/// Result of [`remove_repo`]
#[derive(Debug, Clone, Default)]
pub struct RemovedRepo {
    /// Safety report the removal was gated on, if one ran
    pub report: Option<RepoSafetyReport>,
    pub removed_worktrees: Vec<PathBuf>,
    pub deleted_store: Option<PathBuf>,
}

/// Remove a repository from a workspace
///
/// Deleting worktrees or the bare store is refused with [`Error::Unsafe`]
/// when any branch is dirty, unmerged or unpushed, unless `force` is set.
/// With `allow_content_merged`, unmerged branches are run through the
/// content-merge check and pass when their changes are already in base.
pub fn remove_repo(ctx: &CallContext, input: &RemoveRepoInput<'_>) -> Result<RemovedRepo> {
    if input.name.is_empty() {
        return Err(Error::Config("repo name required".to_string()));
    }
    let root = input.workspace_root;
    let mut ws = Workspace::load(root, input.defaults)?;
    let repo = ws
        .repo(input.name)
        .ok_or_else(|| Error::Config(format!("repo '{}' not found in workspace", input.name)))?
        .with_defaults(input.defaults);

    if input.delete_local && !repo.managed {
        return Err(Error::Config(format!(
            "refusing to delete {}: not managed by workset",
            repo.local_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| repo.name.clone())
        )));
    }

    let mut outcome = RemovedRepo::default();
    let destructive = input.delete_worktrees || input.delete_local;

    if destructive && !input.force {
        let mut report = check_repo_safety(
            ctx,
            &RepoSafetyInput {
                workspace_root: root,
                repo: &repo,
                defaults: input.defaults,
                git: input.git,
                fetch_remotes: input.fetch_remotes,
                fetch_timeout: input.fetch_timeout,
            },
        )?;
        let allow = input.allow_content_merged;
        if allow && !report.summary().unmerged.is_empty() {
            report.confirm_content_merged(ctx, input.git)?;
        }
        let summary = report.summary();
        for warning in &summary.warnings {
            warn!(repo = %repo.name, "{}", warning);
        }
        if summary.blocks_removal(allow) {
            return Err(Error::Unsafe {
                repo: repo.name.clone(),
                details: summary.blocking_details(allow),
            });
        }
        outcome.report = Some(report);
    }

    if input.delete_worktrees {
        outcome.removed_worktrees = delete_worktrees(root, &repo, input.git)?;
    }

    if input.delete_local {
        if let Some(store) = repo.local_path.as_deref().filter(|p| p.exists()) {
            fs::remove_dir_all(store)?;
            info!(repo = %repo.name, store = %store.display(), "Deleted bare store");
            outcome.deleted_store = Some(store.to_path_buf());
        }
    }

    ws.config.repos.retain(|r| r.name != repo.name);
    ws.save_config()?;
    info!(repo = %repo.name, "Removed repo from workspace");
    Ok(outcome)
}

/// Remove every on-disk branch worktree of a repo, admin entry first
fn delete_worktrees(root: &Path, repo: &RepoConfig, git: &dyn GitPort) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for branch in layout::list_worktree_branches(root)? {
        let path = layout::repo_worktree_path(root, &branch, &repo.repo_dir);
        if !path.exists() {
            continue;
        }
        if path.join(".git").is_dir() {
            warn!(
                repo = %repo.name,
                path = %path.display(),
                "Not a linked worktree, leaving it in place"
            );
            continue;
        }

        let (owner, name) = match worktree_admin_from_path(&path)? {
            Some((common_dir, name)) => (Some(common_dir), name),
            None => (repo.local_path.clone(), layout::worktree_name(&branch)),
        };

        if let Some(owner) = owner.filter(|o| o.exists()) {
            match git.worktree_remove(&owner, &name) {
                Ok(()) => debug!(repo = %repo.name, worktree = %name, "Removed worktree"),
                Err(e) if e.is_worktree_not_found() => {
                    debug!(repo = %repo.name, worktree = %name, "Worktree admin entry already gone")
                }
                Err(e) => return Err(e),
            }
        }

        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        prune_branch_dir(root, &branch)?;
        removed.push(path);
    }
    Ok(removed)
}

/// Drop a branch directory once it holds nothing but its metadata file
fn prune_branch_dir(root: &Path, branch: &str) -> Result<()> {
    let dir = layout::branch_path(root, branch);
    let mut entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let only_meta = entries.all(|entry| {
        entry
            .map(|e| e.file_name() == layout::BRANCH_META_FILE)
            .unwrap_or(false)
    });
    if only_meta {
        fs::remove_dir_all(&dir)?;
        debug!(branch, "Pruned empty branch dir");
    }
    Ok(())
}

/// The repository owning a linked worktree and the worktree's admin entry
/// name, read from the worktree's `.git` file
///
/// `None` for a regular checkout (`.git` directory) or a path without a
/// `.git` file.
pub fn worktree_admin_from_path(path: &Path) -> Result<Option<(PathBuf, String)>> {
    let dot_git = path.join(".git");
    if dot_git.is_dir() {
        return Ok(None);
    }
    let Some(admin) = parse_gitdir_file(&dot_git)? else {
        return Ok(None);
    };
    let Some(name) = admin.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(None);
    };

    let common_dir = match fs::read_to_string(admin.join("commondir")) {
        Ok(contents) => {
            let common = Path::new(contents.trim());
            if common.is_absolute() {
                common.to_path_buf()
            } else {
                admin.join(common)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // <common>/worktrees/<name>
            match admin.parent().and_then(Path::parent) {
                Some(common) => common.to_path_buf(),
                None => return Ok(None),
            }
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Some((common_dir, name)))
}

/// Remote settings to change with [`update_repo_remotes`]; `None` leaves a
/// field as it is
#[derive(Debug, Clone, Default)]
pub struct RemoteUpdate {
    pub base_remote: Option<String>,
    pub write_remote: Option<String>,
    pub base_branch: Option<String>,
    pub write_branch: Option<String>,
}

impl RemoteUpdate {
    fn is_empty(&self) -> bool {
        self.base_remote.is_none()
            && self.write_remote.is_none()
            && self.base_branch.is_none()
            && self.write_branch.is_none()
    }
}

/// Change a repo's base/write remotes or branches and save the workspace
pub fn update_repo_remotes(
    root: &Path,
    name: &str,
    defaults: &Defaults,
    update: &RemoteUpdate,
) -> Result<WorkspaceConfig> {
    if name.is_empty() {
        return Err(Error::Config("repo name required".to_string()));
    }
    if update.is_empty() {
        return Err(Error::Config(
            "at least one remote setting required".to_string(),
        ));
    }

    let mut ws = Workspace::load(root, defaults)?;
    let repo = ws
        .config
        .repos
        .iter_mut()
        .find(|r| r.name == name)
        .ok_or_else(|| Error::Config(format!("repo '{name}' not found in workspace")))?;

    let remotes = &mut repo.remotes;
    if let Some(remote) = &update.base_remote {
        remotes.base.name = remote.clone();
    }
    if let Some(remote) = &update.write_remote {
        remotes.write.name = remote.clone();
    }
    if let Some(branch) = &update.base_branch {
        remotes.base.default_branch = branch.clone();
    }
    if let Some(branch) = &update.write_branch {
        remotes.write.default_branch = branch.clone();
    }
    info!(
        repo = name,
        base = %format!("{}/{}", remotes.base.name, remotes.base.default_branch),
        write = %remotes.write.name,
        "Updated repo remotes"
    );

    ws.save_config()?;
    Ok(ws.config)
}

/// Inputs to [`remove_workspace`]
pub struct RemoveWorkspaceInput<'a> {
    pub workspace_root: &'a Path,
    pub defaults: &'a Defaults,
    pub git: &'a dyn GitPort,
    /// Skip the safety check and keep going past worktree cleanup errors
    pub force: bool,
    /// Let squash-merged or cherry-picked branches through after a
    /// content-merge check
    pub allow_content_merged: bool,
    pub fetch_remotes: bool,
    pub fetch_timeout: Option<Duration>,
}

/// Result of [`remove_workspace`]
#[derive(Debug, Clone, Default)]
pub struct RemovedWorkspace {
    pub report: Option<WorkspaceSafetyReport>,
    /// Worktrees detached from their owning repositories
    pub detached_worktrees: Vec<PathBuf>,
}

/// Delete a workspace directory
///
/// Every branch worktree is detached from its owning repository first, so
/// user checkouts outside the workspace are not left with stale admin
/// entries. Refused with [`Error::Unsafe`] like [`remove_repo`].
pub fn remove_workspace(
    ctx: &CallContext,
    input: &RemoveWorkspaceInput<'_>,
) -> Result<RemovedWorkspace> {
    let root = input.workspace_root;
    if !layout::workspace_file(root).is_file() && !layout::workset_dir(root).is_dir() {
        return Err(Error::Config(format!(
            "refusing to delete {}: not a workspace",
            root.display()
        )));
    }

    let mut outcome = RemovedWorkspace::default();
    if !input.force {
        let mut report = check_workspace_safety(
            ctx,
            &WorkspaceSafetyInput {
                workspace_root: root,
                defaults: input.defaults,
                git: input.git,
                fetch_remotes: input.fetch_remotes,
                fetch_timeout: input.fetch_timeout,
            },
        )?;
        let allow = input.allow_content_merged;
        if allow && !report.summary().unmerged.is_empty() {
            report.confirm_content_merged(ctx, input.git)?;
        }
        let summary = report.summary();
        for warning in &summary.warnings {
            warn!(root = %root.display(), "{}", warning);
        }
        if summary.blocks_removal(allow) {
            return Err(Error::Unsafe {
                repo: root.display().to_string(),
                details: summary.blocking_details(allow),
            });
        }
        outcome.report = Some(report);
    }

    outcome.detached_worktrees = cleanup_workspace_worktrees(root, input.git, input.force)?;
    fs::remove_dir_all(root)?;
    info!(root = %root.display(), "Deleted workspace");
    Ok(outcome)
}

/// Detach every linked worktree under the branch directories from its
/// owning repository
///
/// Admin entries that are already gone are skipped. With `force`, other
/// failures are logged and the sweep continues.
pub fn cleanup_workspace_worktrees(
    root: &Path,
    git: &dyn GitPort,
    force: bool,
) -> Result<Vec<PathBuf>> {
    let mut detached = Vec::new();
    for branch in layout::list_worktree_branches(root)? {
        for entry in fs::read_dir(layout::branch_path(root, &branch))? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let admin = match worktree_admin_from_path(&path) {
                Ok(Some(admin)) => admin,
                Ok(None) => {
                    debug!(path = %path.display(), "No linked worktree metadata");
                    continue;
                }
                Err(e) if force => {
                    warn!(path = %path.display(), error = %e, "Unreadable worktree metadata");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let (owner, name) = admin;
            match git.worktree_remove(&owner, &name) {
                Ok(()) => {
                    debug!(worktree = %name, owner = %owner.display(), "Detached worktree");
                    detached.push(path);
                }
                Err(e) if e.is_worktree_not_found() => {
                    debug!(worktree = %name, "Worktree admin entry already gone");
                }
                Err(e) if force => {
                    warn!(worktree = %name, error = %e, "Failed to detach worktree");
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(detached)
}

/// Status of one repo's worktree on the current branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoStatus {
    pub name: String,
    pub path: PathBuf,
    pub dirty: bool,
    pub missing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dirty/missing state of every repo for the workspace's current branch
pub fn status(
    ctx: &CallContext,
    root: &Path,
    defaults: &Defaults,
    git: &dyn GitPort,
) -> Result<Vec<RepoStatus>> {
    let ws = Workspace::load(root, defaults)?;
    let branch = if ws.state.current_branch.is_empty() {
        defaults.base_branch.clone()
    } else {
        ws.state.current_branch.clone()
    };

    let mut results = Vec::with_capacity(ws.config.repos.len());
    for repo in &ws.config.repos {
        ctx.check()?;
        let repo = repo.with_defaults(defaults);
        let path = layout::repo_worktree_path(root, &branch, &repo.repo_dir);
        let (status, error) = match git.status(&path) {
            Ok(status) => (status, None),
            Err(e) => (Default::default(), Some(e.to_string())),
        };
        results.push(RepoStatus {
            name: repo.name,
            path,
            dirty: status.dirty,
            missing: status.missing,
            error,
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_worktree_admin_from_path() {
        let temp = TempDir::new().unwrap();
        let store = temp.path().join("store.git");
        let admin = store.join("worktrees").join("feat-43f486aa");
        let wt = temp.path().join("wt");
        fs::create_dir_all(&admin).unwrap();
        fs::create_dir_all(&wt).unwrap();
        fs::write(wt.join(".git"), format!("gitdir: {}\n", admin.display())).unwrap();
        fs::write(admin.join("commondir"), "../..\n").unwrap();

        let (common, name) = worktree_admin_from_path(&wt).unwrap().unwrap();
        assert_eq!(name, "feat-43f486aa");
        assert_eq!(fs::canonicalize(common).unwrap(), fs::canonicalize(&store).unwrap());

        // Without commondir the owner is two levels up
        fs::remove_file(admin.join("commondir")).unwrap();
        let (common, _) = worktree_admin_from_path(&wt).unwrap().unwrap();
        assert_eq!(common, store);
    }

    #[test]
    fn test_worktree_admin_from_regular_checkout() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(".git")).unwrap();
        assert!(worktree_admin_from_path(temp.path()).unwrap().is_none());
        let empty = TempDir::new().unwrap();
        assert!(worktree_admin_from_path(empty.path()).unwrap().is_none());
    }

    #[test]
    fn test_prune_branch_dir_keeps_occupied_dirs() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        layout::write_branch_meta(root, "feat/one").unwrap();
        fs::create_dir_all(layout::repo_worktree_path(root, "feat/one", "web")).unwrap();

        prune_branch_dir(root, "feat/one").unwrap();
        assert!(layout::branch_path(root, "feat/one").exists());

        fs::remove_dir_all(layout::repo_worktree_path(root, "feat/one", "web")).unwrap();
        prune_branch_dir(root, "feat/one").unwrap();
        assert!(!layout::branch_path(root, "feat/one").exists());

        // Absent dir is fine
        prune_branch_dir(root, "never").unwrap();
    }

    #[test]
    fn test_update_repo_remotes() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let defaults = Defaults::default();
        let mut ws = Workspace::init(root, "demo", None, &defaults).unwrap();
        let mut repo = RepoConfig {
            name: "api".to_string(),
            ..Default::default()
        };
        repo.apply_defaults(&defaults);
        ws.config.repos.push(repo);
        ws.save_config().unwrap();

        let err =
            update_repo_remotes(root, "api", &defaults, &RemoteUpdate::default()).unwrap_err();
        assert!(err.to_string().contains("at least one"));
        let update = RemoteUpdate {
            write_remote: Some("fork".to_string()),
            base_branch: Some("develop".to_string()),
            ..Default::default()
        };
        assert!(update_repo_remotes(root, "web", &defaults, &update).is_err());

        let config = update_repo_remotes(root, "api", &defaults, &update).unwrap();
        let remotes = &config.repo("api").unwrap().remotes;
        assert_eq!(remotes.write.name, "fork");
        assert_eq!(remotes.base.default_branch, "develop");
        assert_eq!(remotes.base.name, "origin", "untouched fields keep their value");

        let reloaded = Workspace::load(root, &defaults).unwrap();
        assert_eq!(reloaded.repo("api").unwrap().remotes, *remotes);
    }
}
