//! Pre-removal safety reports
//!
//! For every branch worktree a repository has on disk, the checker records
//! whether it is dirty, whether the branch reached the base remote, and
//! whether the write remote holds all local commits. Individual failures are
//! attached to the entry they concern so that a report is always produced.
//!
//! The checker never changes refs or working trees; only `fetch` (when
//! requested) updates remote-tracking refs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Defaults;
use crate::git::{CallContext, GitPort};
use crate::layout;
use crate::workspace::{RepoConfig, State, Workspace};
use crate::{Error, Result};

/// Findings for one branch worktree of a repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BranchSafety {
    pub branch: String,
    pub path: PathBuf,
    pub dirty: bool,
    pub missing: bool,
    pub unmerged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unmerged_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unmerged_err: Option<String>,
    pub unpushed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unpushed_err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_base_err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_write_err: Option<String>,
    /// Result of the explicit content-merge confirmation, if it ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_merged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_merge_err: Option<String>,
}

impl BranchSafety {
    fn errors(&self) -> impl Iterator<Item = (&'static str, &String)> {
        [
            ("status", &self.status_err),
            ("fetch base", &self.fetch_base_err),
            ("fetch write", &self.fetch_write_err),
            ("merge check", &self.unmerged_err),
            ("push check", &self.unpushed_err),
            ("content check", &self.content_merge_err),
        ]
        .into_iter()
        .filter_map(|(label, err)| err.as_ref().map(|e| (label, e)))
    }
}

/// Findings for one repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepoSafetyReport {
    pub repo_name: String,
    /// Repository the refs were read from; `None` when nothing was on disk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refs_path: Option<PathBuf>,
    pub base_remote: String,
    pub base_branch: String,
    pub write_remote: String,
    pub branches: Vec<BranchSafety>,
}

/// Findings for every repository of a workspace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkspaceSafetyReport {
    pub root: PathBuf,
    pub repos: Vec<RepoSafetyReport>,
}

/// Inputs to [`check_repo_safety`]
pub struct RepoSafetyInput<'a> {
    pub workspace_root: &'a Path,
    pub repo: &'a RepoConfig,
    pub defaults: &'a Defaults,
    pub git: &'a dyn GitPort,
    /// Fetch the base and write remotes before checking
    pub fetch_remotes: bool,
    /// Bound for each fetch, on top of the caller's context
    pub fetch_timeout: Option<Duration>,
}

/// Inputs to [`check_workspace_safety`]
pub struct WorkspaceSafetyInput<'a> {
    pub workspace_root: &'a Path,
    pub defaults: &'a Defaults,
    pub git: &'a dyn GitPort,
    pub fetch_remotes: bool,
    pub fetch_timeout: Option<Duration>,
}

/// Branches to inspect: the branch directories on disk, or the workspace's
/// current branch when no branch directory exists yet
fn candidate_branches(root: &Path, defaults: &Defaults) -> Result<Vec<String>> {
    if layout::branches_path(root).is_dir() {
        return layout::list_worktree_branches(root);
    }
    let current = State::read(root)
        .map(|s| s.current_branch)
        .unwrap_or_else(|| defaults.base_branch.clone());
    Ok(vec![current])
}

fn fetch_ctx(ctx: &CallContext, timeout: Option<Duration>) -> CallContext {
    match timeout {
        Some(t) => ctx.child_with_timeout(t),
        None => ctx.clone(),
    }
}

/// Build the safety report for one repository
///
/// Fails only on missing inputs or when the branch directories cannot be
/// read; per-branch and per-check failures land in the report.
pub fn check_repo_safety(ctx: &CallContext, input: &RepoSafetyInput<'_>) -> Result<RepoSafetyReport> {
    if input.workspace_root.as_os_str().is_empty() {
        return Err(Error::Config("workspace root required".to_string()));
    }
    if input.repo.name.is_empty() {
        return Err(Error::Config("repo name required".to_string()));
    }
    ctx.check()?;

    let repo = input.repo.with_defaults(input.defaults);
    let git = input.git;
    let base = &repo.remotes.base;
    let write = &repo.remotes.write;

    let mut report = RepoSafetyReport {
        repo_name: repo.name.clone(),
        refs_path: repo.local_path.clone(),
        base_remote: base.name.clone(),
        base_branch: base.default_branch.clone(),
        write_remote: write.name.clone(),
        branches: Vec::new(),
    };

    for branch in candidate_branches(input.workspace_root, input.defaults)? {
        let path = layout::repo_worktree_path(input.workspace_root, &branch, &repo.repo_dir);
        if !path.exists() {
            continue;
        }
        let mut entry = BranchSafety {
            branch,
            path,
            ..Default::default()
        };
        match git.status(&entry.path) {
            Ok(status) => {
                entry.dirty = status.dirty;
                entry.missing = status.missing;
            }
            Err(e) => entry.status_err = Some(e.to_string()),
        }
        if report.refs_path.is_none() && !entry.missing {
            report.refs_path = Some(entry.path.clone());
        }
        report.branches.push(entry);
    }

    let Some(refs_path) = report.refs_path.clone() else {
        debug!(repo = %repo.name, "No repository on disk, nothing to check");
        return Ok(report);
    };

    if input.fetch_remotes {
        if !base.name.is_empty() {
            if let Err(e) = git.fetch(&fetch_ctx(ctx, input.fetch_timeout), &refs_path, &base.name) {
                warn!(repo = %repo.name, remote = %base.name, error = %e, "Fetch failed");
                let msg = e.to_string();
                for entry in &mut report.branches {
                    entry.fetch_base_err = Some(msg.clone());
                }
            }
        }
        if !write.name.is_empty() && write.name != base.name {
            if let Err(e) = git.fetch(&fetch_ctx(ctx, input.fetch_timeout), &refs_path, &write.name) {
                warn!(repo = %repo.name, remote = %write.name, error = %e, "Fetch failed");
                let msg = e.to_string();
                for entry in &mut report.branches {
                    entry.fetch_write_err = Some(msg.clone());
                }
            }
        }
    }
    ctx.check()?;

    let base_ref = (!base.name.is_empty() && !base.default_branch.is_empty())
        .then(|| format!("refs/remotes/{}/{}", base.name, base.default_branch));

    // Whether the base ref can be used at all; an error here is reported per entry
    let base_available: std::result::Result<bool, String> = match &base_ref {
        Some(r) => git.reference_exists(&refs_path, r).map_err(|e| e.to_string()),
        None => Ok(false),
    };

    for entry in report.branches.iter_mut().filter(|e| !e.missing) {
        let branch_ref = format!("refs/heads/{}", entry.branch);

        let mut base_checked = false;
        match (&base_ref, &base_available) {
            (Some(base_ref), Ok(true)) => match git.is_ancestor(&refs_path, &branch_ref, base_ref) {
                Ok(true) => base_checked = true,
                Ok(false) => {
                    base_checked = true;
                    entry.unmerged = true;
                    entry.unmerged_reason = Some(format!(
                        "{} is not merged into {}/{}",
                        entry.branch, base.name, base.default_branch
                    ));
                }
                Err(e) => entry.unmerged_err = Some(e.to_string()),
            },
            (Some(base_ref), Ok(false)) => {
                entry.unmerged_err = Some(format!("base ref {base_ref} not found"));
            }
            (Some(_), Err(e)) => entry.unmerged_err = Some(e.clone()),
            (None, _) => {}
        }

        if write.name.is_empty() {
            continue;
        }
        let remote_ref = format!("refs/remotes/{}/{}", write.name, entry.branch);
        match git.reference_exists(&refs_path, &remote_ref) {
            // Local commits missing from the remote; a remote that is ahead loses nothing
            Ok(true) => match git.is_ancestor(&refs_path, &branch_ref, &remote_ref) {
                Ok(contained) => entry.unpushed = !contained,
                Err(e) => entry.unpushed_err = Some(e.to_string()),
            },
            // Never pushed: only a problem if the work has not landed in base either
            Ok(false) => entry.unpushed = entry.unmerged || !base_checked,
            Err(e) => entry.unpushed_err = Some(e.to_string()),
        }
    }

    info!(
        repo = %report.repo_name,
        branches = report.branches.len(),
        "Safety check complete"
    );
    Ok(report)
}

/// Build safety reports for every repository of a workspace, in config order
pub fn check_workspace_safety(
    ctx: &CallContext,
    input: &WorkspaceSafetyInput<'_>,
) -> Result<WorkspaceSafetyReport> {
    let workspace = Workspace::load(input.workspace_root, input.defaults)?;
    let mut report = WorkspaceSafetyReport {
        root: workspace.root.clone(),
        repos: Vec::with_capacity(workspace.config.repos.len()),
    };
    for repo in &workspace.config.repos {
        report.repos.push(check_repo_safety(
            ctx,
            &RepoSafetyInput {
                workspace_root: input.workspace_root,
                repo,
                defaults: input.defaults,
                git: input.git,
                fetch_remotes: input.fetch_remotes,
                fetch_timeout: input.fetch_timeout,
            },
        )?);
    }
    Ok(report)
}

impl RepoSafetyReport {
    /// Run the content-merge check for every unmerged branch
    ///
    /// This is the check a caller runs before overriding a refusal: it fills
    /// `content_merged` / `content_merge_err` and leaves `unmerged` as is.
    pub fn confirm_content_merged(&mut self, ctx: &CallContext, git: &dyn GitPort) -> Result<()> {
        let Some(refs_path) = self.refs_path.clone() else {
            return Ok(());
        };
        if self.base_remote.is_empty() || self.base_branch.is_empty() {
            return Ok(());
        }
        let base_ref = format!("refs/remotes/{}/{}", self.base_remote, self.base_branch);

        for entry in self.branches.iter_mut().filter(|e| e.unmerged) {
            ctx.check()?;
            let branch_ref = format!("refs/heads/{}", entry.branch);
            match git.is_content_merged(ctx, &refs_path, &branch_ref, &base_ref) {
                Ok(merged) => {
                    debug!(repo = %self.repo_name, branch = %entry.branch, merged, "Content check");
                    entry.content_merged = Some(merged);
                }
                Err(e @ (Error::Cancelled | Error::TimedOut(_))) => return Err(e),
                Err(e) => entry.content_merge_err = Some(e.to_string()),
            }
        }
        Ok(())
    }

    /// Condensed view of the report
    pub fn summary(&self) -> SafetySummary {
        let mut summary = SafetySummary::default();
        summary.add(None, self);
        summary
    }
}

impl WorkspaceSafetyReport {
    /// Run [`RepoSafetyReport::confirm_content_merged`] for every repository
    pub fn confirm_content_merged(&mut self, ctx: &CallContext, git: &dyn GitPort) -> Result<()> {
        for repo in &mut self.repos {
            repo.confirm_content_merged(ctx, git)?;
        }
        Ok(())
    }

    /// Condensed view across repositories; names are `repo:branch`
    pub fn summary(&self) -> SafetySummary {
        let mut summary = SafetySummary::default();
        for repo in &self.repos {
            summary.add(Some(&repo.repo_name), repo);
        }
        summary
    }
}

/// A branch that failed the ancestry check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmergedBranch {
    pub name: String,
    pub reason: String,
    pub content_merged: Option<bool>,
}

/// Branch lists a removal command acts on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SafetySummary {
    pub dirty: Vec<String>,
    pub unmerged: Vec<UnmergedBranch>,
    pub unpushed: Vec<String>,
    /// Every recorded check failure, one line each
    pub warnings: Vec<String>,
}

impl SafetySummary {
    fn add(&mut self, repo: Option<&str>, report: &RepoSafetyReport) {
        for entry in &report.branches {
            let name = match repo {
                Some(repo) => format!("{}:{}", repo, entry.branch),
                None => entry.branch.clone(),
            };
            if entry.dirty {
                self.dirty.push(name.clone());
            }
            if entry.unmerged {
                self.unmerged.push(UnmergedBranch {
                    name: name.clone(),
                    reason: entry
                        .unmerged_reason
                        .clone()
                        .unwrap_or_else(|| "not merged".to_string()),
                    content_merged: entry.content_merged,
                });
            }
            if entry.unpushed {
                self.unpushed.push(name.clone());
            }
            for (label, err) in entry.errors() {
                self.warnings.push(format!("{name}: {label} failed: {err}"));
            }
        }
    }

    /// True when nothing blocks a destructive action
    pub fn is_clean(&self) -> bool {
        !self.blocks_removal(false)
    }

    /// Whether dirty, unmerged or unpushed findings should stop a removal
    ///
    /// With `allow_content_merged`, unmerged branches whose content was
    /// confirmed present in base do not block.
    pub fn blocks_removal(&self, allow_content_merged: bool) -> bool {
        !self.dirty.is_empty()
            || !self.unpushed.is_empty()
            || self
                .unmerged
                .iter()
                .any(|u| !(allow_content_merged && u.content_merged == Some(true)))
    }

    /// `branch: reason` lines for unmerged branches
    pub fn unmerged_details(&self) -> Vec<String> {
        self.unmerged
            .iter()
            .map(|u| match u.content_merged {
                Some(true) => format!("{}: {} (content already in base)", u.name, u.reason),
                _ => format!("{}: {}", u.name, u.reason),
            })
            .collect()
    }

    /// One line per blocking finding
    pub fn blocking_details(&self, allow_content_merged: bool) -> Vec<String> {
        let mut details: Vec<String> = self
            .dirty
            .iter()
            .map(|b| format!("{b}: uncommitted changes"))
            .collect();
        details.extend(
            self.unmerged
                .iter()
                .filter(|u| !(allow_content_merged && u.content_merged == Some(true)))
                .map(|u| format!("{}: {}", u.name, u.reason)),
        );
        details.extend(
            self.unpushed
                .iter()
                .map(|b| format!("{b}: commits not pushed")),
        );
        details
    }
}
