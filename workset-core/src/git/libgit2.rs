//! GitPort backed by embedded libgit2
//!
//! Repositories are opened per call, so the backend itself holds no handles
//! and is freely shared across threads.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use git2::build::RepoBuilder;
use git2::{
    BranchType, Cred, Delta, DiffFindOptions, DiffOptions, ErrorCode, FetchOptions, FileMode,
    Oid, RemoteCallbacks, Repository, Status, StatusOptions, WorktreeLockStatus,
    WorktreePruneOptions,
};
use tracing::debug;

use super::content_merge::ContentMergeDetector;
use super::{
    wrap_auth_error, CallContext, ChangeKind, ChangeSide, GitPort, ObjectId, StatusSummary,
    TreeChange, TreeEntry, TreeReader, WorktreeAddOptions,
};
use crate::{Error, Result};

/// Credential callback invocations before giving up on a remote
const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

/// Git driven through libgit2
#[derive(Debug, Clone)]
pub struct Libgit2 {
    command_timeout: Duration,
}

impl Default for Libgit2 {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl Libgit2 {
    /// Create a backend; `command_timeout` bounds calls made without a
    /// context
    ///
    /// libgit2 calls cannot be interrupted, so the deadline is checked
    /// between steps and a single long call still runs to completion.
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    fn default_ctx(&self) -> CallContext {
        CallContext::with_timeout(self.command_timeout)
    }
}

fn open(path: &Path) -> Result<Repository> {
    Ok(Repository::discover(path)?)
}

/// Shared git dir: the repo's own dir unless it was opened from a linked
/// worktree, whose `commondir` file points back at the owner
fn common_dir(repo: &Repository) -> Result<PathBuf> {
    let git_dir = repo.path();
    match fs::read_to_string(git_dir.join("commondir")) {
        Ok(contents) => {
            let target = PathBuf::from(contents.trim());
            Ok(if target.is_absolute() {
                target
            } else {
                git_dir.join(target)
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(git_dir.to_path_buf()),
        Err(e) => Err(e.into()),
    }
}

fn is_not_found(e: &git2::Error) -> bool {
    matches!(e.code(), ErrorCode::NotFound | ErrorCode::InvalidSpec)
}

fn commit_id(repo: &Repository, rev: &str) -> Result<Oid> {
    Ok(repo.revparse_single(rev)?.peel_to_commit()?.id())
}

fn file_mode(mode: FileMode) -> u32 {
    #[allow(unreachable_patterns)]
    match mode {
        FileMode::Unreadable => 0,
        FileMode::Tree => 0o040000,
        FileMode::Blob => 0o100644,
        FileMode::BlobGroupWritable => 0o100664,
        FileMode::BlobExecutable => 0o100755,
        FileMode::Link => 0o120000,
        FileMode::Commit => 0o160000,
        _ => 0,
    }
}

fn path_string(path: Option<&Path>) -> Result<String> {
    path.map(|p| p.to_string_lossy().replace('\\', "/"))
        .ok_or_else(|| Error::Other("diff entry without a path".to_string()))
}

fn diff_side(file: &git2::DiffFile<'_>) -> Result<Option<ChangeSide>> {
    Ok(Some(ChangeSide {
        path: path_string(file.path())?,
        entry: TreeEntry {
            mode: file_mode(file.mode()),
            id: file.id().into(),
        },
    }))
}

/// Callbacks that stop transfers once the context is done and only offer
/// non-interactive credentials
fn remote_callbacks<'a>(ctx: &'a CallContext, config: Option<git2::Config>) -> RemoteCallbacks<'a> {
    let attempts = Cell::new(0u32);
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username, allowed| {
        attempts.set(attempts.get() + 1);
        if attempts.get() > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::from_str(
                "authentication failed: no usable credentials",
            ));
        }
        if allowed.is_ssh_key() {
            if let Some(user) = username {
                return Cred::ssh_key_from_agent(user);
            }
        }
        if allowed.is_user_pass_plaintext() {
            if let Some(cfg) = &config {
                if let Ok(cred) = Cred::credential_helper(cfg, url, username) {
                    return Ok(cred);
                }
            }
        }
        if allowed.is_username() {
            return Cred::username(username.unwrap_or("git"));
        }
        Cred::default()
    });
    callbacks.transfer_progress(move |_| !ctx.is_done());
    callbacks.sideband_progress(move |_| !ctx.is_done());
    callbacks
}

/// Prefer the context's error when a transfer was aborted by it
fn network_error(ctx: &CallContext, e: git2::Error) -> Error {
    match ctx.check() {
        Err(ctx_err) => ctx_err,
        Ok(()) => wrap_auth_error(Error::Git(e)),
    }
}

impl GitPort for Libgit2 {
    fn status(&self, path: &Path) -> Result<StatusSummary> {
        let missing = StatusSummary {
            dirty: false,
            missing: true,
        };
        if !path.exists() {
            return Ok(missing);
        }
        let ctx = self.default_ctx();
        let repo = match Repository::discover(path) {
            Ok(repo) => repo,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Not a repository");
                return Ok(missing);
            }
        };

        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .include_ignored(false)
            .recurse_untracked_dirs(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        let mut dirty = false;
        for entry in statuses.iter() {
            ctx.check()?;
            if !entry.status().is_empty() && !entry.status().contains(Status::IGNORED) {
                dirty = true;
                break;
            }
        }
        ctx.check()?;
        Ok(StatusSummary {
            dirty,
            missing: false,
        })
    }

    fn is_repo(&self, path: &Path) -> Result<bool> {
        match Repository::discover(path) {
            Ok(repo) => Ok(!repo.is_bare()),
            Err(_) => Ok(false),
        }
    }

    fn reference_exists(&self, repo: &Path, reference: &str) -> Result<bool> {
        let repo = open(repo)?;
        let found = match repo.find_reference(reference) {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        };
        found
    }

    fn fetch(&self, ctx: &CallContext, repo: &Path, remote: &str) -> Result<()> {
        if remote.is_empty() {
            return Err(Error::Config("remote name required".to_string()));
        }
        ctx.check()?;
        let repo = open(repo)?;
        let mut handle = repo.find_remote(remote)?;

        let mut opts = FetchOptions::new();
        opts.remote_callbacks(remote_callbacks(ctx, repo.config().ok()))
            .update_fetchhead(false);

        debug!(remote, "Fetching with libgit2");
        handle
            .fetch(&[] as &[&str], Some(&mut opts), None)
            .map_err(|e| network_error(ctx, e))
    }

    fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
        let ctx = self.default_ctx();
        let repo = open(repo)?;
        let ancestor = commit_id(&repo, ancestor)?;
        let descendant = commit_id(&repo, descendant)?;
        if ancestor == descendant {
            return Ok(true);
        }
        ctx.check()?;
        let merged = repo.graph_descendant_of(descendant, ancestor)?;
        ctx.check()?;
        Ok(merged)
    }

    fn is_content_merged(
        &self,
        ctx: &CallContext,
        repo: &Path,
        branch: &str,
        base: &str,
    ) -> Result<bool> {
        ContentMergeDetector::new(self).is_content_merged(ctx, repo, branch, base)
    }

    fn worktree_add(&self, ctx: &CallContext, opts: &WorktreeAddOptions) -> Result<()> {
        opts.validate()?;
        ctx.check()?;
        let repo = open(&opts.repo_path)?;

        let existing = repo.worktrees()?;
        if existing.iter().flatten().any(|n| n == opts.worktree_name) {
            return Err(Error::Config(format!(
                "worktree {} already exists",
                opts.worktree_name
            )));
        }

        let branch = match repo.find_branch(&opts.branch_name, BranchType::Local) {
            Ok(branch) => branch,
            Err(e) if is_not_found(&e) => {
                let start = start_commit(&repo, opts)?;
                debug!(branch = %opts.branch_name, start = %start.id(), "Creating branch");
                repo.branch(&opts.branch_name, &start, false)?
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = opts.worktree_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let reference = branch.into_reference();
        let mut add = git2::WorktreeAddOptions::new();
        add.reference(Some(&reference));
        repo.worktree(&opts.worktree_name, &opts.worktree_path, Some(&add))?;
        Ok(())
    }

    fn worktree_remove(&self, repo: &Path, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Config("worktree name required".to_string()));
        }
        let repo = open(repo)?;
        let admin = common_dir(&repo)?.join("worktrees").join(name);
        if !admin.is_dir() {
            return Err(Error::WorktreeNotFound(name.to_string()));
        }

        let worktree = match repo.find_worktree(name) {
            Ok(wt) => wt,
            Err(e) if is_not_found(&e) => return Err(Error::WorktreeNotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        };
        if let WorktreeLockStatus::Locked(reason) = worktree.is_locked()? {
            return Err(Error::Other(format!(
                "worktree {} is locked{}",
                name,
                reason.map(|r| format!(": {r}")).unwrap_or_default()
            )));
        }

        let mut prune = WorktreePruneOptions::new();
        prune.valid(true).working_tree(true);
        worktree.prune(Some(&mut prune))?;
        debug!(name, "Pruned worktree");
        Ok(())
    }

    fn worktree_list(&self, repo: &Path) -> Result<Vec<String>> {
        self.default_ctx().check()?;
        let repo = open(repo)?;
        let mut names: Vec<String> = repo
            .worktrees()?
            .iter()
            .flatten()
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    fn remote_exists(&self, repo: &Path, remote: &str) -> Result<bool> {
        let repo = open(repo)?;
        let found = match repo.find_remote(remote) {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        };
        found
    }

    fn current_branch(&self, repo: &Path) -> Result<Option<String>> {
        let repo = open(repo)?;
        let head = repo.find_reference("HEAD")?;
        Ok(head
            .symbolic_target()
            .and_then(|target| target.strip_prefix("refs/heads/"))
            .map(str::to_string))
    }

    fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<()> {
        let repo = open(repo)?;
        let added = match repo.remote(name, url) {
            Ok(_) => Ok(()),
            Err(e) if e.code() == ErrorCode::Exists => Ok(()),
            Err(e) => Err(e.into()),
        };
        added
    }

    fn clone_repo(&self, ctx: &CallContext, url: &str, path: &Path, remote: &str) -> Result<()> {
        clone(ctx, url, path, remote, false)
    }

    fn clone_bare(&self, ctx: &CallContext, url: &str, path: &Path, remote: &str) -> Result<()> {
        clone(ctx, url, path, remote, true)
    }
}

fn clone(ctx: &CallContext, url: &str, path: &Path, remote: &str, bare: bool) -> Result<()> {
    let remote = if remote.is_empty() { "origin" } else { remote };
    ctx.check()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let config = git2::Config::open_default().ok();
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(remote_callbacks(ctx, config));

    let refspec = format!("+refs/heads/*:refs/remotes/{remote}/*");
    let mut builder = RepoBuilder::new();
    builder
        .bare(bare)
        .fetch_options(fetch)
        .remote_create(|repo, _name, url| repo.remote_with_fetch(remote, url, &refspec));

    debug!(url, path = %path.display(), bare, "Cloning with libgit2");
    builder.clone(url, path).map_err(|e| network_error(ctx, e))?;
    Ok(())
}

/// Remote ref, then local branch, then HEAD
fn start_commit<'r>(repo: &'r Repository, opts: &WorktreeAddOptions) -> Result<git2::Commit<'r>> {
    let mut candidates: Vec<String> = Vec::new();
    if !opts.start_branch.is_empty() {
        if !opts.start_remote.is_empty() {
            candidates.push(format!(
                "refs/remotes/{}/{}",
                opts.start_remote, opts.start_branch
            ));
        }
        candidates.push(format!("refs/heads/{}", opts.start_branch));
    }

    for name in &candidates {
        match repo.find_reference(name) {
            Ok(reference) => return Ok(reference.peel_to_commit()?),
            Err(e) if is_not_found(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(repo.head()?.peel_to_commit()?)
}

impl TreeReader for Libgit2 {
    fn tree_id(&self, ctx: &CallContext, repo: &Path, rev: &str) -> Result<ObjectId> {
        ctx.check()?;
        let repo = open(repo)?;
        let tree = repo.revparse_single(rev)?.peel_to_tree()?;
        Ok(tree.id().into())
    }

    fn merge_bases(
        &self,
        ctx: &CallContext,
        repo: &Path,
        a: &str,
        b: &str,
    ) -> Result<Vec<ObjectId>> {
        ctx.check()?;
        let repo = open(repo)?;
        let a = commit_id(&repo, a)?;
        let b = commit_id(&repo, b)?;
        match repo.merge_bases(a, b) {
            Ok(bases) => Ok(bases.iter().map(|oid| ObjectId::from(*oid)).collect()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn diff_trees(
        &self,
        ctx: &CallContext,
        repo: &Path,
        from: &str,
        to: &str,
    ) -> Result<Vec<TreeChange>> {
        ctx.check()?;
        let repo = open(repo)?;
        let old = repo.revparse_single(from)?.peel_to_tree()?;
        let new = repo.revparse_single(to)?.peel_to_tree()?;

        let mut opts = DiffOptions::new();
        opts.include_typechange(true);
        let mut diff = repo.diff_tree_to_tree(Some(&old), Some(&new), Some(&mut opts))?;

        let mut find = DiffFindOptions::new();
        find.renames(true).exact_match_only(true);
        diff.find_similar(Some(&mut find))?;
        ctx.check()?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            let (kind, old, new) = match delta.status() {
                Delta::Added => (ChangeKind::Added, None, diff_side(&delta.new_file())?),
                Delta::Deleted => (ChangeKind::Deleted, diff_side(&delta.old_file())?, None),
                Delta::Modified => (
                    ChangeKind::Modified,
                    diff_side(&delta.old_file())?,
                    diff_side(&delta.new_file())?,
                ),
                Delta::Typechange => (
                    ChangeKind::TypeChanged,
                    diff_side(&delta.old_file())?,
                    diff_side(&delta.new_file())?,
                ),
                Delta::Renamed => (
                    ChangeKind::Renamed,
                    diff_side(&delta.old_file())?,
                    diff_side(&delta.new_file())?,
                ),
                Delta::Copied => (
                    ChangeKind::Copied,
                    diff_side(&delta.old_file())?,
                    diff_side(&delta.new_file())?,
                ),
                Delta::Unmodified => continue,
                other => {
                    return Err(Error::Other(format!(
                        "unsupported tree delta {:?}",
                        other
                    )))
                }
            };
            changes.push(TreeChange { kind, old, new });
        }
        Ok(changes)
    }

    fn tree_entries(
        &self,
        ctx: &CallContext,
        repo: &Path,
        rev: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, TreeEntry>> {
        ctx.check()?;
        let repo = open(repo)?;
        let tree = repo.revparse_single(rev)?.peel_to_tree()?;

        let mut entries = BTreeMap::new();
        for path in paths {
            match tree.get_path(&PathBuf::from(path)) {
                Ok(entry) => {
                    entries.insert(
                        path.clone(),
                        TreeEntry {
                            mode: entry.filemode() as u32,
                            id: entry.id().into(),
                        },
                    );
                }
                Err(e) if e.code() == ErrorCode::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }

    fn tree_in_history(
        &self,
        ctx: &CallContext,
        repo: &Path,
        rev: &str,
        tree: &ObjectId,
        hide: &[ObjectId],
    ) -> Result<bool> {
        let repo = open(repo)?;
        let target = Oid::from_str(tree.as_str())?;

        let mut walk = repo.revwalk()?;
        walk.push(commit_id(&repo, rev)?)?;
        for id in hide {
            walk.hide(Oid::from_str(id.as_str())?)?;
        }

        for oid in walk {
            ctx.check()?;
            if repo.find_commit(oid?)?.tree_id() == target {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_mode_matches_git_octal() {
        assert_eq!(file_mode(FileMode::Blob), 0o100644);
        assert_eq!(file_mode(FileMode::BlobExecutable), 0o100755);
        assert_eq!(file_mode(FileMode::Link), 0o120000);
        assert_eq!(file_mode(FileMode::Commit), 0o160000);
        assert_eq!(file_mode(FileMode::Tree), 0o040000);
    }

    #[test]
    fn test_status_of_missing_path() {
        let backend = Libgit2::default();
        let status = backend
            .status(Path::new("/definitely/not/here/workset"))
            .unwrap();
        assert!(status.missing);
        assert!(!status.dirty);
    }

    #[test]
    fn test_command_timeout_bounds_status() {
        let temp = tempfile::TempDir::new().unwrap();
        Repository::init(temp.path()).unwrap();

        let err = Libgit2::new(Duration::ZERO).status(temp.path()).unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)), "{err}");
        assert!(!Libgit2::default().status(temp.path()).unwrap().missing);
    }

    #[test]
    fn test_common_dir_of_plain_repo() {
        let temp = tempfile::TempDir::new().unwrap();
        let repo = Repository::init_bare(temp.path().join("store.git")).unwrap();
        assert_eq!(common_dir(&repo).unwrap(), repo.path());
    }
}
