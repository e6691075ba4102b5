//! Git access for workset
//!
//! [`GitPort`] is the narrow set of git operations the rest of the crate
//! needs. Two interchangeable backends implement it: [`CliGit`] drives the
//! `git` executable and [`Libgit2`] uses the embedded library. Both also
//! implement [`TreeReader`], which is all the content-merge detector needs.

mod cli;
pub mod content_merge;
mod libgit2;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::{GitBackendKind, GitSettings};
use crate::{Error, Result};

pub use cli::CliGit;
pub(crate) use cli::parse_gitdir_file;
pub use content_merge::ContentMergeDetector;
pub use libgit2::Libgit2;

/// Cancellation and deadline for a git call
///
/// Cloning shares the cancellation token; a child context is cancelled when
/// its parent is.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl CallContext {
    /// A context with no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now().checked_add(timeout),
            timeout: Some(timeout),
        }
    }

    /// A child that is cancelled with this context and expires at the
    /// earlier of the two deadlines
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now().checked_add(timeout);
        let (deadline, timeout) = match (self.deadline, own) {
            (Some(parent), Some(child)) if parent <= child => (Some(parent), self.timeout),
            (_, Some(child)) => (Some(child), Some(timeout)),
            (parent, None) => (parent, self.timeout),
        };
        Self {
            token: self.token.child_token(),
            deadline,
            timeout,
        }
    }

    /// Cancel this context and every child
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Token for wiring into async code
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err` once cancelled or past the deadline
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::TimedOut(self.timeout.unwrap_or_default()));
            }
        }
        Ok(())
    }

    /// True once cancelled or past the deadline
    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }
}

/// Working-tree status of a path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
    /// Staged, unstaged or untracked changes exist
    pub dirty: bool,
    /// The path does not exist or is not inside a repository
    pub missing: bool,
}

/// Inputs to [`GitPort::worktree_add`]
#[derive(Debug, Clone, Default)]
pub struct WorktreeAddOptions {
    /// Repository that owns the worktree (bare store or checkout)
    pub repo_path: PathBuf,
    /// Directory to check the worktree out into
    pub worktree_path: PathBuf,
    /// Admin entry name, see [`crate::layout::worktree_name`]
    pub worktree_name: String,
    /// Branch to create or attach
    pub branch_name: String,
    /// Remote to start a new branch from, if any
    pub start_remote: String,
    /// Branch on `start_remote` (or local) to start from
    pub start_branch: String,
}

impl WorktreeAddOptions {
    /// Reject options with an empty required field
    pub(crate) fn validate(&self) -> Result<()> {
        let missing = if self.repo_path.as_os_str().is_empty() {
            Some("repo path")
        } else if self.worktree_path.as_os_str().is_empty() {
            Some("worktree path")
        } else if self.worktree_name.is_empty() {
            Some("worktree name")
        } else if self.branch_name.is_empty() {
            Some("branch name")
        } else {
            None
        };
        match missing {
            Some(field) => Err(Error::Config(format!("{field} required"))),
            None => Ok(()),
        }
    }
}

/// Operations the workspace layer performs against a repository
///
/// `repo` arguments accept a working tree, a bare store or a worktree path.
pub trait GitPort: Send + Sync {
    /// Dirty/missing summary for a worktree path
    fn status(&self, path: &Path) -> Result<StatusSummary>;

    /// True when `path` lies inside a working tree
    fn is_repo(&self, path: &Path) -> Result<bool>;

    /// True when the fully qualified reference resolves
    fn reference_exists(&self, repo: &Path, reference: &str) -> Result<bool>;

    /// Fetch one remote using its configured refspecs
    fn fetch(&self, ctx: &CallContext, repo: &Path, remote: &str) -> Result<()>;

    /// True when `ancestor` is reachable from `descendant`
    fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool>;

    /// True when the content of `branch` already exists in `base`
    fn is_content_merged(
        &self,
        ctx: &CallContext,
        repo: &Path,
        branch: &str,
        base: &str,
    ) -> Result<bool>;

    /// Create (or attach) a branch and check it out as a named worktree
    fn worktree_add(&self, ctx: &CallContext, opts: &WorktreeAddOptions) -> Result<()>;

    /// Remove a worktree and its admin entry
    ///
    /// Returns [`Error::WorktreeNotFound`] when no admin entry named `name`
    /// exists.
    fn worktree_remove(&self, repo: &Path, name: &str) -> Result<()>;

    /// Sorted admin entry names
    fn worktree_list(&self, repo: &Path) -> Result<Vec<String>>;

    /// True when a remote of that name is configured
    fn remote_exists(&self, repo: &Path, remote: &str) -> Result<bool>;

    /// Checked-out branch, `None` when HEAD is detached
    fn current_branch(&self, repo: &Path) -> Result<Option<String>>;

    /// Configure a remote; an existing remote of that name is left as is
    fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<()>;

    /// Clone with a working tree
    fn clone_repo(&self, ctx: &CallContext, url: &str, path: &Path, remote: &str) -> Result<()>;

    /// Clone into a bare store whose fetches populate remote-tracking refs
    fn clone_bare(&self, ctx: &CallContext, url: &str, path: &Path, remote: &str) -> Result<()>;
}

/// Build the configured backend
pub fn backend(settings: &GitSettings) -> Arc<dyn GitPort> {
    match settings.backend {
        GitBackendKind::Cli => Arc::new(CliGit::new(&settings.git_path, settings.command_timeout)),
        GitBackendKind::Libgit2 => Arc::new(Libgit2::new(settings.command_timeout)),
    }
}

/// A git object id in hex form
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wrap a hex id, normalizing case and whitespace
    pub fn new(hex: impl AsRef<str>) -> Self {
        Self(hex.as_ref().trim().to_ascii_lowercase())
    }

    /// Hex form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<git2::Oid> for ObjectId {
    fn from(oid: git2::Oid) -> Self {
        Self(oid.to_string())
    }
}

/// A tree entry as seen through a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Unix file mode (`0o100644`, `0o120000`, ...)
    pub mode: u32,
    /// Blob, tree or commit id
    pub id: ObjectId,
}

/// One side of a tree change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSide {
    /// Path relative to the tree root
    pub path: String,
    /// Entry at that path
    pub entry: TreeEntry,
}

/// Classification of a change between two trees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    TypeChanged,
    Renamed,
    Copied,
}

/// A single path-level change between two trees
///
/// `old` is absent for additions, `new` is absent for deletions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub kind: ChangeKind,
    pub old: Option<ChangeSide>,
    pub new: Option<ChangeSide>,
}

/// Read-only tree and history queries used by [`ContentMergeDetector`]
pub trait TreeReader {
    /// Root tree id of a revision
    fn tree_id(&self, ctx: &CallContext, repo: &Path, rev: &str) -> Result<ObjectId>;

    /// Every merge base of two revisions; empty when unrelated
    fn merge_bases(&self, ctx: &CallContext, repo: &Path, a: &str, b: &str)
        -> Result<Vec<ObjectId>>;

    /// Recursive changes from `from` to `to`, with exact renames detected
    fn diff_trees(&self, ctx: &CallContext, repo: &Path, from: &str, to: &str)
        -> Result<Vec<TreeChange>>;

    /// Entries at `paths` in the tree of `rev`; absent paths are omitted
    fn tree_entries(
        &self,
        ctx: &CallContext,
        repo: &Path,
        rev: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, TreeEntry>>;

    /// True when a commit reachable from `rev` but not from `hide` has root
    /// tree `tree`
    fn tree_in_history(
        &self,
        ctx: &CallContext,
        repo: &Path,
        rev: &str,
        tree: &ObjectId,
        hide: &[ObjectId],
    ) -> Result<bool>;
}

/// Add a hint to network failures that look like ssh authentication problems
pub(crate) fn wrap_auth_error(err: Error) -> Error {
    let text = err.to_string();
    let lower = text.to_ascii_lowercase();
    let looks_like_auth = lower.contains("permission denied (publickey")
        || lower.contains("authentication failed")
        || lower.contains("authentication required")
        || lower.contains("could not read from remote repository")
        || lower.contains("no supported authentication methods");
    if !looks_like_auth {
        return err;
    }
    let hint = if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        "SSH_AUTH_SOCK is not set; start an ssh-agent and add your key"
    } else {
        "check that your ssh-agent holds a key accepted by the remote"
    };
    Error::Other(format!("{text} (hint: {hint})"))
}
