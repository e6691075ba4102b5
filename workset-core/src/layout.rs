//! On-disk layout of a workspace
//!
//! A workspace root holds one bare store per repository and one worktree per
//! `(repo, branch)` pair:
//!
//! ```text
//! <root>/workset.toml
//! <root>/.workset/state.json
//! <root>/.workset/gitdirs/<repo>.git
//! <root>/branches/<encoded branch>/.workset-branch
//! <root>/branches/<encoded branch>/<repo_dir>
//! ```
//!
//! Path and name computation never fails; degenerate input is normalized so
//! callers can always attempt cleanup.

use std::fs;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::Result;

/// Directory holding workspace-private state
pub const WORKSET_DIR: &str = ".workset";

/// Workspace config file name
pub const WORKSPACE_FILE: &str = "workset.toml";

/// Metadata file recording the literal branch name of a branch directory
pub const BRANCH_META_FILE: &str = ".workset-branch";

const STATE_FILE: &str = "state.json";
const GITDIRS_DIR: &str = "gitdirs";
const BRANCHES_DIR: &str = "branches";
const FALLBACK_NAME: &str = "branch";

/// `<root>/workset.toml`
pub fn workspace_file(root: &Path) -> PathBuf {
    root.join(WORKSPACE_FILE)
}

/// `<root>/.workset`
pub fn workset_dir(root: &Path) -> PathBuf {
    root.join(WORKSET_DIR)
}

/// `<root>/.workset/state.json`
pub fn state_path(root: &Path) -> PathBuf {
    workset_dir(root).join(STATE_FILE)
}

/// `<root>/.workset/gitdirs`
pub fn gitdirs_path(root: &Path) -> PathBuf {
    workset_dir(root).join(GITDIRS_DIR)
}

/// Bare store for a repository under a git dirs root
pub fn bare_store_path(gitdirs_root: &Path, repo_name: &str) -> PathBuf {
    gitdirs_root.join(format!("{repo_name}.git"))
}

/// Bare store for a repository inside a workspace
pub fn repo_store_path(root: &Path, repo_name: &str) -> PathBuf {
    bare_store_path(&gitdirs_path(root), repo_name)
}

/// `<root>/branches`
pub fn branches_path(root: &Path) -> PathBuf {
    root.join(BRANCHES_DIR)
}

/// Directory holding every repository's worktree for one branch
pub fn branch_path(root: &Path, branch: &str) -> PathBuf {
    branches_path(root).join(worktree_dir_name(branch))
}

/// Worktree of one repository on one branch
pub fn repo_worktree_path(root: &Path, branch: &str, repo_dir: &str) -> PathBuf {
    branch_path(root, branch).join(repo_dir)
}

/// Branch metadata file inside a branch directory
pub fn branch_meta_path(root: &Path, branch: &str) -> PathBuf {
    branch_path(root, branch).join(BRANCH_META_FILE)
}

/// Git-level worktree identifier for a branch
///
/// The branch is reduced to letters, digits and `-` for readability, then
/// suffixed with the first four bytes of the SHA-1 of the unsanitized name so
/// that `feat/one` and `feat_one` never share an admin entry.
pub fn worktree_name(branch: &str) -> String {
    let branch = if branch.is_empty() {
        FALLBACK_NAME
    } else {
        branch
    };
    format!("{}-{}", sanitize_worktree_name(branch), short_hash(branch))
}

/// Reversible directory name for a branch (`/` becomes `__`)
pub fn worktree_dir_name(branch: &str) -> String {
    if branch.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    branch.replace('/', "__")
}

/// Inverse of [`worktree_dir_name`]
pub fn branch_name_from_dir(dir: &str) -> String {
    dir.replace("__", "/")
}

/// Record the literal branch name in its branch directory
pub fn write_branch_meta(root: &Path, branch: &str) -> Result<()> {
    if branch.is_empty() {
        return Ok(());
    }
    fs::create_dir_all(branch_path(root, branch))?;
    fs::write(branch_meta_path(root, branch), branch)?;
    Ok(())
}

/// Read the branch name recorded in a branch directory
pub fn read_branch_meta(branch_dir: &Path) -> Result<Option<String>> {
    match fs::read_to_string(branch_dir.join(BRANCH_META_FILE)) {
        Ok(contents) => {
            let name = contents.trim();
            Ok((!name.is_empty()).then(|| name.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Branches that have a directory under `<root>/branches`, sorted
///
/// The metadata file wins over decoding the directory name. A missing
/// branches directory yields an empty list.
pub fn list_worktree_branches(root: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(branches_path(root)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut branches = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let branch = match read_branch_meta(&entry.path())? {
            Some(name) => name,
            None => branch_name_from_dir(&entry.file_name().to_string_lossy()),
        };
        branches.push(branch);
    }
    branches.sort();
    Ok(branches)
}

fn sanitize_worktree_name(branch: &str) -> String {
    let mut out = String::with_capacity(branch.len());
    let mut last_dash = false;
    for c in branch.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

fn short_hash(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_worktree_name_known_values() {
        assert_eq!(worktree_name("main"), "main-b28b7af6");
        assert_eq!(worktree_name("feat/one"), "feat-one-43f486aa");
        assert_eq!(worktree_name("feat_one"), "feat-one-58d0a646");
        assert_eq!(worktree_name(""), "branch-10d735e5");
    }

    #[test]
    fn test_worktree_name_is_stable_and_distinct() {
        assert_eq!(worktree_name("feature/x"), worktree_name("feature/x"));
        assert_ne!(worktree_name("feat/one"), worktree_name("feat_one"));
        assert_ne!(worktree_name("a"), worktree_name("b"));
    }

    #[test]
    fn test_worktree_name_never_empty_or_nested() {
        for branch in ["///", "---", "é/ü", "..", " ", "a//b", "-x-"] {
            let name = worktree_name(branch);
            assert!(!name.is_empty());
            assert!(!name.contains('/') && !name.contains('\\'), "{name}");
            assert!(!name.starts_with('-'), "{name}");
            let (prefix, hash) = name.rsplit_once('-').unwrap();
            assert!(!prefix.is_empty());
            assert_eq!(hash.len(), 8);
        }
        assert!(worktree_name("///").starts_with("branch-"));
    }

    #[test]
    fn test_sanitize_collapses_runs() {
        assert_eq!(sanitize_worktree_name("feat//one__two"), "feat-one-two");
        assert_eq!(sanitize_worktree_name("--lead"), "lead");
        assert_eq!(sanitize_worktree_name("Rel-2.0"), "Rel-2-0");
    }

    #[test]
    fn test_dir_name_round_trip() {
        for branch in ["main", "feat/one", "a/b/c", "release-1.0"] {
            assert_eq!(branch_name_from_dir(&worktree_dir_name(branch)), branch);
        }
        assert_eq!(worktree_dir_name(""), "branch");
    }

    #[test]
    fn test_paths() {
        let root = Path::new("/ws");
        assert_eq!(
            repo_worktree_path(root, "feat/one", "api"),
            PathBuf::from("/ws/branches/feat__one/api")
        );
        assert_eq!(
            repo_store_path(root, "api"),
            PathBuf::from("/ws/.workset/gitdirs/api.git")
        );
        assert_eq!(state_path(root), PathBuf::from("/ws/.workset/state.json"));
    }

    #[test]
    fn test_list_branches_prefers_metadata() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        assert!(list_worktree_branches(root).unwrap().is_empty());

        write_branch_meta(root, "feat/one").unwrap();
        fs::create_dir_all(branch_path(root, "fix/two")).unwrap();
        // A dir whose name decodes wrongly, rescued by its metadata file
        let odd = branches_path(root).join("odd__name");
        fs::create_dir_all(&odd).unwrap();
        fs::write(odd.join(BRANCH_META_FILE), "odd__name\n").unwrap();

        let branches = list_worktree_branches(root).unwrap();
        assert_eq!(branches, vec!["feat/one", "fix/two", "odd__name"]);
    }

    #[test]
    fn test_read_branch_meta_blank() {
        let temp = TempDir::new().unwrap();
        assert_eq!(read_branch_meta(temp.path()).unwrap(), None);
        fs::write(temp.path().join(BRANCH_META_FILE), "  \n").unwrap();
        assert_eq!(read_branch_meta(temp.path()).unwrap(), None);
    }
}
