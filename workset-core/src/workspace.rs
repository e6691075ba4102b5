//! Workspace and repository model
//!
//! A workspace is a directory holding `workset.toml` (the repo list),
//! `.workset/state.json` (the current branch) and the derived worktree tree
//! described in [`crate::layout`]. Worktrees themselves are never recorded;
//! they are recomputed from the config and the branch directories on disk.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Defaults;
use crate::layout;
use crate::{Error, Result};

/// A named remote and the branch of interest on it
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteSpec {
    /// Remote name; empty means "not configured"
    pub name: String,
    /// Branch on that remote
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default_branch: String,
}

/// Base (read-only upstream) and write (push target) remotes of a repo
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Remotes {
    /// Upstream the branch merges into
    pub base: RemoteSpec,
    /// Remote the branch is pushed to
    pub write: RemoteSpec,
}

/// One repository in a workspace
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Unique name within the workspace
    pub name: String,
    /// Directory name of the repo inside each branch directory
    pub repo_dir: String,
    /// True when the bare store was created by workset and may be deleted
    pub managed: bool,
    /// Repository refs are read from (bare store or user checkout)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// Remote configuration
    pub remotes: Remotes,
}

impl RepoConfig {
    /// Fill unset fields from workspace defaults
    pub fn apply_defaults(&mut self, defaults: &Defaults) {
        if self.repo_dir.is_empty() {
            self.repo_dir = self.name.clone();
        }
        if self.remotes.base.name.is_empty() {
            self.remotes.base.name = defaults.remotes.base.clone();
        }
        if self.remotes.base.default_branch.is_empty() {
            self.remotes.base.default_branch = defaults.base_branch.clone();
        }
        if self.remotes.write.name.is_empty() {
            self.remotes.write.name = defaults.remotes.write.clone();
        }
    }

    /// Copy of this config with defaults applied
    pub fn with_defaults(&self, defaults: &Defaults) -> Self {
        let mut repo = self.clone();
        repo.apply_defaults(defaults);
        repo
    }
}

/// Contents of `workset.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Human-facing workspace name
    pub name: String,
    /// Repositories, in insertion order
    pub repos: Vec<RepoConfig>,
}

impl WorkspaceConfig {
    /// Read a workspace config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Write a workspace config file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Look up a repo by name
    pub fn repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|r| r.name == name)
    }
}

/// Contents of `.workset/state.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct State {
    /// Branch the workspace currently works on
    pub current_branch: String,
}

impl State {
    /// Read state without repairing it; `None` when missing or unreadable
    pub fn read(root: &Path) -> Option<Self> {
        let path = layout::state_path(root);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable workspace state");
                return None;
            }
        };
        match serde_json::from_str::<State>(&contents) {
            Ok(state) if !state.current_branch.is_empty() => Some(state),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable workspace state");
                None
            }
        }
    }

    /// Load state, recreating it on the default branch when missing or unreadable
    ///
    /// A failed write is logged; the in-memory state is returned either way.
    pub fn load_or_recreate(root: &Path, default_branch: &str) -> Self {
        if let Some(state) = Self::read(root) {
            return state;
        }
        let state = State {
            current_branch: default_branch.to_string(),
        };
        debug!(branch = %state.current_branch, "Recreating workspace state");
        if let Err(e) = state.save(root) {
            warn!(root = %root.display(), error = %e, "Could not write workspace state");
        }
        state
    }

    /// Persist state
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = layout::state_path(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// A loaded workspace
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Workspace root directory
    pub root: PathBuf,
    /// Persisted repo list
    pub config: WorkspaceConfig,
    /// Persisted state
    pub state: State,
}

impl Workspace {
    /// Create a new workspace at `root`
    ///
    /// Fails if the root already holds a workspace. The current branch is
    /// `branch` when given, else the default base branch.
    pub fn init(
        root: &Path,
        name: &str,
        branch: Option<&str>,
        defaults: &Defaults,
    ) -> Result<Self> {
        let file = layout::workspace_file(root);
        if file.exists() {
            return Err(Error::Config(format!(
                "Workspace already exists at {}",
                file.display()
            )));
        }

        fs::create_dir_all(layout::workset_dir(root))?;

        let config = WorkspaceConfig {
            name: name.to_string(),
            repos: Vec::new(),
        };
        config.save(&file)?;

        let state = State {
            current_branch: branch
                .filter(|b| !b.is_empty())
                .unwrap_or(&defaults.base_branch)
                .to_string(),
        };
        state.save(root)?;

        debug!(root = %root.display(), branch = %state.current_branch, "Initialized workspace");

        Ok(Self {
            root: root.to_path_buf(),
            config,
            state,
        })
    }

    /// Load the workspace rooted at `root`
    pub fn load(root: &Path, defaults: &Defaults) -> Result<Self> {
        let file = layout::workspace_file(root);
        if !file.exists() {
            return Err(Error::Config(format!(
                "No workspace at {} ({} not found)",
                root.display(),
                layout::WORKSPACE_FILE
            )));
        }
        let config = WorkspaceConfig::load(&file)?;
        let state = State::load_or_recreate(root, &defaults.base_branch);

        Ok(Self {
            root: root.to_path_buf(),
            config,
            state,
        })
    }

    /// Persist the repo list
    pub fn save_config(&self) -> Result<()> {
        self.config.save(&layout::workspace_file(&self.root))
    }

    /// Look up a repo by name
    pub fn repo(&self, name: &str) -> Option<&RepoConfig> {
        self.config.repo(name)
    }

    /// Search `start` and its ancestors for a workspace root
    pub fn find_root(start: &Path) -> Result<PathBuf> {
        start
            .ancestors()
            .find(|dir| layout::workspace_file(dir).is_file())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                Error::Config(format!(
                    "{} not found from {}",
                    layout::WORKSPACE_FILE,
                    start.display()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_defaults() {
        let defaults = Defaults::default();
        let mut repo = RepoConfig {
            name: "api".to_string(),
            ..Default::default()
        };
        repo.apply_defaults(&defaults);
        assert_eq!(repo.repo_dir, "api");
        assert_eq!(repo.remotes.base.name, "origin");
        assert_eq!(repo.remotes.base.default_branch, "main");
        assert_eq!(repo.remotes.write.name, "origin");

        let mut custom = RepoConfig {
            name: "web".to_string(),
            repo_dir: "frontend".to_string(),
            remotes: Remotes {
                base: RemoteSpec {
                    name: "upstream".to_string(),
                    default_branch: "trunk".to_string(),
                },
                write: RemoteSpec::default(),
            },
            ..Default::default()
        };
        custom.apply_defaults(&defaults);
        assert_eq!(custom.repo_dir, "frontend");
        assert_eq!(custom.remotes.base.name, "upstream");
        assert_eq!(custom.remotes.base.default_branch, "trunk");
        assert_eq!(custom.remotes.write.name, "origin");
    }

    #[test]
    fn test_init_and_load() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("ws");
        let defaults = Defaults::default();

        let ws = Workspace::init(&root, "demo", Some("feat/one"), &defaults).unwrap();
        assert_eq!(ws.state.current_branch, "feat/one");
        assert!(Workspace::init(&root, "demo", None, &defaults).is_err());

        let mut ws = Workspace::load(&root, &defaults).unwrap();
        assert_eq!(ws.config.name, "demo");
        assert_eq!(ws.state.current_branch, "feat/one");

        ws.config.repos.push(RepoConfig {
            name: "api".to_string(),
            repo_dir: "api".to_string(),
            managed: true,
            local_path: Some(root.join(".workset/gitdirs/api.git")),
            ..Default::default()
        });
        ws.save_config().unwrap();

        let reloaded = Workspace::load(&root, &defaults).unwrap();
        assert!(reloaded.repo("api").unwrap().managed);
        assert!(reloaded.repo("web").is_none());
    }

    #[test]
    fn test_state_recreated_when_missing_or_corrupt() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        let state = State::load_or_recreate(root, "main");
        assert_eq!(state.current_branch, "main");
        assert!(layout::state_path(root).exists());

        fs::write(layout::state_path(root), "{not json").unwrap();
        let state = State::load_or_recreate(root, "develop");
        assert_eq!(state.current_branch, "develop");

        let on_disk: State =
            serde_json::from_str(&fs::read_to_string(layout::state_path(root)).unwrap()).unwrap();
        assert_eq!(on_disk.current_branch, "develop");
    }

    #[test]
    fn test_unwritable_state_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("ws");
        let defaults = Defaults::default();
        Workspace::init(&root, "demo", Some("feat/a"), &defaults).unwrap();

        // A file where the state directory should be
        fs::remove_dir_all(layout::workset_dir(&root)).unwrap();
        fs::write(layout::workset_dir(&root), "not a dir").unwrap();

        let ws = Workspace::load(&root, &defaults).unwrap();
        assert_eq!(ws.state.current_branch, "main");
        assert!(!layout::state_path(&root).exists());
    }

    #[test]
    fn test_find_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("ws");
        Workspace::init(&root, "demo", None, &Defaults::default()).unwrap();
        let nested = root.join("branches/main/api/src");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(Workspace::find_root(&nested).unwrap(), root);
        assert!(Workspace::find_root(temp.path()).is_err());
    }
}
