//! Configuration management for workset
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (WORKSET_*)
//! 3. Config file (~/.workset/config.toml)
//! 4. Default values

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Remote names used when a repo does not specify its own
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteNames {
    /// Read-only upstream remote
    pub base: String,
    /// Push target remote
    pub write: String,
}

impl Default for RemoteNames {
    fn default() -> Self {
        Self {
            base: "origin".to_string(),
            write: "origin".to_string(),
        }
    }
}

/// Workspace-wide defaults
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Defaults {
    /// Branch that work is integrated into
    pub base_branch: String,
    /// Workspace root used when none is given on the command line
    pub workspace_root: Option<PathBuf>,
    /// Default remote names
    pub remotes: RemoteNames,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            workspace_root: None,
            remotes: RemoteNames::default(),
        }
    }
}

/// Which git backend to drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GitBackendKind {
    /// The `git` executable
    #[default]
    Cli,
    /// Embedded libgit2
    Libgit2,
}

impl std::str::FromStr for GitBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cli" | "git" => Ok(Self::Cli),
            "libgit2" | "git2" => Ok(Self::Libgit2),
            other => Err(Error::Config(format!(
                "unknown git backend '{}', expected 'cli' or 'libgit2'",
                other
            ))),
        }
    }
}

/// Git invocation settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GitSettings {
    /// Backend implementation
    pub backend: GitBackendKind,

    /// Path to the git executable (CLI backend)
    pub git_path: String,

    /// Upper bound for local git operations
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Upper bound for a single remote fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            backend: GitBackendKind::Cli,
            git_path: "git".to_string(),
            command_timeout: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(300),
        }
    }
}

/// Where a repo alias comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoSource<'a> {
    /// Remote URL, cloned into a managed bare store
    Url(&'a str),
    /// Pre-existing local repository, never deleted
    Path(&'a Path),
}

/// A named, reusable repository source
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RepoAlias {
    /// Clone URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Local repository path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Remote name to clone under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    /// Branch work is integrated into
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

impl RepoAlias {
    /// Resolve the alias source; a local path wins over a URL
    pub fn source(&self) -> Option<RepoSource<'_>> {
        if let Some(path) = self.path.as_deref() {
            return Some(RepoSource::Path(path));
        }
        self.url.as_deref().map(RepoSource::Url)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Workspace defaults
    pub defaults: Defaults,
    /// Git settings
    pub git: GitSettings,
    /// Repo aliases keyed by name
    pub repos: BTreeMap<String, RepoAlias>,
}

impl Config {
    /// Load configuration from the default config file location
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| {
            Error::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })
    }

    /// Get the default config file path
    ///
    /// Returns `~/.workset/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".workset").join("config.toml"))
    }

    /// Apply environment variable overrides
    ///
    /// Supported variables:
    /// - WORKSET_BASE_BRANCH
    /// - WORKSET_BASE_REMOTE
    /// - WORKSET_WRITE_REMOTE
    /// - WORKSET_GIT_BACKEND
    /// - WORKSET_ROOT
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(branch) = var("WORKSET_BASE_BRANCH") {
            self.defaults.base_branch = branch;
        }
        if let Some(remote) = var("WORKSET_BASE_REMOTE") {
            self.defaults.remotes.base = remote;
        }
        if let Some(remote) = var("WORKSET_WRITE_REMOTE") {
            self.defaults.remotes.write = remote;
        }
        if let Some(backend) = var("WORKSET_GIT_BACKEND") {
            self.git.backend = backend.parse()?;
        }
        if let Some(root) = var("WORKSET_ROOT") {
            self.defaults.workspace_root = Some(PathBuf::from(root));
        }
        Ok(self)
    }

    /// Apply CLI flag overrides
    pub fn with_cli_overrides(
        mut self,
        workspace_root: Option<PathBuf>,
        backend: Option<GitBackendKind>,
    ) -> Self {
        if let Some(root) = workspace_root {
            self.defaults.workspace_root = Some(root);
        }
        if let Some(backend) = backend {
            self.git.backend = backend;
        }
        self
    }

    /// Load configuration with all overrides applied
    ///
    /// Priority: CLI > env > config file > defaults
    pub fn load_with_overrides(
        workspace_root: Option<PathBuf>,
        backend: Option<GitBackendKind>,
    ) -> Result<Self> {
        Ok(Self::load()?
            .with_env_overrides()?
            .with_cli_overrides(workspace_root, backend))
    }
}

/// Derive a repository name from a clone URL or path
///
/// Handles `https://host/owner/repo(.git)`, `git@host:owner/repo(.git)` and
/// plain filesystem paths.
pub fn repo_name_from_url(input: &str) -> Option<String> {
    let input = input.trim().trim_end_matches('/');
    if input.is_empty() {
        return None;
    }

    let path = if input.contains("://") {
        let url = url::Url::parse(input).ok()?;
        url.path().trim_end_matches('/').to_string()
    } else if let Some((_, path)) = input.split_once(':').filter(|_| input.contains('@')) {
        path.to_string()
    } else {
        input.to_string()
    };

    let last = path
        .rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    (!name.is_empty()).then(|| name.to_string())
}

/// True when a source string names a local directory rather than a clone URL
///
/// `file://` URLs are clone URLs.
pub fn looks_like_local_path(input: &str) -> bool {
    let input = input.trim();
    if input.contains("://") {
        return false;
    }
    if input.contains('@') && input.contains(':') {
        return false;
    }
    input.starts_with('/')
        || input.starts_with("./")
        || input.starts_with("../")
        || input.starts_with('~')
        || Path::new(input).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.defaults.base_branch, "main");
        assert_eq!(config.defaults.remotes.base, "origin");
        assert_eq!(config.defaults.remotes.write, "origin");
        assert_eq!(config.git.backend, GitBackendKind::Cli);
        assert!(config.repos.is_empty());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[defaults]
base_branch = "develop"

[defaults.remotes]
base = "upstream"
write = "origin"

[git]
backend = "libgit2"
command_timeout = "30s"
fetch_timeout = "2m"

[repos.api]
url = "git@github.com:acme/api.git"
default_branch = "trunk"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.defaults.base_branch, "develop");
        assert_eq!(config.defaults.remotes.base, "upstream");
        assert_eq!(config.git.backend, GitBackendKind::Libgit2);
        assert_eq!(config.git.command_timeout, Duration::from_secs(30));
        assert_eq!(config.git.fetch_timeout, Duration::from_secs(120));
        let api = &config.repos["api"];
        assert_eq!(api.source(), Some(RepoSource::Url("git@github.com:acme/api.git")));
        assert_eq!(api.default_branch.as_deref(), Some("trunk"));
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
[git]
backend = "cli"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        // Everything else should use defaults
        assert_eq!(config.defaults, Defaults::default());
        assert_eq!(config.git.git_path, "git");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WORKSET_BASE_BRANCH", "trunk"),
            ("WORKSET_WRITE_REMOTE", "fork"),
            ("WORKSET_GIT_BACKEND", "git2"),
        ]
        .into_iter()
        .collect();
        let config = Config::default()
            .with_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.defaults.base_branch, "trunk");
        assert_eq!(config.defaults.remotes.base, "origin");
        assert_eq!(config.defaults.remotes.write, "fork");
        assert_eq!(config.git.backend, GitBackendKind::Libgit2);

        let bad = Config::default().with_overrides_from(|k| {
            (k == "WORKSET_GIT_BACKEND").then(|| "svn".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::default()
            .with_cli_overrides(Some(PathBuf::from("/ws")), Some(GitBackendKind::Libgit2));
        assert_eq!(config.defaults.workspace_root, Some(PathBuf::from("/ws")));
        assert_eq!(config.git.backend, GitBackendKind::Libgit2);
    }

    #[test]
    fn test_alias_path_wins() {
        let alias = RepoAlias {
            url: Some("https://example.com/a.git".to_string()),
            path: Some(PathBuf::from("/src/a")),
            ..Default::default()
        };
        assert_eq!(alias.source(), Some(RepoSource::Path(Path::new("/src/a"))));
        assert_eq!(RepoAlias::default().source(), None);
    }

    #[test]
    fn test_repo_name_from_url() {
        assert_eq!(repo_name_from_url("https://github.com/acme/api.git").as_deref(), Some("api"));
        assert_eq!(repo_name_from_url("https://github.com/acme/api/").as_deref(), Some("api"));
        assert_eq!(repo_name_from_url("git@github.com:acme/web.git").as_deref(), Some("web"));
        assert_eq!(repo_name_from_url("/src/tools").as_deref(), Some("tools"));
        assert_eq!(repo_name_from_url("file:///srv/git/lib.git").as_deref(), Some("lib"));
        assert_eq!(repo_name_from_url(""), None);
    }

    #[test]
    fn test_looks_like_local_path() {
        assert!(looks_like_local_path("/src/tools"));
        assert!(looks_like_local_path("./tools"));
        assert!(!looks_like_local_path("file:///srv/git/lib.git"));
        assert!(!looks_like_local_path("https://github.com/acme/api.git"));
        assert!(!looks_like_local_path("git@github.com:acme/web.git"));
    }
}
