//! Git fixtures shared by integration tests
//!
//! Repositories are built with the git binary so both backends read the
//! same on-disk state.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;
use workset_core::{CliGit, GitPort, Libgit2};

/// True when a usable git binary is on PATH
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Skip the current test when git is missing
macro_rules! require_git {
    () => {
        if !common::git_available() {
            eprintln!("git not available, skipping");
            return;
        }
    };
}

/// Both backends, labelled for assertion messages
pub fn backends() -> Vec<(&'static str, Arc<dyn GitPort>)> {
    vec![
        ("cli", Arc::new(CliGit::default()) as Arc<dyn GitPort>),
        ("libgit2", Arc::new(Libgit2::default()) as Arc<dyn GitPort>),
    ]
}

/// Run git in `dir` with a fixed identity, panicking on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .current_dir(dir)
        .args([
            "-c",
            "user.name=Workset Test",
            "-c",
            "user.email=test@workset.invalid",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "init.defaultBranch=main",
            "-c",
            "protocol.file.allow=always",
        ])
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("HOME", dir)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A throwaway repository with a working tree on `main`
pub struct Fixture {
    _temp: TempDir,
    pub path: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("repo");
        fs::create_dir_all(&path).unwrap();
        git(&path, &["init", "-q", "-b", "main"]);
        let fixture = Self { _temp: temp, path };
        fixture.commit_file("README.md", "hello\n", "initial");
        fixture
    }

    /// Scratch directory next to the repo
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.path.parent().unwrap().join(name)
    }

    pub fn git(&self, args: &[&str]) -> String {
        git(&self.path, args)
    }

    pub fn write(&self, file: &str, contents: &str) {
        let path = self.path.join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    /// Write a file and commit it, returning the commit id
    pub fn commit_file(&self, file: &str, contents: &str, message: &str) -> String {
        self.write(file, contents);
        self.git(&["add", "--", file]);
        self.git(&["commit", "-q", "-m", message]);
        self.head()
    }

    pub fn commit_all(&self, message: &str) -> String {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
        self.head()
    }

    pub fn checkout(&self, branch: &str) {
        self.git(&["checkout", "-q", branch]);
    }

    pub fn branch(&self, name: &str) {
        self.git(&["checkout", "-q", "-b", name]);
    }

    pub fn head(&self) -> String {
        self.git(&["rev-parse", "HEAD"])
    }
}
