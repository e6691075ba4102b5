//! GitPort backed by the `git` executable
//!
//! Every invocation runs non-interactively (no terminal prompts, batch-mode
//! ssh, null stdin) and is bounded by a [`CallContext`]. Output is drained
//! into anonymous temp files while the child is polled, so large `log`
//! output never blocks the process and no reader threads are needed.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

use super::content_merge::ContentMergeDetector;
use super::{
    wrap_auth_error, CallContext, ChangeKind, ChangeSide, GitPort, ObjectId, StatusSummary,
    TreeChange, TreeEntry, TreeReader, WorktreeAddOptions,
};
use crate::{Error, Result};

/// Paths per `ls-tree` invocation
const LS_TREE_CHUNK: usize = 500;

const POLL_START: Duration = Duration::from_millis(2);
const POLL_MAX: Duration = Duration::from_millis(50);

/// Git driven through its command line
#[derive(Debug, Clone)]
pub struct CliGit {
    git_path: PathBuf,
    command_timeout: Duration,
}

impl Default for CliGit {
    fn default() -> Self {
        Self::new("git", Duration::from_secs(120))
    }
}

/// Captured result of one git invocation
#[derive(Debug)]
struct Output {
    args: String,
    code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Output {
    fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Convert a failed run into an error, pass a successful one through
    fn check(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    fn into_error(self) -> Error {
        let mut message = self.stderr().trim().to_string();
        if message.is_empty() {
            message = self.stdout().trim().to_string();
        }
        Error::GitCommand {
            args: self.args,
            code: self.code,
            message,
        }
    }

    fn is_not_repo(&self) -> bool {
        if self.success() {
            return false;
        }
        let msg = self.stderr().to_ascii_lowercase();
        msg.contains("not a git repository") || msg.contains("not a git repo")
    }

    fn is_missing_ref(&self) -> bool {
        let msg = self.stderr().to_ascii_lowercase();
        msg.contains("not a valid ref")
            || msg.contains("unknown revision")
            || msg.contains("bad object")
            || msg.contains("ambiguous argument")
    }
}

/// Where to run git for a given repository path
#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    /// Directory passed to `-C`
    dir: PathBuf,
    /// Explicit `--git-dir`, when the path is not discoverable from `dir`
    git_dir: Option<PathBuf>,
}

impl Location {
    fn args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("-C"), self.dir.clone().into_os_string()];
        if let Some(git_dir) = &self.git_dir {
            args.push(OsString::from("--git-dir"));
            args.push(git_dir.clone().into_os_string());
        }
        args
    }

    /// Classify a repository path
    ///
    /// - `.git` file: run from its directory with the file's target as git dir
    /// - worktree admin dir or `.git` dir: run from the worktree root
    /// - bare store or working tree: run from the path itself
    fn resolve(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;

        if !meta.is_dir() {
            let git_dir = parse_gitdir_file(path)?.ok_or_else(|| {
                Error::Config(format!("{} is not a directory", path.display()))
            })?;
            let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            return Ok(Self {
                dir,
                git_dir: Some(git_dir),
            });
        }

        if is_git_dir(path) {
            if let Some(root) = worktree_root_from_git_dir(path)? {
                return Ok(Self {
                    dir: root,
                    git_dir: Some(path.to_path_buf()),
                });
            }
            if is_worktree_admin_dir(path) {
                return Ok(Self {
                    dir: path.to_path_buf(),
                    git_dir: Some(path.to_path_buf()),
                });
            }
        }

        Ok(Self {
            dir: path.to_path_buf(),
            git_dir: None,
        })
    }

    /// Resolve a path printed by git relative to where it ran
    fn absolutize(&self, printed: &str) -> PathBuf {
        let printed = Path::new(printed.trim());
        if printed.is_absolute() {
            printed.to_path_buf()
        } else {
            self.dir.join(printed)
        }
    }
}

impl CliGit {
    /// Create a backend using the given executable and per-call timeout
    pub fn new(git_path: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            git_path: git_path.into(),
            command_timeout,
        }
    }

    fn default_ctx(&self) -> CallContext {
        CallContext::with_timeout(self.command_timeout)
    }

    /// Run git, returning its output whatever the exit code
    fn run<I, S>(&self, ctx: &CallContext, repo: Option<&Path>, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let location = repo.map(Location::resolve).transpose()?;

        let shown = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");

        let mut stdout = tempfile::tempfile()?;
        let mut stderr = tempfile::tempfile()?;

        let mut cmd = Command::new(&self.git_path);
        if let Some(location) = &location {
            cmd.args(location.args());
        }
        cmd.args(&args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GCM_INTERACTIVE", "never")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout.try_clone()?))
            .stderr(Stdio::from(stderr.try_clone()?));
        if std::env::var_os("GIT_SSH_COMMAND").is_none() && std::env::var_os("GIT_SSH").is_none() {
            cmd.env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes");
        }

        ctx.check()?;
        debug!(args = %shown, dir = ?location.as_ref().map(|l| &l.dir), "Running git");

        let mut child = cmd.spawn().map_err(|e| {
            Error::Other(format!(
                "Failed to run {}: {}",
                self.git_path.display(),
                e
            ))
        })?;

        let mut poll = POLL_START;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Err(e) = ctx.check() {
                // The child may have exited between the two checks
                let _ = child.kill();
                let _ = child.wait();
                debug!(args = %shown, error = %e, "Killed git");
                return Err(e);
            }
            std::thread::sleep(poll);
            poll = (poll * 2).min(POLL_MAX);
        };

        Ok(Output {
            args: shown,
            code: status.code(),
            stdout: read_back(&mut stdout)?,
            stderr: read_back(&mut stderr)?,
        })
    }

    /// Run git and require success
    fn run_ok<I, S>(&self, ctx: &CallContext, repo: Option<&Path>, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run(ctx, repo, args)?.check()
    }

    /// Absolute path of `name` inside the (common) git dir
    fn git_path(&self, ctx: &CallContext, repo: &Path, name: &str) -> Result<PathBuf> {
        let location = Location::resolve(repo)?;
        let out = self.run_ok(ctx, Some(repo), ["rev-parse", "--git-path", name])?;
        Ok(location.absolutize(&out.stdout()))
    }

    fn start_ref(&self, ctx: &CallContext, opts: &WorktreeAddOptions) -> Result<Option<String>> {
        if opts.start_branch.is_empty() {
            return Ok(None);
        }
        if !opts.start_remote.is_empty() {
            let remote_ref = format!("refs/remotes/{}/{}", opts.start_remote, opts.start_branch);
            if self.ref_exists_ctx(ctx, &opts.repo_path, &remote_ref)? {
                return Ok(Some(remote_ref));
            }
        }
        let local_ref = format!("refs/heads/{}", opts.start_branch);
        if self.ref_exists_ctx(ctx, &opts.repo_path, &local_ref)? {
            return Ok(Some(local_ref));
        }
        Ok(None)
    }

    fn ref_exists_ctx(&self, ctx: &CallContext, repo: &Path, reference: &str) -> Result<bool> {
        let out = self.run(ctx, Some(repo), ["show-ref", "--verify", "--quiet", reference])?;
        if out.success() {
            return Ok(true);
        }
        if out.code == Some(1) || out.is_missing_ref() {
            return Ok(false);
        }
        Err(out.into_error())
    }

    /// Give git's auto-named admin entry the requested name
    fn rename_admin_entry(&self, worktree_path: &Path, name: &str) -> Result<()> {
        let dot_git = worktree_path.join(".git");
        let admin = parse_gitdir_file(&dot_git)?.ok_or_else(|| {
            Error::Other(format!(
                "{} does not point at a worktree admin dir",
                dot_git.display()
            ))
        })?;

        if admin.file_name() == Some(OsStr::new(name)) {
            return Ok(());
        }
        let renamed = admin
            .parent()
            .map(|p| p.join(name))
            .ok_or_else(|| Error::Other(format!("Invalid admin dir {}", admin.display())))?;

        fs::rename(&admin, &renamed)?;
        fs::write(&dot_git, format!("gitdir: {}\n", renamed.display()))?;
        debug!(from = %admin.display(), to = %renamed.display(), "Renamed worktree admin entry");
        Ok(())
    }
}

impl GitPort for CliGit {
    fn status(&self, path: &Path) -> Result<StatusSummary> {
        let ctx = self.default_ctx();
        let out = match self.run(&ctx, Some(path), ["status", "--porcelain=v1", "-z", "-unormal"]) {
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StatusSummary {
                    dirty: false,
                    missing: true,
                })
            }
            other => other?,
        };
        if out.is_not_repo() {
            return Ok(StatusSummary {
                dirty: false,
                missing: true,
            });
        }
        let out = out.check()?;
        Ok(StatusSummary {
            dirty: !out.stdout.is_empty(),
            missing: false,
        })
    }

    fn is_repo(&self, path: &Path) -> Result<bool> {
        let ctx = self.default_ctx();
        let out = match self.run(&ctx, Some(path), ["rev-parse", "--is-inside-work-tree"]) {
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            other => other?,
        };
        Ok(out.success() && out.stdout().trim() == "true")
    }

    fn reference_exists(&self, repo: &Path, reference: &str) -> Result<bool> {
        self.ref_exists_ctx(&self.default_ctx(), repo, reference)
    }

    fn fetch(&self, ctx: &CallContext, repo: &Path, remote: &str) -> Result<()> {
        if remote.is_empty() {
            return Err(Error::Config("remote name required".to_string()));
        }
        let out = self.run(ctx, Some(repo), ["fetch", "--no-write-fetch-head", remote])?;
        if out.success() {
            return Ok(());
        }
        let stderr = out.stderr().to_ascii_lowercase();
        if stderr.contains("unknown option") && stderr.contains("no-write-fetch-head") {
            self.run_ok(ctx, Some(repo), ["fetch", remote])
                .map_err(wrap_auth_error)?;
            return Ok(());
        }
        Err(wrap_auth_error(out.into_error()))
    }

    fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
        let ctx = self.default_ctx();
        let out = self.run(
            &ctx,
            Some(repo),
            ["merge-base", "--is-ancestor", ancestor, descendant],
        )?;
        match out.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(out.into_error()),
        }
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

        if self.worktree_list(&opts.repo_path)?.contains(&opts.worktree_name) {
            return Err(Error::Config(format!(
                "worktree {} already exists",
                opts.worktree_name
            )));
        }

        let start = self.start_ref(ctx, opts)?;
        let branch_ref = format!("refs/heads/{}", opts.branch_name);
        let branch_exists = self.ref_exists_ctx(ctx, &opts.repo_path, &branch_ref)?;

        if let Some(parent) = opts.worktree_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut args: Vec<OsString> = vec!["worktree".into(), "add".into()];
        if branch_exists {
            args.push(opts.worktree_path.clone().into_os_string());
            args.push(opts.branch_name.clone().into());
        } else {
            args.push("-b".into());
            args.push(opts.branch_name.clone().into());
            args.push("--no-track".into());
            args.push(opts.worktree_path.clone().into_os_string());
            if let Some(start) = &start {
                args.push(start.into());
            }
        }
        self.run_ok(ctx, Some(&opts.repo_path), &args)?;

        if let Err(e) = self.rename_admin_entry(&opts.worktree_path, &opts.worktree_name) {
            // Under git's generated name nothing could find the worktree again
            let undo = [
                OsStr::new("worktree"),
                OsStr::new("remove"),
                OsStr::new("--force"),
                opts.worktree_path.as_os_str(),
            ];
            if let Err(undo_err) = self.run_ok(&self.default_ctx(), Some(&opts.repo_path), undo) {
                warn!(
                    path = %opts.worktree_path.display(),
                    error = %undo_err,
                    "Failed to roll back worktree"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    fn worktree_remove(&self, repo: &Path, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Config("worktree name required".to_string()));
        }
        let ctx = self.default_ctx();
        let admin = self.git_path(&ctx, repo, "worktrees")?.join(name);
        if !admin.is_dir() {
            return Err(Error::WorktreeNotFound(name.to_string()));
        }

        let worktree_dir = read_admin_gitdir(&admin)?
            .and_then(|dot_git| dot_git.parent().map(Path::to_path_buf));

        match worktree_dir {
            Some(dir) if dir.exists() => {
                let args = [
                    OsStr::new("worktree"),
                    OsStr::new("remove"),
                    OsStr::new("--force"),
                    dir.as_os_str(),
                ];
                let out = self.run(&ctx, Some(repo), args)?;
                if out.success() {
                    return Ok(());
                }
                if out.stderr().contains("not a working tree") {
                    return Err(Error::WorktreeNotFound(name.to_string()));
                }
                Err(out.into_error())
            }
            _ => {
                debug!(admin = %admin.display(), "Worktree dir gone, pruning admin entry");
                fs::remove_dir_all(&admin)?;
                Ok(())
            }
        }
    }

    fn worktree_list(&self, repo: &Path) -> Result<Vec<String>> {
        let ctx = self.default_ctx();
        let dir = self.git_path(&ctx, repo, "worktrees")?;
        list_admin_entries(&dir)
    }

    fn remote_exists(&self, repo: &Path, remote: &str) -> Result<bool> {
        let ctx = self.default_ctx();
        let out = self.run(&ctx, Some(repo), ["remote", "get-url", remote])?;
        if out.success() {
            return Ok(true);
        }
        if out.is_not_repo() {
            return Err(out.into_error());
        }
        Ok(false)
    }

    fn current_branch(&self, repo: &Path) -> Result<Option<String>> {
        let ctx = self.default_ctx();
        let out = self.run(&ctx, Some(repo), ["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        match out.code {
            Some(0) => {
                let name = out.stdout().trim().to_string();
                Ok((!name.is_empty()).then_some(name))
            }
            Some(1) => Ok(None),
            _ => Err(out.into_error()),
        }
    }

    fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<()> {
        if self.remote_exists(repo, name)? {
            return Ok(());
        }
        let ctx = self.default_ctx();
        self.run_ok(&ctx, Some(repo), ["remote", "add", name, url])?;
        Ok(())
    }

    fn clone_repo(&self, ctx: &CallContext, url: &str, path: &Path, remote: &str) -> Result<()> {
        let remote = if remote.is_empty() { "origin" } else { remote };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let args = [
            OsStr::new("clone"),
            OsStr::new("--origin"),
            OsStr::new(remote),
            OsStr::new(url),
            path.as_os_str(),
        ];
        self.run_ok(ctx, None, args).map_err(wrap_auth_error)?;
        Ok(())
    }

    fn clone_bare(&self, ctx: &CallContext, url: &str, path: &Path, remote: &str) -> Result<()> {
        let remote = if remote.is_empty() { "origin" } else { remote };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let args = [
            OsStr::new("clone"),
            OsStr::new("--bare"),
            OsStr::new("--origin"),
            OsStr::new(remote),
            OsStr::new(url),
            path.as_os_str(),
        ];
        self.run_ok(ctx, None, args).map_err(wrap_auth_error)?;

        // Bare clones map branches onto refs/heads; track them as remote refs instead
        let key = format!("remote.{remote}.fetch");
        let refspec = format!("+refs/heads/*:refs/remotes/{remote}/*");
        self.run_ok(ctx, Some(path), ["config", key.as_str(), refspec.as_str()])?;
        self.fetch(ctx, path, remote)
    }
}

impl TreeReader for CliGit {
    fn tree_id(&self, ctx: &CallContext, repo: &Path, rev: &str) -> Result<ObjectId> {
        let spec = format!("{rev}^{{tree}}");
        let out = self.run_ok(ctx, Some(repo), ["rev-parse", "--verify", spec.as_str()])?;
        Ok(ObjectId::new(out.stdout()))
    }

    fn merge_bases(
        &self,
        ctx: &CallContext,
        repo: &Path,
        a: &str,
        b: &str,
    ) -> Result<Vec<ObjectId>> {
        let out = self.run(ctx, Some(repo), ["merge-base", "--all", a, b])?;
        if out.code == Some(1) && out.stdout.is_empty() {
            return Ok(Vec::new());
        }
        let out = out.check()?;
        Ok(out
            .stdout()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ObjectId::new)
            .collect())
    }

    fn diff_trees(
        &self,
        ctx: &CallContext,
        repo: &Path,
        from: &str,
        to: &str,
    ) -> Result<Vec<TreeChange>> {
        let out = self.run_ok(
            ctx,
            Some(repo),
            [
                "diff-tree",
                "-r",
                "-z",
                "--no-commit-id",
                "--no-abbrev",
                "--find-renames=100%",
                from,
                to,
            ],
        )?;
        parse_diff_tree(&out.stdout)
    }

    fn tree_entries(
        &self,
        ctx: &CallContext,
        repo: &Path,
        rev: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, TreeEntry>> {
        let mut entries = BTreeMap::new();
        for chunk in paths.chunks(LS_TREE_CHUNK) {
            let mut args = vec!["--literal-pathspecs", "ls-tree", "-z", "--full-tree", rev, "--"];
            args.extend(chunk.iter().map(String::as_str));
            let out = self.run_ok(ctx, Some(repo), &args)?;
            entries.extend(parse_ls_tree(&out.stdout)?);
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
        let mut args = vec!["log", "--no-show-signature", "--format=%T", rev];
        if !hide.is_empty() {
            args.push("--not");
            args.extend(hide.iter().map(ObjectId::as_str));
        }
        args.push("--");
        let out = self.run_ok(ctx, Some(repo), &args)?;
        Ok(out
            .stdout()
            .lines()
            .any(|line| ObjectId::new(line) == *tree))
    }
}

fn read_back(file: &mut File) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Admin entry names under a `worktrees` dir, sorted
pub(crate) fn list_admin_entries(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let complete = ["gitdir", "commondir", "HEAD"]
            .iter()
            .all(|f| path.join(f).is_file());
        if complete {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Target of a `gitdir: <path>` file; relative targets resolve against the
/// file's directory
pub(crate) fn parse_gitdir_file(path: &Path) -> Result<Option<PathBuf>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let target = match contents.trim().strip_prefix("gitdir:") {
        Some(t) => t.trim(),
        None => return Ok(None),
    };
    if target.is_empty() {
        return Ok(None);
    }
    let target = Path::new(target);
    if target.is_absolute() {
        Ok(Some(target.to_path_buf()))
    } else {
        let base = path.parent().unwrap_or(Path::new("."));
        Ok(Some(base.join(target)))
    }
}

/// The `.git` file path recorded in a worktree admin entry
fn read_admin_gitdir(admin: &Path) -> Result<Option<PathBuf>> {
    let contents = match fs::read_to_string(admin.join("gitdir")) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let target = contents.trim();
    if target.is_empty() {
        return Ok(None);
    }
    let target = Path::new(target);
    Ok(Some(if target.is_absolute() {
        target.to_path_buf()
    } else {
        admin.join(target)
    }))
}

fn is_git_dir(path: &Path) -> bool {
    path.join("HEAD").is_file() && (path.join("config").is_file() || path.join("commondir").is_file())
}

fn is_worktree_admin_dir(path: &Path) -> bool {
    path.join("gitdir").is_file() || path.join("commondir").is_file()
}

/// Working tree root belonging to a git dir, when one can be derived
fn worktree_root_from_git_dir(path: &Path) -> Result<Option<PathBuf>> {
    if let Some(dot_git) = read_admin_gitdir(path)? {
        if let Some(root) = dot_git.parent().filter(|r| r.is_dir()) {
            return Ok(Some(root.to_path_buf()));
        }
    }
    if path.file_name() == Some(OsStr::new(".git")) {
        if let Some(parent) = path.parent() {
            return Ok(Some(parent.to_path_buf()));
        }
    }
    Ok(None)
}

fn parse_mode(field: &str) -> Result<u32> {
    u32::from_str_radix(field, 8)
        .map_err(|_| Error::Other(format!("invalid file mode '{field}' in git output")))
}

fn side(path: &str, mode: u32, id: &str) -> Option<ChangeSide> {
    Some(ChangeSide {
        path: path.to_string(),
        entry: TreeEntry {
            mode,
            id: ObjectId::new(id),
        },
    })
}

/// Parse `git diff-tree -r -z --no-abbrev` raw output
///
/// Each record is `:<old mode> <new mode> <old id> <new id> <status>` NUL
/// `<path>` NUL, with a second path for renames and copies.
fn parse_diff_tree(raw: &[u8]) -> Result<Vec<TreeChange>> {
    let text = String::from_utf8_lossy(raw);
    let mut fields = text.split('\0').filter(|f| !f.is_empty());
    let mut changes = Vec::new();

    while let Some(header) = fields.next() {
        let header = header.trim_start_matches('\n');
        let header = header
            .strip_prefix(':')
            .ok_or_else(|| Error::Other(format!("unexpected diff-tree record '{header}'")))?;
        let parts: Vec<&str> = header.split(' ').collect();
        let [old_mode, new_mode, old_id, new_id, status] = parts.as_slice() else {
            return Err(Error::Other(format!("unexpected diff-tree header '{header}'")));
        };
        let old_mode = parse_mode(old_mode)?;
        let new_mode = parse_mode(new_mode)?;

        let mut next_path = || {
            fields
                .next()
                .ok_or_else(|| Error::Other("truncated diff-tree output".to_string()))
        };
        let path = next_path()?;

        let change = match status.chars().next() {
            Some('A') => TreeChange {
                kind: ChangeKind::Added,
                old: None,
                new: side(path, new_mode, new_id),
            },
            Some('D') => TreeChange {
                kind: ChangeKind::Deleted,
                old: side(path, old_mode, old_id),
                new: None,
            },
            Some('M') => TreeChange {
                kind: ChangeKind::Modified,
                old: side(path, old_mode, old_id),
                new: side(path, new_mode, new_id),
            },
            Some('T') => TreeChange {
                kind: ChangeKind::TypeChanged,
                old: side(path, old_mode, old_id),
                new: side(path, new_mode, new_id),
            },
            Some(kind @ ('R' | 'C')) => {
                let new_path = next_path()?;
                TreeChange {
                    kind: if kind == 'R' {
                        ChangeKind::Renamed
                    } else {
                        ChangeKind::Copied
                    },
                    old: side(path, old_mode, old_id),
                    new: side(new_path, new_mode, new_id),
                }
            }
            _ => {
                return Err(Error::Other(format!(
                    "unsupported diff-tree status '{status}' for {path}"
                )))
            }
        };
        changes.push(change);
    }

    Ok(changes)
}

/// Parse `git ls-tree -z` output: `<mode> <type> <id>\t<path>` NUL
fn parse_ls_tree(raw: &[u8]) -> Result<BTreeMap<String, TreeEntry>> {
    let text = String::from_utf8_lossy(raw);
    let mut entries = BTreeMap::new();
    for record in text.split('\0').filter(|r| !r.is_empty()) {
        let (meta, path) = record
            .split_once('\t')
            .ok_or_else(|| Error::Other(format!("unexpected ls-tree record '{record}'")))?;
        let mut meta = meta.split(' ');
        let (Some(mode), Some(_kind), Some(id)) = (meta.next(), meta.next(), meta.next()) else {
            return Err(Error::Other(format!("unexpected ls-tree record '{record}'")));
        };
        entries.insert(
            path.to_string(),
            TreeEntry {
                mode: parse_mode(mode)?,
                id: ObjectId::new(id),
            },
        );
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const A: &str = "1111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222";
    const Z: &str = "0000000000000000000000000000000000000000";

    #[test]
    fn test_parse_diff_tree() {
        let raw = format!(
            ":000000 100644 {Z} {A} A\0new.txt\0\
             :100644 000000 {A} {Z} D\0gone.txt\0\
             :100644 100755 {A} {B} M\0bin/run\0\
             :100644 120000 {A} {B} T\0link\0\
             :100644 100644 {A} {A} R100\0old/name.rs\0new/name.rs\0\
             :100644 100644 {B} {B} C100\0src.rs\0copy.rs\0"
        );
        let changes = parse_diff_tree(raw.as_bytes()).unwrap();
        assert_eq!(changes.len(), 6);

        assert_eq!(changes[0].kind, ChangeKind::Added);
        assert!(changes[0].old.is_none());
        assert_eq!(changes[0].new.as_ref().unwrap().entry.mode, 0o100644);

        assert_eq!(changes[1].kind, ChangeKind::Deleted);
        assert!(changes[1].new.is_none());
        assert_eq!(changes[1].old.as_ref().unwrap().path, "gone.txt");

        assert_eq!(changes[2].kind, ChangeKind::Modified);
        assert_eq!(changes[2].new.as_ref().unwrap().entry.mode, 0o100755);
        assert_eq!(changes[2].new.as_ref().unwrap().entry.id, ObjectId::new(B));

        assert_eq!(changes[3].kind, ChangeKind::TypeChanged);
        assert_eq!(changes[3].new.as_ref().unwrap().entry.mode, 0o120000);

        assert_eq!(changes[4].kind, ChangeKind::Renamed);
        assert_eq!(changes[4].old.as_ref().unwrap().path, "old/name.rs");
        assert_eq!(changes[4].new.as_ref().unwrap().path, "new/name.rs");

        assert_eq!(changes[5].kind, ChangeKind::Copied);
        assert_eq!(changes[5].new.as_ref().unwrap().path, "copy.rs");
    }

    #[test]
    fn test_parse_diff_tree_empty_and_odd_paths() {
        assert!(parse_diff_tree(b"").unwrap().is_empty());

        let raw = format!(":000000 100644 {Z} {A} A\0dir with space/tab\there.txt\0");
        let changes = parse_diff_tree(raw.as_bytes()).unwrap();
        assert_eq!(
            changes[0].new.as_ref().unwrap().path,
            "dir with space/tab\there.txt"
        );
    }

    #[test]
    fn test_parse_diff_tree_rejects_garbage() {
        assert!(parse_diff_tree(b"not a record\0").is_err());
        let truncated = format!(":100644 100644 {A} {B} R100\0only-one\0");
        assert!(parse_diff_tree(truncated.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_ls_tree() {
        let raw = format!(
            "100644 blob {A}\tREADME.md\0100755 blob {B}\tbin/run\0160000 commit {A}\tvendor/lib\0"
        );
        let entries = parse_ls_tree(raw.as_bytes()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries["README.md"].mode, 0o100644);
        assert_eq!(entries["bin/run"].id, ObjectId::new(B));
        assert_eq!(entries["vendor/lib"].mode, 0o160000);
    }

    #[test]
    fn test_parse_gitdir_file() {
        let temp = TempDir::new().unwrap();
        let wt = temp.path().join("wt");
        fs::create_dir_all(&wt).unwrap();

        fs::write(wt.join(".git"), "gitdir: /repo/.git/worktrees/wt\n").unwrap();
        assert_eq!(
            parse_gitdir_file(&wt.join(".git")).unwrap(),
            Some(PathBuf::from("/repo/.git/worktrees/wt"))
        );

        fs::write(wt.join(".git"), "gitdir: ../store/worktrees/wt").unwrap();
        assert_eq!(
            parse_gitdir_file(&wt.join(".git")).unwrap(),
            Some(wt.join("../store/worktrees/wt"))
        );

        fs::write(wt.join(".git"), "something else").unwrap();
        assert_eq!(parse_gitdir_file(&wt.join(".git")).unwrap(), None);
        assert_eq!(parse_gitdir_file(&wt.join("absent")).unwrap(), None);
    }

    #[test]
    fn test_location_resolve() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        // Plain directory (working tree or bare store)
        let plain = root.join("plain");
        fs::create_dir_all(&plain).unwrap();
        assert_eq!(
            Location::resolve(&plain).unwrap(),
            Location {
                dir: plain.clone(),
                git_dir: None
            }
        );

        // Bare store: HEAD + config, no worktree root
        let bare = root.join("store.git");
        fs::create_dir_all(&bare).unwrap();
        fs::write(bare.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        fs::write(bare.join("config"), "").unwrap();
        assert_eq!(Location::resolve(&bare).unwrap().git_dir, None);

        // Worktree admin dir pointing at a live worktree
        let wt = root.join("wt");
        fs::create_dir_all(&wt).unwrap();
        let admin = bare.join("worktrees/wt");
        fs::create_dir_all(&admin).unwrap();
        fs::write(admin.join("HEAD"), "ref: refs/heads/feat\n").unwrap();
        fs::write(admin.join("commondir"), "../..\n").unwrap();
        fs::write(admin.join("gitdir"), format!("{}\n", wt.join(".git").display())).unwrap();
        fs::write(wt.join(".git"), format!("gitdir: {}\n", admin.display())).unwrap();
        assert_eq!(
            Location::resolve(&admin).unwrap(),
            Location {
                dir: wt.clone(),
                git_dir: Some(admin.clone())
            }
        );

        // The worktree's .git file
        assert_eq!(
            Location::resolve(&wt.join(".git")).unwrap(),
            Location {
                dir: wt.clone(),
                git_dir: Some(admin.clone())
            }
        );

        // Missing path is an io NotFound
        match Location::resolve(&root.join("absent")) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_list_admin_entries_requires_complete_entries() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("worktrees");
        assert!(list_admin_entries(&dir).unwrap().is_empty());

        for name in ["b-entry", "a-entry"] {
            let admin = dir.join(name);
            fs::create_dir_all(&admin).unwrap();
            for f in ["gitdir", "commondir", "HEAD"] {
                fs::write(admin.join(f), "x").unwrap();
            }
        }
        fs::create_dir_all(dir.join("partial")).unwrap();
        fs::write(dir.join("partial/HEAD"), "x").unwrap();

        assert_eq!(list_admin_entries(&dir).unwrap(), vec!["a-entry", "b-entry"]);
    }
}
