//! Git repository backend.
//!
//! Drives the `git` command-line tool as a subprocess. Cheap queries
//! (branches, tags, heads, trees, revision windows) run as one-shot
//! commands; bulk metadata and diffstat fetching goes through the
//! [`Prefetcher`](super::prefetch::Prefetcher), which is created lazily on
//! the first `prefetch` call. Revisions requested without a prefetch in
//! flight fall back to one-shot fetches.
//!
//! The resolved metadata directory is handed to every child through the
//! `GIT_DIR` environment variable, scoped per command rather than set
//! process-wide.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memchr::memchr;

use crate::revision::{Diffstat, Revision};
use crate::subprocess::{run_command, ProcessError, SubprocessPipe};

use super::diff;
use super::header::parse_header;
use super::prefetch::Prefetcher;
use super::{split_revision, Backend, BackendError, LogIterator, Tag};

/// Sidecar file caching `(branch, head, root)` triples, kept in the
/// repository's metadata directory. Root-commit discovery walks the whole
/// branch, so heads are remembered and revalidated by ancestry instead.
const UUID_SIDECAR: &str = "revlog.cache";

/// Everything a worker needs to invoke `git` against this repository.
#[derive(Clone, Debug)]
pub(crate) struct GitContext {
    git: PathBuf,
    git_dir: PathBuf,
}

impl GitContext {
    /// Runs `git` with the repository environment and returns stdout.
    pub(crate) fn run(&self, args: &[&str]) -> Result<String, ProcessError> {
        run_command(&self.git, args, &self.envs())
    }

    /// Spawns a long-lived `git` child with piped stdin/stdout.
    pub(crate) fn spawn(&self, args: &[&str]) -> Result<SubprocessPipe, ProcessError> {
        SubprocessPipe::spawn(&self.git, args, &self.envs())
    }

    fn envs(&self) -> [(&'static str, &OsStr); 1] {
        [("GIT_DIR", self.git_dir.as_os_str())]
    }
}

/// Backend implementation driving the `git` executable.
pub struct GitBackend {
    ctx: GitContext,
    uuid: Option<String>,
    prefetcher: Option<Prefetcher>,
}

impl GitBackend {
    /// Returns true if this backend can access the repository at `url`:
    /// a `.git` directory, a `.git` gitdir-pointer file, or a bare layout.
    #[must_use]
    pub fn handles(url: &Path) -> bool {
        if url.join(".git").is_dir() || url.join(".git").is_file() {
            return true;
        }
        url.is_dir() && url.join("HEAD").is_file() && url.join("objects").is_dir()
    }

    /// Opens the repository at `url`.
    ///
    /// Resolves the metadata directory and locates the `git` executable on
    /// `PATH`; both failures are fatal here rather than at first use.
    pub fn open(url: &Path) -> Result<Self, BackendError> {
        let git_dir = resolve_git_dir(url)?;
        let git = find_executable("git")?;
        Ok(Self {
            ctx: GitContext { git, git_dir },
            uuid: None,
            prefetcher: None,
        })
    }

    fn run(&self, args: &[&str]) -> Result<String, BackendError> {
        self.ctx.run(args).map_err(BackendError::Process)
    }

    /// One-shot diffstat fetch, bypassing the prefetcher.
    fn diffstat_once(&self, id: &str) -> Result<Diffstat, BackendError> {
        let (parent, child) = split_revision(id);
        let mut args = vec!["diff-tree", "-U0", "--no-renames"];
        match parent {
            Some(parent) => {
                args.push(parent);
                args.push(child);
            }
            None => {
                args.push("--root");
                args.push(child);
            }
        }
        let mut pipe = self.ctx.spawn(&args)?;
        pipe.close_write();
        let stat = diff::parse(pipe.reader()).map_err(|source| BackendError::Io {
            context: format!("reading diff for revision {id}"),
            source,
        })?;
        pipe.close_checked()?;
        Ok(stat)
    }

    /// Reads the sidecar entry for `branch`, returning `(head, root)`.
    fn sidecar_entry(&self, branch: &str) -> Option<(String, String)> {
        let contents = fs::read_to_string(self.ctx.git_dir.join(UUID_SIDECAR)).ok()?;
        for line in contents.lines() {
            if !line.starts_with(branch) {
                continue;
            }
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() == 3 {
                return Some((fields[1].to_string(), fields[2].to_string()));
            }
            break;
        }
        None
    }

    /// Rewrites the sidecar with a fresh `(branch, head, root)` line,
    /// preserving entries for other branches. Write-to-temp then rename.
    fn update_sidecar(&self, branch: &str, head: &str, root: &str) -> io::Result<()> {
        let path = self.ctx.git_dir.join(UUID_SIDECAR);
        let mut contents = format!("{branch} {head} {root}\n");
        if let Ok(old) = fs::read_to_string(&path) {
            for line in old.lines() {
                if line.is_empty() || line.starts_with(branch) {
                    continue;
                }
                contents.push_str(line);
                contents.push('\n');
            }
        }
        let tmp = path.with_extension("cache.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)
    }
}

impl Backend for GitBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    /// The repository identifier is the root commit of the main branch.
    ///
    /// Finding it means walking the whole branch, so the sidecar caches
    /// the result per branch: if the cached head still equals the current
    /// head, or is an ancestor of it, the cached root is reused.
    fn uuid(&mut self) -> Result<String, BackendError> {
        if let Some(uuid) = &self.uuid {
            return Ok(uuid.clone());
        }

        let branch = self.main_branch()?;
        let head = self.head(&branch)?;

        let cached = self.sidecar_entry(&branch);
        if let Some((old_head, old_root)) = &cached {
            if *old_head == head {
                self.uuid = Some(old_root.clone());
                return Ok(old_root.clone());
            }
        }

        // A stale head that is still an ancestor of the current head
        // leaves the root commit unchanged.
        let mut root = None;
        if let Some((old_head, old_root)) = &cached {
            let range = format!("{old_head}..{head}");
            if let Ok(out) = self.ctx.run(&["rev-list", "-1", &range]) {
                if !out.trim().is_empty() {
                    root = Some(old_root.clone());
                }
            }
        }

        let root = match root {
            Some(root) => root,
            None => {
                let out = self.run(&["rev-list", "--reverse", &branch, "--"])?;
                out.lines()
                    .next()
                    .filter(|line| !line.is_empty())
                    .ok_or_else(|| BackendError::Failed {
                        op: "uuid",
                        id: branch.clone(),
                    })?
                    .to_string()
            }
        };

        if let Err(err) = self.update_sidecar(&branch, &head, &root) {
            eprintln!("git: unable to update uuid sidecar: {err}");
        }
        self.uuid = Some(root.clone());
        Ok(root)
    }

    fn head(&self, branch: &str) -> Result<String, BackendError> {
        let name = if branch.is_empty() { "HEAD" } else { branch };
        let out = self.run(&["rev-list", "-1", name, "--"])?;
        Ok(out.trim().to_string())
    }

    fn main_branch(&self) -> Result<String, BackendError> {
        let out = self.run(&["branch"])?;
        let mut names = Vec::new();
        for line in out.lines() {
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix("* ") {
                return Ok(name.to_string());
            }
            names.push(line.get(2..).unwrap_or(line));
        }
        for fallback in ["master", "remotes/origin/master"] {
            if names.iter().any(|name| *name == fallback) {
                return Ok(fallback.to_string());
            }
        }
        Ok("master".to_string())
    }

    fn branches(&self) -> Result<Vec<String>, BackendError> {
        let out = self.run(&["branch"])?;
        Ok(out
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.get(2..).unwrap_or(line).to_string())
            .collect())
    }

    fn tags(&self) -> Result<Vec<Tag>, BackendError> {
        let out = self.run(&["tag"])?;
        let mut tags = Vec::new();
        for name in out.lines().filter(|line| !line.is_empty()) {
            let id = self.run(&["rev-list", "-1", name])?;
            let id = id.trim();
            if !id.is_empty() {
                tags.push(Tag {
                    id: id.to_string(),
                    name: name.to_string(),
                });
            }
        }
        Ok(tags)
    }

    fn tree(&self, id: &str) -> Result<Vec<String>, BackendError> {
        let name = if id.is_empty() { "HEAD" } else { id };
        let out = self.run(&["ls-tree", "-r", "--full-name", "--name-only", name])?;
        Ok(out
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn diffstat(&mut self, id: &str) -> Result<Diffstat, BackendError> {
        if let Some(prefetcher) = &self.prefetcher {
            if prefetcher.will_fetch_diffstat(id) {
                return prefetcher
                    .get_diffstat(id)
                    .ok_or_else(|| BackendError::Failed {
                        op: "diffstat",
                        id: id.to_string(),
                    });
            }
        }
        self.diffstat_once(id)
    }

    fn revision(&mut self, id: &str) -> Result<Revision, BackendError> {
        if let Some(prefetcher) = &self.prefetcher {
            if prefetcher.will_fetch_meta(id) {
                let meta = prefetcher.get_meta(id).ok_or_else(|| BackendError::Failed {
                    op: "revision",
                    id: id.to_string(),
                })?;
                let stat = self.diffstat(id)?;
                return Ok(Revision::new(id, meta.date, meta.author, meta.message, stat));
            }
        }

        let (_, child) = split_revision(id);
        let out = self.run(&["rev-list", "-1", "--header", child])?;
        // --header terminates the commit with a NUL byte.
        let raw = match memchr(0, out.as_bytes()) {
            Some(pos) => &out[..pos],
            None => out.as_str(),
        };
        let lines: Vec<&str> = raw.split('\n').collect();
        let meta = parse_header(&lines).map_err(|source| BackendError::Parse {
            id: id.to_string(),
            source,
        })?;
        let stat = self.diffstat(id)?;
        Ok(Revision::new(id, meta.date, meta.author, meta.message, stat))
    }

    fn iterator(
        &self,
        branch: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<LogIterator, BackendError> {
        let mut args: Vec<String> = vec![
            "rev-list".to_string(),
            "--first-parent".to_string(),
            "--reverse".to_string(),
        ];
        if let Some(start) = start {
            args.push(format!("--max-age={start}"));
        }
        if let Some(end) = end {
            args.push(format!("--min-age={end}"));
        }
        args.push(branch.to_string());
        args.push("--".to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run(&arg_refs)?;
        let ids: Vec<String> = out
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(LogIterator::paired(ids))
    }

    fn prefetch(&mut self, ids: &[String]) -> Result<(), BackendError> {
        let ctx = self.ctx.clone();
        let prefetcher = self
            .prefetcher
            .get_or_insert_with(|| Prefetcher::new(ctx, None));
        prefetcher.prefetch(ids);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        if let Some(mut prefetcher) = self.prefetcher.take() {
            prefetcher.stop();
            prefetcher.wait();
        }
        Ok(())
    }
}

impl Drop for GitBackend {
    fn drop(&mut self) {
        if let Some(mut prefetcher) = self.prefetcher.take() {
            prefetcher.stop();
            prefetcher.wait();
        }
    }
}

/// Resolves the repository's metadata directory.
fn resolve_git_dir(url: &Path) -> Result<PathBuf, BackendError> {
    if url.join("HEAD").is_file() {
        return Ok(url.to_path_buf());
    }
    if url.join(".git").join("HEAD").is_file() {
        return Ok(url.join(".git"));
    }
    let pointer = url.join(".git");
    if pointer.is_file() {
        // Worktree/submodule layout: ".git" is a file "gitdir: <path>".
        let contents = fs::read_to_string(&pointer).map_err(|source| BackendError::Io {
            context: format!("reading {}", pointer.display()),
            source,
        })?;
        let first = contents.lines().next().unwrap_or("");
        if let Some((_, path)) = first.split_once(':') {
            let path = path.trim();
            if !path.is_empty() {
                return Ok(url.join(path));
            }
        }
    }
    Err(BackendError::NotARepository {
        url: url.to_path_buf(),
    })
}

/// Scans `PATH` for an executable with the given name.
fn find_executable(program: &'static str) -> Result<PathBuf, BackendError> {
    let path = env::var_os("PATH").ok_or(BackendError::ExecutableNotFound { program })?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
        #[cfg(windows)]
        {
            let candidate = dir.join(format!("{program}.exe"));
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }
    Err(BackendError::ExecutableNotFound { program })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
