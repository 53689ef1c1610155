// Git operations on the user's checkout

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, trace};

pub mod error;

pub use error::{GitError, Result};

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Namespace for refs fetched from the sandbox so they never touch the
/// user's own branches.
pub const AGENT_REF_NAMESPACE: &str = "refs/sync-agent";

/// A repository git can fetch from or push to, plus any `-c` settings the
/// transport needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRemote {
    pub url: String,
    pub config: Vec<String>,
}

impl GitRemote {
    pub fn local(path: &Path) -> Self {
        Self {
            url: path.to_string_lossy().into_owned(),
            config: Vec::new(),
        }
    }

    fn config_args(&self) -> Vec<String> {
        self.config
            .iter()
            .flat_map(|setting| ["-c".to_string(), setting.clone()])
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoOperation {
    None,
    Merge,
    Rebase,
    CherryPick,
    Revert,
    Bisect,
    ApplyMailbox,
}

impl RepoOperation {
    pub fn is_in_progress(&self) -> bool {
        *self != RepoOperation::None
    }

    fn from_state(state: git2::RepositoryState) -> Self {
        use git2::RepositoryState as S;
        match state {
            S::Clean => RepoOperation::None,
            S::Merge => RepoOperation::Merge,
            S::Rebase | S::RebaseInteractive | S::RebaseMerge | S::ApplyMailboxOrRebase => {
                RepoOperation::Rebase
            }
            S::CherryPick | S::CherryPickSequence => RepoOperation::CherryPick,
            S::Revert | S::RevertSequence => RepoOperation::Revert,
            S::Bisect => RepoOperation::Bisect,
            S::ApplyMailbox => RepoOperation::ApplyMailbox,
        }
    }
}

impl std::fmt::Display for RepoOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RepoOperation::None => "none",
            RepoOperation::Merge => "merge",
            RepoOperation::Rebase => "rebase",
            RepoOperation::CherryPick => "cherry-pick",
            RepoOperation::Revert => "revert",
            RepoOperation::Bisect => "bisect",
            RepoOperation::ApplyMailbox => "am",
        };
        f.write_str(label)
    }
}

/// Working tree and index state of a checkout
#[derive(Debug, Clone)]
pub struct RepoStatus {
    pub operation: RepoOperation,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
    pub conflicted: Vec<String>,
}

impl RepoStatus {
    pub fn is_in_intermediate_state(&self) -> bool {
        self.operation.is_in_progress() || !self.conflicted.is_empty()
    }

    /// No in-progress operation, no changes, no untracked files
    pub fn is_clean_and_safe_to_operate_on(&self) -> bool {
        !self.is_in_intermediate_state()
            && self.staged.is_empty()
            && self.unstaged.is_empty()
            && self.untracked.is_empty()
    }

    pub fn describe(&self) -> String {
        let mut lines = Vec::new();
        if self.operation.is_in_progress() {
            lines.push(format!("  {} in progress", self.operation));
        }
        for (label, paths) in [
            ("conflicted", &self.conflicted),
            ("staged", &self.staged),
            ("unstaged", &self.unstaged),
            ("untracked", &self.untracked),
        ] {
            if paths.is_empty() {
                continue;
            }
            let mut shown: Vec<&str> = paths.iter().take(5).map(String::as_str).collect();
            let extra = paths.len().saturating_sub(shown.len());
            let suffix = if extra > 0 {
                format!(" (and {} more)", extra)
            } else {
                String::new()
            };
            shown.sort_unstable();
            lines.push(format!("  {}: {}{}", label, shown.join(", "), suffix));
        }
        if lines.is_empty() {
            lines.push("  clean".to_string());
        }
        lines.join("\n")
    }
}

/// A local checkout. libgit2 handles queries; mutations go through the git
/// CLI so hooks, config and the index behave exactly as the user expects.
#[derive(Debug, Clone)]
pub struct GitRepo {
    repo_path: PathBuf,
    git_dir: PathBuf,
    timeout: Duration,
}

impl GitRepo {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = git2::Repository::open(path)
            .map_err(|_| GitError::NotAGitRepo(path.to_path_buf()))?;
        let repo_path = repo
            .workdir()
            .ok_or_else(|| GitError::NotAGitRepo(path.to_path_buf()))?
            .to_path_buf();
        Ok(Self {
            repo_path,
            git_dir: repo.path().to_path_buf(),
            timeout: DEFAULT_GIT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_git_repo(path: &Path) -> bool {
        git2::Repository::open(path).is_ok()
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    fn open_repo(&self) -> Result<git2::Repository> {
        Ok(git2::Repository::open(&self.repo_path)?)
    }

    /// `None` on detached HEAD
    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.open_repo()?;
        if repo.head_detached()? {
            return Ok(None);
        }
        let head = repo.head()?;
        Ok(head.shorthand().map(str::to_string))
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.open_repo()?;
        let exists = repo.find_branch(branch, git2::BranchType::Local).is_ok();
        Ok(exists)
    }

    pub fn branch_head_commit(&self, branch: &str) -> Result<String> {
        self.ref_commit(&format!("refs/heads/{}", branch))?
            .ok_or_else(|| GitError::BranchNotFound(branch.to_string()))
    }

    /// Commit a full ref name points at, if the ref exists
    pub fn ref_commit(&self, refname: &str) -> Result<Option<String>> {
        let repo = self.open_repo()?;
        let reference = match repo.find_reference(refname) {
            Ok(reference) => reference,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let commit = reference.peel_to_commit()?;
        Ok(Some(commit.id().to_string()))
    }

    /// True if `ancestor` is reachable from `descendant` (or equal to it).
    /// Commits this repository doesn't have count as unrelated.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        if ancestor == descendant {
            return Ok(true);
        }
        let repo = self.open_repo()?;
        let ancestor = git2::Oid::from_str(ancestor)?;
        let descendant = git2::Oid::from_str(descendant)?;
        match repo.graph_descendant_of(descendant, ancestor) {
            Ok(is_descendant) => Ok(is_descendant),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn operation(&self) -> Result<RepoOperation> {
        let repo = self.open_repo()?;
        Ok(RepoOperation::from_state(repo.state()))
    }

    pub fn status(&self) -> Result<RepoStatus> {
        let repo = self.open_repo()?;
        let mut options = git2::StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(false)
            .include_ignored(false)
            .exclude_submodules(true);
        let statuses = repo.statuses(Some(&mut options))?;

        let mut status = RepoStatus {
            operation: RepoOperation::from_state(repo.state()),
            staged: Vec::new(),
            unstaged: Vec::new(),
            untracked: Vec::new(),
            conflicted: Vec::new(),
        };

        for entry in statuses.iter() {
            let path = entry.path().unwrap_or("<non-utf8 path>").to_string();
            let flags = entry.status();
            if flags.is_conflicted() {
                status.conflicted.push(path);
                continue;
            }
            if flags.is_wt_new() {
                status.untracked.push(path);
                continue;
            }
            if flags.intersects(
                git2::Status::INDEX_NEW
                    | git2::Status::INDEX_MODIFIED
                    | git2::Status::INDEX_DELETED
                    | git2::Status::INDEX_RENAMED
                    | git2::Status::INDEX_TYPECHANGE,
            ) {
                status.staged.push(path.clone());
            }
            if flags.intersects(
                git2::Status::WT_MODIFIED
                    | git2::Status::WT_DELETED
                    | git2::Status::WT_RENAMED
                    | git2::Status::WT_TYPECHANGE,
            ) {
                status.unstaged.push(path);
            }
        }

        Ok(status)
    }

    pub fn head_refs_dir(&self) -> PathBuf {
        self.git_dir.join("refs").join("heads")
    }

    /// Loose ref file for `branch`
    pub fn branch_ref_file(&self, branch: &str) -> PathBuf {
        self.head_refs_dir().join(branch)
    }

    /// Packed refs have no file to watch; write the loose copy git would
    /// write on the next update anyway.
    pub fn ensure_loose_branch_ref(&self, branch: &str) -> Result<PathBuf> {
        let ref_file = self.branch_ref_file(branch);
        if ref_file.exists() {
            return Ok(ref_file);
        }
        let commit = self.branch_head_commit(branch)?;
        if let Some(parent) = ref_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&ref_file, format!("{}\n", commit))?;
        debug!(branch, path = %ref_file.display(), "Wrote loose branch ref");
        Ok(ref_file)
    }

    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run_git(&["checkout", branch])?;
        Ok(())
    }

    /// Fetch `src_ref` from `remote` into `dst_ref`. `update_head_ok` allows
    /// updating the branch that is currently checked out.
    pub fn fetch(
        &self,
        remote: &GitRemote,
        src_ref: &str,
        dst_ref: &str,
        update_head_ok: bool,
    ) -> Result<()> {
        let refspec = format!("{}:{}", src_ref, dst_ref);
        let mut args = remote.config_args();
        args.extend(["fetch".to_string(), "--show-forced-updates".to_string()]);
        if update_head_ok {
            args.push("--update-head-ok".to_string());
        }
        args.push(remote.url.clone());
        args.push(refspec);
        self.run_git(&args)?;
        Ok(())
    }

    /// Force-fetch the sandbox's copy of `branch` under [`AGENT_REF_NAMESPACE`]
    /// and return the commit it points at.
    pub fn fetch_agent_branch(&self, remote: &GitRemote, branch: &str) -> Result<String> {
        let tracking_ref = agent_tracking_ref(branch);
        self.fetch(
            remote,
            &format!("+refs/heads/{}", branch),
            &tracking_ref,
            false,
        )?;
        self.ref_commit(&tracking_ref)?
            .ok_or_else(|| GitError::BranchNotFound(format!("{} (in sandbox)", branch)))
    }

    pub fn push(&self, remote: &GitRemote, src_ref: &str, dst_ref: &str) -> Result<()> {
        let mut args = remote.config_args();
        args.push("push".to_string());
        args.push(remote.url.clone());
        args.push(format!("{}:{}", src_ref, dst_ref));
        self.run_git(&args)?;
        Ok(())
    }

    pub fn reset_mixed(&self, reference: &str) -> Result<()> {
        self.run_git(&["reset", "--mixed", reference])?;
        Ok(())
    }

    /// Discard tracked changes and untracked files
    pub fn reset_working_directory(&self) -> Result<()> {
        self.run_git(&["reset", "--hard", "HEAD"])?;
        self.run_git(&["clean", "-fd"])?;
        Ok(())
    }

    /// Paths git currently ignores, relative to the repo root
    pub fn ignored_paths(&self) -> Result<Vec<String>> {
        let stdout = self.run_git(&["status", "--ignored=matching", "--porcelain"])?;
        Ok(parse_ignored_paths(&stdout))
    }

    pub fn run_git<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let joined = args.join(" ");
        trace!(repo = %self.repo_path.display(), "git {}", joined);

        let mut command = Command::new("git");
        command.arg("-C").arg(&self.repo_path).args(&args);

        let output = crate::process::run_with_timeout(&mut command, self.timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                GitError::TimedOut {
                    args: joined.clone(),
                    seconds: self.timeout.as_secs(),
                }
            } else {
                GitError::IoError(e)
            }
        })?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                args: joined,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

pub fn agent_tracking_ref(branch: &str) -> String {
    format!("{}/{}", AGENT_REF_NAMESPACE, branch)
}

fn parse_ignored_paths(porcelain: &str) -> Vec<String> {
    porcelain
        .lines()
        .filter_map(|line| line.strip_prefix("!! "))
        .map(|path| path.trim_matches('"').to_string())
        .collect()
}
