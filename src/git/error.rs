// Git error types

use std::path::PathBuf;

#[derive(Debug)]
pub enum GitError {
    NotAGitRepo(PathBuf),
    BranchNotFound(String),
    CommandFailed {
        args: String,
        code: Option<i32>,
        stderr: String,
    },
    TimedOut {
        args: String,
        seconds: u64,
    },
    Git2Error(git2::Error),
    IoError(std::io::Error),
}

impl GitError {
    /// Name of the git operation that failed, for cleanup diagnostics
    pub fn operation(&self) -> &str {
        match self {
            GitError::CommandFailed { args, .. } | GitError::TimedOut { args, .. } => {
                args.split_whitespace().next().unwrap_or("command")
            }
            GitError::NotAGitRepo(_) => "open",
            GitError::BranchNotFound(_) => "resolve_branch",
            GitError::Git2Error(_) => "libgit2",
            GitError::IoError(_) => "io",
        }
    }
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::NotAGitRepo(path) => {
                write!(f, "Path is not in a git repository: {}", path.display())
            }
            GitError::BranchNotFound(branch) => write!(f, "Branch '{}' not found", branch),
            GitError::CommandFailed { args, code, stderr } => {
                write!(f, "git {} failed", args)?;
                if let Some(code) = code {
                    write!(f, " (exit code {})", code)?;
                }
                if !stderr.trim().is_empty() {
                    write!(f, ": {}", stderr.trim())?;
                }
                Ok(())
            }
            GitError::TimedOut { args, seconds } => {
                write!(f, "git {} timed out after {}s", args, seconds)
            }
            GitError::Git2Error(err) => write!(f, "Git error: {}", err),
            GitError::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for GitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GitError::Git2Error(err) => Some(err),
            GitError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<git2::Error> for GitError {
    fn from(err: git2::Error) -> Self {
        GitError::Git2Error(err)
    }
}

impl From<std::io::Error> for GitError {
    fn from(err: std::io::Error) -> Self {
        GitError::IoError(err)
    }
}

pub type Result<T> = std::result::Result<T, GitError>;
