use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::notice::Notice;
use crate::environment::EnvironmentError;
use crate::git::GitError;

/// A precondition that prevents a session from starting. Startup reports
/// every blocker it finds at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectedStartupBlocker {
    UserGitStateDirty,
    UserBranchAheadOfAgent,
    BranchesDiverged,
}

impl std::fmt::Display for ExpectedStartupBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExpectedStartupBlocker::UserGitStateDirty => "USER_GIT_STATE_DIRTY",
            ExpectedStartupBlocker::UserBranchAheadOfAgent => "USER_BRANCH_AHEAD_OF_AGENT",
            ExpectedStartupBlocker::BranchesDiverged => "BRANCHES_DIVERGED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Cannot {action} {task_id}: Another sync state transition is in progress")]
    OtherSyncTransitionInProgress { action: String, task_id: String },

    #[error("{}\nExpected blockers: {}", with_details(.message, &[("Task branch", Some(.task_branch.as_str()))]), join_blockers(.blockers))]
    ExpectedStartup {
        message: String,
        blockers: Vec<ExpectedStartupBlocker>,
        task_branch: String,
    },

    #[error("{}", with_details(.message, &[("Task ID", .task_id.as_deref()), ("Task branch", .task_branch.as_deref())]))]
    Startup {
        message: String,
        task_id: Option<String>,
        task_branch: Option<String>,
    },

    #[error("{}", with_details(.message, &[("Task ID", .task_id.as_deref()), ("Cleanup step", .cleanup_step.as_deref())]))]
    Cleanup {
        message: String,
        task_id: Option<String>,
        cleanup_step: Option<String>,
    },

    #[error("{}", with_details(.message, &[("Task ID", .task_id.as_deref()), ("Current state", .current_state.as_deref()), ("Expected state", .expected_state.as_deref())]))]
    State {
        message: String,
        task_id: Option<String>,
        current_state: Option<String>,
        expected_state: Option<String>,
    },

    #[error("{}", join_reasons(.0))]
    NewNotices(Vec<Notice>),

    #[error("Invalid sync configuration: {0}")]
    Configuration(String),

    #[error("{}", with_details(.message, &[("Operation", Some(.operation.as_str())), ("Session", Some(.session_name.as_str())), ("Exit code", .exit_code.map(|c| c.to_string()).as_deref()), ("Stderr", .stderr.as_deref())]))]
    FiletreeSync {
        operation: String,
        session_name: String,
        message: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error("Task store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("File watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Only a concurrent transition clears up on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::OtherSyncTransitionInProgress { .. })
    }

    /// User-actionable conditions as opposed to bugs or infrastructure failures
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            SyncError::ExpectedStartup { .. }
                | SyncError::OtherSyncTransitionInProgress { .. }
                | SyncError::NewNotices(_)
        )
    }

    pub fn blockers(&self) -> &[ExpectedStartupBlocker] {
        match self {
            SyncError::ExpectedStartup { blockers, .. } => blockers,
            _ => &[],
        }
    }

    /// Short name used to group repeated failures in logs
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::OtherSyncTransitionInProgress { .. } => "other_transition_in_progress",
            SyncError::ExpectedStartup { .. } => "expected_startup",
            SyncError::Startup { .. } => "startup",
            SyncError::Cleanup { .. } => "cleanup",
            SyncError::State { .. } => "state",
            SyncError::NewNotices(_) => "new_notices",
            SyncError::Configuration(_) => "configuration",
            SyncError::FiletreeSync { .. } => "filetree_sync",
            SyncError::Git(_) => "git",
            SyncError::Environment(_) => "environment",
            SyncError::Store(_) => "store",
            SyncError::Watcher(_) => "watcher",
            SyncError::Io(_) => "io",
        }
    }

    pub(crate) fn cleanup(
        message: impl Into<String>,
        task_id: Option<&str>,
        cleanup_step: &str,
    ) -> Self {
        SyncError::Cleanup {
            message: message.into(),
            task_id: task_id.map(str::to_string),
            cleanup_step: Some(cleanup_step.to_string()),
        }
    }
}

fn with_details(message: &str, details: &[(&str, Option<&str>)]) -> String {
    let mut lines = vec![message.to_string()];
    for (label, value) in details {
        if let Some(value) = value {
            lines.push(format!("{}: {}", label, value));
        }
    }
    lines.join("\n")
}

fn join_reasons(notices: &[Notice]) -> String {
    notices
        .iter()
        .map(Notice::reason)
        .collect::<Vec<_>>()
        .join(", AND ")
}

fn join_blockers(blockers: &[ExpectedStartupBlocker]) -> String {
    blockers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, SyncError>;
