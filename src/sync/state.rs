//! What callers see of a running sync session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::notice::{LocalSyncMessage, Notice};
use super::observer::{ObserverLifecycle, ObserverSnapshot};
use super::scheduler::SchedulerStatus;

/// Identifies one sync session. Persisted while the session runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSessionInfo {
    pub task_id: String,
    pub project_id: String,
    /// Name of the file-tree sync session
    pub sync_name: String,
    pub sync_branch: String,
    /// Where the user was before the first sync in this project
    pub original_branch: String,
}

impl SyncSessionInfo {
    pub fn is_switching_branches(&self) -> bool {
        self.original_branch != self.sync_branch
    }
}

/// The only status a caller should branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalSyncHighLevelStatus {
    Active,
    Paused,
    Stopped,
}

impl LocalSyncHighLevelStatus {
    /// Stopped wins over paused, paused over active
    pub fn derive(lifecycle: ObserverLifecycle, scheduler_status: SchedulerStatus) -> Self {
        if lifecycle.is_stopped_or_stopping() || scheduler_status == SchedulerStatus::Stopping {
            return LocalSyncHighLevelStatus::Stopped;
        }
        if scheduler_status.is_paused() {
            return LocalSyncHighLevelStatus::Paused;
        }
        LocalSyncHighLevelStatus::Active
    }

    pub fn is_paused(&self) -> bool {
        *self == LocalSyncHighLevelStatus::Paused
    }
}

impl std::fmt::Display for LocalSyncHighLevelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LocalSyncHighLevelStatus::Active => "ACTIVE",
            LocalSyncHighLevelStatus::Paused => "PAUSED",
            LocalSyncHighLevelStatus::Stopped => "STOPPED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSyncSessionState {
    pub info: SyncSessionInfo,
    pub scheduler_status: SchedulerStatus,
    pub observer_lifecycle: ObserverLifecycle,
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    pub last_sent_message: Option<LocalSyncMessage>,
}

impl LocalSyncSessionState {
    /// `None` until the local watcher has actually started, so a session
    /// never looks active without one.
    pub fn build_if_sensible(
        info: SyncSessionInfo,
        observer: &ObserverSnapshot,
        scheduler_status: SchedulerStatus,
        last_sent_message: Option<LocalSyncMessage>,
    ) -> Option<Self> {
        let start_time = match (observer.lifecycle, observer.start_time) {
            (ObserverLifecycle::Initialized, _) | (_, None) => {
                debug!("Session state requested before the observer started");
                return None;
            }
            (_, Some(start_time)) => start_time,
        };
        Some(Self {
            info,
            scheduler_status,
            observer_lifecycle: observer.lifecycle,
            start_time,
            stop_time: observer.stop_time,
            last_sent_message,
        })
    }

    pub fn high_level_status(&self) -> LocalSyncHighLevelStatus {
        LocalSyncHighLevelStatus::derive(self.observer_lifecycle, self.scheduler_status)
    }

    /// Notices carried by the latest update message
    pub fn notices(&self) -> Vec<Notice> {
        self.last_sent_message
            .as_ref()
            .map(LocalSyncMessage::all_notices)
            .unwrap_or_default()
    }
}
