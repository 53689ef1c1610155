//! Notices and messages a sync session reports to its task

use serde::{Deserialize, Serialize};

/// A user-facing reason attached to session updates.
///
/// Pause notices stop batches from being handled until the condition clears;
/// warnings are informational.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Pause { source_tag: String, reason: String },
    Warning { source_tag: String, reason: String },
}

impl Notice {
    pub fn pause(source_tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Notice::Pause {
            source_tag: source_tag.into(),
            reason: reason.into(),
        }
    }

    pub fn warning(source_tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Notice::Warning {
            source_tag: source_tag.into(),
            reason: reason.into(),
        }
    }

    pub fn source_tag(&self) -> &str {
        match self {
            Notice::Pause { source_tag, .. } | Notice::Warning { source_tag, .. } => source_tag,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Notice::Pause { reason, .. } | Notice::Warning { reason, .. } => reason,
        }
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, Notice::Pause { .. })
    }

    /// Pauses sort before warnings
    pub fn priority_for_ordering(&self) -> u8 {
        match self {
            Notice::Pause { .. } => 0,
            Notice::Warning { .. } => 1,
        }
    }

    pub fn describe(&self) -> String {
        let kind = match self {
            Notice::Pause { .. } => "Pause",
            Notice::Warning { .. } => "Warning",
        };
        format!("{} from {}: {}", kind, self.source_tag(), self.reason())
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

pub fn sort_by_priority(notices: &mut [Notice]) {
    notices.sort_by_key(Notice::priority_for_ordering);
}

pub fn is_pause_necessary<'a>(notices: impl IntoIterator<Item = &'a Notice>) -> bool {
    notices.into_iter().any(Notice::is_pause)
}

/// Splits notices into `(pauses, non-pauses)`, preserving order
pub fn separate_pause_notices(notices: &[Notice]) -> (Vec<Notice>, Vec<Notice>) {
    notices.iter().cloned().partition(Notice::is_pause)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStep {
    ValidateGitStateSafety,
    MirrorAgentIntoLocalRepo,
    BeginTwoWayControlledSync,
}

impl std::fmt::Display for SetupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SetupStep::ValidateGitStateSafety => "validating git state",
            SetupStep::MirrorAgentIntoLocalRepo => "mirroring agent into local repo",
            SetupStep::BeginTwoWayControlledSync => "starting two-way sync",
        };
        f.write_str(label)
    }
}

/// Everything a session tells its task, in the order it happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalSyncMessage {
    SetupStarted,
    SetupProgress {
        next_step: SetupStep,
    },
    SetupAndEnabled,
    UpdatePending {
        description: String,
    },
    UpdateCompleted {
        description: String,
        nonpause_notices: Vec<Notice>,
        is_resumption: bool,
    },
    /// Build with [`LocalSyncMessage::update_paused`]; it always carries at
    /// least one pause notice.
    UpdatePaused {
        description: String,
        nonpause_notices: Vec<Notice>,
        pause_notices: Vec<Notice>,
    },
    Disabled,
}

impl LocalSyncMessage {
    /// Returns `None` when there is nothing to pause on.
    pub fn update_paused(
        description: impl Into<String>,
        nonpause_notices: Vec<Notice>,
        pause_notices: Vec<Notice>,
    ) -> Option<Self> {
        if pause_notices.is_empty() || !pause_notices.iter().all(Notice::is_pause) {
            return None;
        }
        Some(LocalSyncMessage::UpdatePaused {
            description: description.into(),
            nonpause_notices,
            pause_notices,
        })
    }

    pub fn is_update(&self) -> bool {
        matches!(
            self,
            LocalSyncMessage::UpdatePending { .. }
                | LocalSyncMessage::UpdateCompleted { .. }
                | LocalSyncMessage::UpdatePaused { .. }
        )
    }

    /// Notices a UI should display for this message, pauses first
    pub fn all_notices(&self) -> Vec<Notice> {
        match self {
            LocalSyncMessage::UpdateCompleted {
                nonpause_notices, ..
            } => nonpause_notices.clone(),
            LocalSyncMessage::UpdatePaused {
                nonpause_notices,
                pause_notices,
                ..
            } => pause_notices
                .iter()
                .chain(nonpause_notices.iter())
                .cloned()
                .collect(),
            LocalSyncMessage::SetupStarted
            | LocalSyncMessage::SetupProgress { .. }
            | LocalSyncMessage::SetupAndEnabled
            | LocalSyncMessage::UpdatePending { .. }
            | LocalSyncMessage::Disabled => Vec::new(),
        }
    }

    /// One-line summary for terminal output
    pub fn summary(&self) -> String {
        match self {
            LocalSyncMessage::SetupStarted => "sync setup started".to_string(),
            LocalSyncMessage::SetupProgress { next_step } => format!("sync setup: {}", next_step),
            LocalSyncMessage::SetupAndEnabled => "sync enabled".to_string(),
            LocalSyncMessage::UpdatePending { description } => description.clone(),
            LocalSyncMessage::UpdateCompleted { description, .. } => description.clone(),
            LocalSyncMessage::UpdatePaused {
                description,
                pause_notices,
                ..
            } => {
                let reasons: Vec<_> = pause_notices.iter().map(Notice::describe).collect();
                format!("{}: {}", description, reasons.join("; "))
            }
            LocalSyncMessage::Disabled => "sync disabled".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let notice = Notice::pause("local_git_state_guardian", "rebase is in progress");
        assert_eq!(
            notice.describe(),
            "Pause from local_git_state_guardian: rebase is in progress"
        );
        assert_eq!(
            Notice::warning("filetree", "conflict").describe(),
            "Warning from filetree: conflict"
        );
    }

    #[test]
    fn test_sort_puts_pauses_first() {
        let mut notices = vec![
            Notice::warning("a", "w1"),
            Notice::pause("b", "p1"),
            Notice::warning("c", "w2"),
            Notice::pause("d", "p2"),
        ];
        sort_by_priority(&mut notices);
        let reasons: Vec<_> = notices.iter().map(Notice::reason).collect();
        assert_eq!(reasons, vec!["p1", "p2", "w1", "w2"]);
    }

    #[test]
    fn test_separate_pause_notices() {
        let notices = vec![Notice::warning("a", "w"), Notice::pause("b", "p")];
        let (pauses, nonpauses) = separate_pause_notices(&notices);
        assert_eq!(pauses, vec![Notice::pause("b", "p")]);
        assert_eq!(nonpauses, vec![Notice::warning("a", "w")]);
        assert!(is_pause_necessary(&notices));
        assert!(!is_pause_necessary(&nonpauses));
    }

    #[test]
    fn test_update_paused_requires_a_pause_notice() {
        assert!(LocalSyncMessage::update_paused("paused", vec![], vec![]).is_none());
        assert!(LocalSyncMessage::update_paused(
            "paused",
            vec![],
            vec![Notice::warning("a", "not a pause")]
        )
        .is_none());

        let message = LocalSyncMessage::update_paused(
            "paused",
            vec![Notice::warning("a", "w")],
            vec![Notice::pause("b", "p")],
        )
        .unwrap();
        assert_eq!(
            message.all_notices(),
            vec![Notice::pause("b", "p"), Notice::warning("a", "w")]
        );
    }

    #[test]
    fn test_message_serialization_is_tagged() {
        let message = LocalSyncMessage::SetupProgress {
            next_step: SetupStep::MirrorAgentIntoLocalRepo,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(
            json,
            r#"{"type":"setup_progress","next_step":"mirror_agent_into_local_repo"}"#
        );
        let parsed: LocalSyncMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }
}
