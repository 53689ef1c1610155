//! Turns session progress and batch outcomes into task messages

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use super::notice::{LocalSyncMessage, Notice, SetupStep};
use super::scheduler::{BatchLifecycleCallbacks, PathsByTag, PauseCause};
use super::threading::StopEvent;
use crate::task::TaskStore;

fn changed_path_count(paths_by_tag: &PathsByTag) -> usize {
    paths_by_tag
        .values()
        .flatten()
        .collect::<BTreeSet<&PathBuf>>()
        .len()
}

#[derive(Debug)]
pub struct SyncUpdateMessenger {
    task_id: String,
    store: Arc<dyn TaskStore>,
    stop: Mutex<Option<StopEvent>>,
    last_sent_message: Mutex<Option<LocalSyncMessage>>,
}

impl SyncUpdateMessenger {
    pub fn new(task_id: impl Into<String>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            task_id: task_id.into(),
            store,
            stop: Mutex::new(None),
            last_sent_message: Mutex::new(None),
        }
    }

    /// Once `stop` is set, nothing more is sent
    pub fn attach_stop_event(&self, stop: StopEvent) {
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop);
    }

    fn is_stopped(&self) -> bool {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(StopEvent::is_set)
    }

    pub fn last_sent_message(&self) -> Option<LocalSyncMessage> {
        self.last_sent_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn send(&self, message: LocalSyncMessage) {
        if self.is_stopped() {
            info!(
                task_id = %self.task_id,
                "Not sending update message, sync session is stopped: {}",
                message.summary()
            );
            return;
        }
        if let Err(e) = self.store.record_message(&self.task_id, &message) {
            warn!(task_id = %self.task_id, "Failed to record sync message: {:#}", e);
        }
        *self
            .last_sent_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    pub fn on_setup_update(&self, next_step: SetupStep) {
        self.send(LocalSyncMessage::SetupProgress { next_step });
    }

    pub fn on_setup_complete(&self) {
        self.send(LocalSyncMessage::SetupAndEnabled);
    }
}

impl BatchLifecycleCallbacks for SyncUpdateMessenger {
    fn on_new_batch_pending(&self, triggering_paths_by_tag: &PathsByTag) {
        let description = format!(
            "New batch pending (changed_path_count={})",
            changed_path_count(triggering_paths_by_tag)
        );
        self.send(LocalSyncMessage::UpdatePending { description });
    }

    fn on_batch_complete(
        &self,
        path_batch_by_tag: &PathsByTag,
        nonpause_notices: &[Notice],
        prior_pause: Option<PauseCause>,
    ) {
        let count = changed_path_count(path_batch_by_tag);
        let (description, is_resumption) = match prior_pause {
            Some(PauseCause::KnownNotice) => (
                format!(
                    "Resuming after resolving known notices (changed_path_count={})",
                    count
                ),
                true,
            ),
            Some(PauseCause::UnexpectedError) => (
                format!(
                    "Resuming after resolving unexpected exceptions (changed_path_count={})",
                    count
                ),
                true,
            ),
            Some(PauseCause::User) | None => (
                format!(
                    "Sending update local sync message (changed_path_count={})",
                    count
                ),
                false,
            ),
        };
        info!(task_id = %self.task_id, "{}", description);
        self.send(LocalSyncMessage::UpdateCompleted {
            description,
            nonpause_notices: nonpause_notices.to_vec(),
            is_resumption,
        });
    }

    fn on_handling_paused(
        &self,
        pending_reconciler_tags: &[String],
        nonpause_notices: &[Notice],
        pause_notices: &[Notice],
    ) {
        let description = format!(
            "Paused due to notices (pending_reconciler_tags=[{}])",
            pending_reconciler_tags.join(", ")
        );
        match LocalSyncMessage::update_paused(
            description,
            nonpause_notices.to_vec(),
            pause_notices.to_vec(),
        ) {
            Some(message) => self.send(message),
            None => warn!(
                task_id = %self.task_id,
                "Handling paused without a pause notice, not reporting it"
            ),
        }
    }
}
