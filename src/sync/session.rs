//! One running sync session: the watchers, the batch scheduler and the live
//! file-tree sync session, wired together.
//!
//! The session does not restore anything in the user's repo when it stops;
//! that belongs to the manager.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::branch_sync::BranchSyncReconciler;
use super::error::{Result, SyncError};
use super::filetree::{FiletreeReconciler, FiletreeSyncBackend, GitStateGuardian};
use super::messenger::SyncUpdateMessenger;
use super::notice::{LocalSyncMessage, SetupStep};
use super::observer::{LocalObserver, ObserverTimings};
use super::reconciler::{default_excluded_subpaths, SubPathReconciler};
use super::remote_bridge::{default_remote_watch_command, RemoteBridge};
use super::scheduler::{PathBatchScheduler, SchedulerConfig};
use super::state::{LocalSyncHighLevelStatus, LocalSyncSessionState, SyncSessionInfo};
use super::threading::StopEvent;
use crate::config::Config;
use crate::environment::Environment;
use crate::git::GitRepo;

/// Tunables for one session, usually derived from [`Config`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub scheduler: SchedulerConfig,
    pub observer: ObserverTimings,
    pub excluded_subpaths: Vec<PathBuf>,
    /// `None` runs the default inotify watch on the sandbox workspace
    pub remote_watch_command: Option<Vec<String>>,
    pub watch_as_root: bool,
    pub thread_join_timeout: Duration,
    pub final_batch_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            observer: ObserverTimings::default(),
            excluded_subpaths: default_excluded_subpaths(),
            remote_watch_command: None,
            watch_as_root: true,
            thread_join_timeout: Duration::from_secs(5),
            final_batch_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            scheduler: SchedulerConfig::from(&config.sync),
            observer: config.sync.observer_timings(),
            excluded_subpaths: config.sync.excluded_subpaths.clone(),
            remote_watch_command: config.sandbox.remote_watch_command.clone(),
            watch_as_root: config.sandbox.watch_as_root,
            thread_join_timeout: config.sync.thread_join_timeout(),
            final_batch_timeout: config.sync.final_batch_timeout(),
        }
    }
}

pub struct LocalSyncSession {
    info: SyncSessionInfo,
    messenger: Arc<SyncUpdateMessenger>,
    backend: Arc<dyn FiletreeSyncBackend>,
    scheduler: PathBatchScheduler,
    observer: LocalObserver,
    bridge: RemoteBridge,
    stop: StopEvent,
    settings: SessionSettings,
}

impl LocalSyncSession {
    /// Validate, mirror the sandbox into the user's checkout, then start
    /// two-way sync. Every reconciler does its initial check and first sync
    /// here.
    pub fn build_and_start(
        environment: Arc<dyn Environment>,
        info: SyncSessionInfo,
        user_repo: GitRepo,
        messenger: Arc<SyncUpdateMessenger>,
        backend: Arc<dyn FiletreeSyncBackend>,
        settings: SessionSettings,
    ) -> Result<Self> {
        let started = Instant::now();
        messenger.on_setup_update(SetupStep::ValidateGitStateSafety);
        let branch_reconciler =
            BranchSyncReconciler::build(&info.sync_branch, user_repo.clone(), environment.clone())?;
        branch_reconciler.validate_branches_are_safely_syncable()?;

        messenger.on_setup_update(SetupStep::MirrorAgentIntoLocalRepo);
        branch_reconciler.mirror_agent_into_user(info.is_switching_branches())?;

        let guardian = GitStateGuardian::new(user_repo.clone(), info.sync_branch.clone());
        let local_root = user_repo.repo_path().to_path_buf();
        let remote_url = environment.filetree_sync_url();
        backend.overwrite_local_with_remote_once(
            &local_root,
            &remote_url,
            &format!("{}-init", info.sync_name),
            environment.snapshot_guard(),
        )?;
        debug!(elapsed = ?started.elapsed(), "Local checkout mirrors the sandbox");

        messenger.on_setup_update(SetupStep::BeginTwoWayControlledSync);
        let filetree_session = backend.create_bidirectional_session(
            &local_root,
            &remote_url,
            &info.sync_name,
            environment.snapshot_guard(),
        )?;

        let stop = StopEvent::new();
        messenger.attach_stop_event(stop.clone());
        let watching = FiletreeReconciler::with_exclusions(
            filetree_session,
            local_root,
            environment.workspace_dir().to_path_buf(),
            guardian,
            stop.clone(),
            &settings.excluded_subpaths,
        )
        .and_then(|filetree_reconciler| {
            let reconcilers: Vec<Box<dyn SubPathReconciler>> =
                vec![Box::new(branch_reconciler), Box::new(filetree_reconciler)];
            start_watching(
                environment.as_ref(),
                reconcilers,
                messenger.clone(),
                &settings,
                &stop,
            )
        });
        let (scheduler, observer, bridge) = match watching {
            Ok(parts) => parts,
            Err(e) => {
                stop.set();
                if let Err(term_err) = backend.terminate_session(&info.sync_name) {
                    warn!(
                        session = %info.sync_name,
                        "Failed to terminate file-tree session after failed start: {}", term_err
                    );
                }
                return Err(e);
            }
        };

        messenger.on_setup_complete();
        info!(
            task_id = %info.task_id,
            branch = %info.sync_branch,
            elapsed = ?started.elapsed(),
            "Local sync started"
        );
        Ok(Self {
            info,
            messenger,
            backend,
            scheduler,
            observer,
            bridge,
            stop,
            settings,
        })
    }

    pub fn info(&self) -> &SyncSessionInfo {
        &self.info
    }

    pub fn state(&self) -> Option<LocalSyncSessionState> {
        LocalSyncSessionState::build_if_sensible(
            self.info.clone(),
            &self.observer.snapshot(),
            self.scheduler.status(),
            self.messenger.last_sent_message(),
        )
    }

    /// Stopped when the state can't be built
    pub fn high_level_status(&self) -> LocalSyncHighLevelStatus {
        self.state()
            .map(|state| state.high_level_status())
            .unwrap_or(LocalSyncHighLevelStatus::Stopped)
    }

    pub fn last_sent_message(&self) -> Option<LocalSyncMessage> {
        self.messenger.last_sent_message()
    }

    /// Why the local watcher died, if it did
    pub fn watcher_failure(&self) -> Option<String> {
        self.observer.snapshot().failure
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    pub fn describe_current_state(&self) -> String {
        format!(
            "session {} ({})\nobserver: {}\nremote watcher running: {}\n{}",
            self.info.sync_name,
            self.high_level_status(),
            self.observer.lifecycle(),
            self.bridge.is_running(),
            self.scheduler.describe_current_state()
        )
    }

    /// Let any in-flight batch finish, then tear everything down. Every part
    /// is stopped even when an earlier one fails.
    pub fn stop(&self) -> Result<()> {
        let task_id = self.info.task_id.as_str();
        info!(task_id, "Stopping local sync session");
        self.scheduler.stop();
        if !self
            .scheduler
            .wait_for_final_batch(self.settings.final_batch_timeout)
        {
            info!(task_id, "Final batch still running, tearing down anyway");
        }

        let terminated = self.backend.terminate_session(&self.info.sync_name);

        self.observer.stop();
        self.bridge.stop();
        let timeout = self.settings.thread_join_timeout;
        let observer_exited = self.observer.join(timeout);
        let bridge_exited = self.bridge.join(timeout);

        if let Err(e) = terminated {
            error!(task_id, "Failed to terminate file-tree session: {}", e);
            return Err(SyncError::cleanup(
                format!("Failed to terminate file-tree session: {}", e),
                Some(task_id),
                "mutagen_termination",
            ));
        }
        if !observer_exited || !bridge_exited {
            return Err(SyncError::cleanup(
                format!(
                    "Watcher threads did not exit in time (observer_exited={}, bridge_exited={})",
                    observer_exited, bridge_exited
                ),
                Some(task_id),
                "observer_cleanup",
            ));
        }
        debug!(task_id, "Local sync session stopped");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_set()
    }
}

impl std::fmt::Debug for LocalSyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSyncSession")
            .field("info", &self.info)
            .field("observer", &self.observer)
            .field("stopped", &self.stop.is_set())
            .finish()
    }
}

fn start_watching(
    environment: &dyn Environment,
    reconcilers: Vec<Box<dyn SubPathReconciler>>,
    messenger: Arc<SyncUpdateMessenger>,
    settings: &SessionSettings,
    stop: &StopEvent,
) -> Result<(PathBatchScheduler, LocalObserver, RemoteBridge)> {
    let (tx, rx) = mpsc::channel();
    let scheduler = PathBatchScheduler::start(
        reconcilers,
        messenger,
        rx,
        settings.scheduler.clone(),
        stop.clone(),
    )?;

    let observer = LocalObserver::new(
        "aoe-sync-observer",
        scheduler.top_level_local_dirs_to_register(),
        stop.clone(),
        settings.observer,
    );
    observer.start(tx.clone())?;

    let command = settings
        .remote_watch_command
        .clone()
        .unwrap_or_else(|| default_remote_watch_command(environment.workspace_dir()));
    let bridge = match RemoteBridge::start(
        environment,
        &command,
        settings.watch_as_root,
        tx,
        stop.clone(),
    ) {
        Ok(bridge) => bridge,
        Err(e) => {
            observer.stop();
            observer.join(settings.thread_join_timeout);
            return Err(e);
        }
    };
    Ok((scheduler, observer, bridge))
}
