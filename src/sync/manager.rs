//! The top-level sync state machine.
//!
//! At most one session runs per process. Start, stop and cleanup are
//! serialized by a transition lock that is only ever *tried*: a second caller
//! gets [`SyncError::OtherSyncTransitionInProgress`] instead of queueing
//! behind the first. Reads of the current session go through a separate
//! reader/writer lock so a slow status poll never holds up a transition.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::error::{Result, SyncError};
use super::filetree::{
    filetree_session_name, project_session_prefix, FiletreeSyncBackend, DEFAULT_SESSION_PREFIX,
};
use super::messenger::SyncUpdateMessenger;
use super::notice::{LocalSyncMessage, SetupStep};
use super::rwlock::ReadWriteLock;
use super::session::{LocalSyncSession, SessionSettings};
use super::state::{LocalSyncSessionState, SyncSessionInfo};
use crate::config::Config;
use crate::environment::{self, Environment};
use crate::git::GitRepo;
use crate::task::{Task, TaskStore};

pub type EnvironmentFactory = Arc<dyn Fn(&Task) -> Arc<dyn Environment> + Send + Sync>;

const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct LocalSyncManager {
    store: Arc<dyn TaskStore>,
    backend: Arc<dyn FiletreeSyncBackend>,
    environment_factory: EnvironmentFactory,
    settings: SessionSettings,
    session_prefix: String,
    git_timeout: Duration,
    transition: Mutex<()>,
    session: ReadWriteLock<Option<Arc<LocalSyncSession>>>,
}

impl LocalSyncManager {
    pub fn new(store: Arc<dyn TaskStore>, backend: Arc<dyn FiletreeSyncBackend>) -> Self {
        let workspace_dir = PathBuf::from("/workspace");
        Self {
            store,
            backend,
            environment_factory: Arc::new(move |task: &Task| {
                environment::for_task(&task.environment, &workspace_dir)
            }),
            settings: SessionSettings::default(),
            session_prefix: DEFAULT_SESSION_PREFIX.to_string(),
            git_timeout: DEFAULT_GIT_TIMEOUT,
            transition: Mutex::new(()),
            session: ReadWriteLock::new(None),
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn TaskStore>,
        backend: Arc<dyn FiletreeSyncBackend>,
    ) -> Self {
        let workspace_dir = config.sandbox.workspace_dir.clone();
        Self::new(store, backend)
            .with_settings(SessionSettings::from(config))
            .with_session_prefix(config.filetree.session_prefix.clone())
            .with_git_timeout(config.git.command_timeout())
            .with_environment_factory(move |task: &Task| {
                environment::for_task(&task.environment, &workspace_dir)
            })
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_session_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.session_prefix = prefix.into();
        self
    }

    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn with_environment_factory(
        mut self,
        factory: impl Fn(&Task) -> Arc<dyn Environment> + Send + Sync + 'static,
    ) -> Self {
        self.environment_factory = Arc::new(factory);
        self
    }

    /// Terminate file-tree sessions a previous process left behind
    pub fn start_service(&self) {
        info!("Starting local sync service");
        self.cleanup_dangling_sessions();
    }

    pub fn stop_service(&self) {
        self.cleanup_current_sync();
        self.cleanup_dangling_sessions();
    }

    fn try_begin_transition(&self, action: &str, task_id: &str) -> Result<MutexGuard<'_, ()>> {
        match self.transition.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(SyncError::OtherSyncTransitionInProgress {
                action: action.to_string(),
                task_id: task_id.to_string(),
            }),
        }
    }

    pub fn current_session(&self) -> Option<Arc<LocalSyncSession>> {
        (*self.session.read_lock()).clone()
    }

    fn current_info(&self) -> Option<SyncSessionInfo> {
        self.current_session().map(|s| s.info().clone())
    }

    pub fn get_session_state(&self) -> Option<LocalSyncSessionState> {
        self.current_session().and_then(|s| s.state())
    }

    pub fn is_task_synced(&self, task_id: &str) -> bool {
        self.current_info().is_some_and(|info| info.task_id == task_id)
    }

    fn send(&self, task_id: &str, message: LocalSyncMessage) {
        if let Err(e) = self.store.record_message(task_id, &message) {
            warn!(task_id, "Failed to record sync message: {:#}", e);
        }
    }

    fn ensure_session_is_stopped(&self) -> Result<()> {
        let session = self.session.write_lock().take();
        match session {
            Some(session) => session.stop(),
            None => Ok(()),
        }
    }

    fn open_repo(&self, task: &Task) -> Result<GitRepo> {
        Ok(GitRepo::open(&task.repo_path)?.with_timeout(self.git_timeout))
    }

    /// Start syncing `task_id`, replacing whatever session is running
    pub fn sync_to_task(&self, task_id: &str) -> Result<SyncSessionInfo> {
        let _transition = self.try_begin_transition("sync to", task_id)?;
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| SyncError::Startup {
                message: format!("Task {} not found", task_id),
                task_id: Some(task_id.to_string()),
                task_branch: None,
            })?;
        self.sync_to_task_locked(&task)
    }

    fn sync_to_task_locked(&self, task: &Task) -> Result<SyncSessionInfo> {
        info!(task_id = %task.id, branch = %task.branch_name, "Starting sync");

        let previous = self.current_info();
        let previous_in_project = previous
            .as_ref()
            .filter(|p| p.project_id == task.project_id)
            .cloned();
        if let Some(previous) = &previous {
            if let Err(e) = self.unsync_locked(&previous.task_id, previous_in_project.is_some()) {
                error!(
                    task_id = %previous.task_id,
                    "Failed to cleanly disable previous sync: {}", e
                );
            }
        }

        let messenger = Arc::new(SyncUpdateMessenger::new(&task.id, self.store.clone()));
        messenger.send(LocalSyncMessage::SetupStarted);
        self.ensure_no_sessions_exist_for_project(&task.project_id);

        let mut new_info = None;
        let started = self.start_session(task, previous_in_project, &messenger, &mut new_info);
        let session = match started {
            Ok(session) => session,
            Err(e) => {
                let error = match e {
                    e @ (SyncError::ExpectedStartup { .. } | SyncError::Startup { .. }) => e,
                    other => {
                        error!(task_id = %task.id, "Failed to start sync: {}", other);
                        SyncError::Startup {
                            message: format!("Failed to start sync for task {}: {}", task.id, other),
                            task_id: Some(task.id.clone()),
                            task_branch: Some(task.branch_name.clone()),
                        }
                    }
                };
                if let Some(info) = new_info {
                    self.cleanup_after_failed_start(task, &info, &messenger);
                }
                return Err(error);
            }
        };

        let info = session.info().clone();
        if let Err(e) = self.store.save_sync_record(&info) {
            warn!(task_id = %task.id, "Failed to persist active sync record: {:#}", e);
        }
        *self.session.write_lock() = Some(session);
        info!(task_id = %task.id, "Successfully enabled sync");
        Ok(info)
    }

    fn start_session(
        &self,
        task: &Task,
        previous_in_project: Option<SyncSessionInfo>,
        messenger: &Arc<SyncUpdateMessenger>,
        new_info: &mut Option<SyncSessionInfo>,
    ) -> Result<Arc<LocalSyncSession>> {
        let user_repo = self.open_repo(task)?;
        let original_branch = match previous_in_project {
            // The restore target stays the branch from before the first sync
            Some(previous) => previous.original_branch,
            None => user_repo.current_branch()?.ok_or_else(|| SyncError::Startup {
                message: "Cannot start sync from a detached HEAD; check out a branch first"
                    .to_string(),
                task_id: Some(task.id.clone()),
                task_branch: Some(task.branch_name.clone()),
            })?,
        };
        let info = SyncSessionInfo {
            task_id: task.id.clone(),
            project_id: task.project_id.clone(),
            sync_name: filetree_session_name(&self.session_prefix, &task.project_id, &task.id),
            sync_branch: task.branch_name.clone(),
            original_branch,
        };
        *new_info = Some(info.clone());

        let environment = (self.environment_factory)(task);
        let session = LocalSyncSession::build_and_start(
            environment,
            info,
            user_repo,
            messenger.clone(),
            self.backend.clone(),
            self.settings.clone(),
        )?;
        Ok(Arc::new(session))
    }

    /// Setup only touches the user's checkout from the mirroring step on.
    /// Failures before that leave everything as the user had it.
    fn cleanup_after_failed_start(
        &self,
        task: &Task,
        info: &SyncSessionInfo,
        messenger: &SyncUpdateMessenger,
    ) {
        info!(task_id = %task.id, "Cleaning up after sync startup error");
        if let Err(e) = self.backend.terminate_session(&info.sync_name) {
            warn!(session = %info.sync_name, "Failed to terminate file-tree session: {}", e);
        }
        let has_touched_checkout = matches!(
            messenger.last_sent_message(),
            Some(LocalSyncMessage::SetupProgress {
                next_step: SetupStep::MirrorAgentIntoLocalRepo | SetupStep::BeginTwoWayControlledSync
            })
        );
        if !has_touched_checkout {
            debug!(task_id = %task.id, "Startup failed before touching the local checkout");
            return;
        }
        if let Err(e) = self.restore_user_repo(info, false) {
            error!(task_id = %task.id, "Failed to restore local checkout after startup error: {}", e);
        }
    }

    /// Stop syncing `task_id` and put the user back on their original branch.
    /// With `switching_to_task` the sync branch stays checked out for the
    /// task that takes over next.
    pub fn unsync_from_task(&self, task_id: &str, switching_to_task: bool) -> Result<()> {
        let _transition = self.try_begin_transition("unsync from", task_id)?;
        self.unsync_locked(task_id, switching_to_task)
    }

    fn unsync_locked(&self, task_id: &str, switching_to_task: bool) -> Result<()> {
        let reason = if switching_to_task {
            "switching to a new task"
        } else {
            "stopping active sync"
        };
        info!(task_id, "Stopping active sync: {}", reason);

        let session = self
            .current_session()
            .filter(|session| session.info().task_id == task_id);
        let Some(session) = session else {
            debug!(task_id, "No active sync found, sending disabled message anyway");
            self.send(task_id, LocalSyncMessage::Disabled);
            return Ok(());
        };
        let info = session.info().clone();
        let is_paused = session.high_level_status().is_paused();
        drop(session);

        let stopped = self.ensure_session_is_stopped();
        if let Err(e) = self.store.clear_sync_record() {
            warn!(task_id, "Failed to clear active sync record: {:#}", e);
        }
        if let Err(e) = stopped {
            error!(task_id, "Failed to stop sync session: {}", e);
            self.send(task_id, LocalSyncMessage::Disabled);
            return Err(e);
        }

        if is_paused {
            info!(task_id, "Unsyncing from paused task and leaving behind state as-is");
            self.send(task_id, LocalSyncMessage::Disabled);
            return Ok(());
        }

        if let Err(e) = self.restore_user_repo(&info, switching_to_task) {
            self.send(task_id, LocalSyncMessage::Disabled);
            error!(task_id, "Failed to disable sync: {}", e);
            return Err(SyncError::cleanup(
                format!("Failed to clean up sync for task {}: {}", task_id, e),
                Some(task_id),
                &cleanup_step(&e),
            ));
        }

        self.send(task_id, LocalSyncMessage::Disabled);
        Ok(())
    }

    /// Discard what sync left in the working tree and check out the original
    /// branch. A repo in the middle of a merge or rebase is left alone.
    fn restore_user_repo(&self, info: &SyncSessionInfo, switching_to_task: bool) -> Result<()> {
        let task = self
            .store
            .get_task(&info.task_id)?
            .ok_or_else(|| SyncError::State {
                message: format!("Task {} disappeared while synced", info.task_id),
                task_id: Some(info.task_id.clone()),
                current_state: None,
                expected_state: None,
            })?;
        let repo = self.open_repo(&task)?;
        let status = repo.status()?;
        if status.is_in_intermediate_state() {
            info!(
                task_id = %info.task_id,
                "Repo is mid-operation, leaving behind state as-is:\n{}",
                status.describe()
            );
            return Ok(());
        }
        repo.reset_working_directory()?;

        if !switching_to_task {
            debug!(branch = %info.original_branch, "Restoring original branch");
            repo.checkout_branch(&info.original_branch)?;
        }
        Ok(())
    }

    /// Tear down whatever is running, or whatever a crashed process left
    /// behind. Errors are logged, never raised.
    pub fn cleanup_current_sync(&self) {
        let Some(info) = self.current_info() else {
            self.recover_recorded_sync();
            return;
        };
        let _transition = match self.try_begin_transition("clean up", &info.task_id) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(task_id = %info.task_id, "Skipping cleanup: {}", e);
                return;
            }
        };
        // The session may have changed hands before the lock was taken
        let Some(info) = self.current_info() else {
            return;
        };
        info!(task_id = %info.task_id, "Cleaning up current sync");
        if let Err(e) = self.unsync_locked(&info.task_id, false) {
            error!(task_id = %info.task_id, "Failed to disable sync during cleanup: {}", e);
        }
        if let Err(e) = self.ensure_session_is_stopped() {
            error!(task_id = %info.task_id, "Failed to stop sync session during cleanup: {}", e);
        }
    }

    fn recover_recorded_sync(&self) {
        let record = match self.store.load_sync_record() {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read active sync record: {:#}", e);
                return;
            }
        };
        let _transition = match self.try_begin_transition("recover", &record.task_id) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Skipping recovery: {}", e);
                return;
            }
        };
        info!(task_id = %record.task_id, "Recovering sync left behind by a previous process");
        if let Err(e) = self.backend.terminate_session(&record.sync_name) {
            warn!(session = %record.sync_name, "Failed to terminate file-tree session: {}", e);
        }
        if let Err(e) = self.restore_user_repo(&record, false) {
            error!(task_id = %record.task_id, "Failed to restore local checkout: {}", e);
        }
        self.send(&record.task_id, LocalSyncMessage::Disabled);
        if let Err(e) = self.store.clear_sync_record() {
            warn!("Failed to clear active sync record: {:#}", e);
        }
    }

    fn ensure_no_sessions_exist_for_project(&self, project_id: &str) {
        let prefix = project_session_prefix(&self.session_prefix, project_id);
        let existing = self.backend.list_session_names(&prefix);
        if existing.is_empty() {
            return;
        }
        error!(
            project_id,
            ?existing,
            "LOCAL_SYNC_STATE_MISMATCH: file-tree sessions exist but should not when starting a new sync, cleaning up"
        );
        for name in existing {
            if let Err(e) = self.backend.terminate_session(&name) {
                warn!(session = %name, "Failed to terminate file-tree session: {}", e);
            }
        }
    }

    fn cleanup_dangling_sessions(&self) {
        let project_ids = match self.store.project_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Failed to list projects, skipping dangling session cleanup: {:#}", e);
                return;
            }
        };
        for project_id in project_ids {
            let prefix = project_session_prefix(&self.session_prefix, &project_id);
            for name in self.backend.list_session_names(&prefix) {
                info!(session = %name, "Cleaning up dangling file-tree session");
                if let Err(e) = self.backend.terminate_session(&name) {
                    warn!(session = %name, "Failed to terminate file-tree session: {}", e);
                }
            }
        }
    }
}

impl std::fmt::Debug for LocalSyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSyncManager")
            .field("current", &self.current_info())
            .field("session_prefix", &self.session_prefix)
            .finish()
    }
}

fn cleanup_step(error: &SyncError) -> String {
    match error {
        SyncError::FiletreeSync { .. } => "mutagen_termination".to_string(),
        SyncError::Git(e) => format!("git_{}", e.operation()),
        SyncError::Cleanup {
            cleanup_step: Some(step),
            ..
        } => step.clone(),
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::LocalDirectoryEnvironment;
    use crate::sync::filetree::FiletreeSyncSession;
    use crate::sync::state::LocalSyncHighLevelStatus;
    use crate::sync::error::ExpectedStartupBlocker;
    use crate::task::{EnvironmentSpec, InMemoryTaskStore};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct FakeBackend {
        existing: Mutex<Vec<String>>,
        terminated: Mutex<Vec<String>>,
        created: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn terminated(&self) -> Vec<String> {
            self.terminated.lock().unwrap().clone()
        }
    }

    #[derive(Debug)]
    struct FakeSession(String);

    impl FiletreeSyncSession for FakeSession {
        fn name(&self) -> &str {
            &self.0
        }
        fn create(&mut self) -> Result<()> {
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        fn terminate(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_daemon_running(&self) -> bool {
            true
        }
    }

    impl FiletreeSyncBackend for FakeBackend {
        fn overwrite_local_with_remote_once(
            &self,
            _local: &Path,
            _remote_url: &str,
            _session_name: &str,
            _snapshot_guard: Option<Arc<ReadWriteLock>>,
        ) -> Result<()> {
            Ok(())
        }

        fn create_bidirectional_session(
            &self,
            _local: &Path,
            _remote_url: &str,
            session_name: &str,
            _snapshot_guard: Option<Arc<ReadWriteLock>>,
        ) -> Result<Box<dyn FiletreeSyncSession>> {
            self.created.lock().unwrap().push(session_name.to_string());
            Ok(Box::new(FakeSession(session_name.to_string())))
        }

        fn list_session_names(&self, prefix: &str) -> Vec<String> {
            self.existing
                .lock()
                .unwrap()
                .iter()
                .filter(|name| name.starts_with(prefix))
                .cloned()
                .collect()
        }

        fn terminate_session(&self, name: &str) -> Result<()> {
            self.existing.lock().unwrap().retain(|n| n != name);
            self.terminated.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn commit_file(repo: &git2::Repository, name: &str, content: &str, message: &str) {
        let workdir = repo.workdir().unwrap();
        fs::write(workdir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("Test", "test@example.com").unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap();
    }

    fn head_branch(path: &Path) -> String {
        let repo = git2::Repository::open(path).unwrap();
        let head = repo.head().unwrap();
        head.shorthand().unwrap().to_string()
    }

    /// User checkout on its default branch, sandbox clone with the agent's
    /// work on `feature`
    struct Fixture {
        user_dir: TempDir,
        _agent_dir: TempDir,
        original_branch: String,
        store: Arc<InMemoryTaskStore>,
        backend: Arc<FakeBackend>,
        manager: LocalSyncManager,
    }

    impl Fixture {
        fn new() -> Self {
            let user_dir = TempDir::new().unwrap();
            let user = git2::Repository::init(user_dir.path()).unwrap();
            commit_file(&user, "README.md", "hello\n", "Initial commit");
            let original_branch = head_branch(user_dir.path());

            let agent_dir = TempDir::new().unwrap();
            let agent =
                git2::Repository::clone(&user_dir.path().to_string_lossy(), agent_dir.path())
                    .unwrap();
            let head = agent.head().unwrap().peel_to_commit().unwrap();
            agent.branch("feature", &head, false).unwrap();
            agent.set_head("refs/heads/feature").unwrap();
            agent
                .checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
                .unwrap();
            commit_file(&agent, "agent.txt", "work\n", "Agent work");

            let store = Arc::new(InMemoryTaskStore::new());
            for (id, branch) in [("t1", "feature"), ("t2", "feature")] {
                store.add_task(Task::new(
                    id,
                    "proj",
                    branch,
                    user_dir.path().to_path_buf(),
                    EnvironmentSpec::LocalDirectory {
                        path: agent_dir.path().to_path_buf(),
                    },
                ));
            }
            let backend = Arc::new(FakeBackend::default());
            let settings = SessionSettings {
                remote_watch_command: Some(vec!["sleep".to_string(), "600".to_string()]),
                ..SessionSettings::default()
            };
            let manager = LocalSyncManager::new(store.clone(), backend.clone())
                .with_settings(settings)
                .with_environment_factory(|task: &Task| match &task.environment {
                    EnvironmentSpec::LocalDirectory { path } => {
                        Arc::new(LocalDirectoryEnvironment::new(path.clone()))
                    }
                    EnvironmentSpec::Docker { .. } => unreachable!(),
                });
            Self {
                user_dir,
                _agent_dir: agent_dir,
                original_branch,
                store,
                backend,
                manager,
            }
        }
    }

    #[test]
    fn test_concurrent_transition_is_rejected() {
        let fixture = Fixture::new();
        let _held = fixture.manager.transition.lock().unwrap();

        let err = fixture.manager.sync_to_task("t1").unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, SyncError::OtherSyncTransitionInProgress { .. }));
        assert!(err.to_string().starts_with("Cannot sync to t1"));

        let err = fixture.manager.unsync_from_task("t1", false).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cleanup_waits_for_running_transition() {
        let fixture = Fixture::new();
        let info = fixture.manager.sync_to_task("t1").unwrap();

        let held = fixture.manager.transition.lock().unwrap();
        fixture.manager.cleanup_current_sync();
        assert!(fixture.manager.is_task_synced("t1"));
        assert_eq!(fixture.store.load_sync_record().unwrap(), Some(info.clone()));
        assert_eq!(head_branch(fixture.user_dir.path()), "feature");
        assert!(!fixture.backend.terminated().contains(&info.sync_name));
        drop(held);

        fixture.manager.cleanup_current_sync();
        assert!(fixture.manager.current_session().is_none());
        assert!(fixture.store.load_sync_record().unwrap().is_none());
        assert_eq!(head_branch(fixture.user_dir.path()), fixture.original_branch);
    }

    enum Transition {
        Sync(&'static str),
        Unsync(&'static str),
        Cleanup,
    }

    #[test]
    fn test_concurrent_starts_leave_one_session() {
        let fixture = Fixture::new();
        let barrier = std::sync::Barrier::new(4);
        let results: Vec<Result<SyncSessionInfo>> = std::thread::scope(|scope| {
            let handles: Vec<_> = ["t1", "t2", "t1", "t2"]
                .into_iter()
                .map(|task_id| {
                    let barrier = &barrier;
                    let manager = &fixture.manager;
                    scope.spawn(move || {
                        barrier.wait();
                        manager.sync_to_task(task_id)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.iter().any(Result::is_ok));
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(err.is_retryable(), "unexpected error: {}", err);
        }
        let current = fixture.manager.current_info().unwrap();
        assert!(fixture.manager.is_task_synced(&current.task_id));

        fixture.manager.unsync_from_task(&current.task_id, false).unwrap();
        assert!(fixture.manager.current_session().is_none());
        assert_eq!(head_branch(fixture.user_dir.path()), fixture.original_branch);
    }

    #[test]
    fn test_racing_sync_unsync_and_cleanup_stay_consistent() {
        let fixture = Fixture::new();
        fixture.manager.sync_to_task("t1").unwrap();

        let transitions = [
            Transition::Sync("t2"),
            Transition::Unsync("t1"),
            Transition::Cleanup,
            Transition::Sync("t1"),
            Transition::Unsync("t2"),
            Transition::Cleanup,
        ];
        let barrier = std::sync::Barrier::new(transitions.len());
        let errors: Vec<SyncError> = std::thread::scope(|scope| {
            let handles: Vec<_> = transitions
                .iter()
                .map(|transition| {
                    let barrier = &barrier;
                    let manager = &fixture.manager;
                    scope.spawn(move || {
                        barrier.wait();
                        match transition {
                            Transition::Sync(task_id) => manager.sync_to_task(task_id).err(),
                            Transition::Unsync(task_id) => {
                                manager.unsync_from_task(task_id, false).err()
                            }
                            Transition::Cleanup => {
                                manager.cleanup_current_sync();
                                None
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect()
        });

        for err in &errors {
            assert!(err.is_retryable(), "unexpected error: {}", err);
        }
        let record = fixture.store.load_sync_record().unwrap();
        match fixture.manager.current_info() {
            Some(current) => {
                assert!(fixture.manager.is_task_synced(&current.task_id));
                assert_eq!(record, Some(current));
                assert_eq!(head_branch(fixture.user_dir.path()), "feature");
            }
            None => {
                assert!(record.is_none());
                assert_eq!(head_branch(fixture.user_dir.path()), fixture.original_branch);
            }
        }

        fixture.manager.cleanup_current_sync();
        assert!(fixture.manager.current_session().is_none());
        assert!(fixture.store.load_sync_record().unwrap().is_none());
        assert_eq!(head_branch(fixture.user_dir.path()), fixture.original_branch);
    }

    #[test]
    fn test_unknown_task_fails_startup() {
        let fixture = Fixture::new();
        let err = fixture.manager.sync_to_task("missing").unwrap_err();
        assert!(matches!(err, SyncError::Startup { .. }));
        assert!(!fixture.manager.is_task_synced("missing"));
    }

    #[test]
    fn test_unsync_without_session_sends_disabled() {
        let fixture = Fixture::new();
        fixture.manager.unsync_from_task("t1", false).unwrap();
        assert_eq!(fixture.store.messages("t1"), vec![LocalSyncMessage::Disabled]);
    }

    #[test]
    fn test_unsync_while_switching_keeps_sync_branch() {
        let fixture = Fixture::new();
        let info = fixture.manager.sync_to_task("t1").unwrap();

        fixture.manager.unsync_from_task("t1", true).unwrap();
        assert!(!fixture.manager.is_task_synced("t1"));
        assert!(fixture.store.load_sync_record().unwrap().is_none());
        assert!(fixture.backend.terminated().contains(&info.sync_name));
        assert_eq!(head_branch(fixture.user_dir.path()), "feature");
        assert_eq!(
            fixture.store.messages("t1").last(),
            Some(&LocalSyncMessage::Disabled)
        );
    }

    #[test]
    fn test_sync_and_unsync_restores_original_branch() {
        let fixture = Fixture::new();
        let manager = &fixture.manager;

        let info = manager.sync_to_task("t1").unwrap();
        assert_eq!(info.sync_branch, "feature");
        assert_eq!(info.original_branch, fixture.original_branch);
        assert!(manager.is_task_synced("t1"));
        assert_eq!(head_branch(fixture.user_dir.path()), "feature");

        let state = manager.get_session_state().unwrap();
        assert_eq!(state.high_level_status(), LocalSyncHighLevelStatus::Active);
        assert_eq!(fixture.store.load_sync_record().unwrap(), Some(info.clone()));
        assert_eq!(
            fixture.store.messages("t1").last(),
            Some(&LocalSyncMessage::SetupAndEnabled)
        );

        manager.unsync_from_task("t1", false).unwrap();
        assert!(!manager.is_task_synced("t1"));
        assert!(manager.get_session_state().is_none());
        assert_eq!(head_branch(fixture.user_dir.path()), fixture.original_branch);
        assert!(fixture.store.load_sync_record().unwrap().is_none());
        assert!(fixture.backend.terminated().contains(&info.sync_name));
        assert_eq!(
            fixture.store.messages("t1").last(),
            Some(&LocalSyncMessage::Disabled)
        );
    }

    #[test]
    fn test_switching_within_project_carries_original_branch() {
        let fixture = Fixture::new();
        let manager = &fixture.manager;

        manager.sync_to_task("t1").unwrap();
        let second = manager.sync_to_task("t2").unwrap();
        assert_eq!(second.original_branch, fixture.original_branch);
        assert!(manager.is_task_synced("t2"));
        assert!(!manager.is_task_synced("t1"));
        // Switching skips the checkout of the original branch
        assert_eq!(head_branch(fixture.user_dir.path()), "feature");

        manager.cleanup_current_sync();
        assert!(manager.current_session().is_none());
        assert_eq!(head_branch(fixture.user_dir.path()), fixture.original_branch);
    }

    #[test]
    fn test_dirty_tree_blocks_start_and_is_left_alone() {
        let fixture = Fixture::new();
        let scratch = fixture.user_dir.path().join("scratch.txt");
        fs::write(&scratch, "unsaved\n").unwrap();

        let err = fixture.manager.sync_to_task("t1").unwrap_err();
        assert!(err.is_expected());
        assert_eq!(err.blockers(), &[ExpectedStartupBlocker::UserGitStateDirty]);
        assert!(scratch.exists());
        assert_eq!(head_branch(fixture.user_dir.path()), fixture.original_branch);
        assert!(fixture.manager.current_session().is_none());
    }

    #[test]
    fn test_start_service_terminates_dangling_sessions() {
        let fixture = Fixture::new();
        fixture.backend.existing.lock().unwrap().extend([
            "aoe-sync-proj-old".to_string(),
            "aoe-sync-unrelated-x".to_string(),
        ]);

        fixture.manager.start_service();
        assert_eq!(fixture.backend.terminated(), vec!["aoe-sync-proj-old".to_string()]);
    }

    #[test]
    fn test_cleanup_recovers_recorded_sync() {
        let fixture = Fixture::new();
        let info = fixture.manager.sync_to_task("t1").unwrap();
        // Simulate a crash: the session goes away but the record stays
        let session = fixture.manager.session.write_lock().take().unwrap();
        session.stop().unwrap();
        assert!(fixture.store.load_sync_record().unwrap().is_some());

        fixture.manager.cleanup_current_sync();
        assert!(fixture.store.load_sync_record().unwrap().is_none());
        assert_eq!(head_branch(fixture.user_dir.path()), fixture.original_branch);
        assert!(fixture.backend.terminated().contains(&info.sync_name));
    }
}
