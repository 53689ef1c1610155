//! File-tree sync through mutagen, and the reconciler that drives it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use super::error::{Result, SyncError};
use super::notice::Notice;
use super::reconciler::{
    default_excluded_subpaths, MultiRootReconciler, SubPathReconciler,
};
use super::rwlock::ReadWriteLock;
use super::threading::StopEvent;
use crate::git::{GitRepo, RepoOperation};

pub const FILETREE_SYNC_TAG: &str = "local_filetree_sync";
pub const GIT_STATE_GUARDIAN_TAG: &str = "local_git_state_guardian";

pub const DEFAULT_SESSION_PREFIX: &str = "aoe-sync-";

const CREATE_ATTEMPTS: u32 = 3;
const CREATE_BACKOFF_MIN: Duration = Duration::from_secs(1);
const CREATE_BACKOFF_MAX: Duration = Duration::from_secs(10);
const QUICK_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);
const SESSION_NAME_TEMPLATE: &str = r#"{{range .}}{{.Name}}{{"\n"}}{{end}}"#;

/// `<prefix><project>-<task>`, with underscores swapped for dashes since
/// mutagen rejects them in names
pub fn filetree_session_name(prefix: &str, project_id: &str, task_id: &str) -> String {
    format!(
        "{}{}-{}",
        prefix,
        project_id.replace('_', "-"),
        task_id.replace('_', "-")
    )
}

/// Prefix shared by every session name of one project
pub fn project_session_prefix(prefix: &str, project_id: &str) -> String {
    format!("{}{}-", prefix, project_id.replace('_', "-"))
}

/// One live sync session between the local tree and the sandbox
pub trait FiletreeSyncSession: Send + fmt::Debug {
    fn name(&self) -> &str;

    fn create(&mut self) -> Result<()>;

    /// Block until both endpoints have been reconciled once
    fn flush(&mut self) -> Result<()>;

    fn terminate(&mut self) -> Result<()>;

    fn is_daemon_running(&self) -> bool;
}

pub trait FiletreeSyncBackend: Send + Sync + fmt::Debug {
    /// Make the local tree an exact replica of the sandbox, then tear the
    /// one-shot session down
    fn overwrite_local_with_remote_once(
        &self,
        local: &Path,
        remote_url: &str,
        session_name: &str,
        snapshot_guard: Option<Arc<ReadWriteLock>>,
    ) -> Result<()>;

    /// Two-way session where local wins conflicts. Created and flushed once
    /// before returning.
    fn create_bidirectional_session(
        &self,
        local: &Path,
        remote_url: &str,
        session_name: &str,
        snapshot_guard: Option<Arc<ReadWriteLock>>,
    ) -> Result<Box<dyn FiletreeSyncSession>>;

    fn list_session_names(&self, prefix: &str) -> Vec<String>;

    /// Missing sessions are not an error
    fn terminate_session(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    OverwriteLocalWithRemote,
    BidirectionalUserAlwaysWins,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStep::OverwriteLocalWithRemote => "OVERWRITE_LOCAL_WITH_REMOTE",
            SyncStep::BidirectionalUserAlwaysWins => "BIDIRECTIONAL_USER_ALWAYS_WINS",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastAction {
    Create,
    Flush,
    Terminate,
}

/// Invokes the `mutagen` CLI against a private daemon data directory, so
/// our sessions never mix with the user's own.
#[derive(Debug, Clone)]
pub struct MutagenBackend {
    binary: String,
    data_dir: PathBuf,
    session_prefix: String,
    excluded_subpaths: Vec<PathBuf>,
}

impl MutagenBackend {
    pub fn new(data_dir: PathBuf, session_prefix: impl Into<String>) -> Self {
        Self {
            binary: "mutagen".to_string(),
            data_dir,
            session_prefix: session_prefix.into(),
            excluded_subpaths: default_excluded_subpaths(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Sub-paths mutagen never transfers, relative to the synced root
    pub fn with_excluded_subpaths(mut self, excluded_subpaths: Vec<PathBuf>) -> Self {
        self.excluded_subpaths = excluded_subpaths;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run(
        &self,
        args: &[String],
        timeout: Duration,
        snapshot_guard: Option<&ReadWriteLock>,
    ) -> std::result::Result<String, MutagenFailure> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .env("MUTAGEN_DATA_DIRECTORY", &self.data_dir);
        trace!("{} {}", self.binary, args.join(" "));

        let _snapshot = snapshot_guard.map(|guard| guard.read_lock());
        let output = crate::process::run_with_timeout(&mut command, timeout).map_err(|e| {
            MutagenFailure {
                exit_code: None,
                stderr: e.to_string(),
                timed_out: e.kind() == std::io::ErrorKind::TimedOut,
            }
        })?;
        if !output.status.success() {
            return Err(MutagenFailure {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                timed_out: false,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn create_with_retry(
        &self,
        session_name: &str,
        args: &[String],
        snapshot_guard: Option<&ReadWriteLock>,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.run(args, TRANSFER_TIMEOUT, snapshot_guard) {
                Ok(_) => return Ok(()),
                Err(failure) if attempt < CREATE_ATTEMPTS => {
                    let backoff = create_backoff(attempt);
                    warn!(
                        session = session_name,
                        attempt,
                        ?backoff,
                        "Failed to create mutagen session, retrying: {}",
                        failure.stderr
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(failure) => {
                    debug!(session = session_name, "Failed to create mutagen session");
                    return Err(failure.into_error(
                        "create",
                        session_name,
                        "Failed to create mutagen sync session",
                    ));
                }
            }
        }
    }

    fn session(
        &self,
        name: &str,
        local: &Path,
        remote_url: &str,
        step: SyncStep,
        snapshot_guard: Option<Arc<ReadWriteLock>>,
    ) -> Result<MutagenSession> {
        if !name.starts_with(&self.session_prefix) {
            return Err(SyncError::Configuration(format!(
                "session name {} must start with {}",
                name, self.session_prefix
            )));
        }
        let ignore_patterns = ignore_patterns(local, &self.excluded_subpaths);
        Ok(MutagenSession {
            backend: self.clone(),
            name: name.to_string(),
            local: local.to_path_buf(),
            remote_url: remote_url.to_string(),
            step,
            ignore_patterns,
            snapshot_guard,
            last_action: None,
        })
    }
}

impl FiletreeSyncBackend for MutagenBackend {
    fn overwrite_local_with_remote_once(
        &self,
        local: &Path,
        remote_url: &str,
        session_name: &str,
        snapshot_guard: Option<Arc<ReadWriteLock>>,
    ) -> Result<()> {
        debug!("Creating initial one-way sync session to pull task changes");
        let mut session = self.session(
            session_name,
            local,
            remote_url,
            SyncStep::OverwriteLocalWithRemote,
            snapshot_guard,
        )?;
        session.create()?;
        let flushed = session.flush();
        let terminated = session.terminate();
        debug!(session = session_name, "Terminated initial sync session");
        flushed?;
        terminated
    }

    fn create_bidirectional_session(
        &self,
        local: &Path,
        remote_url: &str,
        session_name: &str,
        snapshot_guard: Option<Arc<ReadWriteLock>>,
    ) -> Result<Box<dyn FiletreeSyncSession>> {
        debug!(session = session_name, "Creating mutagen sync session");
        let mut session = self.session(
            session_name,
            local,
            remote_url,
            SyncStep::BidirectionalUserAlwaysWins,
            snapshot_guard,
        )?;
        session.create()?;
        session.flush()?;
        Ok(Box::new(session))
    }

    fn list_session_names(&self, prefix: &str) -> Vec<String> {
        let args = to_args(&["sync", "list", "--template", SESSION_NAME_TEMPLATE]);
        match self.run(&args, QUICK_COMMAND_TIMEOUT, None) {
            Ok(stdout) => parse_session_names(&stdout, prefix),
            Err(failure) => {
                error!(
                    timed_out = failure.timed_out,
                    "Failed to list mutagen sync sessions: {}", failure.stderr
                );
                Vec::new()
            }
        }
    }

    fn terminate_session(&self, name: &str) -> Result<()> {
        let args = to_args(&["sync", "terminate", name]);
        match self.run(&args, QUICK_COMMAND_TIMEOUT, None) {
            Ok(_) => Ok(()),
            Err(failure) if failure.stderr.contains("unable to locate requested sessions") => {
                debug!(session = name, "Mutagen session not found to terminate");
                Ok(())
            }
            Err(failure) => {
                error!(
                    session = name,
                    timed_out = failure.timed_out,
                    "Failed to terminate mutagen session: {}",
                    failure.stderr
                );
                Err(failure.into_error("terminate", name, "Failed to terminate mutagen session"))
            }
        }
    }
}

#[derive(Debug)]
struct MutagenFailure {
    exit_code: Option<i32>,
    stderr: String,
    timed_out: bool,
}

impl MutagenFailure {
    fn into_error(self, operation: &str, session_name: &str, message: &str) -> SyncError {
        SyncError::FiletreeSync {
            operation: operation.to_string(),
            session_name: session_name.to_string(),
            message: message.to_string(),
            exit_code: self.exit_code,
            stderr: Some(self.stderr),
        }
    }
}

#[derive(Debug)]
pub struct MutagenSession {
    backend: MutagenBackend,
    name: String,
    local: PathBuf,
    remote_url: String,
    step: SyncStep,
    ignore_patterns: Vec<String>,
    snapshot_guard: Option<Arc<ReadWriteLock>>,
    last_action: Option<LastAction>,
}

impl MutagenSession {
    /// `(alpha, beta, mode)`. Alpha wins conflicts in `two-way-resolved`.
    fn endpoints_and_mode(&self) -> (String, String, &'static str) {
        let local = self.local.to_string_lossy().into_owned();
        match self.step {
            SyncStep::OverwriteLocalWithRemote => {
                (self.remote_url.clone(), local, "one-way-replica")
            }
            SyncStep::BidirectionalUserAlwaysWins => {
                (local, self.remote_url.clone(), "two-way-resolved")
            }
        }
    }

    fn create_args(&self) -> Vec<String> {
        let (alpha, beta, mode) = self.endpoints_and_mode();
        let mut args = to_args(&[
            "sync",
            "create",
            "--watch-mode",
            "no-watch",
            "--name",
            &self.name,
            "--sync-mode",
            mode,
            "--ignore-vcs",
        ]);
        for pattern in &self.ignore_patterns {
            args.push("--ignore".to_string());
            args.push(pattern.clone());
        }
        args.push(alpha);
        args.push(beta);
        args
    }

    fn track(&mut self, action: LastAction) -> Option<LastAction> {
        self.last_action.replace(action)
    }

    fn guard(&self) -> Option<&ReadWriteLock> {
        self.snapshot_guard.as_deref()
    }
}

impl FiletreeSyncSession for MutagenSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&mut self) -> Result<()> {
        match self.track(LastAction::Create) {
            None => trace!("{}.create()", self.name),
            Some(LastAction::Terminate) => {
                trace!("{}.create() after terminate: restarting session", self.name)
            }
            Some(LastAction::Create | LastAction::Flush) => {
                let is_running = self.is_daemon_running();
                debug!(
                    "suspicious: {}.create() called twice, is_daemon_running={}",
                    self.name, is_running
                );
                if is_running {
                    return Ok(());
                }
            }
        }
        let args = self.create_args();
        self.backend.create_with_retry(&self.name, &args, self.guard())
    }

    fn flush(&mut self) -> Result<()> {
        self.track(LastAction::Flush);
        let args = to_args(&["sync", "flush", &self.name]);
        self.backend
            .run(&args, TRANSFER_TIMEOUT, self.guard())
            .map(|_| ())
            .map_err(|failure| {
                debug!(session = %self.name, "Failed to flush sync session: {}", failure.stderr);
                failure.into_error(
                    &format!("{}.flush", self.step),
                    &self.name,
                    &format!("Failed to flush sync session {}", self.name),
                )
            })
    }

    fn terminate(&mut self) -> Result<()> {
        if self.track(LastAction::Terminate).is_none() {
            trace!("Skipping termination of uncreated session {}", self.name);
            return Ok(());
        }
        self.backend.terminate_session(&self.name)
    }

    fn is_daemon_running(&self) -> bool {
        self.backend
            .list_session_names(&self.name)
            .iter()
            .any(|name| *name == self.name)
    }
}

impl Drop for MutagenSession {
    fn drop(&mut self) {
        if matches!(self.last_action, None | Some(LastAction::Terminate)) {
            return;
        }
        if let Err(e) = self.terminate() {
            warn!("Failed to terminate {} on drop: {}", self.name, e);
        }
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn create_backoff(attempt: u32) -> Duration {
    let exponential = CREATE_BACKOFF_MIN.saturating_mul(1 << attempt.saturating_sub(1).min(8));
    exponential.clamp(CREATE_BACKOFF_MIN, CREATE_BACKOFF_MAX)
}

fn parse_session_names(stdout: &str, prefix: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && name.starts_with(prefix))
        .map(str::to_string)
        .collect()
}

/// Configured exclusions plus whatever git ignores in the local checkout
fn ignore_patterns(local: &Path, excluded_subpaths: &[PathBuf]) -> Vec<String> {
    let mut patterns: Vec<String> = excluded_subpaths
        .iter()
        .map(|subpath| format!("{}/**", subpath.to_string_lossy().trim_end_matches('/')))
        .collect();
    match GitRepo::open(local).and_then(|repo| repo.ignored_paths()) {
        Ok(ignored) => patterns.extend(ignored),
        Err(e) => error!("Failed to get ignored files from git: {}", e),
    }
    patterns
}

/// Blocks syncing while the user's checkout is somewhere a transfer could
/// clobber: mid-rebase, detached, or on another branch.
#[derive(Debug, Clone)]
pub struct GitStateGuardian {
    repo: GitRepo,
    branch: String,
}

impl GitStateGuardian {
    pub fn new(repo: GitRepo, branch: impl Into<String>) -> Self {
        Self {
            repo,
            branch: branch.into(),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn blockers(&self) -> crate::git::Result<Vec<String>> {
        let mut blockers = Vec::new();
        let operation = self.repo.operation()?;
        let label = match operation {
            RepoOperation::Rebase => Some("rebase"),
            RepoOperation::Merge => Some("merge"),
            RepoOperation::CherryPick => Some("cherry-pick"),
            _ => None,
        };
        if let Some(label) = label {
            blockers.push(format!("{} is in progress (finish or abort to resume)", label));
        }

        match self.repo.current_branch()? {
            None if label.is_none() => blockers.push(format!(
                "detached HEAD state (switch back to `{}` to resume)",
                self.branch
            )),
            None => {}
            Some(current) if current != self.branch => blockers.push(format!(
                "switched to `{}` (switch back to `{}` to resume)",
                current, self.branch
            )),
            Some(_) => {}
        }
        Ok(blockers)
    }

    pub fn notices(&self) -> Vec<Notice> {
        match self.blockers() {
            Ok(blockers) => blockers
                .into_iter()
                .map(|reason| {
                    Notice::pause(
                        GIT_STATE_GUARDIAN_TAG,
                        format!("cannot sync filetree while {}", reason),
                    )
                })
                .collect(),
            Err(e) => vec![Notice::pause(
                GIT_STATE_GUARDIAN_TAG,
                format!("cannot sync filetree while git state is unreadable: {}", e),
            )],
        }
    }

    pub fn validate_state_is_acceptable(&self) -> Result<()> {
        let notices = self.notices();
        if notices.is_empty() {
            return Ok(());
        }
        Err(SyncError::NewNotices(notices))
    }
}

/// Flushes the live file-tree session whenever anything under the local
/// checkout or the sandbox workspace changes.
///
/// Both endpoints are watched, so every flush echoes back as another batch.
/// That batch finds nothing to transfer and completes quietly.
#[derive(Debug)]
pub struct FiletreeReconciler {
    filter: MultiRootReconciler,
    local_root: PathBuf,
    environment_root: PathBuf,
    session: Box<dyn FiletreeSyncSession>,
    guardian: GitStateGuardian,
    stop: StopEvent,
}

impl FiletreeReconciler {
    pub fn new(
        session: Box<dyn FiletreeSyncSession>,
        local_root: PathBuf,
        environment_root: PathBuf,
        guardian: GitStateGuardian,
        stop: StopEvent,
    ) -> Result<Self> {
        Self::with_exclusions(
            session,
            local_root,
            environment_root,
            guardian,
            stop,
            &default_excluded_subpaths(),
        )
    }

    pub fn with_exclusions(
        session: Box<dyn FiletreeSyncSession>,
        local_root: PathBuf,
        environment_root: PathBuf,
        guardian: GitStateGuardian,
        stop: StopEvent,
        excluded_subpaths: &[PathBuf],
    ) -> Result<Self> {
        let filter = MultiRootReconciler::new(
            vec![local_root.clone(), environment_root.clone()],
            excluded_subpaths,
        )?;
        Ok(Self {
            filter,
            local_root,
            environment_root,
            session,
            guardian,
            stop,
        })
    }

    pub fn session_name(&self) -> &str {
        self.session.name()
    }

    /// The session is ours: if something killed its daemon, bring it back
    /// and try once more.
    fn flush_with_resurrection(&mut self) -> Result<()> {
        let started = Instant::now();
        let failure = match self.session.flush() {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let elapsed = started.elapsed();
        let is_daemon_running = self.session.is_daemon_running();
        if self.stop.is_set() {
            // Racing shutdown; the session owner has taken over
            warn!(
                ?elapsed,
                is_daemon_running, "File-tree flush failed during shutdown: {}", failure
            );
            return Ok(());
        }
        info!(
            ?elapsed,
            is_daemon_running, "File-tree flush failed: {}", failure
        );
        if is_daemon_running {
            return Err(failure);
        }

        self.session.create()?;
        self.session.flush()
    }

    pub fn terminate_session(&mut self) -> Result<()> {
        self.session.terminate()
    }
}

impl SubPathReconciler for FiletreeReconciler {
    fn tag(&self) -> &str {
        FILETREE_SYNC_TAG
    }

    fn is_relevant_subpath(&mut self, path: &Path) -> bool {
        self.filter.is_relevant_subpath(path)
    }

    fn dirs_to_watch(&self) -> Vec<PathBuf> {
        self.filter.dirs_to_watch()
    }

    fn local_dirs_to_watch(&self) -> Vec<PathBuf> {
        vec![self.local_root.clone()]
    }

    fn environment_dirs_to_watch(&self) -> Vec<PathBuf> {
        vec![self.environment_root.clone()]
    }

    fn notices(&mut self) -> Vec<Notice> {
        self.guardian.notices()
    }

    fn handle_path_changes(&mut self, _paths: &[PathBuf]) -> Result<()> {
        self.guardian.validate_state_is_acceptable()?;
        self.flush_with_resurrection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn setup_test_repo() -> (TempDir, git2::Repository) {
        let dir = TempDir::new().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        {
            let sig = git2::Signature::now("Test", "test@example.com").unwrap();
            let tree_id = repo.index().unwrap().write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
                .unwrap();
        }
        (dir, repo)
    }

    fn head_branch(repo: &git2::Repository) -> String {
        repo.head().unwrap().shorthand().unwrap().to_string()
    }

    #[derive(Debug, Clone, Default)]
    struct ScriptedSession {
        log: Arc<Mutex<Vec<&'static str>>>,
        failing_flushes: Arc<Mutex<u32>>,
        daemon_running: Arc<Mutex<bool>>,
    }

    impl ScriptedSession {
        fn calls(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    impl FiletreeSyncSession for ScriptedSession {
        fn name(&self) -> &str {
            "aoe-sync-project-task"
        }

        fn create(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("create");
            *self.daemon_running.lock().unwrap() = true;
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("flush");
            let mut failing = self.failing_flushes.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(SyncError::FiletreeSync {
                    operation: "flush".to_string(),
                    session_name: self.name().to_string(),
                    message: "daemon gone".to_string(),
                    exit_code: Some(1),
                    stderr: None,
                });
            }
            Ok(())
        }

        fn terminate(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("terminate");
            Ok(())
        }

        fn is_daemon_running(&self) -> bool {
            *self.daemon_running.lock().unwrap()
        }
    }

    fn reconciler(
        repo_dir: &Path,
        branch: &str,
        session: &ScriptedSession,
    ) -> FiletreeReconciler {
        let guardian = GitStateGuardian::new(GitRepo::open(repo_dir).unwrap(), branch);
        FiletreeReconciler::new(
            Box::new(session.clone()),
            repo_dir.to_path_buf(),
            PathBuf::from("/workspace"),
            guardian,
            StopEvent::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_session_name_sanitizes_underscores() {
        assert_eq!(
            filetree_session_name("aoe-sync-", "proj_1", "task_abc"),
            "aoe-sync-proj-1-task-abc"
        );
        assert_eq!(project_session_prefix("aoe-sync-", "proj_1"), "aoe-sync-proj-1-");
    }

    #[test]
    fn test_parse_session_names_filters_prefix() {
        let stdout = "aoe-sync-a-1\nsomeone-else\n\n  aoe-sync-b-2  \n";
        assert_eq!(
            parse_session_names(stdout, "aoe-sync-"),
            vec!["aoe-sync-a-1".to_string(), "aoe-sync-b-2".to_string()]
        );
    }

    #[test]
    fn test_create_backoff_is_bounded() {
        assert_eq!(create_backoff(1), Duration::from_secs(1));
        assert_eq!(create_backoff(2), Duration::from_secs(2));
        assert_eq!(create_backoff(3), Duration::from_secs(4));
        assert_eq!(create_backoff(10), Duration::from_secs(10));
    }

    #[test]
    fn test_mutagen_create_args_by_step() {
        let dir = TempDir::new().unwrap();
        let backend = MutagenBackend::new(dir.path().join("mutagen"), DEFAULT_SESSION_PREFIX);
        let overwrite = backend
            .session(
                "aoe-sync-p-t",
                dir.path(),
                "docker://box/workspace",
                SyncStep::OverwriteLocalWithRemote,
                None,
            )
            .unwrap();
        let args = overwrite.create_args();
        assert!(args.windows(2).any(|w| w == ["--sync-mode", "one-way-replica"]));
        assert!(args.windows(2).any(|w| w == ["--ignore", ".git/**"]));
        assert!(args.windows(2).any(|w| w == ["--watch-mode", "no-watch"]));
        let n = args.len();
        assert_eq!(args[n - 2], "docker://box/workspace");
        assert_eq!(args[n - 1], dir.path().to_string_lossy());

        let live = backend
            .session(
                "aoe-sync-p-t",
                dir.path(),
                "docker://box/workspace",
                SyncStep::BidirectionalUserAlwaysWins,
                None,
            )
            .unwrap();
        let args = live.create_args();
        assert!(args.windows(2).any(|w| w == ["--sync-mode", "two-way-resolved"]));
        assert_eq!(args[args.len() - 1], "docker://box/workspace");
    }

    #[test]
    fn test_mutagen_ignores_configured_exclusions() {
        let dir = TempDir::new().unwrap();
        let backend = MutagenBackend::new(dir.path().join("mutagen"), DEFAULT_SESSION_PREFIX)
            .with_excluded_subpaths(vec![PathBuf::from(".git/"), PathBuf::from("target/")]);
        let live = backend
            .session(
                "aoe-sync-p-t",
                dir.path(),
                "docker://box/workspace",
                SyncStep::BidirectionalUserAlwaysWins,
                None,
            )
            .unwrap();
        let args = live.create_args();
        assert!(args.windows(2).any(|w| w == ["--ignore", "target/**"]));
        assert!(args.windows(2).any(|w| w == ["--ignore", ".git/**"]));
        assert!(!args.windows(2).any(|w| w == ["--ignore", "node_modules/**"]));
    }

    #[test]
    fn test_session_name_must_carry_prefix() {
        let dir = TempDir::new().unwrap();
        let backend = MutagenBackend::new(dir.path().join("mutagen"), DEFAULT_SESSION_PREFIX);
        let result = backend.session(
            "someone-elses-session",
            dir.path(),
            "/workspace",
            SyncStep::BidirectionalUserAlwaysWins,
            None,
        );
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[test]
    fn test_terminate_of_uncreated_session_is_skipped() {
        let dir = TempDir::new().unwrap();
        let backend = MutagenBackend::new(dir.path().join("mutagen"), DEFAULT_SESSION_PREFIX)
            .with_binary("definitely-not-mutagen");
        let mut session = backend
            .session(
                "aoe-sync-p-t",
                dir.path(),
                "/workspace",
                SyncStep::BidirectionalUserAlwaysWins,
                None,
            )
            .unwrap();
        assert!(session.terminate().is_ok());
    }

    #[test]
    fn test_missing_binary_fails_flush() {
        let dir = TempDir::new().unwrap();
        let backend = MutagenBackend::new(dir.path().join("mutagen"), DEFAULT_SESSION_PREFIX)
            .with_binary("definitely-not-mutagen");
        assert!(!backend.is_available());
        assert!(backend.list_session_names("aoe-sync-").is_empty());

        let mut session = backend
            .session(
                "aoe-sync-p-t",
                dir.path(),
                "/workspace",
                SyncStep::BidirectionalUserAlwaysWins,
                None,
            )
            .unwrap();
        let err = session.flush().unwrap_err();
        assert!(matches!(err, SyncError::FiletreeSync { .. }));
        assert_eq!(err.kind(), "filetree_sync");
    }

    #[test]
    fn test_guardian_is_quiet_on_sync_branch() {
        let (dir, repo) = setup_test_repo();
        let branch = head_branch(&repo);
        let guardian = GitStateGuardian::new(GitRepo::open(dir.path()).unwrap(), branch);
        assert!(guardian.notices().is_empty());
        assert!(guardian.validate_state_is_acceptable().is_ok());
    }

    #[test]
    fn test_guardian_pauses_on_other_branch() {
        let (dir, repo) = setup_test_repo();
        let branch = head_branch(&repo);
        let guardian = GitStateGuardian::new(GitRepo::open(dir.path()).unwrap(), "sync-branch");
        let notices = guardian.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].is_pause());
        assert_eq!(notices[0].source_tag(), GIT_STATE_GUARDIAN_TAG);
        assert_eq!(
            notices[0].reason(),
            format!(
                "cannot sync filetree while switched to `{}` (switch back to `sync-branch` to resume)",
                branch
            )
        );
    }

    #[test]
    fn test_guardian_pauses_on_detached_head() {
        let (dir, repo) = setup_test_repo();
        let branch = head_branch(&repo);
        let head = repo.head().unwrap().target().unwrap();
        repo.set_head_detached(head).unwrap();

        let guardian = GitStateGuardian::new(GitRepo::open(dir.path()).unwrap(), branch.clone());
        let reasons: Vec<String> = guardian
            .notices()
            .iter()
            .map(|n| n.reason().to_string())
            .collect();
        assert_eq!(
            reasons,
            vec![format!(
                "cannot sync filetree while detached HEAD state (switch back to `{}` to resume)",
                branch
            )]
        );
    }

    #[test]
    fn test_guardian_reports_merge_in_progress() {
        let (dir, repo) = setup_test_repo();
        let branch = head_branch(&repo);
        let head = repo.head().unwrap().target().unwrap();
        std::fs::write(repo.path().join("MERGE_HEAD"), format!("{}\n", head)).unwrap();

        let guardian = GitStateGuardian::new(GitRepo::open(dir.path()).unwrap(), branch);
        let notices = guardian.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(
            notices[0].reason(),
            "cannot sync filetree while merge is in progress (finish or abort to resume)"
        );
        assert!(matches!(
            guardian.validate_state_is_acceptable(),
            Err(SyncError::NewNotices(_))
        ));
    }

    #[test]
    fn test_reconciler_roots_and_relevance() {
        let (dir, repo) = setup_test_repo();
        let session = ScriptedSession::default();
        let mut r = reconciler(dir.path(), &head_branch(&repo), &session);

        assert_eq!(r.tag(), FILETREE_SYNC_TAG);
        assert_eq!(r.local_dirs_to_watch(), vec![dir.path().to_path_buf()]);
        assert_eq!(r.environment_dirs_to_watch(), vec![PathBuf::from("/workspace")]);
        assert!(r.is_relevant_subpath(&dir.path().join("src/main.rs")));
        assert!(r.is_relevant_subpath(Path::new("/workspace/src/main.rs")));
        assert!(!r.is_relevant_subpath(&dir.path().join(".git/HEAD")));
        assert!(!r.is_relevant_subpath(Path::new("/workspace")));
    }

    #[test]
    fn test_handle_path_changes_flushes() {
        let (dir, repo) = setup_test_repo();
        let session = ScriptedSession::default();
        let mut r = reconciler(dir.path(), &head_branch(&repo), &session);

        r.handle_path_changes(&[dir.path().join("a.txt")]).unwrap();
        assert_eq!(session.calls(), vec!["flush"]);
    }

    #[test]
    fn test_handle_path_changes_refuses_while_guarded() {
        let (dir, _repo) = setup_test_repo();
        let session = ScriptedSession::default();
        let mut r = reconciler(dir.path(), "not-checked-out", &session);

        let err = r.handle_path_changes(&[dir.path().join("a.txt")]).unwrap_err();
        assert!(matches!(err, SyncError::NewNotices(ref n) if n.len() == 1));
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_dead_daemon_is_resurrected() {
        let (dir, repo) = setup_test_repo();
        let session = ScriptedSession::default();
        *session.failing_flushes.lock().unwrap() = 1;
        let mut r = reconciler(dir.path(), &head_branch(&repo), &session);

        r.handle_path_changes(&[dir.path().join("a.txt")]).unwrap();
        assert_eq!(session.calls(), vec!["flush", "create", "flush"]);
    }

    #[test]
    fn test_flush_failure_with_live_daemon_propagates() {
        let (dir, repo) = setup_test_repo();
        let session = ScriptedSession::default();
        *session.failing_flushes.lock().unwrap() = 1;
        *session.daemon_running.lock().unwrap() = true;
        let mut r = reconciler(dir.path(), &head_branch(&repo), &session);

        let err = r.handle_path_changes(&[dir.path().join("a.txt")]).unwrap_err();
        assert_eq!(err.kind(), "filetree_sync");
        assert_eq!(session.calls(), vec!["flush"]);
    }
}
