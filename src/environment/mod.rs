//! Sandboxes the agent works in: process execution and file access

mod docker;
pub mod error;
mod local;

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

pub use docker::DockerEnvironment;
pub use error::{EnvironmentError, Result};
pub use local::LocalDirectoryEnvironment;

use crate::git::GitRemote;
use crate::sync::rwlock::ReadWriteLock;
use crate::task::EnvironmentSpec;

/// How long a terminated background process gets to exit before we stop waiting
const TERMINATE_WAIT: Duration = Duration::from_secs(2);

/// Everything the sync engine needs from the sandbox. Paths are sandbox-side
/// paths, rooted at [`Environment::workspace_dir`].
pub trait Environment: Send + Sync + std::fmt::Debug {
    /// Launch a long-running command. Its stdout is handed to the caller,
    /// stderr is drained into the log.
    fn run_process_in_background(
        &self,
        command: &[String],
        secrets: &HashMap<String, String>,
        run_as_root: bool,
    ) -> Result<BackgroundProcess>;

    /// Run a command to completion inside the workspace. A nonzero exit is
    /// reported in the output, not as an error.
    fn run_command(&self, command: &[String]) -> Result<CommandOutput>;

    /// `None` if the file doesn't exist
    fn read_file(&self, path: &Path) -> Result<Option<String>>;

    fn write_file(&self, path: &Path, content: &str) -> Result<()>;

    fn move_file(&self, from: &Path, to: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> Result<bool>;

    fn workspace_dir(&self) -> &Path;

    /// Endpoint the file-tree sync tool uses for the sandbox side
    fn filetree_sync_url(&self) -> String;

    /// How git on the host reaches the sandbox's repository
    fn git_remote(&self) -> GitRemote;

    /// Held for reading around operations that must not overlap a snapshot
    fn snapshot_guard(&self) -> Option<Arc<ReadWriteLock>>;
}

/// Build the environment a task runs in
pub fn for_task(spec: &EnvironmentSpec, workspace_dir: &Path) -> Arc<dyn Environment> {
    match spec {
        EnvironmentSpec::Docker { container } => Arc::new(DockerEnvironment::new(
            container.clone(),
            workspace_dir.to_path_buf(),
        )),
        EnvironmentSpec::LocalDirectory { path } => {
            Arc::new(LocalDirectoryEnvironment::new(path.clone()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub(crate) fn from_output(command: String, output: std::process::Output) -> Self {
        Self {
            command,
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a nonzero exit into [`EnvironmentError::CommandFailed`]
    pub fn checked(self) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(EnvironmentError::CommandFailed {
            command: self.command,
            code: self.exit_code,
            stderr: self.stderr,
        })
    }
}

pub(crate) fn describe_command(command: &[String]) -> String {
    command.join(" ")
}

type TerminateHook = Box<dyn FnOnce() + Send>;

/// A running process whose whole tree is torn down on [`terminate`](Self::terminate)
/// or drop.
pub struct BackgroundProcess {
    description: String,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_drain: Option<JoinHandle<()>>,
    on_terminate: Option<TerminateHook>,
    exit_status: Option<ExitStatus>,
}

impl BackgroundProcess {
    pub fn spawn(mut command: Command, description: impl Into<String>) -> Result<Self> {
        let description = description.into();
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EnvironmentError::SpawnFailed {
                command: description.clone(),
                message: e.to_string(),
            })?;
        debug!(pid = child.id(), command = %description, "Started background process");

        let stdout = child.stdout.take();
        let stderr_drain = match child.stderr.take() {
            Some(stderr) => {
                let label = description.clone();
                Some(
                    thread::Builder::new()
                        .name("aoe-sync-stderr".to_string())
                        .spawn(move || {
                            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                                debug!(command = %label, "stderr: {}", line);
                            }
                        })?,
                )
            }
            None => None,
        };

        Ok(Self {
            description,
            child,
            stdout,
            stderr_drain,
            on_terminate: None,
            exit_status: None,
        })
    }

    /// Extra teardown to run after the local process tree is gone, e.g.
    /// killing the matching process inside a container.
    pub(crate) fn with_terminate_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_terminate = Some(Box::new(hook));
        self
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Can only be taken once
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit_status.is_none() {
            self.exit_status = self.child.try_wait()?;
        }
        Ok(self.exit_status)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Kill the process tree and reap it
    pub fn terminate(&mut self) -> Result<Option<ExitStatus>> {
        if self.is_running() {
            debug!(pid = self.pid(), command = %self.description, "Terminating background process");
            crate::process::kill_process_tree(self.pid());
            self.exit_status = match crate::process::wait_with_deadline(&mut self.child, TERMINATE_WAIT)? {
                Some(status) => Some(status),
                None => {
                    warn!(pid = self.pid(), "Background process ignored termination, killing");
                    let _ = self.child.kill();
                    Some(self.child.wait()?)
                }
            };
        }
        if let Some(hook) = self.on_terminate.take() {
            hook();
        }
        if let Some(drain) = self.stderr_drain.take() {
            if drain.is_finished() {
                let _ = drain.join();
            }
        }
        Ok(self.exit_status)
    }
}

impl std::fmt::Debug for BackgroundProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundProcess")
            .field("pid", &self.child.id())
            .field("description", &self.description)
            .field("exit_status", &self.exit_status)
            .finish()
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!(command = %self.description, "Failed to terminate background process: {}", e);
        }
    }
}

pub(crate) fn workspace_path(workspace_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_background_process_streams_stdout() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo one; echo two; echo oops >&2"]);
        let mut process = BackgroundProcess::spawn(command, "echo").unwrap();

        let mut out = String::new();
        process.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "one\ntwo\n");
        assert!(process.take_stdout().is_none());
    }

    #[test]
    fn test_terminate_kills_long_running_process() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30"]);
        let mut process = BackgroundProcess::spawn(command, "sleep").unwrap();
        assert!(process.is_running());

        let status = process.terminate().unwrap();
        assert!(status.is_some());
        assert!(!process.is_running());
    }

    #[test]
    fn test_terminate_runs_hook_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30"]);
        let mut process = BackgroundProcess::spawn(command, "sleep")
            .unwrap()
            .with_terminate_hook(move || tx.send(()).unwrap());

        process.terminate().unwrap();
        process.terminate().unwrap();
        drop(process);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_spawn_failure_names_command() {
        let command = Command::new("/definitely/not/a/binary");
        let err = BackgroundProcess::spawn(command, "missing-binary").unwrap_err();
        assert!(matches!(err, EnvironmentError::SpawnFailed { ref command, .. } if command == "missing-binary"));
    }

    #[test]
    fn test_checked_output() {
        let ok = CommandOutput {
            command: "true".into(),
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(ok.clone().checked().is_ok());

        let failed = CommandOutput {
            exit_code: Some(2),
            stderr: "bad".into(),
            ..ok
        };
        assert!(matches!(
            failed.checked(),
            Err(EnvironmentError::CommandFailed { code: Some(2), .. })
        ));
    }

    #[test]
    fn test_workspace_path() {
        let root = Path::new("/workspace");
        assert_eq!(workspace_path(root, Path::new("a/b")), PathBuf::from("/workspace/a/b"));
        assert_eq!(workspace_path(root, Path::new("/etc/x")), PathBuf::from("/etc/x"));
    }
}
