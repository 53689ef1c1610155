use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::error::{EnvironmentError, Result};
use super::{describe_command, workspace_path, BackgroundProcess, CommandOutput, Environment};
use crate::git::GitRemote;
use crate::sync::rwlock::ReadWriteLock;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// A directory on this machine standing in for the sandbox: a mounted VM
/// workspace, or a scratch clone in tests.
#[derive(Debug, Clone)]
pub struct LocalDirectoryEnvironment {
    root: PathBuf,
}

impl LocalDirectoryEnvironment {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn command(&self, command: &[String]) -> Result<Command> {
        let (program, args) = command.split_first().ok_or_else(|| EnvironmentError::SpawnFailed {
            command: String::new(),
            message: "empty command".to_string(),
        })?;
        if !self.root.is_dir() {
            return Err(EnvironmentError::DirectoryNotFound(
                self.root.display().to_string(),
            ));
        }
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.root);
        Ok(cmd)
    }
}

impl Environment for LocalDirectoryEnvironment {
    fn run_process_in_background(
        &self,
        command: &[String],
        secrets: &HashMap<String, String>,
        run_as_root: bool,
    ) -> Result<BackgroundProcess> {
        if run_as_root {
            debug!("Local directory sandbox runs everything as the current user");
        }
        let mut cmd = self.command(command)?;
        cmd.envs(secrets);
        BackgroundProcess::spawn(cmd, describe_command(command))
    }

    fn run_command(&self, command: &[String]) -> Result<CommandOutput> {
        let description = describe_command(command);
        let mut cmd = self.command(command)?;
        let output = crate::process::run_with_timeout(&mut cmd, COMMAND_TIMEOUT).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                EnvironmentError::TimedOut {
                    command: description.clone(),
                    seconds: COMMAND_TIMEOUT.as_secs(),
                }
            } else {
                EnvironmentError::SpawnFailed {
                    command: description.clone(),
                    message: e.to_string(),
                }
            }
        })?;
        Ok(CommandOutput::from_output(description, output))
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(workspace_path(&self.root, path)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        let path = workspace_path(&self.root, path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(workspace_path(&self.root, from), workspace_path(&self.root, to))?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(workspace_path(&self.root, path).exists())
    }

    fn workspace_dir(&self) -> &Path {
        &self.root
    }

    fn filetree_sync_url(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn git_remote(&self) -> GitRemote {
        GitRemote::local(&self.root)
    }

    fn snapshot_guard(&self) -> Option<Arc<ReadWriteLock>> {
        None
    }
}
