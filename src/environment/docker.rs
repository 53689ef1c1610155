use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::error::{EnvironmentError, Result};
use super::{describe_command, workspace_path, BackgroundProcess, CommandOutput, Environment};
use crate::git::GitRemote;
use crate::sync::rwlock::ReadWriteLock;

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(600);

/// A running container the agent works in. Everything goes through
/// `docker exec`.
#[derive(Debug)]
pub struct DockerEnvironment {
    container: String,
    workspace_dir: PathBuf,
    snapshot_guard: Arc<ReadWriteLock>,
}

impl DockerEnvironment {
    pub fn new(container: impl Into<String>, workspace_dir: PathBuf) -> Self {
        Self {
            container: container.into(),
            workspace_dir,
            snapshot_guard: Arc::new(ReadWriteLock::default()),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn is_docker_available() -> bool {
        Command::new("docker")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn is_alive(&self) -> Result<bool> {
        let _guard = self.snapshot_guard.read_lock();
        let output = self.docker(&[
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            self.container.clone(),
        ])?;
        Ok(output.success() && output.stdout.trim() == "true")
    }

    /// Commit the container to `image_tag`. Holds the write side of the
    /// snapshot guard so no file-tree transfer is mid-flight.
    pub fn snapshot(&self, image_tag: &str) -> Result<String> {
        info!(container = %self.container, image_tag, "Snapshotting container");
        let output = {
            let _guard = self.snapshot_guard.write_lock();
            let mut command = Command::new("docker");
            command.args(["commit", &self.container, image_tag]);
            crate::process::run_with_timeout(&mut command, SNAPSHOT_TIMEOUT)?
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EnvironmentError::SnapshotFailed(format!(
                "{} -> {}: {}",
                self.container,
                image_tag,
                stderr.trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim().rsplit(':').next().unwrap_or_default().to_string())
    }

    fn exec_args(&self, run_as_root: bool, secrets: &HashMap<String, String>) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            self.workspace_dir.to_string_lossy().into_owned(),
        ];
        if run_as_root {
            args.extend(["-u".to_string(), "root".to_string()]);
        }
        let mut names: Vec<&String> = secrets.keys().collect();
        names.sort();
        for name in names {
            // Only the name goes on the command line; the value comes from our env
            args.extend(["-e".to_string(), name.clone()]);
        }
        args
    }

    fn docker(&self, args: &[String]) -> Result<CommandOutput> {
        let description = format!("docker {}", describe_command(args));
        let mut command = Command::new("docker");
        command.args(args);
        let output = crate::process::run_with_timeout(&mut command, EXEC_TIMEOUT).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EnvironmentError::NotInstalled
            } else if e.kind() == std::io::ErrorKind::TimedOut {
                EnvironmentError::TimedOut {
                    command: description.clone(),
                    seconds: EXEC_TIMEOUT.as_secs(),
                }
            } else {
                EnvironmentError::IoError(e)
            }
        })?;
        let output = CommandOutput::from_output(description, output);
        if output.exit_code == Some(125) || output.stderr.contains("Error response from daemon") {
            return Err(EnvironmentError::from_docker_stderr(
                output.command,
                output.exit_code,
                &output.stderr,
            ));
        }
        Ok(output)
    }

    fn exec(&self, command: &[String]) -> Result<CommandOutput> {
        let mut args = self.exec_args(false, &HashMap::new());
        args.push(self.container.clone());
        args.extend(command.iter().cloned());
        let _guard = self.snapshot_guard.read_lock();
        let mut output = self.docker(&args)?;
        output.command = describe_command(command);
        Ok(output)
    }
}

impl Environment for DockerEnvironment {
    fn run_process_in_background(
        &self,
        command: &[String],
        secrets: &HashMap<String, String>,
        run_as_root: bool,
    ) -> Result<BackgroundProcess> {
        // docker exec doesn't forward signals, so the process records its
        // pid where the terminate hook can find it
        let pid_file = format!("/tmp/aoe-sync-{}.pid", uuid::Uuid::new_v4());
        let mut args = self.exec_args(run_as_root, secrets);
        args.push(self.container.clone());
        args.extend([
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > {} && exec \"$@\"", pid_file),
            "--".to_string(),
        ]);
        args.extend(command.iter().cloned());

        let mut docker = Command::new("docker");
        docker.args(&args).envs(secrets);

        let process = {
            let _guard = self.snapshot_guard.read_lock();
            BackgroundProcess::spawn(docker, describe_command(command))?
        };

        let container = self.container.clone();
        Ok(process.with_terminate_hook(move || {
            let script = format!(
                "test -f {0} && kill $(cat {0}) 2>/dev/null; rm -f {0}",
                pid_file
            );
            let mut kill = Command::new("docker");
            kill.args(["exec", "-u", "root", &container, "sh", "-c", &script]);
            match crate::process::run_with_timeout(&mut kill, EXEC_TIMEOUT) {
                Ok(output) if output.status.success() => {
                    debug!(container = %container, "Stopped in-container process");
                }
                Ok(output) => debug!(
                    container = %container,
                    "In-container process already gone: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!(container = %container, "Failed to stop in-container process: {}", e),
            }
        }))
    }

    fn run_command(&self, command: &[String]) -> Result<CommandOutput> {
        self.exec(command)
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        let path = workspace_path(&self.workspace_dir, path);
        let script = "test -f \"$1\" || exit 3; cat \"$1\"".to_string();
        let output = self.exec(&[
            "sh".to_string(),
            "-c".to_string(),
            script,
            "sh".to_string(),
            path.to_string_lossy().into_owned(),
        ])?;
        if output.exit_code == Some(3) {
            return Ok(None);
        }
        Ok(Some(output.checked()?.stdout))
    }

    fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        let path = workspace_path(&self.workspace_dir, path);
        let path_str = path.to_string_lossy().into_owned();
        let mut command = Command::new("docker");
        command
            .args(["exec", "-i", &self.container, "sh", "-c"])
            .arg("mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\"")
            .args(["sh", &path_str])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let _guard = self.snapshot_guard.read_lock();
        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(EnvironmentError::from_docker_stderr(
                format!("write {}", path_str),
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(())
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        let from = workspace_path(&self.workspace_dir, from);
        let to = workspace_path(&self.workspace_dir, to);
        self.exec(&[
            "mv".to_string(),
            "-f".to_string(),
            from.to_string_lossy().into_owned(),
            to.to_string_lossy().into_owned(),
        ])?
        .checked()?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        let path = workspace_path(&self.workspace_dir, path);
        let output = self.exec(&[
            "test".to_string(),
            "-e".to_string(),
            path.to_string_lossy().into_owned(),
        ])?;
        Ok(output.success())
    }

    fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    fn filetree_sync_url(&self) -> String {
        format!("docker://{}{}", self.container, self.workspace_dir.display())
    }

    fn git_remote(&self) -> GitRemote {
        GitRemote {
            url: format!(
                "ext::docker exec -i {} %S {}",
                self.container,
                self.workspace_dir.display()
            ),
            config: vec!["protocol.ext.allow=always".to_string()],
        }
    }

    fn snapshot_guard(&self) -> Option<Arc<ReadWriteLock>> {
        Some(Arc::clone(&self.snapshot_guard))
    }
}
