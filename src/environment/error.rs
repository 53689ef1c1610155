use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error(
        "Docker is not installed or not in PATH.\n\
         Install Docker: https://docs.docker.com/get-docker/"
    )]
    NotInstalled,

    #[error(
        "Docker daemon is not running.\n\
         Start Docker Desktop or run: sudo systemctl start docker"
    )]
    DaemonNotRunning,

    #[error(
        "Docker permission denied.\n\
         On Linux, add your user to the docker group:\n\
         sudo usermod -aG docker $USER\n\
         Then log out and back in."
    )]
    PermissionDenied,

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container is not running: {0}")]
    ContainerNotRunning(String),

    #[error("Sandbox directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Command `{command}` failed in sandbox (exit code {}): {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()), .stderr.trim())]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {seconds}s")]
    TimedOut { command: String, seconds: u64 },

    #[error("Failed to start `{command}`: {message}")]
    SpawnFailed { command: String, message: String },

    #[error("Failed to snapshot container: {0}")]
    SnapshotFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EnvironmentError {
    /// Classify a failed `docker` invocation by its stderr
    pub(crate) fn from_docker_stderr(command: String, code: Option<i32>, stderr: &str) -> Self {
        if stderr.contains("permission denied while trying to connect") {
            return EnvironmentError::PermissionDenied;
        }
        if stderr.contains("Cannot connect to the Docker daemon") {
            return EnvironmentError::DaemonNotRunning;
        }
        if let Some(rest) = stderr.split("No such container:").nth(1) {
            return EnvironmentError::ContainerNotFound(rest.trim().to_string());
        }
        if stderr.contains("is not running") {
            return EnvironmentError::ContainerNotRunning(stderr.trim().to_string());
        }
        EnvironmentError::CommandFailed {
            command,
            code,
            stderr: stderr.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EnvironmentError>;
