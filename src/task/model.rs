//! Task data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Where a task's agent runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvironmentSpec {
    /// A running container; the workspace path comes from `[sandbox]` config
    Docker { container: String },
    /// A directory on this machine, e.g. a mounted VM disk
    LocalDirectory { path: PathBuf },
}

impl fmt::Display for EnvironmentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentSpec::Docker { container } => write!(f, "docker:{}", container),
            EnvironmentSpec::LocalDirectory { path } => write!(f, "local:{}", path.display()),
        }
    }
}

/// One agent task whose sandbox can be synced with the user's checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    /// Branch the agent commits to, and the one local sync checks out
    pub branch_name: String,
    /// The user's local checkout
    pub repo_path: PathBuf,
    pub environment: EnvironmentSpec,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        branch_name: impl Into<String>,
        repo_path: PathBuf,
        environment: EnvironmentSpec,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            branch_name: branch_name.into(),
            repo_path,
            environment,
            created_at: Utc::now(),
        }
    }
}

/// Ids end up in session names and file names, so keep them to a safe
/// character set
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("T001"));
        assert!(is_valid_id("my_project-2"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id("../escape"));
    }

    #[test]
    fn test_environment_spec_serialization() {
        let spec = EnvironmentSpec::Docker {
            container: "agent-1".to_string(),
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"kind":"docker","container":"agent-1"}"#);

        let parsed: EnvironmentSpec =
            serde_json::from_str(r#"{"kind":"local_directory","path":"/mnt/vm"}"#).unwrap();
        assert_eq!(
            parsed,
            EnvironmentSpec::LocalDirectory {
                path: PathBuf::from("/mnt/vm")
            }
        );
    }

    #[test]
    fn test_environment_spec_display() {
        let spec = EnvironmentSpec::LocalDirectory {
            path: PathBuf::from("/mnt/vm"),
        };
        assert_eq!(spec.to_string(), "local:/mnt/vm");
    }
}
