//! Task storage - JSON file persistence

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::model::{is_valid_id, Task};
use crate::sync::notice::LocalSyncMessage;
use crate::sync::state::SyncSessionInfo;

/// What the sync engine reads from and writes to the task layer
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    fn record_message(&self, task_id: &str, message: &LocalSyncMessage) -> Result<()>;

    /// Persist the active session so a crashed process can be cleaned up
    fn save_sync_record(&self, info: &SyncSessionInfo) -> Result<()>;

    fn load_sync_record(&self) -> Result<Option<SyncSessionInfo>>;

    fn clear_sync_record(&self) -> Result<()>;

    fn project_ids(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub recorded_at: DateTime<Utc>,
    pub message: LocalSyncMessage,
}

/// Tasks in `tasks.json`, messages as JSON lines under `messages/`, and the
/// active session in `active_sync.json`
#[derive(Debug)]
pub struct JsonTaskStore {
    dir: PathBuf,
}

impl JsonTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("messages"))
            .with_context(|| format!("Failed to create task store at {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn tasks_path(&self) -> PathBuf {
        self.dir.join("tasks.json")
    }

    fn sync_record_path(&self) -> PathBuf {
        self.dir.join("active_sync.json")
    }

    fn messages_path(&self, task_id: &str) -> PathBuf {
        self.dir.join("messages").join(format!("{}.jsonl", task_id))
    }

    /// Serializes writers across processes
    fn lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(".lock"))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let path = self.tasks_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let tasks: Vec<Task> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(tasks)
    }

    fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        let path = self.tasks_path();
        if path.exists() {
            let backup_path = path.with_extension("json.bak");
            if let Err(e) = fs::copy(&path, &backup_path) {
                warn!("Failed to create backup: {}", e);
            }
        }

        let content = serde_json::to_string_pretty(tasks)?;
        fs::write(&path, content)?;
        Ok(())
    }

    pub fn add_task(&self, task: Task) -> Result<()> {
        if !is_valid_id(&task.id) || !is_valid_id(&task.project_id) {
            bail!(
                "Task and project ids may only contain letters, digits, '-' and '_': {} / {}",
                task.id,
                task.project_id
            );
        }
        let _lock = self.lock()?;
        let mut tasks = self.list_tasks()?;
        if tasks.iter().any(|t| t.id == task.id) {
            bail!("Task already exists: {}", task.id);
        }
        tasks.push(task);
        self.save_tasks(&tasks)
    }

    /// Returns the removed task, if there was one
    pub fn remove_task(&self, task_id: &str) -> Result<Option<Task>> {
        let _lock = self.lock()?;
        let mut tasks = self.list_tasks()?;
        let Some(index) = tasks.iter().position(|t| t.id == task_id) else {
            return Ok(None);
        };
        let removed = tasks.remove(index);
        self.save_tasks(&tasks)?;
        Ok(Some(removed))
    }

    pub fn messages(&self, task_id: &str) -> Result<Vec<StoredMessage>> {
        let path = self.messages_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut messages = Vec::new();
        for line in BufReader::new(File::open(&path)?).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable message: {}", e),
            }
        }
        Ok(messages)
    }
}

impl TaskStore for JsonTaskStore {
    fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.list_tasks()?.into_iter().find(|t| t.id == task_id))
    }

    fn record_message(&self, task_id: &str, message: &LocalSyncMessage) -> Result<()> {
        let record = StoredMessage {
            recorded_at: Utc::now(),
            message: message.clone(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _lock = self.lock()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.messages_path(task_id))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn save_sync_record(&self, info: &SyncSessionInfo) -> Result<()> {
        let _lock = self.lock()?;
        let content = serde_json::to_string_pretty(info)?;
        fs::write(self.sync_record_path(), content)?;
        Ok(())
    }

    fn load_sync_record(&self) -> Result<Option<SyncSessionInfo>> {
        let path = self.sync_record_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn clear_sync_record(&self) -> Result<()> {
        let _lock = self.lock()?;
        match fs::remove_file(self.sync_record_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn project_ids(&self) -> Result<Vec<String>> {
        let ids: BTreeSet<String> = self
            .list_tasks()?
            .into_iter()
            .map(|t| t.project_id)
            .collect();
        Ok(ids.into_iter().collect())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: Vec<Task>,
    messages: HashMap<String, Vec<LocalSyncMessage>>,
    sync_record: Option<SyncSessionInfo>,
}

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    state: Mutex<MemoryState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let store = Self::new();
        store.lock().tasks.extend(tasks);
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_task(&self, task: Task) {
        self.lock().tasks.push(task);
    }

    pub fn messages(&self, task_id: &str) -> Vec<LocalSyncMessage> {
        self.lock()
            .messages
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.lock().tasks.iter().find(|t| t.id == task_id).cloned())
    }

    fn record_message(&self, task_id: &str, message: &LocalSyncMessage) -> Result<()> {
        self.lock()
            .messages
            .entry(task_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn save_sync_record(&self, info: &SyncSessionInfo) -> Result<()> {
        self.lock().sync_record = Some(info.clone());
        Ok(())
    }

    fn load_sync_record(&self) -> Result<Option<SyncSessionInfo>> {
        Ok(self.lock().sync_record.clone())
    }

    fn clear_sync_record(&self) -> Result<()> {
        self.lock().sync_record = None;
        Ok(())
    }

    fn project_ids(&self) -> Result<Vec<String>> {
        let ids: BTreeSet<String> = self.lock().tasks.iter().map(|t| t.project_id.clone()).collect();
        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::EnvironmentSpec;
    use tempfile::tempdir;

    fn task(id: &str, project: &str) -> Task {
        Task::new(
            id,
            project,
            "main",
            PathBuf::from("/tmp/repo"),
            EnvironmentSpec::Docker {
                container: format!("agent-{}", id),
            },
        )
    }

    fn info(task_id: &str) -> SyncSessionInfo {
        SyncSessionInfo {
            task_id: task_id.to_string(),
            project_id: "proj".to_string(),
            sync_name: format!("aoe-sync-proj-{}", task_id),
            sync_branch: "feature".to_string(),
            original_branch: "main".to_string(),
        }
    }

    #[test]
    fn test_task_roundtrip() -> Result<()> {
        let temp = tempdir()?;
        let store = JsonTaskStore::new(temp.path())?;

        store.add_task(task("t1", "proj"))?;
        store.add_task(task("t2", "other"))?;

        let loaded = store.list_tasks()?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(store.get_task("t2")?.map(|t| t.project_id), Some("other".to_string()));
        assert_eq!(store.project_ids()?, vec!["other".to_string(), "proj".to_string()]);
        Ok(())
    }

    #[test]
    fn test_duplicate_and_invalid_tasks_rejected() -> Result<()> {
        let temp = tempdir()?;
        let store = JsonTaskStore::new(temp.path())?;

        store.add_task(task("t1", "proj"))?;
        assert!(store.add_task(task("t1", "proj")).is_err());
        assert!(store.add_task(task("bad id", "proj")).is_err());
        Ok(())
    }

    #[test]
    fn test_save_creates_backup() -> Result<()> {
        let temp = tempdir()?;
        let store = JsonTaskStore::new(temp.path())?;

        store.add_task(task("t1", "proj"))?;
        assert!(!temp.path().join("tasks.json.bak").exists());
        store.add_task(task("t2", "proj"))?;
        assert!(temp.path().join("tasks.json.bak").exists());
        Ok(())
    }

    #[test]
    fn test_remove_task() -> Result<()> {
        let temp = tempdir()?;
        let store = JsonTaskStore::new(temp.path())?;

        store.add_task(task("t1", "proj"))?;
        assert_eq!(store.remove_task("t1")?.map(|t| t.id), Some("t1".to_string()));
        assert!(store.remove_task("t1")?.is_none());
        assert!(store.list_tasks()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_load_empty_file() -> Result<()> {
        let temp = tempdir()?;
        let store = JsonTaskStore::new(temp.path())?;
        fs::write(temp.path().join("tasks.json"), "  \n")?;
        assert!(store.list_tasks()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_messages_are_appended() -> Result<()> {
        let temp = tempdir()?;
        let store = JsonTaskStore::new(temp.path())?;

        store.record_message("t1", &LocalSyncMessage::SetupStarted)?;
        store.record_message("t1", &LocalSyncMessage::Disabled)?;

        let messages: Vec<LocalSyncMessage> =
            store.messages("t1")?.into_iter().map(|m| m.message).collect();
        assert_eq!(
            messages,
            vec![LocalSyncMessage::SetupStarted, LocalSyncMessage::Disabled]
        );
        assert!(store.messages("t2")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_sync_record_lifecycle() -> Result<()> {
        let temp = tempdir()?;
        let store = JsonTaskStore::new(temp.path())?;

        assert!(store.load_sync_record()?.is_none());
        store.save_sync_record(&info("t1"))?;
        assert_eq!(store.load_sync_record()?, Some(info("t1")));
        store.clear_sync_record()?;
        assert!(store.load_sync_record()?.is_none());
        // Clearing twice is fine
        store.clear_sync_record()?;
        Ok(())
    }

    #[test]
    fn test_in_memory_store() -> Result<()> {
        let store = InMemoryTaskStore::with_tasks([task("t1", "proj")]);
        assert!(store.get_task("t1")?.is_some());
        store.record_message("t1", &LocalSyncMessage::SetupAndEnabled)?;
        assert_eq!(store.messages("t1"), vec![LocalSyncMessage::SetupAndEnabled]);
        store.save_sync_record(&info("t1"))?;
        assert_eq!(store.load_sync_record()?.map(|i| i.task_id), Some("t1".to_string()));
        Ok(())
    }
}
