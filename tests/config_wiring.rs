//! Integration tests for config wiring
//!
//! These tests verify that settings from `config.toml` reach the components
//! that use them: session tunables, the task store location and the
//! file-tree daemon directory.

use std::path::PathBuf;
use std::time::Duration;

use aoe_sync::config::{save_config, Config, HOME_ENV_VAR};
use aoe_sync::sync::{LocalSyncMessage, SessionSettings};
use aoe_sync::task::{EnvironmentSpec, JsonTaskStore, Task, TaskStore};
use serial_test::serial;

fn setup_temp_home() -> tempfile::TempDir {
    let temp = tempfile::TempDir::new().unwrap();
    std::env::set_var(HOME_ENV_VAR, temp.path());
    temp
}

#[test]
#[serial]
fn test_session_settings_follow_saved_config() {
    let _temp = setup_temp_home();

    let mut config = Config::default();
    config.sync.debounce_seconds = 0.1;
    config.sync.max_debounce_seconds = 0.5;
    config.sync.excluded_subpaths = vec![PathBuf::from(".git/"), PathBuf::from("target/")];
    config.sync.thread_join_timeout_seconds = 2;
    config.sandbox.watch_as_root = false;
    save_config(&config).unwrap();

    let loaded = Config::load().unwrap();
    let settings = SessionSettings::from(&loaded);
    assert_eq!(settings.scheduler.debounce, Duration::from_millis(100));
    assert_eq!(settings.scheduler.max_debounce, Duration::from_millis(500));
    assert_eq!(
        settings.excluded_subpaths,
        vec![PathBuf::from(".git/"), PathBuf::from("target/")]
    );
    assert_eq!(settings.thread_join_timeout, Duration::from_secs(2));
    assert!(!settings.watch_as_root);
    assert!(settings.remote_watch_command.is_none());
}

#[test]
#[serial]
fn test_task_store_lives_in_app_dir() {
    let temp = setup_temp_home();
    let config = Config::load().unwrap();

    let data_dir = config.data_dir().unwrap();
    assert!(data_dir.starts_with(temp.path()));
    assert_eq!(
        config.filetree_data_dir().unwrap(),
        temp.path().join("mutagen")
    );

    let store = JsonTaskStore::new(&data_dir).unwrap();
    store
        .add_task(Task::new(
            "T001",
            "proj",
            "feature",
            temp.path().to_path_buf(),
            EnvironmentSpec::Docker {
                container: "agent-1".to_string(),
            },
        ))
        .unwrap();
    store
        .record_message("T001", &LocalSyncMessage::SetupStarted)
        .unwrap();

    let reopened = JsonTaskStore::new(&data_dir).unwrap();
    assert_eq!(reopened.list_tasks().unwrap().len(), 1);
    assert_eq!(reopened.project_ids().unwrap(), vec!["proj".to_string()]);
    let messages = reopened.messages("T001").unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, LocalSyncMessage::SetupStarted);
}

#[test]
#[serial]
fn test_invalid_config_is_reported() {
    let temp = setup_temp_home();
    std::fs::write(temp.path().join("config.toml"), "[sync]\ndebounce_seconds = \"soon\"\n")
        .unwrap();

    let err = Config::load().unwrap_err();
    assert!(format!("{:#}", err).contains("config.toml"));
}
