//! `aoe-sync task` commands

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::Config;
use crate::git::GitRepo;
use crate::task::{EnvironmentSpec, JsonTaskStore, Task};

const TABLE_COL_ID: usize = 16;
const TABLE_COL_PROJECT: usize = 16;
const TABLE_COL_BRANCH: usize = 24;
const TABLE_COL_ENV: usize = 30;

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Register a task
    Add(TaskAddArgs),

    /// List registered tasks
    List(TaskListArgs),

    /// Forget a task
    Remove(TaskRemoveArgs),
}

#[derive(Args)]
pub struct TaskAddArgs {
    /// Task ID
    id: String,

    /// Project the task belongs to
    #[arg(short, long)]
    project: String,

    /// Branch the agent works on
    #[arg(short, long)]
    branch: String,

    /// Local checkout to sync into (defaults to the current directory)
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Container running the agent
    #[arg(long, required_unless_present = "local_dir", conflicts_with = "local_dir")]
    container: Option<String>,

    /// Directory on this machine acting as the sandbox
    #[arg(long)]
    local_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct TaskListArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
pub struct TaskRemoveArgs {
    /// Task ID
    id: String,
}

#[derive(Serialize)]
struct TaskJson<'a> {
    id: &'a str,
    project: &'a str,
    branch: &'a str,
    repo: String,
    environment: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

pub async fn run(config: &Config, command: TaskCommands) -> Result<()> {
    let store = JsonTaskStore::new(config.data_dir()?)?;
    match command {
        TaskCommands::Add(args) => run_add(&store, args),
        TaskCommands::List(args) => run_list(&store, args),
        TaskCommands::Remove(args) => run_remove(&store, args),
    }
}

fn run_add(store: &JsonTaskStore, args: TaskAddArgs) -> Result<()> {
    let repo = match args.repo {
        Some(repo) => repo,
        None => std::env::current_dir()?,
    };
    let repo = repo
        .canonicalize()
        .with_context(|| format!("Repository path does not exist: {}", repo.display()))?;
    if !GitRepo::is_git_repo(&repo) {
        bail!("Not a git repository: {}", repo.display());
    }

    let environment = match (args.container, args.local_dir) {
        (Some(container), None) => EnvironmentSpec::Docker { container },
        (None, Some(path)) => EnvironmentSpec::LocalDirectory { path },
        _ => bail!("Specify exactly one of --container or --local-dir"),
    };

    let task = Task::new(&args.id, args.project, args.branch, repo, environment);
    store.add_task(task)?;
    println!("✓ Added task {}", args.id);
    Ok(())
}

fn run_list(store: &JsonTaskStore, args: TaskListArgs) -> Result<()> {
    let tasks = store.list_tasks()?;

    if args.json {
        let tasks: Vec<TaskJson> = tasks
            .iter()
            .map(|task| TaskJson {
                id: &task.id,
                project: &task.project_id,
                branch: &task.branch_name,
                repo: task.repo_path.display().to_string(),
                environment: task.environment.to_string(),
                created_at: task.created_at,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks registered.");
        return Ok(());
    }

    println!(
        "{:<id$} {:<project$} {:<branch$} {:<env$} REPO",
        "ID",
        "PROJECT",
        "BRANCH",
        "ENVIRONMENT",
        id = TABLE_COL_ID,
        project = TABLE_COL_PROJECT,
        branch = TABLE_COL_BRANCH,
        env = TABLE_COL_ENV
    );
    for task in &tasks {
        println!(
            "{:<id$} {:<project$} {:<branch$} {:<env$} {}",
            super::truncate(&task.id, TABLE_COL_ID),
            super::truncate(&task.project_id, TABLE_COL_PROJECT),
            super::truncate(&task.branch_name, TABLE_COL_BRANCH),
            super::truncate(&task.environment.to_string(), TABLE_COL_ENV),
            task.repo_path.display(),
            id = TABLE_COL_ID,
            project = TABLE_COL_PROJECT,
            branch = TABLE_COL_BRANCH,
            env = TABLE_COL_ENV
        );
    }
    println!("\nTotal: {} tasks", tasks.len());
    Ok(())
}

fn run_remove(store: &JsonTaskStore, args: TaskRemoveArgs) -> Result<()> {
    if let Some(record) = crate::task::TaskStore::load_sync_record(store)? {
        if record.task_id == args.id {
            bail!(
                "Task {} is being synced; stop it or run `aoe-sync cleanup` first",
                args.id
            );
        }
    }
    match store.remove_task(&args.id)? {
        Some(_) => println!("✓ Removed task {}", args.id),
        None => bail!("Task not found: {}", args.id),
    }
    Ok(())
}
