//! Agent tasks and their persistence
//!
//! The sync engine only needs a few things from a task: which project it
//! belongs to, which branch the agent works on, where the user's checkout is
//! and how to reach the sandbox.

pub mod model;
pub mod storage;

pub use model::{is_valid_id, EnvironmentSpec, Task};
pub use storage::{InMemoryTaskStore, JsonTaskStore, StoredMessage, TaskStore};
