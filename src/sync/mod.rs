//! Local ↔ sandbox sync engine
//!
//! A session keeps a user's local checkout and an agent's sandbox workspace
//! in step: file contents through an external file-tree sync tool, the sync
//! branch's head through git. Changes on either side are picked up by
//! watchers, batched, and handed to the reconcilers that own them.

pub mod branch_sync;
pub mod debounce;
pub mod error;
pub mod events;
pub mod filetree;
pub mod manager;
pub mod messenger;
pub mod notice;
pub mod observer;
pub mod reconciler;
pub mod remote_bridge;
pub mod rwlock;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod threading;

pub use error::{ExpectedStartupBlocker, Result, SyncError};
pub use filetree::{FiletreeSyncBackend, FiletreeSyncSession, MutagenBackend};
pub use manager::LocalSyncManager;
pub use notice::{LocalSyncMessage, Notice, SetupStep};
pub use session::{LocalSyncSession, SessionSettings};
pub use state::{LocalSyncHighLevelStatus, LocalSyncSessionState, SyncSessionInfo};
