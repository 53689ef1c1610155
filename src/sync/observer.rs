//! Native file watcher on the local working tree, with lifecycle tracking

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use super::error::{Result, SyncError};
use super::events::FileSystemEvent;
use super::rwlock::ReadWriteLock;
use super::threading::{join_logged, StopEvent};

/// Monotonic: INITIALIZED → STARTED → STOPPING → STOPPED, or straight from
/// INITIALIZED to STOPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObserverLifecycle {
    Initialized,
    Started,
    Stopping,
    Stopped,
}

impl ObserverLifecycle {
    fn next(&self) -> Option<ObserverLifecycle> {
        match self {
            ObserverLifecycle::Initialized => Some(ObserverLifecycle::Started),
            ObserverLifecycle::Started => Some(ObserverLifecycle::Stopping),
            ObserverLifecycle::Stopping => Some(ObserverLifecycle::Stopped),
            ObserverLifecycle::Stopped => None,
        }
    }

    pub fn can_transition_to(&self, desired: ObserverLifecycle) -> bool {
        self.next() == Some(desired)
            || (*self == ObserverLifecycle::Initialized && desired == ObserverLifecycle::Stopped)
    }

    pub fn is_stopped_or_stopping(&self) -> bool {
        matches!(self, ObserverLifecycle::Stopping | ObserverLifecycle::Stopped)
    }
}

impl std::fmt::Display for ObserverLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ObserverLifecycle::Initialized => "INITIALIZED",
            ObserverLifecycle::Started => "STARTED",
            ObserverLifecycle::Stopping => "STOPPING",
            ObserverLifecycle::Stopped => "STOPPED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct ObserverSnapshot {
    pub lifecycle: ObserverLifecycle,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

#[derive(Debug)]
struct ObserverState {
    lifecycle: ObserverLifecycle,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    failure: Option<String>,
}

impl ObserverState {
    fn transition(&mut self, name: &str, desired: ObserverLifecycle) -> bool {
        if !self.lifecycle.can_transition_to(desired) {
            if self.lifecycle == ObserverLifecycle::Stopping && desired == ObserverLifecycle::Stopping {
                warn!(observer = name, "Observer stopped twice, stop calls are racing");
            } else {
                debug!(
                    observer = name,
                    "Invalid lifecycle transition from {} to {}", self.lifecycle, desired
                );
            }
            return false;
        }
        self.lifecycle = desired;
        match desired {
            ObserverLifecycle::Started => self.start_time = Some(Utc::now()),
            ObserverLifecycle::Stopped => self.stop_time = Some(Utc::now()),
            _ => {}
        }
        true
    }
}

/// Shared between the observer handle and its forwarding thread
#[derive(Debug, Clone)]
struct Shared {
    name: String,
    state: Arc<ReadWriteLock<ObserverState>>,
    stop: StopEvent,
}

impl Shared {
    fn ensure_stopped(&self, source: &str) {
        {
            let mut state = self.state.write_lock();
            if state.lifecycle.is_stopped_or_stopping() {
                trace!(observer = %self.name, source, "Ignored repeat stop request ({})", state.lifecycle);
            } else if state.lifecycle == ObserverLifecycle::Started {
                trace!(observer = %self.name, source, "Stopping observer");
                state.transition(&self.name, ObserverLifecycle::Stopping);
            }
        }
        self.stop.set();
        let mut state = self.state.write_lock();
        if state.lifecycle != ObserverLifecycle::Stopped {
            state.transition(&self.name, ObserverLifecycle::Stopped);
        }
    }

    /// A dead watcher must never leave the session looking active
    fn fail(&self, reason: String) {
        error!(observer = %self.name, "Local watcher failed: {}", reason);
        {
            let mut state = self.state.write_lock();
            if state.failure.is_none() {
                state.failure = Some(reason);
            }
            if state.lifecycle == ObserverLifecycle::Started {
                state.transition(&self.name, ObserverLifecycle::Stopping);
            }
        }
        self.stop.set();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObserverTimings {
    pub poll_interval: Duration,
    pub root_health_check_interval: Duration,
}

impl Default for ObserverTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            root_health_check_interval: Duration::from_secs(2),
        }
    }
}

/// Watches local roots recursively and forwards converted events into the
/// session's event sink.
pub struct LocalObserver {
    shared: Shared,
    roots: Vec<PathBuf>,
    timings: ObserverTimings,
    watcher: Mutex<Option<RecommendedWatcher>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl LocalObserver {
    pub fn new(
        name: impl Into<String>,
        roots: Vec<PathBuf>,
        stop: StopEvent,
        timings: ObserverTimings,
    ) -> Self {
        Self {
            shared: Shared {
                name: name.into(),
                state: Arc::new(ReadWriteLock::new(ObserverState {
                    lifecycle: ObserverLifecycle::Initialized,
                    start_time: None,
                    stop_time: None,
                    failure: None,
                })),
                stop,
            },
            roots,
            timings,
            watcher: Mutex::new(None),
            forwarder: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn start(&self, sink: Sender<FileSystemEvent>) -> Result<()> {
        {
            let mut state = self.shared.state.write_lock();
            if !state.transition(&self.shared.name, ObserverLifecycle::Started) {
                return Err(SyncError::State {
                    message: format!("Cannot start observer {}", self.shared.name),
                    task_id: None,
                    current_state: Some(state.lifecycle.to_string()),
                    expected_state: Some(ObserverLifecycle::Initialized.to_string()),
                });
            }
        }

        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<notify::Event>>();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })
        .and_then(|mut watcher| {
            for root in &self.roots {
                watcher.watch(root, RecursiveMode::Recursive)?;
            }
            Ok(watcher)
        });
        let watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                self.shared.fail(format!("could not watch {:?}: {}", self.roots, e));
                self.shared.ensure_stopped("start");
                return Err(e.into());
            }
        };
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        debug!(observer = %self.shared.name, roots = ?self.roots, "Local watcher registered");

        let shared = self.shared.clone();
        let roots = self.roots.clone();
        let timings = self.timings;
        let handle = thread::Builder::new()
            .name(format!("{}-forwarder", self.shared.name))
            .spawn(move || {
                forward_events(&shared, &roots, timings, raw_rx, sink);
                shared.ensure_stopped("forwarder");
            })?;
        *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    pub fn lifecycle(&self) -> ObserverLifecycle {
        self.shared.state.read_lock().lifecycle
    }

    pub fn snapshot(&self) -> ObserverSnapshot {
        let state = self.shared.state.read_lock();
        ObserverSnapshot {
            lifecycle: state.lifecycle,
            start_time: state.start_time,
            stop_time: state.stop_time,
            failure: state.failure.clone(),
        }
    }

    pub fn stop(&self) {
        self.shared.ensure_stopped("stop");
        // Dropping the watcher releases the OS watches and its channel
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Join the forwarding thread. Returns false if it didn't exit in time.
    pub fn join(&self, timeout: Duration) -> bool {
        let handle = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => join_logged(&self.shared.name, handle, timeout),
            None => true,
        }
    }
}

impl std::fmt::Debug for LocalObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalObserver")
            .field("name", &self.shared.name)
            .field("roots", &self.roots)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

fn forward_events(
    shared: &Shared,
    roots: &[PathBuf],
    timings: ObserverTimings,
    raw_rx: mpsc::Receiver<notify::Result<notify::Event>>,
    sink: Sender<FileSystemEvent>,
) {
    let mut last_health_check = Instant::now();
    loop {
        if shared.stop.is_set() {
            return;
        }
        match raw_rx.recv_timeout(timings.poll_interval) {
            Ok(Ok(event)) => {
                if let Some(root) = removed_root(&event, roots) {
                    shared.fail(format!("watched root {} was removed", root.display()));
                    return;
                }
                for converted in FileSystemEvent::from_notify(event) {
                    if sink.send(converted).is_err() {
                        debug!(observer = %shared.name, "Event sink closed, stopping forwarder");
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                shared.fail(format!("watcher error: {}", e));
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if !shared.stop.is_set() {
                    shared.fail("watcher backend exited".to_string());
                }
                return;
            }
        }

        if last_health_check.elapsed() >= timings.root_health_check_interval {
            last_health_check = Instant::now();
            if let Some(root) = roots.iter().find(|root| !root.is_dir()) {
                shared.fail(format!("watched root {} is missing", root.display()));
                return;
            }
        }
    }
}

fn removed_root<'a>(event: &notify::Event, roots: &'a [PathBuf]) -> Option<&'a Path> {
    if !matches!(event.kind, notify::EventKind::Remove(_)) {
        return None;
    }
    roots
        .iter()
        .find(|root| event.paths.iter().any(|path| path == *root))
        .map(PathBuf::as_path)
}
