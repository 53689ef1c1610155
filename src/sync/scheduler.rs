//! Batches relevant path changes and hands them to sub-path reconcilers.
//!
//! One worker thread consumes the unified event stream. Touched paths are
//! filtered per reconciler, de-duplicated, and accumulated until the batch
//! timer fires (debounced, capped at a maximum delay) or the batch grows past
//! a threshold. Reconciler notices are checked before every batch; any pause
//! notice holds the batch and the timer keeps re-checking until they clear.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use super::debounce::DebounceCache;
use super::error::{Result, SyncError};
use super::events::{EventKind, FileSystemEvent};
use super::notice::{is_pause_necessary, separate_pause_notices, sort_by_priority, Notice};
use super::reconciler::{extract_touched_paths, simplify_root_watcher_paths, SubPathReconciler};
use super::rwlock::ReadWriteLock;
use super::threading::{join_with_timeout, StopEvent};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_DEBOUNCE: Duration = Duration::from_secs(2);

const MAX_FAILURE_REASON_CHARS: usize = 300;
const MAX_EVENTS_PER_DRAIN: usize = 1024;
/// Repeats of the same failure are logged at info inside this window
const FAILURE_LOG_WINDOW: Duration = Duration::from_secs(300);

pub type PathsByTag = BTreeMap<String, BTreeSet<PathBuf>>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    pub max_debounce: Duration,
    /// Flush immediately once this many unique paths are buffered
    pub batch_size_threshold: usize,
    pub duplicate_event_window: Duration,
    pub debounce_cache_max_items: usize,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            max_debounce: DEFAULT_MAX_DEBOUNCE,
            batch_size_threshold: 512,
            duplicate_event_window: Duration::from_secs(1),
            debounce_cache_max_items: 1024,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerStatus {
    Active,
    Paused,
    Stopping,
}

impl SchedulerStatus {
    pub fn is_active(&self) -> bool {
        *self == SchedulerStatus::Active
    }

    pub fn is_paused(&self) -> bool {
        *self == SchedulerStatus::Paused
    }
}

impl std::fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SchedulerStatus::Active => "ACTIVE",
            SchedulerStatus::Paused => "PAUSED",
            SchedulerStatus::Stopping => "STOPPING",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseCause {
    KnownNotice,
    UnexpectedError,
    User,
}

/// Outcomes of a batch, reported from the worker thread
pub trait BatchLifecycleCallbacks: Send + Sync {
    /// The first relevant change of a new batch arrived
    fn on_new_batch_pending(&self, triggering_paths_by_tag: &PathsByTag);

    /// Every reconciler handled its share without a pause
    fn on_batch_complete(
        &self,
        path_batch_by_tag: &PathsByTag,
        nonpause_notices: &[Notice],
        prior_pause: Option<PauseCause>,
    );

    fn on_handling_paused(
        &self,
        pending_reconciler_tags: &[String],
        nonpause_notices: &[Notice],
        pause_notices: &[Notice],
    );
}

/// Debounce timer shared by every reconciler
#[derive(Debug, Clone)]
struct BatchTimer {
    debounce: Duration,
    max_debounce: Duration,
    first: Option<Instant>,
    latest: Option<Instant>,
    deadline: Option<Instant>,
    bounces: u32,
}

impl BatchTimer {
    fn new(debounce: Duration, max_debounce: Duration) -> Self {
        Self {
            debounce,
            max_debounce,
            first: None,
            latest: None,
            deadline: None,
            bounces: 0,
        }
    }

    fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Push the deadline out, unless the batch has already waited `max_debounce`
    fn start_or_bounce(&mut self, now: Instant) {
        let Some(first) = self.first.filter(|_| self.is_pending()) else {
            self.restart(now);
            return;
        };
        if now.duration_since(first) > self.max_debounce {
            trace!(
                "Skipping debounce: max debounce of {:?} exceeded",
                self.max_debounce
            );
            return;
        }
        self.latest = Some(now);
        self.bounce(now);
    }

    fn restart(&mut self, now: Instant) {
        self.first = Some(now);
        self.latest = Some(now);
        self.bounce(now);
    }

    fn bounce(&mut self, now: Instant) {
        self.bounces += 1;
        self.deadline = Some(now + self.debounce);
    }

    fn fire_now(&mut self, now: Instant) {
        if self.first.is_none() {
            self.first = Some(now);
        }
        self.deadline = Some(now);
    }

    fn clear(&mut self) {
        self.first = None;
        self.latest = None;
        self.deadline = None;
        self.bounces = 0;
    }

    fn describe(&self, now: Instant) -> String {
        let elapsed = |since: Option<Instant>| {
            since
                .map(|t| now.duration_since(t).as_secs_f64())
                .unwrap_or(0.0)
        };
        format!(
            "BatchTimer(state={}, total_elapsed_seconds={:.4}s, elapsed_since_last_debounce_seconds={:.4}s, bounces={})",
            if self.is_pending() { "pending" } else { "clear" },
            elapsed(self.first),
            elapsed(self.latest),
            self.bounces
        )
    }
}

#[derive(Debug)]
struct SchedulerState {
    batches: PathsByTag,
    last_notices: Vec<Notice>,
    last_failure: Option<(String, &'static str)>,
    timer: BatchTimer,
    user_paused: bool,
    stopping: bool,
}

impl SchedulerState {
    fn pause_cause(&self) -> Option<PauseCause> {
        if self.user_paused {
            Some(PauseCause::User)
        } else if self.last_failure.is_some() {
            Some(PauseCause::UnexpectedError)
        } else if is_pause_necessary(&self.last_notices) {
            Some(PauseCause::KnownNotice)
        } else {
            None
        }
    }

    fn status(&self) -> SchedulerStatus {
        if self.stopping {
            SchedulerStatus::Stopping
        } else if self.pause_cause().is_some() {
            SchedulerStatus::Paused
        } else {
            SchedulerStatus::Active
        }
    }

    fn pending_tags(&self) -> Vec<String> {
        self.batches
            .iter()
            .filter(|(_, paths)| !paths.is_empty())
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    fn unique_path_count(&self) -> usize {
        self.batches
            .values()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len()
    }
}

pub struct PathBatchScheduler {
    state: Arc<ReadWriteLock<SchedulerState>>,
    stop: StopEvent,
    worker: Mutex<Option<JoinHandle<()>>>,
    local_dirs: Vec<PathBuf>,
    environment_dirs: Vec<PathBuf>,
    all_dirs: Vec<PathBuf>,
}

impl PathBatchScheduler {
    /// Spawn the worker. Reconciler tags must be unique.
    pub fn start(
        reconcilers: Vec<Box<dyn SubPathReconciler>>,
        callbacks: Arc<dyn BatchLifecycleCallbacks>,
        events: Receiver<FileSystemEvent>,
        config: SchedulerConfig,
        stop: StopEvent,
    ) -> Result<Self> {
        let tags: BTreeSet<&str> = reconcilers.iter().map(|r| r.tag()).collect();
        if tags.len() != reconcilers.len() {
            return Err(SyncError::Configuration(
                "sub-path reconciler tags must be unique".to_string(),
            ));
        }

        let local_dirs: Vec<PathBuf> = reconcilers
            .iter()
            .flat_map(|r| r.local_dirs_to_watch())
            .collect();
        let environment_dirs: Vec<PathBuf> = reconcilers
            .iter()
            .flat_map(|r| r.environment_dirs_to_watch())
            .collect();
        let all_dirs: Vec<PathBuf> = reconcilers.iter().flat_map(|r| r.dirs_to_watch()).collect();

        let state = Arc::new(ReadWriteLock::new(SchedulerState {
            batches: empty_batches(&reconcilers),
            last_notices: Vec::new(),
            last_failure: None,
            timer: BatchTimer::new(config.debounce, config.max_debounce),
            user_paused: false,
            stopping: false,
        }));

        let worker = Worker {
            duplicates: DebounceCache::new(
                config.duplicate_event_window,
                config.debounce_cache_max_items,
            ),
            failure_log: DebounceCache::new(FAILURE_LOG_WINDOW, 64),
            reconcilers,
            callbacks,
            events: Some(events),
            state: Arc::clone(&state),
            stop: stop.clone(),
            config,
        };
        let handle = thread::Builder::new()
            .name("aoe-sync-scheduler".to_string())
            .spawn(move || worker.run())?;

        debug!(
            local_dirs = ?local_dirs,
            environment_dirs = ?environment_dirs,
            "Path batch scheduler started"
        );
        Ok(Self {
            state,
            stop,
            worker: Mutex::new(Some(handle)),
            local_dirs,
            environment_dirs,
            all_dirs,
        })
    }

    pub fn status(&self) -> SchedulerStatus {
        self.state.read_lock().status()
    }

    pub fn pause_cause(&self) -> Option<PauseCause> {
        self.state.read_lock().pause_cause()
    }

    /// Notices from the most recent batch attempt
    pub fn notices(&self) -> Vec<Notice> {
        self.state.read_lock().last_notices.clone()
    }

    pub fn pending_path_count(&self) -> usize {
        self.state.read_lock().unique_path_count()
    }

    /// Hold batches without tearing anything down. Changes keep buffering.
    pub fn pause(&self) {
        let mut state = self.state.write_lock();
        if state.stopping {
            return;
        }
        info!("Local sync paused by user");
        state.user_paused = true;
    }

    pub fn resume(&self) {
        let mut state = self.state.write_lock();
        if !state.user_paused {
            return;
        }
        info!("Local sync resumed by user");
        state.user_paused = false;
        if state.unique_path_count() > 0 {
            state.timer.restart(Instant::now());
        }
    }

    /// Terminal: buffered changes that haven't started handling are dropped
    pub fn stop(&self) {
        self.state.write_lock().stopping = true;
        self.stop.set();
    }

    /// Wait for an in-flight batch to finish after stop. Returns false on timeout.
    pub fn wait_for_final_batch(&self, timeout: Duration) -> bool {
        if !self.stop.is_set() {
            warn!("wait_for_final_batch called before the stop event was set");
            return false;
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return true;
        };
        match join_with_timeout(handle, timeout) {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                error!("Scheduler worker panicked");
                true
            }
            Err(handle) => {
                let timer = self.state.read_lock().timer.describe(Instant::now());
                error!(?timeout, timer, "Timed out waiting for the final batch");
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                false
            }
        }
    }

    pub fn top_level_local_dirs_to_register(&self) -> Vec<PathBuf> {
        simplify_root_watcher_paths(&self.local_dirs)
    }

    pub fn all_required_paths(&self) -> &[PathBuf] {
        &self.all_dirs
    }

    pub fn all_required_local_paths(&self) -> &[PathBuf] {
        &self.local_dirs
    }

    pub fn all_required_environment_paths(&self) -> &[PathBuf] {
        &self.environment_dirs
    }

    pub fn describe_current_state(&self) -> String {
        let state = self.state.read_lock();
        let buffer: BTreeMap<&String, Vec<String>> = state
            .batches
            .iter()
            .map(|(tag, paths)| (tag, paths.iter().map(|p| p.display().to_string()).collect()))
            .collect();
        let buffer_json =
            serde_json::to_string_pretty(&buffer).unwrap_or_else(|_| format!("{:?}", buffer));

        let mut notices: Vec<String> = state.last_notices.iter().map(Notice::describe).collect();
        notices.sort();
        let mut notice_line = if notices.is_empty() {
            "notices: none".to_string()
        } else {
            format!("notices: {}", notices.join("; "))
        };
        if let Some((tag, kind)) = &state.last_failure {
            notice_line.push_str(&format!(", last failure: ({}, {})", tag, kind));
        }

        [
            format!("PathBatchScheduler (status={}):", state.status()),
            format!("buffered unique paths: {}", state.unique_path_count()),
            format!("buffer state: {}", buffer_json),
            notice_line,
            state.timer.describe(Instant::now()),
        ]
        .join("\n")
    }
}

impl std::fmt::Debug for PathBatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathBatchScheduler")
            .field("status", &self.status())
            .field("local_dirs", &self.local_dirs)
            .field("environment_dirs", &self.environment_dirs)
            .finish()
    }
}

fn empty_batches(reconcilers: &[Box<dyn SubPathReconciler>]) -> PathsByTag {
    reconcilers
        .iter()
        .map(|r| (r.tag().to_string(), BTreeSet::new()))
        .collect()
}

fn truncate_reason(reason: String) -> String {
    if reason.chars().count() <= MAX_FAILURE_REASON_CHARS {
        return reason;
    }
    let mut truncated: String = reason.chars().take(MAX_FAILURE_REASON_CHARS - 3).collect();
    truncated.push_str("...");
    truncated
}

struct Worker {
    reconcilers: Vec<Box<dyn SubPathReconciler>>,
    callbacks: Arc<dyn BatchLifecycleCallbacks>,
    events: Option<Receiver<FileSystemEvent>>,
    state: Arc<ReadWriteLock<SchedulerState>>,
    stop: StopEvent,
    config: SchedulerConfig,
    duplicates: DebounceCache<(PathBuf, EventKind)>,
    failure_log: DebounceCache<(String, &'static str)>,
}

impl Worker {
    fn run(mut self) {
        while !self.stop.is_set() {
            let wait = self.next_wait(Instant::now());
            match &self.events {
                Some(events) => match events.recv_timeout(wait) {
                    Ok(event) => {
                        self.buffer_relevant_paths(&event);
                        self.drain_ready_events();
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        debug!("Event sources closed");
                        self.events = None;
                    }
                },
                None => {
                    self.stop.wait_timeout(wait);
                }
            }

            if self.stop.is_set() {
                break;
            }
            if self.is_due(Instant::now()) {
                self.fire_callbacks();
            }
        }
        trace!("Scheduler worker exiting");
    }

    fn drain_ready_events(&mut self) {
        for _ in 0..MAX_EVENTS_PER_DRAIN {
            let Some(event) = self.events.as_ref().and_then(|events| events.try_recv().ok()) else {
                return;
            };
            self.buffer_relevant_paths(&event);
        }
    }

    fn next_wait(&self, now: Instant) -> Duration {
        let state = self.state.read_lock();
        if state.user_paused {
            return self.config.poll_interval;
        }
        match state.timer.deadline {
            Some(deadline) => deadline
                .saturating_duration_since(now)
                .min(self.config.poll_interval),
            None => self.config.poll_interval,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        let state = self.state.read_lock();
        !state.user_paused && state.timer.is_due(now)
    }

    fn buffer_relevant_paths(&mut self, event: &FileSystemEvent) {
        let touched = extract_touched_paths(event);
        let mut updates: PathsByTag = BTreeMap::new();
        for reconciler in self.reconcilers.iter_mut() {
            let relevant: BTreeSet<PathBuf> = touched
                .iter()
                .filter(|path| reconciler.is_relevant_subpath(path))
                .cloned()
                .collect();
            updates.insert(reconciler.tag().to_string(), relevant);
        }

        // Same path and kind inside the window is already in this batch
        let now = Instant::now();
        let fresh: BTreeSet<PathBuf> = updates
            .values()
            .flatten()
            .filter(|path| self.duplicates.debounce_at(((*path).clone(), event.kind), now))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return;
        }
        for paths in updates.values_mut() {
            paths.retain(|path| fresh.contains(path));
        }

        let is_new_batch = {
            let mut state = self.state.write_lock();
            for (tag, paths) in &updates {
                if let Some(batch) = state.batches.get_mut(tag) {
                    batch.extend(paths.iter().cloned());
                }
            }
            let is_new_batch = !state.timer.is_pending();
            state.timer.start_or_bounce(now);
            if state.unique_path_count() >= self.config.batch_size_threshold {
                trace!("Batch size threshold reached, flushing now");
                state.timer.fire_now(now);
            }
            is_new_batch
        };

        if is_new_batch {
            self.callbacks.on_new_batch_pending(&updates);
        }
    }

    fn collect_notices(&mut self) -> Vec<Notice> {
        let mut notices: Vec<Notice> = self
            .reconcilers
            .iter_mut()
            .flat_map(|reconciler| reconciler.notices())
            .collect();
        sort_by_priority(&mut notices);
        notices
    }

    fn fire_callbacks(&mut self) {
        let prior_pause = self.state.read_lock().pause_cause();
        let notices = self.collect_notices();
        self.state.write_lock().last_notices = notices.clone();
        if is_pause_necessary(&notices) {
            self.handle_pausing();
            return;
        }
        if self.stop.is_set() {
            return;
        }

        // Past this point the batch runs to completion even if stop is set,
        // so file and branch syncs land together
        let batches = self.state.read_lock().batches.clone();
        let mut phase = "known_notice_check".to_string();
        let mut outcome = Ok(());
        for reconciler in self.reconcilers.iter_mut() {
            let Some(paths) = batches.get(reconciler.tag()).filter(|p| !p.is_empty()) else {
                continue;
            };
            phase = reconciler.tag().to_string();
            let paths: Vec<PathBuf> = paths.iter().cloned().collect();
            trace!(tag = %phase, count = paths.len(), "Handling path changes");
            let started = Instant::now();
            outcome = reconciler.handle_path_changes(&paths);
            debug!(tag = %phase, elapsed = ?started.elapsed(), "handle_path_changes finished");
            if outcome.is_err() {
                break;
            }
        }

        match outcome {
            Ok(()) => {
                self.callbacks
                    .on_batch_complete(&batches, &notices, prior_pause);
                self.reset_batch_state();
            }
            Err(SyncError::NewNotices(new_notices)) => {
                {
                    let mut state = self.state.write_lock();
                    state.last_notices.extend(new_notices);
                    sort_by_priority(&mut state.last_notices);
                }
                self.handle_pausing();
            }
            Err(e) => self.handle_failure_by_pausing(&phase, e),
        }
    }

    fn reset_batch_state(&mut self) {
        let mut state = self.state.write_lock();
        state.timer.clear();
        state.last_failure = None;
        state.batches = empty_batches(&self.reconcilers);
        self.duplicates.clear();
    }

    fn handle_pausing(&mut self) {
        let (pauses, nonpauses, pending_tags) = {
            let state = self.state.read_lock();
            let (pauses, nonpauses) = separate_pause_notices(&state.last_notices);
            (pauses, nonpauses, state.pending_tags())
        };

        let mut described: Vec<String> = pauses
            .iter()
            .chain(nonpauses.iter())
            .map(Notice::describe)
            .collect();
        described.sort();
        if described.len() == 1 {
            info!("Local sync paused due to notice: {}", described[0]);
        } else {
            info!(
                "Local sync paused due to notices:\n * {}",
                described.join("\n * ")
            );
        }

        self.callbacks
            .on_handling_paused(&pending_tags, &nonpauses, &pauses);
        // Re-check notices on the next tick
        self.state.write_lock().timer.restart(Instant::now());
    }

    /// Unknown failures still pause rather than retrying blindly
    fn handle_failure_by_pausing(&mut self, source_tag: &str, failure: SyncError) {
        let reason = truncate_reason(format!("{} processing failure: {}", source_tag, failure));
        let key = (source_tag.to_string(), failure.kind());
        let is_new_failure = {
            let mut state = self.state.write_lock();
            state.last_notices.push(Notice::pause(source_tag, reason.clone()));
            let is_new = state.last_failure.as_ref() != Some(&key);
            state.last_failure = Some(key.clone());
            is_new
        };
        self.handle_pausing();

        let window_passed = self.failure_log.debounce(key);
        if is_new_failure || window_passed {
            error!("Local sync paused due to unexpected failure: {}", reason);
        } else {
            info!("Local sync paused, unexpected failure continues: {}", reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::reconciler::MultiRootReconciler;
    use std::path::Path;
    use std::sync::mpsc::{self, Sender};

    #[derive(Clone, Default)]
    struct Probe {
        handled: Arc<Mutex<Vec<Vec<PathBuf>>>>,
        notices: Arc<Mutex<Vec<Notice>>>,
        failure: Arc<Mutex<Option<fn() -> SyncError>>>,
    }

    impl Probe {
        fn handled(&self) -> Vec<Vec<PathBuf>> {
            self.handled.lock().unwrap().clone()
        }

        fn set_notices(&self, notices: Vec<Notice>) {
            *self.notices.lock().unwrap() = notices;
        }

        fn set_failure(&self, failure: Option<fn() -> SyncError>) {
            *self.failure.lock().unwrap() = failure;
        }
    }

    struct RecordingReconciler {
        tag: String,
        filter: MultiRootReconciler,
        probe: Probe,
    }

    impl RecordingReconciler {
        fn boxed(tag: &str, root: &str, probe: &Probe) -> Box<dyn SubPathReconciler> {
            Box::new(Self {
                tag: tag.to_string(),
                filter: MultiRootReconciler::with_default_exclusions(vec![PathBuf::from(root)])
                    .unwrap(),
                probe: probe.clone(),
            })
        }
    }

    impl SubPathReconciler for RecordingReconciler {
        fn tag(&self) -> &str {
            &self.tag
        }

        fn is_relevant_subpath(&mut self, path: &Path) -> bool {
            self.filter.is_relevant_subpath(path)
        }

        fn local_dirs_to_watch(&self) -> Vec<PathBuf> {
            self.filter.dirs_to_watch()
        }

        fn environment_dirs_to_watch(&self) -> Vec<PathBuf> {
            Vec::new()
        }

        fn notices(&mut self) -> Vec<Notice> {
            self.probe.notices.lock().unwrap().clone()
        }

        fn handle_path_changes(&mut self, paths: &[PathBuf]) -> Result<()> {
            if let Some(make_failure) = *self.probe.failure.lock().unwrap() {
                return Err(make_failure());
            }
            self.probe.handled.lock().unwrap().push(paths.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        pending: Mutex<Vec<PathsByTag>>,
        completed: Mutex<Vec<(PathsByTag, Option<PauseCause>)>>,
        paused: Mutex<Vec<(Vec<String>, Vec<Notice>)>>,
    }

    impl BatchLifecycleCallbacks for RecordingCallbacks {
        fn on_new_batch_pending(&self, paths: &PathsByTag) {
            self.pending.lock().unwrap().push(paths.clone());
        }

        fn on_batch_complete(
            &self,
            paths: &PathsByTag,
            _nonpause_notices: &[Notice],
            prior_pause: Option<PauseCause>,
        ) {
            self.completed
                .lock()
                .unwrap()
                .push((paths.clone(), prior_pause));
        }

        fn on_handling_paused(
            &self,
            pending_tags: &[String],
            _nonpause_notices: &[Notice],
            pause_notices: &[Notice],
        ) {
            self.paused
                .lock()
                .unwrap()
                .push((pending_tags.to_vec(), pause_notices.to_vec()));
        }
    }

    struct Harness {
        scheduler: PathBatchScheduler,
        events: Sender<FileSystemEvent>,
        callbacks: Arc<RecordingCallbacks>,
        probe: Probe,
        stop: StopEvent,
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_millis(50),
            max_debounce: Duration::from_millis(400),
            poll_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        }
    }

    fn harness(config: SchedulerConfig) -> Harness {
        let probe = Probe::default();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let (tx, rx) = mpsc::channel();
        let stop = StopEvent::new();
        let scheduler = PathBatchScheduler::start(
            vec![RecordingReconciler::boxed("recording", "/repo", &probe)],
            callbacks.clone(),
            rx,
            config,
            stop.clone(),
        )
        .unwrap();
        Harness {
            scheduler,
            events: tx,
            callbacks,
            probe,
            stop,
        }
    }

    fn modified(path: &str) -> FileSystemEvent {
        FileSystemEvent::new(EventKind::Modified, path)
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_burst_of_changes_is_one_batch() {
        let h = harness(fast_config());
        h.events.send(modified("/repo/a.txt")).unwrap();
        h.events.send(modified("/repo/b.txt")).unwrap();
        h.events.send(modified("/repo/a.txt")).unwrap();
        h.events.send(FileSystemEvent::moved("/repo/c.txt", "/repo/d.txt")).unwrap();

        assert!(wait_for(|| h.probe.handled().len() == 1));
        thread::sleep(Duration::from_millis(200));

        let handled = h.probe.handled();
        assert_eq!(handled.len(), 1);
        assert_eq!(
            handled[0],
            vec![
                PathBuf::from("/repo/a.txt"),
                PathBuf::from("/repo/b.txt"),
                PathBuf::from("/repo/c.txt"),
                PathBuf::from("/repo/d.txt"),
            ]
        );
        assert_eq!(h.callbacks.pending.lock().unwrap().len(), 1);
        let completed = h.callbacks.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1, None);
        assert_eq!(h.scheduler.status(), SchedulerStatus::Active);
        assert_eq!(h.scheduler.pending_path_count(), 0);
    }

    #[test]
    fn test_irrelevant_and_excluded_paths_never_flush() {
        let h = harness(fast_config());
        h.events.send(modified("/repo")).unwrap();
        h.events.send(modified("/repo/.git/index")).unwrap();
        h.events.send(modified("/elsewhere/file.txt")).unwrap();
        thread::sleep(Duration::from_millis(250));

        assert!(h.probe.handled().is_empty());
        assert!(h.callbacks.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pause_notice_holds_batch_until_cleared() {
        let h = harness(fast_config());
        h.probe
            .set_notices(vec![Notice::pause("recording", "rebase is in progress")]);
        h.events.send(modified("/repo/a.txt")).unwrap();

        assert!(wait_for(|| !h.callbacks.paused.lock().unwrap().is_empty()));
        assert_eq!(h.scheduler.status(), SchedulerStatus::Paused);
        assert_eq!(h.scheduler.pause_cause(), Some(PauseCause::KnownNotice));
        assert!(h.probe.handled().is_empty());
        {
            let paused = h.callbacks.paused.lock().unwrap();
            assert_eq!(paused[0].0, vec!["recording".to_string()]);
            assert_eq!(paused[0].1[0].reason(), "rebase is in progress");
        }

        h.probe.set_notices(Vec::new());
        assert!(wait_for(|| h.probe.handled().len() == 1));
        assert!(wait_for(|| !h.callbacks.completed.lock().unwrap().is_empty()));
        assert_eq!(
            h.callbacks.completed.lock().unwrap()[0].1,
            Some(PauseCause::KnownNotice)
        );
        assert_eq!(h.scheduler.status(), SchedulerStatus::Active);
    }

    #[test]
    fn test_unexpected_failure_pauses_then_recovers() {
        let h = harness(fast_config());
        h.probe
            .set_failure(Some(|| SyncError::Configuration("disk on fire".to_string())));
        h.events.send(modified("/repo/a.txt")).unwrap();

        assert!(wait_for(|| h.scheduler.pause_cause() == Some(PauseCause::UnexpectedError)));
        let notices = h.scheduler.notices();
        assert!(notices
            .iter()
            .any(|n| n.is_pause() && n.reason().starts_with("recording processing failure: ")));
        assert!(h.scheduler.describe_current_state().contains("last failure: (recording, configuration)"));

        h.probe.set_failure(None);
        assert!(wait_for(|| h.probe.handled().len() == 1));
        assert!(wait_for(|| h.scheduler.status() == SchedulerStatus::Active));
    }

    #[test]
    fn test_new_notices_from_handler_pause() {
        let h = harness(fast_config());
        h.probe.set_failure(Some(|| {
            SyncError::NewNotices(vec![Notice::pause("recording", "histories diverged")])
        }));
        h.events.send(modified("/repo/a.txt")).unwrap();

        assert!(wait_for(|| h.scheduler.pause_cause() == Some(PauseCause::KnownNotice)));
        assert!(h
            .scheduler
            .notices()
            .iter()
            .any(|n| n.reason() == "histories diverged"));
        h.scheduler.stop();
        assert!(h.scheduler.wait_for_final_batch(Duration::from_secs(5)));
    }

    #[test]
    fn test_user_pause_and_resume() {
        let h = harness(fast_config());
        h.scheduler.pause();
        assert_eq!(h.scheduler.status(), SchedulerStatus::Paused);
        assert_eq!(h.scheduler.pause_cause(), Some(PauseCause::User));

        h.events.send(modified("/repo/a.txt")).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(h.probe.handled().is_empty());
        assert_eq!(h.scheduler.pending_path_count(), 1);

        h.scheduler.resume();
        assert!(wait_for(|| h.probe.handled().len() == 1));
        assert_eq!(h.scheduler.status(), SchedulerStatus::Active);
    }

    #[test]
    fn test_stop_is_terminal() {
        let h = harness(fast_config());
        assert!(!h.scheduler.wait_for_final_batch(Duration::from_millis(10)));

        h.scheduler.stop();
        assert!(h.stop.is_set());
        assert_eq!(h.scheduler.status(), SchedulerStatus::Stopping);
        assert!(h.scheduler.wait_for_final_batch(Duration::from_secs(5)));

        h.scheduler.pause();
        h.scheduler.resume();
        assert_eq!(h.scheduler.status(), SchedulerStatus::Stopping);
        let _ = h.events.send(modified("/repo/a.txt"));
        thread::sleep(Duration::from_millis(100));
        assert!(h.probe.handled().is_empty());
    }

    #[test]
    fn test_batch_threshold_flushes_early() {
        let h = harness(SchedulerConfig {
            debounce: Duration::from_secs(30),
            max_debounce: Duration::from_secs(60),
            batch_size_threshold: 2,
            poll_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        });
        h.events.send(modified("/repo/a.txt")).unwrap();
        h.events.send(modified("/repo/b.txt")).unwrap();
        assert!(wait_for(|| h.probe.handled().len() == 1));
    }

    #[test]
    fn test_duplicate_tags_are_rejected() {
        let probe = Probe::default();
        let (_tx, rx) = mpsc::channel();
        let result = PathBatchScheduler::start(
            vec![
                RecordingReconciler::boxed("same", "/a", &probe),
                RecordingReconciler::boxed("same", "/b", &probe),
            ],
            Arc::new(RecordingCallbacks::default()),
            rx,
            fast_config(),
            StopEvent::new(),
        );
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[test]
    fn test_watch_dirs() {
        let h = harness(fast_config());
        assert_eq!(h.scheduler.all_required_local_paths(), &[PathBuf::from("/repo")]);
        assert!(h.scheduler.all_required_environment_paths().is_empty());
        assert_eq!(
            h.scheduler.top_level_local_dirs_to_register(),
            vec![PathBuf::from("/repo")]
        );
    }

    #[test]
    fn test_batch_timer_bounces_until_max() {
        let start = Instant::now();
        let mut timer = BatchTimer::new(Duration::from_millis(100), Duration::from_millis(300));
        assert!(!timer.is_pending());

        timer.start_or_bounce(start);
        assert_eq!(timer.deadline, Some(start + Duration::from_millis(100)));

        let later = start + Duration::from_millis(80);
        timer.start_or_bounce(later);
        assert_eq!(timer.deadline, Some(later + Duration::from_millis(100)));

        // Past the max, the deadline stops moving
        let too_late = start + Duration::from_millis(350);
        timer.start_or_bounce(too_late);
        assert_eq!(timer.deadline, Some(later + Duration::from_millis(100)));
        assert!(timer.is_due(too_late));

        timer.clear();
        assert!(!timer.is_pending());
        assert!(timer.describe(too_late).contains("state=clear"));
    }

    #[test]
    fn test_truncate_reason() {
        let long = "x".repeat(400);
        let truncated = truncate_reason(long);
        assert_eq!(truncated.chars().count(), MAX_FAILURE_REASON_CHARS);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_reason("short".to_string()), "short");
    }
}
