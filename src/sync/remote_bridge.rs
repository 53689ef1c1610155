//! Streams change notifications from inside the sandbox into the local
//! event sink.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::error::Result;
use super::events::FileSystemEvent;
use super::threading::{join_logged, StopEvent};
use crate::environment::{BackgroundProcess, Environment};

/// Recursive inotify watch printing one path per line. Only content-changing
/// events are subscribed, so close notifications never show up.
pub fn default_remote_watch_command(workspace_dir: &std::path::Path) -> Vec<String> {
    [
        "inotifywait",
        "-m",
        "-r",
        "-q",
        "-e",
        "modify,create,delete,move,attrib",
        "--format",
        "%w%f",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain(std::iter::once(workspace_dir.to_string_lossy().into_owned()))
    .collect()
}

pub struct RemoteBridge {
    process: Arc<Mutex<Option<BackgroundProcess>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stop: StopEvent,
}

impl RemoteBridge {
    /// Launch `command` in the environment and pipe each non-empty output
    /// line into `sink` as a synthetic event.
    pub fn start(
        environment: &dyn Environment,
        command: &[String],
        run_as_root: bool,
        sink: Sender<FileSystemEvent>,
        stop: StopEvent,
    ) -> Result<Self> {
        let mut process =
            environment.run_process_in_background(command, &HashMap::new(), run_as_root)?;
        let stdout = process.take_stdout();
        debug!(pid = process.pid(), command = %process.description(), "Remote watcher started");

        let reader_stop = stop.clone();
        let reader = match stdout {
            Some(stdout) => Some(
                thread::Builder::new()
                    .name("aoe-sync-remote-bridge".to_string())
                    .spawn(move || pipe_lines_into_sink(stdout, &sink, &reader_stop))?,
            ),
            None => None,
        };

        Ok(Self {
            process: Arc::new(Mutex::new(Some(process))),
            reader: Mutex::new(reader),
            stop,
        })
    }

    pub fn is_running(&self) -> bool {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .is_some_and(BackgroundProcess::is_running)
    }

    /// Kill the remote command; the reader then sees EOF and exits
    pub fn stop(&self) {
        self.stop.set();
        let process = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut process) = process {
            if let Err(e) = process.terminate() {
                warn!("Failed to terminate remote watcher: {}", e);
            }
        }
    }

    pub fn join(&self, timeout: Duration) -> bool {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => join_logged("remote-bridge", handle, timeout),
            None => true,
        }
    }
}

impl std::fmt::Debug for RemoteBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBridge")
            .field("stopped", &self.stop.is_set())
            .finish()
    }
}

/// Returns once the stream closes or the sink is gone
pub fn pipe_lines_into_sink(output: impl Read, sink: &Sender<FileSystemEvent>, stop: &StopEvent) {
    for line in BufReader::new(output).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read remote watcher output: {}", e);
                break;
            }
        };
        let path = line.trim();
        if path.is_empty() {
            continue;
        }
        trace!(path, "Remote change");
        if sink.send(FileSystemEvent::synthetic(path)).is_err() {
            debug!("Event sink closed, stopping remote bridge");
            return;
        }
    }
    if stop.is_set() {
        trace!("Remote watcher exited");
    } else {
        info!("Remote watcher exited while the session is still running");
    }
}
