//! Cancellation and bounded joins for the session's worker threads

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::warn;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A one-way shutdown signal shared by every loop in a session. Cloning
/// shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopEvent {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (flag, changed) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        changed.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep until set or `timeout` passes. Returns whether it is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, changed) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = changed
            .wait_timeout_while(guard, timeout, |is_set| !*is_set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Join `handle` if it finishes within `timeout`. On timeout the handle is
/// handed back so the caller can decide what to do with the straggler.
pub fn join_with_timeout<T>(
    handle: JoinHandle<T>,
    timeout: Duration,
) -> Result<std::thread::Result<T>, JoinHandle<T>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(handle);
        }
        std::thread::sleep(JOIN_POLL_INTERVAL);
    }
    Ok(handle.join())
}

/// Join a named worker, logging instead of failing. Returns whether it exited.
pub fn join_logged(name: &str, handle: JoinHandle<()>, timeout: Duration) -> bool {
    match join_with_timeout(handle, timeout) {
        Ok(Ok(())) => true,
        Ok(Err(_)) => {
            warn!(thread = name, "Worker thread panicked");
            true
        }
        Err(_) => {
            warn!(thread = name, ?timeout, "Worker thread did not exit in time");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_event_is_shared_between_clones() {
        let stop = StopEvent::new();
        let clone = stop.clone();
        assert!(!clone.is_set());
        stop.set();
        assert!(clone.is_set());
    }

    #[test]
    fn test_wait_timeout_wakes_on_set() {
        let stop = StopEvent::new();
        let setter = stop.clone();
        let started = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            setter.set();
        });
        assert!(stop.wait_timeout(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let stop = StopEvent::new();
        assert!(!stop.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_join_with_timeout() {
        let quick = std::thread::spawn(|| 7);
        assert_eq!(join_with_timeout(quick, Duration::from_secs(5)).unwrap().unwrap(), 7);

        let stop = StopEvent::new();
        let waiter = stop.clone();
        let slow = std::thread::spawn(move || {
            waiter.wait_timeout(Duration::from_secs(30));
        });
        let slow = join_with_timeout(slow, Duration::from_millis(30)).unwrap_err();
        stop.set();
        assert!(join_logged("slow", slow, Duration::from_secs(5)));
    }
}
