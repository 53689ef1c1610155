//! Writer-preferring reader/writer lock
//!
//! Readers share the lock unless a writer is active or waiting. A waiting
//! writer blocks *new* readers from entering, so continuous read traffic can't
//! starve a pending state transition. Writers are mutually exclusive.
//!
//! Both acquisitions are scoped: the returned guard releases on drop, which
//! covers early returns and panics alike.

use std::ops::{Deref, DerefMut};
use std::sync::{
    Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

#[derive(Debug, Default)]
struct Admission {
    active_readers: usize,
    active_writer: bool,
    waiting_writers: usize,
}

pub struct ReadWriteLock<T = ()> {
    admission: Mutex<Admission>,
    changed: Condvar,
    // Entry is decided by `admission`; this only hands out references and is
    // uncontended apart from the instant between a guard's release and drop.
    value: RwLock<T>,
}

impl<T> ReadWriteLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            admission: Mutex::new(Admission::default()),
            changed: Condvar::new(),
            value: RwLock::new(value),
        }
    }

    fn admission(&self) -> MutexGuard<'_, Admission> {
        self.admission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Admission>) -> MutexGuard<'a, Admission> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire shared access. Blocks while a writer is active or waiting.
    pub fn read_lock(&self) -> ReadGuard<'_, T> {
        let mut admission = self.admission();
        while admission.waiting_writers > 0 || admission.active_writer {
            admission = self.wait(admission);
        }
        admission.active_readers += 1;
        drop(admission);

        ReadGuard {
            lock: self,
            inner: self.value.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Acquire exclusive access. Blocks until all current readers and any
    /// active writer have left; new readers queue behind this call.
    pub fn write_lock(&self) -> WriteGuard<'_, T> {
        let mut admission = self.admission();
        admission.waiting_writers += 1;
        while admission.active_writer || admission.active_readers > 0 {
            admission = self.wait(admission);
        }
        admission.active_writer = true;
        admission.waiting_writers -= 1;
        drop(admission);

        WriteGuard {
            lock: self,
            inner: self.value.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn release_reader(&self) {
        let mut admission = self.admission();
        admission.active_readers -= 1;
        if admission.active_readers == 0 {
            self.changed.notify_all();
        }
    }

    fn release_writer(&self) {
        let mut admission = self.admission();
        admission.active_writer = false;
        self.changed.notify_all();
    }

    #[cfg(test)]
    fn waiting_writers(&self) -> usize {
        self.admission().waiting_writers
    }
}

impl<T: Default> Default for ReadWriteLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for ReadWriteLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let admission = self.admission();
        f.debug_struct("ReadWriteLock")
            .field("active_readers", &admission.active_readers)
            .field("active_writer", &admission.active_writer)
            .field("waiting_writers", &admission.waiting_writers)
            .finish()
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a ReadWriteLock<T>,
    inner: RwLockReadGuard<'a, T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_reader();
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a ReadWriteLock<T>,
    inner: RwLockWriteGuard<'a, T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_writer();
    }
}
