//! Sleeping locks and wait channels.
//!
//! A sleep lock is held across disk I/O and other long operations, so
//! contenders block instead of spinning. The raw lock tracks its owner
//! thread, which gives `holding()` for the re-entrancy assertions the
//! inode layer relies on.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// Owner-tracked sleeping lock without data. Building block for
/// `SleepLock<T>` and for callers that guard data living elsewhere.
pub struct RawSleepLock {
    owner: Mutex<Option<ThreadId>>,
    wait: Condvar,

    /// Name of lock for debugging.
    name: &'static str,
}

impl RawSleepLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            owner: Mutex::new(None),
            wait: Condvar::new(),
            name,
        }
    }

    pub fn acquire(&self) {
        let mut owner = self.owner.lock().unwrap();
        while owner.is_some() {
            owner = self.wait.wait(owner).unwrap();
        }
        *owner = Some(thread::current().id());
    }

    pub fn release(&self) {
        let mut owner = self.owner.lock().unwrap();
        assert_eq!(
            owner.take(),
            Some(thread::current().id()),
            "release of {} by non-holder",
            self.name
        );
        drop(owner);
        self.wait.notify_all();
    }

    /// Whether the current thread holds the lock.
    pub fn holding(&self) -> bool {
        *self.owner.lock().unwrap() == Some(thread::current().id())
    }
}

/// Sleeping lock that owns its data.
pub struct SleepLock<T> {
    raw: RawSleepLock,
    data: UnsafeCell<T>,
}

// The guard hands out &T/&mut T only while the raw lock is held.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub fn new(name: &'static str, data: T) -> Self {
        Self {
            raw: RawSleepLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.raw.acquire();
        SleepLockGuard { lock: self }
    }

    pub fn holding(&self) -> bool {
        self.raw.holding()
    }
}

pub struct SleepLockGuard<'s, T> {
    lock: &'s SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the raw lock is held for the guard's lifetime.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the raw lock is held for the guard's lifetime.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

/// Wait channel: sleepers atomically release the protecting mutex and
/// block; `wakeup` unblocks every sleeper, which must re-check its
/// predicate.
pub struct WaitChannel {
    wait: Condvar,
}

impl WaitChannel {
    pub fn new() -> Self {
        Self {
            wait: Condvar::new(),
        }
    }

    pub fn sleep<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait.wait(guard).unwrap()
    }

    pub fn wakeup(&self) {
        self.wait.notify_all();
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn guard_gives_exclusive_access() {
        let lock = Arc::new(SleepLock::new("test", 0u32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let mut guard = lock.lock();
                    *guard += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 800);
    }

    #[test]
    fn holding_tracks_owner() {
        let lock = SleepLock::new("test", ());
        assert!(!lock.holding());
        let guard = lock.lock();
        assert!(lock.holding());
        drop(guard);
        assert!(!lock.holding());
    }

    #[test]
    #[should_panic(expected = "non-holder")]
    fn release_by_non_holder_panics() {
        let raw = Arc::new(RawSleepLock::new("test"));
        let other = Arc::clone(&raw);
        thread::spawn(move || other.acquire()).join().unwrap();
        raw.release();
    }
}
