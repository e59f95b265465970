//! Interchangeable mutual-exclusion primitives behind one trait, chosen once
//! at construction by a [`LockPolicy`] value.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::lock_api::{GetThreadId, RawMutex as _, RawMutexTimed as _, RawReentrantMutex};
use parking_lot::{Condvar, Mutex, RawMutex, RawThreadId};
use serde::Deserialize;

/// Manual acquire/release surface shared by every lock flavor.
///
/// `unlock` must only be called by a holder; prefer [`LockGuard`] so release
/// happens on every exit path.
pub trait Lock: Send + Sync {
    /// Blocking acquire.
    fn lock(&self);
    /// Non-blocking acquire attempt.
    fn try_lock(&self) -> bool;
    /// Bounded-wait acquire attempt.
    fn try_lock_for(&self, timeout: Duration) -> bool;
    /// Release one hold.
    fn unlock(&self);
}

/// Which lock flavor an object uses. Fixed for the owning object's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// One holder at a time; debug builds flag re-entry by the holder.
    Exclusive,
    /// Re-entrant; the holding thread may acquire again.
    Recursive,
    /// Counting semaphore with `permits` simultaneous holders.
    Counting { permits: u32 },
    /// No-op lock for single-threaded use.
    None,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy::Exclusive
    }
}

/// Construct the lock implementation selected by `policy`.
pub fn new_lock(policy: LockPolicy) -> Box<dyn Lock> {
    match policy {
        LockPolicy::Exclusive => Box::new(ExclusiveLock::new()),
        LockPolicy::Recursive => Box::new(RecursiveLock::new()),
        LockPolicy::Counting { permits } => Box::new(SemaphoreLock::new(permits)),
        LockPolicy::None => Box::new(NoopLock),
    }
}

fn current_thread_id() -> usize {
    RawThreadId.nonzero_thread_id().get()
}

/// Plain mutual exclusion. Re-entering from the thread that already holds the
/// lock is a programming error; debug builds catch it instead of deadlocking
/// silently.
pub struct ExclusiveLock {
    raw: RawMutex,
    holder: AtomicUsize,
}

impl ExclusiveLock {
    pub fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            holder: AtomicUsize::new(0),
        }
    }

    fn debug_check_reentry(&self) {
        debug_assert_ne!(
            self.holder.load(Ordering::Relaxed),
            current_thread_id(),
            "exclusive lock re-entered by the thread that already holds it"
        );
    }
}

impl Default for ExclusiveLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock for ExclusiveLock {
    fn lock(&self) {
        self.debug_check_reentry();
        self.raw.lock();
        self.holder.store(current_thread_id(), Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        if self.raw.try_lock() {
            self.holder.store(current_thread_id(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn try_lock_for(&self, timeout: Duration) -> bool {
        self.debug_check_reentry();
        if self.raw.try_lock_for(timeout) {
            self.holder.store(current_thread_id(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn unlock(&self) {
        self.holder.store(0, Ordering::Relaxed);
        unsafe { self.raw.unlock() };
    }
}

/// Re-entrant lock: the holding thread may acquire again; each acquire needs
/// a matching release.
pub struct RecursiveLock {
    raw: RawReentrantMutex<RawMutex, RawThreadId>,
}

impl RecursiveLock {
    pub fn new() -> Self {
        Self {
            raw: RawReentrantMutex::INIT,
        }
    }
}

impl Default for RecursiveLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock for RecursiveLock {
    fn lock(&self) {
        self.raw.lock();
    }

    fn try_lock(&self) -> bool {
        self.raw.try_lock()
    }

    fn try_lock_for(&self, timeout: Duration) -> bool {
        self.raw.try_lock_for(timeout)
    }

    fn unlock(&self) {
        unsafe { self.raw.unlock() };
    }
}

/// Counting semaphore: up to `permits` simultaneous holders.
pub struct SemaphoreLock {
    permits: Mutex<u32>,
    available: Condvar,
    max: u32,
}

impl SemaphoreLock {
    /// `permits` of 0 is clamped to 1 (a semaphore nobody can acquire is
    /// never what a caller wants).
    pub fn new(permits: u32) -> Self {
        let max = permits.max(1);
        Self {
            permits: Mutex::new(max),
            available: Condvar::new(),
            max,
        }
    }
}

impl Lock for SemaphoreLock {
    fn lock(&self) {
        let mut permits = self.permits.lock();
        self.available.wait_while(&mut permits, |p| *p == 0);
        *permits -= 1;
    }

    fn try_lock(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    fn try_lock_for(&self, timeout: Duration) -> bool {
        let mut permits = self.permits.lock();
        if self
            .available
            .wait_while_for(&mut permits, |p| *p == 0, timeout)
            .timed_out()
        {
            return false;
        }
        *permits -= 1;
        true
    }

    fn unlock(&self) {
        let mut permits = self.permits.lock();
        debug_assert!(*permits < self.max, "semaphore released more than acquired");
        *permits = (*permits + 1).min(self.max);
        drop(permits);
        self.available.notify_one();
    }
}

/// All operations succeed immediately. For objects confined to one thread.
pub struct NoopLock;

impl Lock for NoopLock {
    fn lock(&self) {}

    fn try_lock(&self) -> bool {
        true
    }

    fn try_lock_for(&self, _timeout: Duration) -> bool {
        true
    }

    fn unlock(&self) {}
}

/// Scoped acquisition: acquires on construction, releases on drop, including
/// early-return and panic paths.
pub struct LockGuard<'a> {
    lock: &'a dyn Lock,
}

impl<'a> LockGuard<'a> {
    pub fn new(lock: &'a dyn Lock) -> Self {
        lock.lock();
        Self { lock }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn exclusive_blocks_second_thread() {
        let lock: Arc<dyn Lock> = Arc::new(ExclusiveLock::new());
        lock.lock();
        let (tx, rx) = mpsc::channel();
        let l = lock.clone();
        let t = thread::spawn(move || {
            tx.send(l.try_lock()).unwrap();
        });
        assert!(!rx.recv().unwrap());
        t.join().unwrap();
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn try_lock_for_times_out_while_held() {
        let lock: Arc<dyn Lock> = Arc::new(ExclusiveLock::new());
        lock.lock();
        let l = lock.clone();
        let t = thread::spawn(move || {
            let start = Instant::now();
            let got = l.try_lock_for(Duration::from_millis(50));
            (got, start.elapsed())
        });
        let (got, waited) = t.join().unwrap();
        assert!(!got);
        assert!(waited >= Duration::from_millis(40));
        lock.unlock();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "re-entered")]
    fn exclusive_reentry_is_flagged() {
        let lock = ExclusiveLock::new();
        lock.lock();
        lock.lock(); // same thread, still holding
    }

    #[test]
    fn recursive_allows_reentry() {
        let lock = RecursiveLock::new();
        lock.lock();
        lock.lock();
        assert!(lock.try_lock(), "holder can always re-acquire");
        lock.unlock();
        lock.unlock();
        lock.unlock();
    }

    #[test]
    fn recursive_excludes_other_threads_until_fully_released() {
        let lock: Arc<RecursiveLock> = Arc::new(RecursiveLock::new());
        lock.lock();
        lock.lock();
        let probe = |l: Arc<RecursiveLock>| {
            thread::spawn(move || l.try_lock()).join().unwrap()
        };
        assert!(!probe(lock.clone()));
        lock.unlock();
        assert!(!probe(lock.clone()));
        lock.unlock();
        let l = lock.clone();
        let t = thread::spawn(move || {
            let got = l.try_lock();
            if got {
                l.unlock();
            }
            got
        });
        assert!(t.join().unwrap());
    }

    #[test]
    fn semaphore_allows_n_holders() {
        let sem = SemaphoreLock::new(2);
        assert!(sem.try_lock());
        assert!(sem.try_lock());
        assert!(!sem.try_lock());
        sem.unlock();
        assert!(sem.try_lock());
        sem.unlock();
        sem.unlock();
    }

    #[test]
    fn semaphore_bounded_wait() {
        let sem = Arc::new(SemaphoreLock::new(1));
        sem.lock();
        let s = sem.clone();
        let t = thread::spawn(move || s.try_lock_for(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        sem.unlock();
        assert!(t.join().unwrap());
        sem.unlock();
    }

    #[test]
    fn noop_always_succeeds() {
        let lock = NoopLock;
        assert!(lock.try_lock());
        assert!(lock.try_lock_for(Duration::ZERO));
        lock.unlock();
        lock.unlock();
    }

    #[test]
    fn guard_releases_on_scope_exit() {
        let lock = ExclusiveLock::new();
        {
            let _g = LockGuard::new(&lock);
            assert!(!thread_probe(&lock));
        }
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn guard_releases_on_panic() {
        let lock = Arc::new(ExclusiveLock::new());
        let l = lock.clone();
        let result = thread::spawn(move || {
            let _g = LockGuard::new(&*l);
            panic!("boom");
        })
        .join();
        assert!(result.is_err());
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn policy_selects_implementation() {
        for policy in [
            LockPolicy::Exclusive,
            LockPolicy::Recursive,
            LockPolicy::Counting { permits: 3 },
            LockPolicy::None,
        ] {
            let lock = new_lock(policy);
            assert!(lock.try_lock());
            lock.unlock();
        }
    }

    fn thread_probe(lock: &ExclusiveLock) -> bool {
        thread::scope(|s| s.spawn(|| lock.try_lock()).join().unwrap())
    }
}
