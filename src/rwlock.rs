// Modified from https://github.com/rust-lang/rust/blob/master/library/std/src/sys/sync/rwlock/futex.rs
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{
    AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};

// Bits 0..30 hold the lock count:
//   0: unlocked
//   1..=MAX_READERS: locked by N readers
//   WRITE_LOCKED: locked by a writer
// Bit 30: readers are waiting on `state`.
// Bit 31: writers are waiting on `writer_notify`.
const READ_LOCKED: u32 = 1;
const MASK: u32 = (1 << 30) - 1;
const WRITE_LOCKED: u32 = MASK;
const MAX_READERS: u32 = MASK - 1;
const READERS_WAITING: u32 = 1 << 30;
const WRITERS_WAITING: u32 = 1 << 31;

#[inline]
fn is_unlocked(state: u32) -> bool {
    state & MASK == 0
}

#[inline]
fn is_write_locked(state: u32) -> bool {
    state & MASK == WRITE_LOCKED
}

#[inline]
fn has_readers_waiting(state: u32) -> bool {
    state & READERS_WAITING != 0
}

#[inline]
fn has_writers_waiting(state: u32) -> bool {
    state & WRITERS_WAITING != 0
}

#[inline]
fn is_read_lockable(state: u32) -> bool {
    // Readers never jump ahead of waiting threads, so a waiting writer
    // blocks new readers. Also false if the reader count would overflow.
    state & MASK < MAX_READERS && !has_readers_waiting(state) && !has_writers_waiting(state)
}

#[inline]
fn has_reached_max_readers(state: u32) -> bool {
    state & MASK == MAX_READERS
}

/// The raw futex-based reader-writer lock without any protected data.
struct RawRwLock {
    state: AtomicU32,
    /// Bumped on every writer notification.
    writer_notify: AtomicU32,
}

impl RawRwLock {
    #[inline]
    const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            writer_notify: AtomicU32::new(0),
        }
    }

    #[inline]
    fn try_read(&self) -> bool {
        self.state
            .fetch_update(Acquire, Relaxed, |s| {
                is_read_lockable(s).then(|| s + READ_LOCKED)
            })
            .is_ok()
    }

    #[inline]
    fn read(&self) {
        let state = self.state.load(Relaxed);
        if !is_read_lockable(state)
            || self
                .state
                .compare_exchange_weak(state, state + READ_LOCKED, Acquire, Relaxed)
                .is_err()
        {
            self.read_contended();
        }
    }

    #[inline]
    fn read_unlock(&self) {
        let state = self.state.fetch_sub(READ_LOCKED, Release) - READ_LOCKED;

        // A reader can only be waiting on a read-locked lock if a writer is waiting too.
        debug_assert!(!has_readers_waiting(state) || has_writers_waiting(state));

        // The last reader out wakes a waiting writer.
        if is_unlocked(state) && has_writers_waiting(state) {
            self.wake_writer_or_readers(state);
        }
    }

    #[cold]
    fn read_contended(&self) {
        let mut state = self.spin_read();

        loop {
            if is_read_lockable(state) {
                match self.state.compare_exchange_weak(
                    state,
                    state + READ_LOCKED,
                    Acquire,
                    Relaxed,
                ) {
                    Ok(_) => return, // Locked!
                    Err(s) => {
                        state = s;
                        continue;
                    }
                }
            }

            if has_reached_max_readers(state) {
                panic!("too many active read locks on RwLock");
            }

            // Make sure the readers waiting bit is set before we go to sleep.
            if !has_readers_waiting(state) {
                if let Err(s) =
                    self.state
                        .compare_exchange(state, state | READERS_WAITING, Relaxed, Relaxed)
                {
                    state = s;
                    continue;
                }
            }

            atomic_wait::wait(&self.state, state | READERS_WAITING);

            // Spin again after waking up.
            state = self.spin_read();
        }
    }

    #[inline]
    fn try_write(&self) -> bool {
        self.state
            .fetch_update(Acquire, Relaxed, |s| {
                is_unlocked(s).then(|| s + WRITE_LOCKED)
            })
            .is_ok()
    }

    #[inline]
    fn write(&self) {
        if self
            .state
            .compare_exchange_weak(0, WRITE_LOCKED, Acquire, Relaxed)
            .is_err()
        {
            self.write_contended();
        }
    }

    #[inline]
    fn write_unlock(&self) {
        let state = self.state.fetch_sub(WRITE_LOCKED, Release) - WRITE_LOCKED;

        debug_assert!(is_unlocked(state));

        if has_writers_waiting(state) || has_readers_waiting(state) {
            self.wake_writer_or_readers(state);
        }
    }

    #[cold]
    fn write_contended(&self) {
        let mut state = self.spin_write();

        let mut other_writers_waiting = 0;

        loop {
            if is_unlocked(state) {
                match self.state.compare_exchange_weak(
                    state,
                    state | WRITE_LOCKED | other_writers_waiting,
                    Acquire,
                    Relaxed,
                ) {
                    Ok(_) => return, // Locked!
                    Err(s) => {
                        state = s;
                        continue;
                    }
                }
            }

            // Mark that a writer is waiting.
            if !has_writers_waiting(state) {
                if let Err(s) =
                    self.state
                        .compare_exchange(state, state | WRITERS_WAITING, Relaxed, Relaxed)
                {
                    state = s;
                    continue;
                }
            }

            // Other writers might be waiting as well, so keep the bit set
            // once we do get the lock.
            other_writers_waiting = WRITERS_WAITING;

            // Read the notification counter before re-checking the state,
            // so a notification in between is not lost.
            let seq = self.writer_notify.load(Acquire);

            state = self.state.load(Relaxed);
            if is_unlocked(state) || !has_writers_waiting(state) {
                continue;
            }

            atomic_wait::wait(&self.writer_notify, seq);

            // Spin again after waking up.
            state = self.spin_write();
        }
    }

    /// Wakes waiting threads after an unlock.
    ///
    /// Prefers a single writer when both writers and readers are waiting.
    /// `atomic_wait` does not report whether anyone was woken, so the readers
    /// are released as well in that case; they will simply block again behind
    /// the writer if it wins the race.
    #[cold]
    fn wake_writer_or_readers(&self, mut state: u32) {
        assert!(is_unlocked(state));

        // If the lock gets locked in the meantime, the new owner wakes the
        // waiters on its own unlock.

        if state == WRITERS_WAITING {
            match self.state.compare_exchange(state, 0, Relaxed, Relaxed) {
                Ok(_) => {
                    self.wake_writer();
                    return;
                }
                Err(s) => state = s,
            }
        }

        if state == READERS_WAITING + WRITERS_WAITING {
            if self
                .state
                .compare_exchange(state, READERS_WAITING, Relaxed, Relaxed)
                .is_err()
            {
                // Locked again, not our problem anymore.
                return;
            }
            self.wake_writer();
            state = READERS_WAITING;
        }

        if state == READERS_WAITING
            && self
                .state
                .compare_exchange(state, 0, Relaxed, Relaxed)
                .is_ok()
        {
            atomic_wait::wake_all(&self.state);
        }
    }

    fn wake_writer(&self) {
        self.writer_notify.fetch_add(1, Release);
        atomic_wait::wake_one(&self.writer_notify);
    }

    #[inline]
    fn spin_until(&self, f: impl Fn(u32) -> bool) -> u32 {
        let mut spin = 100;
        loop {
            // Only `load` while spinning, to be easier on the caches.
            let state = self.state.load(Relaxed);
            if f(state) || spin == 0 {
                return state;
            }
            std::hint::spin_loop();
            spin -= 1;
        }
    }

    #[inline]
    fn spin_write(&self) -> u32 {
        // Stop when unlocked, or when writers are already queued.
        self.spin_until(|state| is_unlocked(state) || has_writers_waiting(state))
    }

    #[inline]
    fn spin_read(&self) -> u32 {
        // Stop when not write locked, or when anyone is queued.
        self.spin_until(|state| {
            !is_write_locked(state) || has_readers_waiting(state) || has_writers_waiting(state)
        })
    }
}

/// A reader-writer lock protecting a value of type `T`.
///
/// Many readers or a single writer may hold the lock at a time. Writers are
/// preferred over new readers once they start waiting. The lock is released
/// normally when a guard is dropped during a panic, so it never poisons.
pub struct RwLock<T: ?Sized> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `raw`.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Locks with shared read access, blocking while a writer holds or awaits the lock.
    #[inline]
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.raw.read();
        ReadGuard { lock: self }
    }

    #[inline]
    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        self.raw.try_read().then(|| ReadGuard { lock: self })
    }

    /// Locks with exclusive write access, blocking until every other holder is gone.
    #[inline]
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.raw.write();
        WriteGuard { lock: self }
    }

    #[inline]
    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        self.raw.try_write().then(|| WriteGuard { lock: self })
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for shared access. Unlocks on drop.
pub struct ReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: a read lock is held, so no writer has access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.read_unlock();
    }
}

/// RAII guard for exclusive access. Unlocks on drop.
pub struct WriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the write lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the write lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.write_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_rwlock_basic() {
        let lock = RwLock::new(0u32);
        {
            let r1 = lock.read();
            let r2 = lock.read();
            assert_eq!(*r1, 0);
            assert_eq!(*r2, 0);
            assert!(lock.try_write().is_none());
            assert!(lock.try_read().is_some());
        }
        {
            let mut w = lock.write();
            *w += 1;
            assert!(lock.try_read().is_none());
            assert!(lock.try_write().is_none());
        }
        assert_eq!(*lock.read(), 1);
        assert_eq!(lock.into_inner(), 1);
    }

    #[test]
    fn test_rwlock_writers_exclusive() {
        let lock = Arc::new(RwLock::new(0usize));
        let current = Arc::new(AtomicU32::new(0));
        const N: usize = 8;
        const M: usize = 1 << 16;

        let mut tasks = vec![];
        for _ in 0..N {
            let lock = lock.clone();
            let current = current.clone();
            tasks.push(std::thread::spawn(move || {
                for _ in 0..M {
                    let mut guard = lock.write();
                    assert_eq!(current.fetch_add(1, Acquire), 0);
                    *guard += 1;
                    current.fetch_sub(1, Acquire);
                }
            }));
        }
        for task in tasks {
            task.join().unwrap();
        }
        assert_eq!(*lock.read(), N * M);
    }

    #[test]
    fn test_rwlock_readers_share() {
        let lock = Arc::new(RwLock::new(()));
        const N: usize = 4;
        // Every reader holds its guard across the barrier, which only
        // completes if all of them hold the read lock at the same time.
        let barrier = Arc::new(Barrier::new(N));

        let tasks = (0..N)
            .map(|_| {
                let lock = lock.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let _guard = lock.read();
                    barrier.wait();
                })
            })
            .collect::<Vec<_>>();
        tasks.into_iter().for_each(|t| t.join().unwrap());
    }

    #[test]
    fn test_rwlock_readers_and_writers() {
        let lock = Arc::new(RwLock::new((0usize, 0usize)));
        let readers = Arc::new(AtomicUsize::new(0));
        const ITERATIONS: usize = 10000;

        let writers = (0..2)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let mut guard = lock.write();
                        guard.0 += 1;
                        std::thread::yield_now(); // Force a context switch to increase contention
                        guard.1 += 1;
                    }
                })
            })
            .collect::<Vec<_>>();

        let reader_threads = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let readers = readers.clone();
                std::thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let guard = lock.read();
                        readers.fetch_add(1, Relaxed);
                        // Writers update both halves under one lock.
                        assert_eq!(guard.0, guard.1);
                    }
                })
            })
            .collect::<Vec<_>>();

        writers.into_iter().for_each(|t| t.join().unwrap());
        reader_threads.into_iter().for_each(|t| t.join().unwrap());

        assert_eq!(*lock.read(), (2 * ITERATIONS, 2 * ITERATIONS));
        assert_eq!(readers.load(Relaxed), 4 * ITERATIONS);
    }

    #[test]
    fn test_rwlock_no_poison() {
        let lock = Arc::new(RwLock::new(1u32));
        let result = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let _guard = lock.write();
                panic!("boom");
            })
            .join()
        };
        assert!(result.is_err());
        assert_eq!(*lock.read(), 1);
        *lock.write() = 2;
        assert_eq!(*lock.read(), 2);
    }
}
