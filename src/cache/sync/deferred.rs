//! Thread-local deferred-lock registry
//!
//! During a unit-of-work merge of a cyclic object graph, a thread may hit an
//! entry lock held by another thread that is, directly or transitively,
//! waiting on a lock this thread already holds. Blocking there deadlocks.
//! [`ConcurrencyManager::acquire_deferred`] instead records the busy lock
//! here and returns, letting the caller finish the rest of the merge and
//! settle the deferred requests afterwards.
//!
//! The registry also keeps the per-thread count of exclusive locks held,
//! which is the cycle heuristic: a thread holding nothing cannot close a
//! cycle and is allowed to block.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::concurrency_manager::{ConcurrencyManager, LockError};

/// Lifecycle of one lock request, tracked per deferred entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRequestState {
    /// Ownership obtained.
    Held,
    /// Blocked in a bounded wait during settlement.
    Waiting,
    /// Recorded for later settlement; not waited on yet.
    Deferred,
}

#[derive(Debug)]
struct DeferredRequest {
    lock: Arc<ConcurrencyManager>,
    state: LockRequestState,
}

#[derive(Debug, Default)]
struct ThreadLocks {
    /// Exclusive locks currently held by this thread (reentrant acquires
    /// count once).
    held: usize,
    deferred: Vec<DeferredRequest>,
}

thread_local! {
    static THREAD_LOCKS: RefCell<ThreadLocks> = RefCell::new(ThreadLocks::default());
}

/// Accessor for the calling thread's lock bookkeeping.
///
/// Zero-sized; all state lives in a thread local. Registration is invisible
/// to callers except through eventual successful settlement.
#[derive(Debug, Clone, Copy)]
pub struct DeferredLockRegistry;

impl DeferredLockRegistry {
    pub(crate) fn note_acquired() {
        THREAD_LOCKS.with(|locks| locks.borrow_mut().held += 1);
    }

    pub(crate) fn note_released() {
        THREAD_LOCKS.with(|locks| {
            let mut locks = locks.borrow_mut();
            locks.held = locks.held.saturating_sub(1);
        });
    }

    pub(crate) fn record(lock: Arc<ConcurrencyManager>) {
        THREAD_LOCKS.with(|locks| {
            locks.borrow_mut().deferred.push(DeferredRequest {
                lock,
                state: LockRequestState::Deferred,
            })
        });
    }

    /// Whether this thread currently holds any exclusive lock.
    pub fn holds_locks() -> bool {
        THREAD_LOCKS.with(|locks| locks.borrow().held > 0)
    }

    pub fn deferred_count() -> usize {
        THREAD_LOCKS.with(|locks| locks.borrow().deferred.len())
    }

    /// Request states for this thread's deferred locks, in registration
    /// order. Diagnostic only.
    pub fn pending_states() -> Vec<LockRequestState> {
        THREAD_LOCKS.with(|locks| {
            locks
                .borrow()
                .deferred
                .iter()
                .map(|request| request.state)
                .collect()
        })
    }

    /// Drain the registry without waiting. Callers that want to retry each
    /// lock themselves (rather than settle in bulk) take the list.
    pub fn take_deferred() -> Vec<Arc<ConcurrencyManager>> {
        THREAD_LOCKS.with(|locks| {
            locks
                .borrow_mut()
                .deferred
                .drain(..)
                .map(|request| request.lock)
                .collect()
        })
    }

    /// Wait, within `timeout`, for every deferred lock to be released by
    /// its owner. Each lock is briefly acquired and released to confirm the
    /// owning operation finished; settled requests leave the registry even
    /// when a later one times out.
    pub fn settle(timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;

        loop {
            let next = THREAD_LOCKS.with(|locks| {
                let mut locks = locks.borrow_mut();
                if locks.deferred.is_empty() {
                    None
                } else {
                    locks.deferred[0].state = LockRequestState::Waiting;
                    Some(Arc::clone(&locks.deferred[0].lock))
                }
            });
            let Some(lock) = next else {
                return Ok(());
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            lock.acquire_with_timeout(remaining)?;
            let _ = lock.release();

            THREAD_LOCKS.with(|locks| {
                let mut locks = locks.borrow_mut();
                if !locks.deferred.is_empty() {
                    locks.deferred.remove(0);
                }
            });
        }
    }

    /// Abandon all deferred requests for this thread. Used when a merge is
    /// rolled back instead of retried.
    pub fn clear() {
        THREAD_LOCKS.with(|locks| locks.borrow_mut().deferred.clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::sync::DeferredOutcome;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn deferred_acquire_never_blocks_a_lock_holder() {
        let busy = Arc::new(ConcurrencyManager::new());
        let mine = Arc::new(ConcurrencyManager::new());
        busy.acquire();

        let busy_clone = Arc::clone(&busy);
        let mine_clone = Arc::clone(&mine);
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            // Holding one lock, a request against a busy lock must defer
            // instead of blocking.
            mine_clone.acquire();
            let started = Instant::now();
            let outcome = ConcurrencyManager::acquire_deferred(&busy_clone);
            assert!(started.elapsed() < Duration::from_millis(100));
            assert_eq!(outcome, DeferredOutcome::Deferred);
            assert_eq!(DeferredLockRegistry::deferred_count(), 1);
            assert_eq!(
                DeferredLockRegistry::pending_states(),
                vec![LockRequestState::Deferred]
            );
            tx.send(()).unwrap();

            // Settlement succeeds once the owner releases.
            DeferredLockRegistry::settle(Duration::from_secs(2)).unwrap();
            assert_eq!(DeferredLockRegistry::deferred_count(), 0);
            mine_clone.release().unwrap();
        });

        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(30));
        busy.release().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn deferred_acquire_blocks_when_nothing_is_held() {
        let busy = Arc::new(ConcurrencyManager::new());
        busy.acquire();

        let busy_clone = Arc::clone(&busy);
        let handle = thread::spawn(move || {
            // No held locks means no cycle risk: plain blocking acquire.
            let outcome = ConcurrencyManager::acquire_deferred(&busy_clone);
            assert_eq!(outcome, DeferredOutcome::Acquired);
            busy_clone.release().unwrap();
        });
        thread::sleep(Duration::from_millis(30));
        busy.release().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn deferred_acquire_on_a_free_lock_acquires() {
        let lock = Arc::new(ConcurrencyManager::new());
        assert_eq!(ConcurrencyManager::acquire_deferred(&lock), DeferredOutcome::Acquired);
        assert!(lock.is_owned_by_current_thread());
        lock.release().unwrap();
    }

    #[test]
    fn take_deferred_hands_back_the_recorded_locks() {
        let busy = Arc::new(ConcurrencyManager::new());
        let held = Arc::new(ConcurrencyManager::new());
        busy.acquire();

        let busy_clone = Arc::clone(&busy);
        let held_clone = Arc::clone(&held);
        let handle = thread::spawn(move || {
            held_clone.acquire();
            assert_eq!(ConcurrencyManager::acquire_deferred(&busy_clone), DeferredOutcome::Deferred);
            let pending = DeferredLockRegistry::take_deferred();
            assert_eq!(pending.len(), 1);
            assert!(Arc::ptr_eq(&pending[0], &busy_clone));
            assert_eq!(DeferredLockRegistry::deferred_count(), 0);
            held_clone.release().unwrap();
        });
        handle.join().unwrap();
        busy.release().unwrap();
    }
}
