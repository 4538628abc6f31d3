//! Reentrant, queue-aware mutex with deferred acquisition
//!
//! Built directly on `std::sync::{Mutex, Condvar}` rather than a library
//! reentrant lock: the deferred path and the shared/exclusive mix have no
//! standard-library equivalent. The state machine is owner-thread-id + depth
//! + reader count; all blocking goes through one condvar.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use super::deferred::DeferredLockRegistry;

/// Default budget for [`ConcurrencyManager::check_read_lock`].
pub(crate) const CHECK_READ_LOCK_BUDGET: Duration = Duration::from_millis(500);

/// Lock acquisition and release failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Bounded wait expired. Carries the owning thread (if any) at expiry
    /// and how long the caller waited, to aid diagnosing deadlocks.
    Timeout {
        owner: Option<String>,
        waited: Duration,
    },
    /// Release attempted by a thread that does not own the lock, or one
    /// release too many. A programming defect, surfaced immediately.
    NotOwner,
    /// A shared-mode release with no shared holders outstanding.
    NoReaders,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Timeout { owner, waited } => match owner {
                Some(owner) => write!(
                    f,
                    "Lock acquisition timed out after {:?}; held by {}",
                    waited, owner
                ),
                None => write!(f, "Lock acquisition timed out after {:?}", waited),
            },
            LockError::NotOwner => write!(f, "Lock released by a non-owning thread"),
            LockError::NoReaders => write!(f, "Read lock released with no readers"),
        }
    }
}

impl std::error::Error for LockError {}

/// Outcome of a deferred acquisition attempt. Guaranteed non-blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredOutcome {
    /// The lock was free (or already owned by this thread) and is now held.
    Acquired,
    /// The lock is busy and the request was recorded in the calling
    /// thread's deferred-lock registry for later settlement.
    Deferred,
}

#[derive(Debug, Default)]
struct LockState {
    /// Exclusive owner. `None` while free or held only in shared mode.
    active_thread: Option<ThreadId>,
    /// Reentrant depth of the exclusive owner.
    depth: usize,
    /// Outstanding shared-mode holders.
    readers: usize,
}

impl LockState {
    /// Shared mode is admissible unless a foreign thread holds the lock
    /// exclusively; readers never exclude each other.
    #[inline]
    fn readable_for(&self, me: ThreadId) -> bool {
        self.active_thread.is_none() || self.active_thread == Some(me)
    }
}

/// Reentrant mutual-exclusion primitive for one cache entry or the whole
/// cache.
///
/// Exclusive mode is reentrant per thread; shared mode admits concurrent
/// readers but blocks behind a foreign exclusive owner. Fairness is
/// whatever the condvar provides; no extra ordering layer is imposed.
#[derive(Debug, Default)]
pub struct ConcurrencyManager {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl ConcurrencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Poisoning carries no meaning here: the protected state is only the
    /// lock bookkeeping itself, which is left consistent at every await
    /// point.
    #[inline]
    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn wait<'a>(&self, guard: MutexGuard<'a, LockState>) -> MutexGuard<'a, LockState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the lock is free or already held by the calling thread.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.lock_state();

        if state.active_thread == Some(me) {
            state.depth += 1;
            return;
        }
        while !(state.active_thread.is_none() && state.readers == 0) {
            state = self.wait(state);
        }
        state.active_thread = Some(me);
        state.depth = 1;
        drop(state);
        DeferredLockRegistry::note_acquired();
    }

    /// Immediate attempt; `false` signals "busy", not an error.
    pub fn acquire_nowait(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.lock_state();

        if state.active_thread == Some(me) {
            state.depth += 1;
            return true;
        }
        if state.active_thread.is_none() && state.readers == 0 {
            state.active_thread = Some(me);
            state.depth = 1;
            drop(state);
            DeferredLockRegistry::note_acquired();
            return true;
        }
        false
    }

    /// Block up to `timeout`; on expiry fail with the owning thread named.
    pub fn acquire_with_timeout(&self, timeout: Duration) -> Result<(), LockError> {
        let me = thread::current().id();
        let started = Instant::now();
        let mut state = self.lock_state();

        if state.active_thread == Some(me) {
            state.depth += 1;
            return Ok(());
        }
        while !(state.active_thread.is_none() && state.readers == 0) {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LockError::Timeout {
                    owner: state.active_thread.map(|t| format!("{:?}", t)),
                    waited: elapsed,
                });
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, timeout - elapsed)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        state.active_thread = Some(me);
        state.depth = 1;
        drop(state);
        DeferredLockRegistry::note_acquired();
        Ok(())
    }

    /// Non-blocking acquisition for cyclic object-graph merges.
    ///
    /// A thread that holds no other locks cannot be part of a lock cycle,
    /// so it simply blocks. A thread that already holds or has deferred
    /// locks must not wait here; the request is recorded in its
    /// [`DeferredLockRegistry`] and settled after the partial merge.
    pub fn acquire_deferred(this: &std::sync::Arc<Self>) -> DeferredOutcome {
        if this.acquire_nowait() {
            return DeferredOutcome::Acquired;
        }
        if DeferredLockRegistry::holds_locks() || DeferredLockRegistry::deferred_count() > 0 {
            DeferredLockRegistry::record(std::sync::Arc::clone(this));
            return DeferredOutcome::Deferred;
        }
        this.acquire();
        DeferredOutcome::Acquired
    }

    /// Decrement the reentrant depth; at zero, give up ownership and wake
    /// waiters.
    pub fn release(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.lock_state();

        if state.active_thread != Some(me) || state.depth == 0 {
            return Err(LockError::NotOwner);
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.active_thread = None;
            drop(state);
            DeferredLockRegistry::note_released();
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Shared mode: proceed alongside other readers, block behind a foreign
    /// exclusive owner. The exclusive owner may take read locks on its own
    /// entry.
    pub fn acquire_read_lock(&self) {
        let me = thread::current().id();
        let mut state = self.lock_state();

        while !state.readable_for(me) {
            state = self.wait(state);
        }
        state.readers += 1;
    }

    /// Immediate shared-mode attempt.
    pub fn try_read_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.lock_state();

        if state.readable_for(me) {
            state.readers += 1;
            return true;
        }
        false
    }

    pub fn release_read_lock(&self) -> Result<(), LockError> {
        let mut state = self.lock_state();
        if state.readers == 0 {
            return Err(LockError::NoReaders);
        }
        state.readers -= 1;
        if state.readers == 0 {
            drop(state);
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Wait briefly for a foreign write lock to clear, without ever taking
    /// ownership. Returns whether the lock was clear when the wait ended;
    /// callers proceed either way once the budget is spent.
    pub fn check_read_lock(&self) -> bool {
        self.check_read_lock_within(CHECK_READ_LOCK_BUDGET)
    }

    pub fn check_read_lock_within(&self, budget: Duration) -> bool {
        let me = thread::current().id();
        let started = Instant::now();
        let mut state = self.lock_state();

        loop {
            let foreign = state.active_thread.is_some() && state.active_thread != Some(me);
            if !foreign {
                return true;
            }
            let elapsed = started.elapsed();
            if elapsed >= budget {
                return false;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, budget - elapsed)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Exclusive owner, if any. Diagnostic only; stale the moment it is
    /// read.
    pub fn owner(&self) -> Option<ThreadId> {
        self.lock_state().active_thread
    }

    pub fn is_acquired(&self) -> bool {
        self.lock_state().active_thread.is_some()
    }

    /// Whether the calling thread is the exclusive owner.
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.lock_state().active_thread == Some(thread::current().id())
    }

    pub fn depth(&self) -> usize {
        self.lock_state().depth
    }
}
