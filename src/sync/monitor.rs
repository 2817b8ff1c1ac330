//! A mutex-protected value paired with a condition variable
//!
//! Waiters block until a predicate over the value holds. Waits performed on
//! the thread of an execution unit observe the unit's cancellation token, so
//! cancelling the unit interrupts the wait.

use crate::execution::current_cancel_token;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Upper bound on how long a cancellable wait sleeps before rechecking its token
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Why a wait ended without its predicate holding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout elapsed
    TimedOut,
    /// The calling execution unit was cancelled
    Cancelled,
}

/// Value guarded by a mutex, with change notification
#[derive(Debug, Default)]
pub struct Monitor<T> {
    value: Mutex<T>,
    cond: Condvar,
}

impl<T> Monitor<T> {
    /// Create a new monitor holding `value`
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    /// Lock the value. A poisoned lock is recovered.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the value and wake every waiter
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let mut guard = self.lock();
            f(&mut guard)
        };
        self.cond.notify_all();
        result
    }

    /// Wake every waiter without changing the value
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Block until `done` holds, the timeout elapses or the calling unit is cancelled
    ///
    /// The guard is handed back in every case so callers can undo partial
    /// work (e.g. withdraw a barrier arrival) under the same lock.
    pub fn wait_until<'a, F>(
        &'a self,
        mut guard: MutexGuard<'a, T>,
        timeout: Option<Duration>,
        mut done: F,
    ) -> (MutexGuard<'a, T>, Result<(), WaitError>)
    where
        F: FnMut(&T) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let cancel = current_cancel_token();

        loop {
            if done(&guard) {
                return (guard, Ok(()));
            }
            if cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
                return (guard, Err(WaitError::Cancelled));
            }

            let mut slice = cancel.as_ref().map(|_| CANCEL_POLL_INTERVAL);
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return (guard, Err(WaitError::TimedOut));
                }
                let remaining = deadline - now;
                slice = Some(slice.map_or(remaining, |s| s.min(remaining)));
            }

            guard = match slice {
                Some(slice) => match self.cond.wait_timeout(guard, slice) {
                    Ok((g, _)) => g,
                    Err(e) => e.into_inner().0,
                },
                None => self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

impl<T: Clone> Monitor<T> {
    /// Snapshot of the current value
    pub fn get(&self) -> T {
        self.lock().clone()
    }
}
