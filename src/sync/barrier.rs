//! Rendezvous barrier for a fixed number of participants
//!
//! A barrier is owned by the node that created it (its master). Each round
//! starts with `set_height(n)`; every participant then calls `arrive()`,
//! which blocks until `n` arrivals occurred and then releases all of them
//! together. A released round accepts no further arrivals until the barrier
//! is reset or reconfigured.

use super::monitor::{Monitor, WaitError};
use crate::error::{LockstepError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Identifier of a barrier, unique within its master node
pub type BarrierId = u32;

#[derive(Debug, Default)]
struct Round {
    height: u32,
    arrived: u32,
    /// Incremented on every release; waiters block until it changes
    generation: u64,
    released: bool,
}

/// Synchronization barrier
#[derive(Debug)]
pub struct Barrier {
    id: BarrierId,
    master: String,
    round: Monitor<Round>,
    latency: AtomicU32,
}

impl Barrier {
    /// Create an unconfigured barrier (height 0) owned by `master`
    pub fn new(id: BarrierId, master: impl Into<String>) -> Self {
        Self {
            id,
            master: master.into(),
            round: Monitor::new(Round::default()),
            latency: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> BarrierId {
        self.id
    }

    /// Name of the node that owns this barrier
    pub fn master(&self) -> &str {
        &self.master
    }

    /// Participant count of the current round (0 when unconfigured)
    pub fn height(&self) -> u32 {
        self.round.lock().height
    }

    /// Participants currently blocked in `arrive`
    pub fn pending_waiters(&self) -> u32 {
        let round = self.round.lock();
        if round.released {
            0
        } else {
            round.arrived
        }
    }

    /// Whether the current round has released its participants
    pub fn is_released(&self) -> bool {
        self.round.lock().released
    }

    /// Number of frames this barrier may stay in flight
    pub fn latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    pub fn set_latency(&self, latency: u32) {
        self.latency.store(latency, Ordering::Relaxed);
    }

    /// Configure the participant count and open a new round
    ///
    /// Only allowed while no participant is waiting.
    pub fn set_height(&self, height: u32) -> Result<()> {
        if height == 0 {
            return Err(LockstepError::protocol(format!(
                "barrier {} of {}: height must be at least 1",
                self.id, self.master
            )));
        }
        self.round.update(|round| {
            if !round.released && round.arrived > 0 {
                return Err(LockstepError::protocol(format!(
                    "barrier {} of {}: height changed with {} pending arrivals",
                    self.id, self.master, round.arrived
                )));
            }
            round.height = height;
            round.arrived = 0;
            round.released = false;
            Ok(())
        })
    }

    /// Open a new round with the current height
    pub fn reset(&self) -> Result<()> {
        let height = self.height();
        if height == 0 {
            return Err(LockstepError::protocol(format!(
                "barrier {} of {}: reset before height was set",
                self.id, self.master
            )));
        }
        self.set_height(height)
    }

    /// Return the barrier to its unconfigured state; used by the barrier cache
    pub(crate) fn clear(&self) {
        self.round.update(|round| {
            round.height = 0;
            round.arrived = 0;
            round.released = false;
        });
    }

    /// Block until all participants of the round arrived
    pub fn arrive(&self) -> Result<()> {
        self.arrive_inner(None)
    }

    /// Like `arrive`, giving up after `timeout`
    ///
    /// A timed-out participant withdraws its arrival.
    pub fn arrive_timeout(&self, timeout: Duration) -> Result<()> {
        self.arrive_inner(Some(timeout))
    }

    fn arrive_inner(&self, timeout: Option<Duration>) -> Result<()> {
        let mut round = self.round.lock();

        if round.height == 0 {
            return Err(LockstepError::protocol(format!(
                "barrier {} of {}: arrival before height was set",
                self.id, self.master
            )));
        }
        if round.released {
            return Err(LockstepError::protocol(format!(
                "barrier {} of {}: arrival beyond height {} before reset",
                self.id, self.master, round.height
            )));
        }

        round.arrived += 1;
        tracing::trace!(
            "Barrier {} of {}: {}/{} arrived",
            self.id,
            self.master,
            round.arrived,
            round.height
        );

        if round.arrived == round.height {
            round.released = true;
            round.generation += 1;
            drop(round);
            self.round.notify_all();
            return Ok(());
        }

        let generation = round.generation;
        let (mut round, waited) = self
            .round
            .wait_until(round, timeout, |r| r.generation != generation);

        match waited {
            Ok(()) => Ok(()),
            Err(reason) => {
                round.arrived -= 1;
                match reason {
                    WaitError::TimedOut => Err(LockstepError::Timeout(format!(
                        "barrier {} of {} after {}/{} arrivals",
                        self.id, self.master, round.arrived, round.height
                    ))),
                    WaitError::Cancelled => Err(LockstepError::Cancelled(format!(
                        "waiting on barrier {} of {}",
                        self.id, self.master
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_height_one_is_noop() {
        let barrier = Barrier::new(1, "node");
        barrier.set_height(1).unwrap();
        barrier.arrive().unwrap();
        assert!(barrier.is_released());
    }

    #[test]
    fn test_arrive_before_height_is_violation() {
        let barrier = Barrier::new(1, "node");
        assert!(barrier.arrive().unwrap_err().is_protocol_violation());
        assert!(barrier.set_height(0).unwrap_err().is_protocol_violation());
        assert!(barrier.reset().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_releases_only_after_all_arrivals() {
        let barrier = Arc::new(Barrier::new(7, "node"));
        barrier.set_height(3).unwrap();
        let released = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let barrier = barrier.clone();
                let released = released.clone();
                thread::spawn(move || {
                    barrier.arrive().unwrap();
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        while barrier.pending_waiters() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        barrier.arrive().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(barrier.pending_waiters(), 0);
    }

    #[test]
    fn test_over_arrival_then_reset() {
        let barrier = Barrier::new(2, "node");
        barrier.set_height(1).unwrap();
        barrier.arrive().unwrap();
        assert!(barrier.arrive().unwrap_err().is_protocol_violation());

        barrier.reset().unwrap();
        barrier.arrive().unwrap();
    }

    #[test]
    fn test_timeout_withdraws_arrival() {
        let barrier = Barrier::new(3, "node");
        barrier.set_height(2).unwrap();

        let err = barrier.arrive_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, LockstepError::Timeout(_)));
        assert_eq!(barrier.pending_waiters(), 0);

        // the round is still open and can be reconfigured
        barrier.set_height(1).unwrap();
        barrier.arrive().unwrap();
    }

    #[test]
    fn test_set_height_with_pending_arrivals_is_violation() {
        let barrier = Arc::new(Barrier::new(4, "node"));
        barrier.set_height(2).unwrap();

        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.arrive())
        };
        while barrier.pending_waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(barrier.set_height(3).unwrap_err().is_protocol_violation());
        barrier.arrive().unwrap();
        waiter.join().unwrap().unwrap();
    }
}
