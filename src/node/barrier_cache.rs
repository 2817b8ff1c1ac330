//! Per-node cache of barriers
//!
//! Barriers live in an arena of slots. Idle slots are kept on a free list
//! and handed out again before any new barrier is constructed, so a frame
//! loop that acquires and releases one barrier per frame allocates once.

use crate::error::{LockstepError, Result};
use crate::sync::{Barrier, BarrierId};
use std::ops::Deref;
use std::sync::Arc;

/// A barrier checked out of a [`BarrierCache`]
///
/// Clones share the barrier; hand one to every participant and return the
/// original with `release` once the round is over.
#[derive(Debug, Clone)]
pub struct BarrierHandle {
    slot: usize,
    barrier: Arc<Barrier>,
}

impl BarrierHandle {
    pub fn barrier(&self) -> &Arc<Barrier> {
        &self.barrier
    }
}

impl Deref for BarrierHandle {
    type Target = Barrier;

    fn deref(&self) -> &Barrier {
        &self.barrier
    }
}

#[derive(Debug)]
struct Slot {
    barrier: Arc<Barrier>,
    in_use: bool,
}

/// Arena of barriers owned by one master node
#[derive(Debug)]
pub struct BarrierCache {
    master: String,
    slots: Vec<Option<Slot>>,
    /// Slots holding an idle barrier, most recently released last
    idle: Vec<usize>,
    /// Slots whose barrier was dropped by trimming
    vacant: Vec<usize>,
    next_id: BarrierId,
    latency: u32,
}

impl BarrierCache {
    pub fn new(master: impl Into<String>, latency: u32) -> Self {
        Self {
            master: master.into(),
            slots: Vec::new(),
            idle: Vec::new(),
            vacant: Vec::new(),
            next_id: 1,
            latency,
        }
    }

    /// Hand out an idle barrier reset to height 0, or construct a new one
    pub fn acquire(&mut self) -> BarrierHandle {
        if let Some(index) = self.idle.pop() {
            if let Some(slot) = self.slots[index].as_mut() {
                slot.in_use = true;
                slot.barrier.clear();
                slot.barrier.set_latency(self.latency);
                tracing::trace!("{}: reusing barrier {}", self.master, slot.barrier.id());
                return BarrierHandle {
                    slot: index,
                    barrier: slot.barrier.clone(),
                };
            }
        }

        let barrier = Arc::new(Barrier::new(self.next_id, self.master.clone()));
        self.next_id += 1;
        barrier.set_latency(self.latency);
        tracing::debug!("{}: allocated barrier {}", self.master, barrier.id());

        let slot = Slot {
            barrier: barrier.clone(),
            in_use: true,
        };
        let index = match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        BarrierHandle {
            slot: index,
            barrier,
        }
    }

    /// Return a barrier for reuse in a later frame
    ///
    /// The barrier must belong to this cache, be checked out and have no
    /// participant blocked in it.
    pub fn release(&mut self, handle: BarrierHandle) -> Result<()> {
        let slot = match self.slots.get_mut(handle.slot) {
            Some(Some(slot)) if Arc::ptr_eq(&slot.barrier, &handle.barrier) => slot,
            _ => {
                return Err(LockstepError::protocol(format!(
                    "{}: barrier {} does not belong to this node",
                    self.master,
                    handle.id()
                )))
            }
        };
        if !slot.in_use {
            return Err(LockstepError::protocol(format!(
                "{}: barrier {} released twice",
                self.master,
                handle.id()
            )));
        }
        let waiters = slot.barrier.pending_waiters();
        if waiters > 0 {
            return Err(LockstepError::protocol(format!(
                "{}: barrier {} released with {} pending waiters",
                self.master,
                handle.id(),
                waiters
            )));
        }

        slot.in_use = false;
        self.idle.push(handle.slot);
        Ok(())
    }

    /// Latency stamped on every barrier; trims the idle pool to `latency + 1`
    pub fn set_latency(&mut self, latency: u32) {
        self.latency = latency;
        for slot in self.slots.iter().flatten() {
            slot.barrier.set_latency(latency);
        }

        let keep = latency as usize + 1;
        while self.idle.len() > keep {
            // drop the least recently released first
            let index = self.idle.remove(0);
            if let Some(slot) = self.slots[index].take() {
                tracing::debug!("{}: trimmed idle barrier {}", self.master, slot.barrier.id());
            }
            self.vacant.push(index);
        }
    }

    pub fn latency(&self) -> u32 {
        self.latency
    }

    /// Drop every barrier
    pub fn flush(&mut self) {
        let in_use = self.in_use();
        if in_use > 0 {
            tracing::warn!("{}: flushing {} barriers still in use", self.master, in_use);
        }
        tracing::debug!("{}: flushing {} barriers", self.master, self.allocated());
        self.slots.clear();
        self.idle.clear();
        self.vacant.clear();
    }

    /// Barriers currently constructed
    pub fn allocated(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Barriers ready for reuse
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Barriers checked out
    pub fn in_use(&self) -> usize {
        self.allocated() - self.idle()
    }
}
