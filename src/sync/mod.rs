//! Blocking synchronization primitives
//!
//! - [`Monitor`] - A value with change notification and cancellable waits
//! - [`Barrier`] - Rendezvous point for a configurable number of participants

pub mod barrier;
pub mod monitor;

pub use barrier::{Barrier, BarrierId};
pub use monitor::{Monitor, WaitError, CANCEL_POLL_INTERVAL};
