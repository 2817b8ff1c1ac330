//! Thread execution with process-context lifecycle notification
//!
//! # Components
//!
//! - [`ExecutionRuntime`] - The observer set shared by all units created against it
//! - [`ExecutionListener`] - Capability notified when any unit starts or stops
//! - [`UnitTracker`] - Listener that records which units are alive
//! - [`ExecutionUnit`] - A named OS thread with an observable lifecycle
//! - [`CancelToken`] - Cooperative cancellation flag observed by blocking waits
//!
//! # Example
//!
//! ```ignore
//! use lockstep::execution::{ExecutionRuntime, ExecutionUnit, UnitTracker};
//!
//! let runtime = ExecutionRuntime::new();
//! let tracker = UnitTracker::new();
//! runtime.add_listener(tracker.clone());
//!
//! let unit = ExecutionUnit::new("node-render1", runtime);
//! unit.start(|ctx| {
//!     while !ctx.is_cancelled() {
//!         // drain commands
//!     }
//! })?;
//! unit.cancel()?;
//! unit.join(Some(std::time::Duration::from_secs(2)))?;
//! ```

pub mod listener;
pub mod unit;

pub use listener::{ExecutionListener, ExecutionRuntime, UnitTracker};
pub use unit::{
    current_cancel_token, current_unit_name, CancelToken, ExecutionState, ExecutionUnit,
    UnitContext,
};
