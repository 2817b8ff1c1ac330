//! Execution listeners and the runtime that owns them
//!
//! Every execution unit is created against an [`ExecutionRuntime`]. When any
//! unit of that runtime starts or stops, all listeners registered with the
//! runtime are called, so subsystems can observe thread lifecycle without
//! knowing who owns the threads.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Observer of execution unit lifecycle
///
/// Both callbacks run on the unit's own thread while the runtime's listener
/// lock is held, so they must not register listeners themselves.
pub trait ExecutionListener: Send + Sync {
    /// Called on the new thread before the unit's task runs
    fn on_started(&self, unit: &str);

    /// Called on the unit's thread once, however the unit ends
    fn on_stopping(&self, unit: &str);
}

/// Observer set shared by all execution units of one process context
#[derive(Default)]
pub struct ExecutionRuntime {
    listeners: Mutex<Vec<Arc<dyn ExecutionListener>>>,
}

impl std::fmt::Debug for ExecutionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRuntime")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl ExecutionRuntime {
    /// Create a runtime with no listeners
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener for all units of this runtime
    pub fn add_listener(&self, listener: Arc<dyn ExecutionListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, listener: &Arc<dyn ExecutionListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn notify_started(&self, unit: &str) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!("Calling {} started listeners for {}", listeners.len(), unit);
        for listener in listeners.iter() {
            listener.on_started(unit);
        }
    }

    pub(crate) fn notify_stopping(&self, unit: &str) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!("Calling {} stopping listeners for {}", listeners.len(), unit);
        for listener in listeners.iter() {
            listener.on_stopping(unit);
        }
    }
}

/// Listener that keeps track of which units are currently alive
///
/// A unit name appears once per live instance; names are counted so two
/// units sharing a name are tracked independently.
#[derive(Debug, Default)]
pub struct UnitTracker {
    live: Mutex<BTreeMap<String, usize>>,
}

impl UnitTracker {
    /// Create a tracker ready to be registered with a runtime
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Names of the units that started and have not stopped yet
    pub fn live_units(&self) -> Vec<String> {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.iter()
            .flat_map(|(name, count)| std::iter::repeat(name.clone()).take(*count))
            .collect()
    }

    /// Number of live units
    pub fn live_count(&self) -> usize {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.values().sum()
    }
}

impl ExecutionListener for UnitTracker {
    fn on_started(&self, unit: &str) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        *live.entry(unit.to_string()).or_insert(0) += 1;
    }

    fn on_stopping(&self, unit: &str) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = live.get_mut(unit) {
            *count -= 1;
            if *count == 0 {
                live.remove(unit);
            }
        }
    }
}
