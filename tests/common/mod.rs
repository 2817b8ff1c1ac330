//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use lockstep::execution::ExecutionListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Poll `condition` until it holds or `timeout` elapsed
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Listener recording every callback in order
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

impl ExecutionListener for RecordingListener {
    fn on_started(&self, unit: &str) {
        self.events.lock().unwrap().push(format!("started:{}", unit));
    }

    fn on_stopping(&self, unit: &str) {
        self.events.lock().unwrap().push(format!("stopping:{}", unit));
    }
}
