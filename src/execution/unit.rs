//! Execution units: OS threads with an observable lifecycle
//!
//! A unit moves through `Stopped → Starting → Running → Stopping → Stopped`.
//! The owner drives `start`, `join` and `cancel`; the unit itself may end
//! early with `exit`. However the task ends, a teardown guard installed on
//! the unit's thread notifies the runtime's stopping listeners exactly once.
//!
//! Cancellation is cooperative: `cancel()` raises the unit's [`CancelToken`],
//! and every [`Monitor`](crate::sync::Monitor) wait on the unit's thread
//! returns promptly with a cancellation error.

use super::listener::ExecutionRuntime;
use crate::error::{LockstepError, Result};
use crate::sync::{Monitor, WaitError};
use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Lifecycle state of an execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionState::Stopped => "stopped",
            ExecutionState::Starting => "starting",
            ExecutionState::Running => "running",
            ExecutionState::Stopping => "stopping",
        };
        write!(f, "{}", name)
    }
}

/// Cancellation flag shared between a unit and its owner
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct CurrentUnit {
    name: String,
    token: CancelToken,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentUnit>> = const { RefCell::new(None) };
}

/// Cancellation token of the execution unit running on this thread, if any
pub fn current_cancel_token() -> Option<CancelToken> {
    CURRENT.with(|current| current.borrow().as_ref().map(|unit| unit.token.clone()))
}

/// Name of the execution unit running on this thread, if any
pub fn current_unit_name() -> Option<String> {
    CURRENT.with(|current| current.borrow().as_ref().map(|unit| unit.name.clone()))
}

#[derive(Debug)]
struct UnitStatus {
    state: ExecutionState,
    thread: Option<ThreadId>,
    /// Set by the teardown guard once the stopping listeners ran
    finished: bool,
}

/// Parts of a unit that do not depend on the task's result type
#[derive(Debug)]
struct UnitShared {
    name: String,
    runtime: Arc<ExecutionRuntime>,
    status: Monitor<UnitStatus>,
}

impl UnitShared {
    fn is_current(&self) -> bool {
        self.status.lock().thread == Some(thread::current().id())
    }
}

struct UnitInner<T> {
    shared: Arc<UnitShared>,
    token: Mutex<CancelToken>,
    handle: Mutex<Option<JoinHandle<T>>>,
}

/// Unwind payload carrying the result passed to `exit`
struct UnitExit<T>(T);

/// Installed on the unit's thread before the task runs; dropping it is the
/// single teardown path for return, exit, cancellation and panic.
struct Teardown {
    shared: Arc<UnitShared>,
}

impl Teardown {
    fn install(shared: Arc<UnitShared>, token: CancelToken) -> Self {
        CURRENT.with(|current| {
            *current.borrow_mut() = Some(CurrentUnit {
                name: shared.name.clone(),
                token,
            });
        });
        shared.status.update(|s| s.thread = Some(thread::current().id()));
        Self { shared }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.shared.status.update(|s| s.state = ExecutionState::Stopping);
        self.shared.runtime.notify_stopping(&self.shared.name);
        CURRENT.with(|current| current.borrow_mut().take());
        self.shared.status.update(|s| s.finished = true);
        tracing::info!("Execution unit {} stopping", self.shared.name);
    }
}

/// Handle passed to a unit's task
pub struct UnitContext<T> {
    shared: Arc<UnitShared>,
    token: CancelToken,
    _result: PhantomData<fn(T)>,
}

impl<T: Send + 'static> UnitContext<T> {
    /// Name of the unit
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the owner requested cancellation
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The unit's cancellation token
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    /// End the unit immediately with `result`
    pub fn exit(&self, result: T) -> ! {
        tracing::info!("Exiting execution unit {}", self.shared.name);
        panic::resume_unwind(Box::new(UnitExit(result)))
    }
}

/// A named OS thread with lifecycle notification
///
/// The handle is cheap to clone; all clones refer to the same unit.
pub struct ExecutionUnit<T> {
    inner: Arc<UnitInner<T>>,
}

impl<T> Clone for ExecutionUnit<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ExecutionUnit<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.inner.shared.status.lock();
        f.debug_struct("ExecutionUnit")
            .field("name", &self.inner.shared.name)
            .field("state", &status.state)
            .finish()
    }
}

impl<T: Send + 'static> ExecutionUnit<T> {
    /// Create a stopped unit bound to `runtime`
    pub fn new(name: impl Into<String>, runtime: Arc<ExecutionRuntime>) -> Self {
        Self {
            inner: Arc::new(UnitInner {
                shared: Arc::new(UnitShared {
                    name: name.into(),
                    runtime,
                    status: Monitor::new(UnitStatus {
                        state: ExecutionState::Stopped,
                        thread: None,
                        finished: false,
                    }),
                }),
                token: Mutex::new(CancelToken::new()),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Name of the unit
    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ExecutionState {
        self.inner.shared.status.lock().state
    }

    /// Whether the caller runs on this unit's thread
    pub fn is_current(&self) -> bool {
        self.inner.shared.is_current()
    }

    /// Whether cancellation of the current run was requested
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_cancelled()
    }

    /// Spawn the unit's thread running `task`
    ///
    /// Only valid while stopped. Returns once the new thread notified the
    /// started listeners and the unit is running.
    pub fn start<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&UnitContext<T>) -> T + Send + 'static,
    {
        {
            let mut status = self.inner.shared.status.lock();
            if status.state != ExecutionState::Stopped {
                return Err(LockstepError::protocol(format!(
                    "cannot start unit {} while {}",
                    self.inner.shared.name, status.state
                )));
            }
            status.state = ExecutionState::Starting;
            status.thread = None;
            status.finished = false;
        }

        let token = CancelToken::new();
        *self.inner.token.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        let shared = self.inner.shared.clone();
        let spawned = thread::Builder::new()
            .name(self.inner.shared.name.clone())
            .spawn(move || run_unit(shared, token, task));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Could not create thread for {}: {}", self.inner.shared.name, e);
                self.inner
                    .shared
                    .status
                    .update(|s| s.state = ExecutionState::Stopped);
                return Err(LockstepError::Io(e).with_context(format!(
                    "spawning unit {}",
                    self.inner.shared.name
                )));
            }
        };
        *self.inner.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        // sync with the child's entry
        let status = self.inner.shared.status.lock();
        let _ = self
            .inner
            .shared
            .status
            .wait_until(status, None, |s| s.state != ExecutionState::Starting);

        tracing::info!("Execution unit {} started", self.inner.shared.name);
        Ok(())
    }

    /// Wait for the unit to stop and collect its result
    ///
    /// On timeout the unit is left running or stopping.
    pub fn join(&self, timeout: Option<Duration>) -> Result<T> {
        if self.is_current() {
            return Err(LockstepError::protocol(format!(
                "unit {} cannot join itself",
                self.inner.shared.name
            )));
        }

        let status = self.inner.shared.status.lock();
        if status.state == ExecutionState::Stopped {
            return Err(LockstepError::protocol(format!(
                "unit {} is not running",
                self.inner.shared.name
            )));
        }

        tracing::debug!("Joining unit {}", self.inner.shared.name);
        let (status, waited) = self
            .inner
            .shared
            .status
            .wait_until(status, timeout, |s| s.finished);
        drop(status);

        match waited {
            Ok(()) => {}
            Err(WaitError::TimedOut) => {
                return Err(LockstepError::Timeout(format!(
                    "joining unit {}",
                    self.inner.shared.name
                )))
            }
            Err(WaitError::Cancelled) => {
                return Err(LockstepError::Cancelled(format!(
                    "joining unit {}",
                    self.inner.shared.name
                )))
            }
        }

        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                LockstepError::protocol(format!("unit {} already joined", self.inner.shared.name))
            })?;

        let joined = handle.join();
        self.inner
            .shared
            .status
            .update(|s| s.state = ExecutionState::Stopped);

        joined.map_err(|payload| LockstepError::ThreadPanic(panic_message(payload.as_ref())))
    }

    /// Request asynchronous termination of the unit
    ///
    /// Best-effort: blocking waits on the unit's thread are interrupted, and
    /// the task is expected to return once it observes the cancellation.
    pub fn cancel(&self) -> Result<()> {
        if self.is_current() {
            return Err(LockstepError::protocol(format!(
                "unit {} cannot cancel itself",
                self.inner.shared.name
            )));
        }

        {
            let mut status = self.inner.shared.status.lock();
            if status.state == ExecutionState::Stopped {
                tracing::debug!("Cancel of stopped unit {} ignored", self.inner.shared.name);
                return Ok(());
            }
            status.state = ExecutionState::Stopping;
        }
        self.inner.shared.status.notify_all();

        tracing::info!("Cancelling unit {}", self.inner.shared.name);
        self.inner
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        Ok(())
    }

    /// End the unit from its own thread with `result`
    ///
    /// Rejected from any other thread; never returns on the unit's thread.
    pub fn exit(&self, result: T) -> Result<()> {
        if !self.is_current() {
            return Err(LockstepError::protocol(format!(
                "exit of unit {} called from another thread",
                self.inner.shared.name
            )));
        }
        tracing::info!("Exiting execution unit {}", self.inner.shared.name);
        panic::resume_unwind(Box::new(UnitExit(result)))
    }
}

fn run_unit<T, F>(shared: Arc<UnitShared>, token: CancelToken, task: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&UnitContext<T>) -> T,
{
    let _teardown = Teardown::install(shared.clone(), token.clone());

    shared.runtime.notify_started(&shared.name);
    shared.status.update(|s| {
        if s.state == ExecutionState::Starting {
            s.state = ExecutionState::Running;
        }
    });

    let context = UnitContext {
        shared: shared.clone(),
        token,
        _result: PhantomData,
    };

    match panic::catch_unwind(AssertUnwindSafe(|| task(&context))) {
        Ok(result) => result,
        Err(payload) => match payload.downcast::<UnitExit<T>>() {
            Ok(exit) => exit.0,
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionListener, UnitTracker};
    use crate::sync::Monitor;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        started: AtomicUsize,
        stopping: AtomicUsize,
    }

    impl ExecutionListener for CountingListener {
        fn on_started(&self, _unit: &str) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stopping(&self, _unit: &str) {
            self.stopping.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runtime_with_counter() -> (Arc<ExecutionRuntime>, Arc<CountingListener>) {
        let runtime = ExecutionRuntime::new();
        let counter = Arc::new(CountingListener::default());
        runtime.add_listener(counter.clone());
        (runtime, counter)
    }

    #[test]
    fn test_start_and_join_returns_result() {
        let (runtime, counter) = runtime_with_counter();
        let unit = ExecutionUnit::new("worker", runtime);

        unit.start(|ctx| ctx.name().len()).unwrap();
        assert_eq!(unit.join(Some(Duration::from_secs(5))).unwrap(), 6);
        assert_eq!(unit.state(), ExecutionState::Stopped);
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);
        assert_eq!(counter.stopping.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let runtime = ExecutionRuntime::new();
        let unit = ExecutionUnit::new("worker", runtime);
        let gate = Arc::new(Monitor::new(false));
        let task_gate = gate.clone();

        unit.start(move |_| {
            let guard = task_gate.lock();
            let _ = task_gate.wait_until(guard, Some(Duration::from_secs(5)), |open| *open);
        })
        .unwrap();

        let err = unit.start(|_| ()).unwrap_err();
        assert!(err.is_protocol_violation());

        gate.update(|open| *open = true);
        unit.join(Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn test_unit_can_restart_after_join() {
        let (runtime, counter) = runtime_with_counter();
        let unit = ExecutionUnit::new("worker", runtime);

        unit.start(|_| 1).unwrap();
        assert_eq!(unit.join(None).unwrap(), 1);
        unit.start(|_| 2).unwrap();
        assert_eq!(unit.join(None).unwrap(), 2);
        assert_eq!(counter.stopping.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_exit_from_own_thread() {
        let (runtime, counter) = runtime_with_counter();
        let unit: ExecutionUnit<u32> = ExecutionUnit::new("exiting", runtime);
        let inner = unit.clone();

        unit.start(move |_| {
            inner.exit(42).unwrap();
            0
        })
        .unwrap();

        assert_eq!(unit.join(Some(Duration::from_secs(5))).unwrap(), 42);
        assert_eq!(counter.stopping.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_context_exit() {
        let runtime = ExecutionRuntime::new();
        let unit: ExecutionUnit<&'static str> = ExecutionUnit::new("ctx-exit", runtime);
        unit.start(|ctx| ctx.exit("early")).unwrap();
        assert_eq!(unit.join(None).unwrap(), "early");
    }

    #[test]
    fn test_exit_from_other_thread_is_rejected() {
        let runtime = ExecutionRuntime::new();
        let unit: ExecutionUnit<u32> = ExecutionUnit::new("worker", runtime);
        let err = unit.exit(1).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_self_join_and_self_cancel_are_rejected() {
        let runtime = ExecutionRuntime::new();
        let unit: ExecutionUnit<(bool, bool)> = ExecutionUnit::new("selfish", runtime);
        let inner = unit.clone();

        unit.start(move |_| {
            let join = inner.join(Some(Duration::from_millis(10)));
            let cancel = inner.cancel();
            (
                join.is_err_and(|e| e.is_protocol_violation()),
                cancel.is_err_and(|e| e.is_protocol_violation()),
            )
        })
        .unwrap();

        assert_eq!(unit.join(None).unwrap(), (true, true));
    }

    #[test]
    fn test_join_never_started_is_rejected() {
        let runtime = ExecutionRuntime::new();
        let unit: ExecutionUnit<()> = ExecutionUnit::new("idle", runtime);
        assert!(unit.join(None).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_join_timeout_leaves_unit_alive() {
        let runtime = ExecutionRuntime::new();
        let unit: ExecutionUnit<()> = ExecutionUnit::new("slow", runtime);

        unit.start(|ctx| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        let err = unit.join(Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, LockstepError::Timeout(_)));
        assert!(matches!(
            unit.state(),
            ExecutionState::Running | ExecutionState::Stopping
        ));

        unit.cancel().unwrap();
        unit.join(Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn test_cancel_interrupts_monitor_wait() {
        let (runtime, counter) = runtime_with_counter();
        let unit = ExecutionUnit::new("blocked", runtime);

        unit.start(|_| {
            let never = Monitor::new(false);
            let guard = never.lock();
            let (_guard, result) = never.wait_until(guard, None, |v| *v);
            result
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        unit.cancel().unwrap();
        let result = unit.join(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(result, Err(WaitError::Cancelled));
        assert_eq!(counter.stopping.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_task_still_notifies() {
        let runtime = ExecutionRuntime::new();
        let tracker = UnitTracker::new();
        runtime.add_listener(tracker.clone());
        let unit: ExecutionUnit<()> = ExecutionUnit::new("doomed", runtime);

        unit.start(|_| panic!("render failure")).unwrap();
        let err = unit.join(Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, LockstepError::ThreadPanic(ref m) if m.contains("render failure")));
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_current_unit_is_visible_on_thread() {
        let runtime = ExecutionRuntime::new();
        let unit = ExecutionUnit::new("visible", runtime);
        unit.start(|_| current_unit_name()).unwrap();
        assert_eq!(unit.join(None).unwrap().as_deref(), Some("visible"));
        assert!(current_unit_name().is_none());
    }
}
