//! Managed background threads.
//!
//! A [`ManagedThread`] runs a [`ThreadBody`] on a dedicated OS thread:
//! `ready_to_run` once, then `thread_loop` repeatedly until the body asks to
//! stop or an exit is requested. The thread can be restarted with `run` after
//! it has fully exited.
//!
//! # Ownership
//!
//! `run` moves one strong handle into the spawned thread, so the object cannot
//! disappear while the thread starts up. The thread then keeps only a weak
//! handle between iterations: if every external handle is dropped, the current
//! iteration completes and the thread ends instead of keeping itself alive.
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use looper_runtime::thread::{ManagedThread, ThreadBody, PRIORITY_DEFAULT};
//!
//! struct CountToThree(AtomicUsize);
//!
//! impl ThreadBody for CountToThree {
//!     fn thread_loop(&self) -> bool {
//!         self.0.fetch_add(1, Ordering::SeqCst) < 2
//!     }
//! }
//!
//! let thread = ManagedThread::new(CountToThree(AtomicUsize::new(0)), false);
//! thread.run("counter", PRIORITY_DEFAULT, None).unwrap();
//! thread.join().unwrap();
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::error::ThreadError;

/// Default scheduling priority passed to [`ManagedThread::run`].
pub const PRIORITY_DEFAULT: i32 = 0;

/// Work executed by a [`ManagedThread`].
pub trait ThreadBody: Send + Sync + 'static {
    /// One-time initialization on the new thread. An error ends the thread
    /// before `thread_loop` is ever called and becomes its terminal status.
    fn ready_to_run(&self) -> Result<(), ThreadError> {
        Ok(())
    }

    /// One iteration. Return `false` to stop the thread.
    fn thread_loop(&self) -> bool;

    /// Called on the thread when `ready_to_run` or `thread_loop` fails or
    /// panics, before `join` waiters are released.
    fn thread_failed(&self, _error: &ThreadError) {}
}

/// Observable lifecycle state of a [`ManagedThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// `run` has never been called.
    NotStarted,
    /// The thread is executing its body.
    Running,
    /// An exit was requested but the current iteration has not finished.
    ExitPending,
    /// The thread has finished.
    Exited,
}

impl std::fmt::Display for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadState::NotStarted => write!(f, "not-started"),
            ThreadState::Running => write!(f, "running"),
            ThreadState::ExitPending => write!(f, "exit-pending"),
            ThreadState::Exited => write!(f, "exited"),
        }
    }
}

/// Lifecycle fields, all guarded by one lock.
struct Lifecycle {
    /// Id of the OS thread currently running the body.
    owner: Option<ThreadId>,
    /// Terminal status reported by `join`.
    status: Result<(), ThreadError>,
    started: bool,
    running: bool,
    exit_pending: bool,
    priority: i32,
}

/// A restartable background thread with cooperative exit and join.
pub struct ManagedThread {
    body: Box<dyn ThreadBody>,
    can_call_java: bool,
    lifecycle: Mutex<Lifecycle>,
    exited: Condvar,
}

impl ManagedThread {
    /// Create a thread object without starting it. See [`ManagedThread::run`].
    pub fn new<B: ThreadBody>(body: B, can_call_java: bool) -> Arc<Self> {
        Arc::new(Self {
            body: Box::new(body),
            can_call_java,
            lifecycle: Mutex::new(Lifecycle {
                owner: None,
                status: Ok(()),
                started: false,
                running: false,
                exit_pending: false,
                priority: PRIORITY_DEFAULT,
            }),
            exited: Condvar::new(),
        })
    }

    /// Start the body on a new OS thread named `name`.
    ///
    /// Success only means the thread was spawned; the body's own outcome is
    /// reported later by [`join`](Self::join).
    pub fn run(
        self: &Arc<Self>,
        name: &str,
        priority: i32,
        stack_size: Option<usize>,
    ) -> Result<(), ThreadError> {
        let mut lifecycle = self.lifecycle.lock();

        if lifecycle.running {
            return Err(ThreadError::AlreadyRunning);
        }

        // Reset so a thread can be run again after an earlier failure.
        lifecycle.status = Ok(());
        lifecycle.exit_pending = false;
        lifecycle.owner = None;
        lifecycle.priority = priority;
        lifecycle.started = true;
        lifecycle.running = true;

        let mut builder = thread::Builder::new().name(name.to_string());
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }

        let strong = Arc::clone(self);
        match builder.spawn(move || thread_main(strong)) {
            Ok(_) => {
                debug!(name, priority, "thread started");
                Ok(())
            }
            Err(e) => {
                let err = ThreadError::SpawnFailed(e.to_string());
                lifecycle.status = Err(err.clone());
                lifecycle.running = false;
                error!(name, error = %e, "failed to spawn thread");
                Err(err)
            }
        }
    }

    /// Ask the thread to exit after its current iteration. Does not block.
    pub fn request_exit(&self) {
        self.lifecycle.lock().exit_pending = true;
    }

    /// Request an exit and wait until the thread has finished.
    ///
    /// Returns [`ThreadError::WouldBlock`] when called from the thread itself.
    pub fn request_exit_and_wait(&self) -> Result<(), ThreadError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.owner == Some(thread::current().id()) {
            error!("request_exit_and_wait called from the thread's own context");
            return Err(ThreadError::WouldBlock);
        }

        lifecycle.exit_pending = true;
        while lifecycle.running {
            self.exited.wait(&mut lifecycle);
        }
        lifecycle.exit_pending = false;

        lifecycle.status.clone()
    }

    /// Wait until the thread has finished. Returns immediately if it is not
    /// running.
    ///
    /// Returns [`ThreadError::WouldBlock`] when called from the thread itself.
    pub fn join(&self) -> Result<(), ThreadError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.owner == Some(thread::current().id()) {
            error!("join called from the thread's own context");
            return Err(ThreadError::WouldBlock);
        }

        while lifecycle.running {
            self.exited.wait(&mut lifecycle);
        }

        lifecycle.status.clone()
    }

    /// Whether the body is currently running.
    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().running
    }

    /// Whether an exit has been requested.
    pub fn exit_pending(&self) -> bool {
        self.lifecycle.lock().exit_pending
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ThreadState {
        let lifecycle = self.lifecycle.lock();
        match (lifecycle.started, lifecycle.running, lifecycle.exit_pending) {
            (false, _, _) => ThreadState::NotStarted,
            (true, true, true) => ThreadState::ExitPending,
            (true, true, false) => ThreadState::Running,
            (true, false, _) => ThreadState::Exited,
        }
    }

    /// Whether the caller is running on this thread.
    pub fn is_current_thread(&self) -> bool {
        self.lifecycle.lock().owner == Some(thread::current().id())
    }

    /// Priority passed to the most recent `run`.
    pub fn priority(&self) -> i32 {
        self.lifecycle.lock().priority
    }

    /// Whether the thread was created as able to call into a managed VM.
    /// Recorded for callers; it has no effect on scheduling.
    pub fn can_call_java(&self) -> bool {
        self.can_call_java
    }
}

impl Drop for ManagedThread {
    fn drop(&mut self) {
        trace!("managed thread dropped");
    }
}

/// Entry point of the spawned OS thread.
fn thread_main(mut strong: Arc<ManagedThread>) {
    let weak = Arc::downgrade(&strong);
    strong.lifecycle.lock().owner = Some(thread::current().id());

    let mut first = true;
    loop {
        let outcome = if first {
            first = false;
            match guarded(|| strong.body.ready_to_run()) {
                // The body runs at least once after a successful start, unless
                // an exit was already requested.
                Ok(()) if !strong.exit_pending() => guarded(|| Ok(strong.body.thread_loop())),
                Ok(()) => Ok(true),
                Err(e) => Err(e),
            }
        } else {
            guarded(|| Ok(strong.body.thread_loop()))
        };

        if let Err(e) = &outcome {
            error!(error = %e, "thread body failed");
            if let Err(hook) = guarded(|| {
                strong.body.thread_failed(e);
                Ok(())
            }) {
                error!(error = %hook, "thread failure hook failed");
            }
        }

        {
            let mut lifecycle = strong.lifecycle.lock();
            let keep_going = match outcome {
                Ok(keep_going) => keep_going,
                Err(e) => {
                    lifecycle.status = Err(e);
                    false
                }
            };

            if !keep_going || lifecycle.exit_pending {
                lifecycle.exit_pending = true;
                lifecycle.running = false;
                // Cleared so a later thread reusing this id is not mistaken
                // for the owner.
                lifecycle.owner = None;
                strong.exited.notify_all();
                break;
            }
        }

        // Give up our strong handle between iterations so the object can be
        // released by its last external owner.
        drop(strong);
        strong = match weak.upgrade() {
            Some(strong) => strong,
            None => {
                trace!("managed thread released between iterations");
                break;
            }
        };
    }
}

/// Run `f`, converting a panic into [`ThreadError::Panicked`].
fn guarded<T, F>(f: F) -> Result<T, ThreadError>
where
    F: FnOnce() -> Result<T, ThreadError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(ThreadError::Panicked(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Weak;
    use std::time::{Duration, Instant};

    /// Loops until `limit` iterations have run.
    struct Counter {
        iterations: Arc<AtomicUsize>,
        limit: usize,
    }

    impl ThreadBody for Counter {
        fn thread_loop(&self) -> bool {
            self.iterations.fetch_add(1, Ordering::SeqCst) + 1 < self.limit
        }
    }

    /// Loops forever, sleeping briefly each iteration.
    struct Spinner {
        iterations: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
    }

    impl ThreadBody for Spinner {
        fn thread_loop(&self) -> bool {
            self.iterations.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            true
        }
    }

    impl Drop for Spinner {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn spinner() -> (Arc<ManagedThread>, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let iterations = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let thread = ManagedThread::new(
            Spinner {
                iterations: Arc::clone(&iterations),
                dropped: Arc::clone(&dropped),
            },
            false,
        );
        (thread, iterations, dropped)
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_run_until_body_stops() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let thread = ManagedThread::new(
            Counter {
                iterations: Arc::clone(&iterations),
                limit: 5,
            },
            false,
        );
        assert_eq!(thread.state(), ThreadState::NotStarted);

        thread.run("counter", PRIORITY_DEFAULT, None).unwrap();
        assert_eq!(thread.join(), Ok(()));

        assert_eq!(iterations.load(Ordering::SeqCst), 5);
        assert_eq!(thread.state(), ThreadState::Exited);
        assert!(!thread.is_running());
    }

    #[test]
    fn test_run_twice_conflicts() {
        let (thread, _, _) = spinner();
        thread.run("spinner", PRIORITY_DEFAULT, None).unwrap();

        assert_eq!(
            thread.run("spinner", PRIORITY_DEFAULT, None),
            Err(ThreadError::AlreadyRunning)
        );

        assert_eq!(thread.request_exit_and_wait(), Ok(()));
    }

    #[test]
    fn test_request_exit_stops_loop() {
        let (thread, iterations, _) = spinner();
        thread.run("spinner", 7, None).unwrap();
        assert_eq!(thread.priority(), 7);

        assert!(wait_until(Duration::from_secs(5), || {
            iterations.load(Ordering::SeqCst) > 2
        }));

        thread.request_exit();
        assert_eq!(thread.join(), Ok(()));
        assert_eq!(thread.state(), ThreadState::Exited);
    }

    #[test]
    fn test_rerun_after_exit() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let thread = ManagedThread::new(
            Counter {
                iterations: Arc::clone(&iterations),
                limit: 1,
            },
            false,
        );

        thread.run("once", PRIORITY_DEFAULT, None).unwrap();
        thread.join().unwrap();
        thread.run("once", PRIORITY_DEFAULT, None).unwrap();
        thread.join().unwrap();

        assert_eq!(iterations.load(Ordering::SeqCst), 2);
    }

    /// Calls a blocking wait on its own thread once, then stops.
    struct SelfWait {
        me: Weak<ManagedThread>,
        use_join: bool,
        result: Arc<Mutex<Option<Result<(), ThreadError>>>>,
    }

    impl ThreadBody for SelfWait {
        fn thread_loop(&self) -> bool {
            if let Some(me) = self.me.upgrade() {
                let outcome = if self.use_join {
                    me.join()
                } else {
                    me.request_exit_and_wait()
                };
                *self.result.lock() = Some(outcome);
            }
            false
        }
    }

    /// Run a body that holds a handle to its own thread and report what its
    /// blocking wait returned.
    fn wait_on_self(use_join: bool) -> Option<Result<(), ThreadError>> {
        let result = Arc::new(Mutex::new(None));
        let thread = {
            let result = Arc::clone(&result);
            Arc::new_cyclic(|me: &Weak<ManagedThread>| ManagedThread {
                body: Box::new(SelfWait {
                    me: me.clone(),
                    use_join,
                    result,
                }),
                can_call_java: false,
                lifecycle: Mutex::new(Lifecycle {
                    owner: None,
                    status: Ok(()),
                    started: false,
                    running: false,
                    exit_pending: false,
                    priority: PRIORITY_DEFAULT,
                }),
                exited: Condvar::new(),
            })
        };

        thread.run("self-wait", PRIORITY_DEFAULT, None).unwrap();
        assert_eq!(thread.join(), Ok(()));
        let outcome = result.lock().take();
        outcome
    }

    #[test]
    fn test_join_from_own_thread_would_block() {
        assert_eq!(wait_on_self(true), Some(Err(ThreadError::WouldBlock)));
    }

    #[test]
    fn test_exit_and_wait_from_own_thread_would_block() {
        assert_eq!(wait_on_self(false), Some(Err(ThreadError::WouldBlock)));
    }

    #[test]
    fn test_failure_hook_runs_before_join() {
        struct Failing(Arc<Mutex<Vec<String>>>);

        impl ThreadBody for Failing {
            fn thread_loop(&self) -> bool {
                panic!("loop failure");
            }

            fn thread_failed(&self, error: &ThreadError) {
                self.0.lock().push(error.to_string());
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let thread = ManagedThread::new(Failing(Arc::clone(&seen)), false);
        thread.run("failing", PRIORITY_DEFAULT, None).unwrap();

        assert!(matches!(thread.join(), Err(ThreadError::Panicked(_))));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("loop failure"));
    }

    #[test]
    fn test_panic_becomes_terminal_status() {
        struct Panics;

        impl ThreadBody for Panics {
            fn thread_loop(&self) -> bool {
                panic!("intentional panic");
            }
        }

        let thread = ManagedThread::new(Panics, false);
        thread.run("panics", PRIORITY_DEFAULT, None).unwrap();

        match thread.join() {
            Err(ThreadError::Panicked(msg)) => assert!(msg.contains("intentional panic")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn test_ready_to_run_failure_skips_loop() {
        struct FailsStartup(Arc<AtomicUsize>);

        impl ThreadBody for FailsStartup {
            fn ready_to_run(&self) -> Result<(), ThreadError> {
                Err(ThreadError::StartupFailed("no device".to_string()))
            }

            fn thread_loop(&self) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                true
            }
        }

        let loops = Arc::new(AtomicUsize::new(0));
        let thread = ManagedThread::new(FailsStartup(Arc::clone(&loops)), true);
        assert!(thread.can_call_java());
        thread.run("fails", PRIORITY_DEFAULT, None).unwrap();

        assert_eq!(
            thread.join(),
            Err(ThreadError::StartupFailed("no device".to_string()))
        );
        assert_eq!(loops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_released_when_last_handle_dropped() {
        let (thread, iterations, dropped) = spinner();
        thread.run("released", PRIORITY_DEFAULT, Some(256 * 1024)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            iterations.load(Ordering::SeqCst) > 0
        }));
        drop(thread);

        assert!(wait_until(Duration::from_secs(5), || dropped.load(Ordering::SeqCst)));
    }
}
