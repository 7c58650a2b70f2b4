//! Loopers: time-ordered message queues drained by one thread.
//!
//! A [`Looper`] owns a queue of pending messages sorted by deadline. Its
//! worker (a [`ManagedThread`], or the caller's own thread when started with
//! [`StartOptions::run_on_calling_thread`]) pops due messages and delivers
//! each one to its target handler. Messages with equal deadlines are
//! delivered in the order they were posted.
//!
//! The looper also carries the wait/notify machinery behind
//! [`Message::post_and_await_response`]: a reply lock and condition that is
//! independent of the queue lock. When both are needed the reply lock is taken
//! first.
//!
//! # Example
//!
//! ```rust
//! use std::sync::mpsc;
//! use looper_runtime::{Handler, Looper, Message, StartOptions};
//!
//! let looper = Looper::new();
//! looper.set_name("example");
//! looper.start(StartOptions::default()).unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! let tx = std::sync::Mutex::new(tx);
//! let handler = Handler::from_fn(move |_, msg: Message| {
//!     tx.lock().unwrap().send(msg.find_int32("x")).unwrap();
//! });
//! looper.register_handler(&handler).unwrap();
//!
//! let mut msg = handler.obtain_message(7);
//! msg.set_int32("x", 42);
//! msg.post(0).unwrap();
//!
//! assert_eq!(rx.recv().unwrap(), Some(42));
//! looper.stop().unwrap();
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{LooperError, Result, ThreadError};
use crate::handler::{Handler, HandlerId};
use crate::message::Message;
use crate::registry::HandlerRegistry;
use crate::thread::{ManagedThread, ThreadBody, PRIORITY_DEFAULT};
use crate::token::ReplyToken;
use crate::LooperConfig;

/// Longest single queue wait, in microseconds.
const MAX_WAIT_US: i64 = i64::MAX / 1000;

// ============================================================================
// Start Options
// ============================================================================

/// Per-`start` settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Drain the queue on the thread calling `start` instead of spawning a
    /// worker. `start` then returns only after `stop`.
    pub run_on_calling_thread: bool,
    /// Recorded on the worker thread; has no effect on scheduling.
    pub can_call_java: bool,
    /// Recorded on the worker thread; has no effect on scheduling.
    pub priority: i32,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            run_on_calling_thread: false,
            can_call_java: false,
            priority: PRIORITY_DEFAULT,
        }
    }
}

impl StartOptions {
    /// Create start options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the looper on the thread that calls `start`.
    pub fn on_calling_thread(mut self) -> Self {
        self.run_on_calling_thread = true;
        self
    }

    /// Set whether the worker thread may call into a managed VM.
    pub fn with_can_call_java(mut self, can_call_java: bool) -> Self {
        self.can_call_java = can_call_java;
        self
    }

    /// Set the worker thread priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

// ============================================================================
// Queue
// ============================================================================

struct Event {
    when_us: i64,
    message: Message,
}

struct QueueState {
    events: VecDeque<Event>,
    thread: Option<Arc<ManagedThread>>,
    running_locally: bool,
}

impl QueueState {
    fn is_active(&self) -> bool {
        self.thread.is_some() || self.running_locally
    }
}

/// State shared between a looper and its worker.
struct LooperCore {
    queue: Mutex<QueueState>,
    queue_changed: Condvar,
    replies: Mutex<()>,
    replies_changed: Condvar,
}

impl LooperCore {
    fn new() -> Self {
        Self {
            queue: Mutex::new(QueueState {
                events: VecDeque::new(),
                thread: None,
                running_locally: false,
            }),
            queue_changed: Condvar::new(),
            replies: Mutex::new(()),
            replies_changed: Condvar::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.queue.lock().is_active()
    }

    fn enqueue(&self, when_us: i64, message: Message) {
        let mut queue = self.queue.lock();

        let pos = queue
            .events
            .iter()
            .position(|event| event.when_us > when_us)
            .unwrap_or(queue.events.len());

        if pos == 0 {
            self.queue_changed.notify_one();
        }

        queue.events.insert(pos, Event { when_us, message });
    }

    /// One step of the delivery loop. Returns `false` once the looper stops.
    fn loop_once(&self) -> bool {
        let event = {
            let mut queue = self.queue.lock();
            if !queue.is_active() {
                return false;
            }

            let Some(when_us) = queue.events.front().map(|event| event.when_us) else {
                self.queue_changed.wait(&mut queue);
                return true;
            };

            let now_us = Looper::now_us();
            if when_us > now_us {
                let delay_us = (when_us - now_us).min(MAX_WAIT_US);
                let _ = self
                    .queue_changed
                    .wait_for(&mut queue, Duration::from_micros(delay_us as u64));
                return true;
            }

            queue.events.pop_front()
        };

        // Delivery may drop the last handle to the looper, so nothing past
        // this point touches looper state.
        if let Some(event) = event {
            event.message.deliver();
        }

        true
    }

    /// Deactivate after the worker died, if it is still the installed
    /// worker, and release anyone blocked on a reply.
    fn detach_failed_worker(&self) {
        let detached = {
            let mut queue = self.queue.lock();
            let installed = queue
                .thread
                .as_ref()
                .is_some_and(|thread| thread.is_current_thread());
            if installed {
                queue.thread.take()
            } else {
                None
            }
        };

        if detached.is_some() {
            warn!("looper thread failed, looper is no longer running");
            self.wake_reply_waiters();
        }
    }

    /// Leave a local run that is unwinding out of `start`.
    fn abort_local_run(&self) {
        self.queue.lock().running_locally = false;
        warn!("looper running on calling thread panicked, looper is no longer running");
        self.wake_reply_waiters();
    }

    fn wake_reply_waiters(&self) {
        let _replies = self.replies.lock();
        self.replies_changed.notify_all();
    }
}

/// Body of a looper's worker thread.
struct LooperThread {
    core: Arc<LooperCore>,
}

impl ThreadBody for LooperThread {
    fn thread_loop(&self) -> bool {
        self.core.loop_once()
    }

    fn thread_failed(&self, _error: &ThreadError) {
        self.core.detach_failed_worker();
    }
}

/// Marks a local run as finished if the calling thread unwinds out of it.
struct LocalRun<'a> {
    core: &'a LooperCore,
}

impl Drop for LocalRun<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.core.abort_local_run();
        }
    }
}

// ============================================================================
// Looper
// ============================================================================

/// A message queue and the thread that drains it.
pub struct Looper {
    name: Mutex<String>,
    config: LooperConfig,
    core: Arc<LooperCore>,
}

impl Looper {
    /// Create a stopped looper with the default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(LooperConfig::default())
    }

    /// Create a stopped looper.
    ///
    /// Also sweeps registrations left behind by loopers that no longer exist.
    pub fn with_config(config: LooperConfig) -> Arc<Self> {
        HandlerRegistry::global().unregister_stale_handlers();

        trace!(thread_name = %config.thread_name, "looper created");
        Arc::new(Self {
            name: Mutex::new(String::new()),
            config,
            core: Arc::new(LooperCore::new()),
        })
    }

    /// Microseconds on a monotonic clock shared by every looper in the
    /// process. Deadlines passed to [`Message::post_at`] use this clock.
    pub fn now_us() -> i64 {
        static BASE: OnceLock<Instant> = OnceLock::new();
        let base = BASE.get_or_init(Instant::now);
        i64::try_from(base.elapsed().as_micros()).unwrap_or(i64::MAX)
    }

    /// Name the looper. Takes effect on the next `start`.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn config(&self) -> &LooperConfig {
        &self.config
    }

    /// Start delivering messages.
    ///
    /// With [`StartOptions::run_on_calling_thread`] the calling thread becomes
    /// the worker and this call returns after [`stop`](Self::stop). Otherwise
    /// a worker thread is spawned and this returns immediately.
    pub fn start(&self, options: StartOptions) -> Result<()> {
        if options.run_on_calling_thread {
            {
                let mut queue = self.core.queue.lock();
                if queue.is_active() {
                    return Err(LooperError::AlreadyActive);
                }
                queue.running_locally = true;
            }

            debug!(name = %self.name(), "looper running on calling thread");
            let _run = LocalRun { core: &self.core };
            while self.core.loop_once() {}
            debug!(name = %self.name(), "looper left calling thread");
            return Ok(());
        }

        let mut queue = self.core.queue.lock();
        if queue.is_active() {
            return Err(LooperError::AlreadyActive);
        }

        let thread = ManagedThread::new(
            LooperThread {
                core: Arc::clone(&self.core),
            },
            options.can_call_java,
        );

        let name = self.name();
        let thread_name = if name.is_empty() {
            self.config.thread_name.as_str()
        } else {
            name.as_str()
        };

        thread.run(thread_name, options.priority, self.config.stack_size)?;
        queue.thread = Some(thread);
        Ok(())
    }

    /// Stop delivering messages.
    ///
    /// Wakes every caller blocked in `post_and_await_response` on this looper
    /// and, unless called from the worker itself, waits for the worker to exit.
    /// Messages still queued stay queued until the looper is restarted or
    /// dropped.
    pub fn stop(&self) -> Result<()> {
        let thread = {
            let mut queue = self.core.queue.lock();
            if !queue.is_active() {
                return Err(LooperError::NotActive);
            }

            let thread = queue.thread.take();
            queue.running_locally = false;
            if let Some(thread) = &thread {
                thread.request_exit();
            }
            self.core.queue_changed.notify_one();
            thread
        };

        self.core.wake_reply_waiters();

        if let Some(thread) = thread {
            if !thread.is_current_thread() {
                if let Err(e) = thread.request_exit_and_wait() {
                    warn!(name = %self.name(), error = %e, "looper thread ended with an error");
                }
            }
        }

        debug!(name = %self.name(), "looper stopped");
        Ok(())
    }

    /// Whether the looper is delivering messages.
    pub fn is_running(&self) -> bool {
        self.core.is_active()
    }

    /// Number of messages waiting in the queue.
    pub fn pending_messages(&self) -> usize {
        self.core.queue.lock().events.len()
    }

    /// Register `handler` on this looper with the process-wide registry.
    pub fn register_handler(self: &Arc<Self>, handler: &Arc<Handler>) -> Result<HandlerId> {
        HandlerRegistry::global().register_handler(self, handler)
    }

    /// Remove a registration from the process-wide registry.
    pub fn unregister_handler(&self, id: HandlerId) {
        HandlerRegistry::global().unregister_handler(id);
    }

    pub(crate) fn post(&self, message: Message, delay_us: i64) {
        let now_us = Self::now_us();
        let when_us = if delay_us > 0 {
            now_us.saturating_add(delay_us)
        } else {
            now_us
        };
        self.post_at(message, when_us);
    }

    pub(crate) fn post_at(&self, message: Message, when_us: i64) {
        self.core.enqueue(when_us, message);
    }

    pub(crate) fn create_reply_token(self: &Arc<Self>) -> ReplyToken {
        ReplyToken::new(Arc::downgrade(self))
    }

    /// Block until `token` is answered or the looper stops.
    pub(crate) fn await_response(&self, token: &ReplyToken) -> Result<Message> {
        let mut replies = self.core.replies.lock();
        loop {
            if let Some(reply) = token.retrieve_reply() {
                return Ok(reply);
            }
            if !self.core.is_active() {
                return Err(LooperError::NotFound);
            }
            self.core.replies_changed.wait(&mut replies);
        }
    }

    pub(crate) fn post_reply(&self, token: &ReplyToken, reply: Message) -> Result<()> {
        token.set_reply(reply)?;

        // Waiters check the token while holding the reply lock, so notifying
        // under it cannot slip between a waiter's check and its wait.
        self.core.wake_reply_waiters();
        Ok(())
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        let _ = self.stop();

        let dropped = std::mem::take(&mut self.core.queue.lock().events);
        if !dropped.is_empty() {
            warn!(name = %self.name.get_mut().as_str(), count = dropped.len(), "dropping undelivered messages");
        }
        drop(dropped);
        trace!("looper dropped");
    }
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Looper")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .field("pending", &self.pending_messages())
            .finish()
    }
}
