//! Message handlers.
//!
//! A [`Handler`] wraps a user-supplied [`MessageHandler`] and carries the
//! registration state the [`HandlerRegistry`](crate::HandlerRegistry) stamps
//! on it: an id and the looper it belongs to. Messages reach the handler on
//! that looper's thread, one at a time.
//!
//! # Example
//!
//! ```rust
//! use looper_runtime::{Handler, Looper, Message, StartOptions};
//!
//! let looper = Looper::new();
//! looper.start(StartOptions::default()).unwrap();
//!
//! let echo = Handler::from_fn(|_handler, mut msg: Message| {
//!     if let Some(token) = msg.sender_awaits_response() {
//!         let mut reply = Message::new(msg.what() + 1);
//!         reply.set_int32("seen", 1);
//!         reply.post_reply(&token).unwrap();
//!     }
//! });
//! looper.register_handler(&echo).unwrap();
//!
//! let reply = echo.obtain_message(7).post_and_await_response().unwrap();
//! assert_eq!(reply.what(), 8);
//! looper.stop().unwrap();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::looper::Looper;
use crate::message::Message;

/// Registry-assigned handler identity. Zero means "not registered".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HandlerId(u32);

impl HandlerId {
    /// Id carried by handlers that are not registered.
    pub const UNREGISTERED: HandlerId = HandlerId(0);

    pub fn new(id: u32) -> Self {
        HandlerId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_registered(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives messages delivered to a [`Handler`].
pub trait MessageHandler: Send + Sync + 'static {
    /// Called on the owning looper's thread for every delivered message.
    ///
    /// `handler` is the registered handler receiving the message, for posting
    /// follow-up messages to itself.
    fn on_message_received(&self, handler: &Handler, msg: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Handler, Message) + Send + Sync + 'static,
{
    fn on_message_received(&self, handler: &Handler, msg: Message) {
        self(handler, msg)
    }
}

/// Registration state, written only by the registry.
struct Binding {
    id: HandlerId,
    looper: Weak<Looper>,
}

#[derive(Default)]
struct Stats {
    delivered: u64,
    by_what: FxHashMap<u32, u32>,
}

/// A registered message sink.
pub struct Handler {
    this: Weak<Handler>,
    binding: Mutex<Binding>,
    verbose_stats: AtomicBool,
    stats: Mutex<Stats>,
    sink: Box<dyn MessageHandler>,
}

impl Handler {
    /// Wrap `sink` in an unregistered handler.
    pub fn new<H: MessageHandler>(sink: H) -> Arc<Self> {
        let handler = Arc::new_cyclic(|this| Handler {
            this: this.clone(),
            binding: Mutex::new(Binding {
                id: HandlerId::UNREGISTERED,
                looper: Weak::new(),
            }),
            verbose_stats: AtomicBool::new(false),
            stats: Mutex::new(Stats::default()),
            sink: Box::new(sink),
        });
        trace!("handler created");
        handler
    }

    /// Build a handler from a closure.
    pub fn from_fn<F>(f: F) -> Arc<Self>
    where
        F: Fn(&Handler, Message) + Send + Sync + 'static,
    {
        Self::new(f)
    }

    pub fn id(&self) -> HandlerId {
        self.binding.lock().id
    }

    /// The looper this handler is registered on, if any and still alive.
    pub fn looper(&self) -> Option<Arc<Looper>> {
        self.binding.lock().looper.upgrade()
    }

    /// A new message already targeted at this handler.
    pub fn obtain_message(&self, what: u32) -> Message {
        Message::with_target(what, self)
    }

    /// Number of messages delivered so far.
    pub fn message_count(&self) -> u64 {
        self.stats.lock().delivered
    }

    /// Enable or disable the per-`what` delivery histogram.
    pub fn set_verbose_stats(&self, enabled: bool) {
        self.verbose_stats.store(enabled, Ordering::Relaxed);
    }

    pub fn verbose_stats(&self) -> bool {
        self.verbose_stats.load(Ordering::Relaxed)
    }

    /// Delivery counts per `what` code, sorted by code. Empty unless verbose
    /// statistics were enabled while messages arrived.
    pub fn message_histogram(&self) -> Vec<(u32, u32)> {
        let stats = self.stats.lock();
        let mut histogram: Vec<_> = stats.by_what.iter().map(|(w, n)| (*w, *n)).collect();
        histogram.sort_unstable();
        histogram
    }

    /// Reset the delivery counter and histogram.
    pub fn reset_stats(&self) {
        *self.stats.lock() = Stats::default();
    }

    /// Id and looper read together, so a message never pairs the id of one
    /// registration with the looper of another.
    pub(crate) fn binding(&self) -> (HandlerId, Weak<Looper>) {
        let binding = self.binding.lock();
        (binding.id, binding.looper.clone())
    }

    pub(crate) fn downgrade(&self) -> Weak<Handler> {
        self.this.clone()
    }

    pub(crate) fn set_id(&self, id: HandlerId, looper: Weak<Looper>) {
        *self.binding.lock() = Binding { id, looper };
    }

    pub(crate) fn clear(&self) {
        *self.binding.lock() = Binding {
            id: HandlerId::UNREGISTERED,
            looper: Weak::new(),
        };
    }

    pub(crate) fn deliver_message(&self, msg: Message) {
        let what = msg.what();
        self.sink.on_message_received(self, msg);

        let mut stats = self.stats.lock();
        stats.delivered += 1;
        if self.verbose_stats() {
            *stats.by_what.entry(what).or_insert(0) += 1;
        }
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        trace!(id = %self.binding.get_mut().id, "handler dropped");
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id())
            .field("delivered", &self.message_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn recording() -> (Arc<Handler>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = Handler::from_fn(move |_, msg: Message| sink.lock().push(msg.what()));
        (handler, seen)
    }

    #[test]
    fn test_handler_id() {
        assert!(!HandlerId::UNREGISTERED.is_registered());
        assert!(HandlerId::new(4).is_registered());
        assert_eq!(HandlerId::new(4).to_string(), "4");
        assert_eq!(HandlerId::default(), HandlerId::UNREGISTERED);
    }

    #[test]
    fn test_new_handler_is_unregistered() {
        let (handler, _) = recording();
        assert_eq!(handler.id(), HandlerId::UNREGISTERED);
        assert!(handler.looper().is_none());

        let msg = handler.obtain_message(3);
        assert_eq!(msg.what(), 3);
        assert_eq!(msg.target(), HandlerId::UNREGISTERED);
    }

    #[test]
    fn test_deliver_counts_messages() {
        let (handler, seen) = recording();

        handler.deliver_message(Message::new(1));
        handler.deliver_message(Message::new(2));

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(handler.message_count(), 2);
        assert!(handler.message_histogram().is_empty());
    }

    #[test]
    fn test_verbose_histogram() {
        let (handler, _) = recording();
        handler.set_verbose_stats(true);

        for what in [5, 1, 5, 5] {
            handler.deliver_message(Message::new(what));
        }

        assert_eq!(handler.message_histogram(), vec![(1, 1), (5, 3)]);

        handler.reset_stats();
        assert_eq!(handler.message_count(), 0);
        assert!(handler.message_histogram().is_empty());
    }

    #[test]
    fn test_sink_sees_handler() {
        struct IdRecorder(Arc<AtomicU32>);

        impl MessageHandler for IdRecorder {
            fn on_message_received(&self, handler: &Handler, _msg: Message) {
                self.0.store(handler.id().as_u32(), Ordering::SeqCst);
            }
        }

        let seen = Arc::new(AtomicU32::new(99));
        let handler = Handler::new(IdRecorder(Arc::clone(&seen)));
        handler.set_id(HandlerId::new(12), Weak::new());
        handler.deliver_message(Message::new(0));

        assert_eq!(seen.load(Ordering::SeqCst), 12);
        assert_eq!(handler.id(), HandlerId::new(12));
        handler.clear();
        assert_eq!(handler.id(), HandlerId::UNREGISTERED);
    }
}
