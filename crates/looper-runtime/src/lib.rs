//! Looper Runtime - timer-ordered message loops with synchronous replies
//!
//! This crate provides a small message-passing runtime:
//! - `Looper` - A time-ordered message queue drained by one thread
//! - `Handler` - A registered sink that receives messages on its looper's thread
//! - `Message` - A typed key/value envelope addressed to a handler
//! - `ReplyToken` - One-shot pairing of a blocked request with its reply
//! - `HandlerRegistry` - Process-wide table of handler registrations
//! - `ManagedThread` - Restartable background thread with cooperative exit
//!
//! # Delivery Model
//!
//! - Messages are delivered in deadline order, FIFO among equal deadlines
//! - A handler runs synchronously on its looper's thread; blocking it stalls
//!   the looper
//! - There is no ordering between different loopers
//!
//! # Ownership
//!
//! Messages, handlers and the registry refer to loopers and handlers weakly.
//! Every operation upgrades first; a failed upgrade is reported as
//! [`LooperError::NotFound`] rather than treated as a bug. Dropping the last
//! handle to a [`Looper`] stops its thread and discards undelivered messages.
//!
//! # Logging
//!
//! Events are emitted through `tracing`. The crate never installs a
//! subscriber.

pub mod error;
pub mod handler;
pub mod looper;
pub mod message;
pub mod registry;
pub mod thread;
pub mod token;

pub use error::{LooperError, Result, ThreadError};
pub use handler::{Handler, HandlerId, MessageHandler};
pub use looper::{Looper, StartOptions};
pub use message::{Message, OpaquePtr, Rect, Value, ValueKind, MAX_ENTRIES};
pub use registry::HandlerRegistry;
pub use thread::{ManagedThread, ThreadBody, ThreadState, PRIORITY_DEFAULT};
pub use token::ReplyToken;

/// Configuration for a looper.
#[derive(Debug, Clone)]
pub struct LooperConfig {
    /// Worker thread name used when the looper has no name of its own
    pub thread_name: String,
    /// Stack size for the worker thread (bytes)
    pub stack_size: Option<usize>,
    /// Whether handlers registered on this looper keep per-`what` statistics
    pub verbose_stats: bool,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            thread_name: "ALooper".to_string(),
            stack_size: None,
            verbose_stats: false,
        }
    }
}

impl LooperConfig {
    /// Create a new looper configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback worker thread name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the stack size for the worker thread.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Enable per-`what` statistics for handlers registered on the looper.
    pub fn with_verbose_stats(mut self, enabled: bool) -> Self {
        self.verbose_stats = enabled;
        self
    }
}
