//! Message envelopes.
//!
//! A [`Message`] is a `what` code plus a small keyed table of typed values,
//! addressed to a [`Handler`]. Posting a message moves it into the target
//! looper's queue; the looper later hands it to the handler on its own thread.
//!
//! # Example
//!
//! ```rust
//! use looper_runtime::Message;
//!
//! let mut msg = Message::new(7);
//! msg.set_int32("x", 42);
//! msg.set_string("name", "decoder");
//!
//! assert_eq!(msg.find_int32("x"), Some(42));
//! assert_eq!(msg.find_string("name"), Some("decoder"));
//! // Lookups are typed: an int32 is not a string.
//! assert_eq!(msg.find_string("x"), None);
//! ```

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use smol_str::SmolStr;
use tracing::{trace, warn};

use crate::error::{LooperError, Result};
use crate::handler::{Handler, HandlerId};
use crate::looper::Looper;
use crate::token::ReplyToken;

/// Maximum number of distinct keys a message can hold.
pub const MAX_ENTRIES: usize = 256;

/// An integer rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

/// An address-sized opaque value. The runtime stores and returns it but never
/// dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpaquePtr(usize);

impl OpaquePtr {
    pub const NULL: OpaquePtr = OpaquePtr(0);

    pub fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Kind tag of a stored [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int32,
    Int64,
    Size,
    Float,
    Double,
    Pointer,
    String,
    Rect,
    Object,
    Message,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int32 => "int32_t",
            ValueKind::Int64 => "int64_t",
            ValueKind::Size => "size_t",
            ValueKind::Float => "float",
            ValueKind::Double => "double",
            ValueKind::Pointer => "void *",
            ValueKind::String => "string",
            ValueKind::Rect => "Rect",
            ValueKind::Object => "object",
            ValueKind::Message => "Message",
        };
        f.write_str(name)
    }
}

/// A value stored under a message key.
#[derive(Clone)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Size(usize),
    Float(f32),
    Double(f64),
    Pointer(OpaquePtr),
    String(String),
    Rect(Rect),
    /// A shared, type-erased object. Duplicating the message shares it.
    Object(Arc<dyn Any + Send + Sync>),
    /// A nested message. Duplicating the message copies it.
    Message(Box<Message>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int32(_) => ValueKind::Int32,
            Value::Int64(_) => ValueKind::Int64,
            Value::Size(_) => ValueKind::Size,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Pointer(_) => ValueKind::Pointer,
            Value::String(_) => ValueKind::String,
            Value::Rect(_) => ValueKind::Rect,
            Value::Object(_) => ValueKind::Object,
            Value::Message(_) => ValueKind::Message,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int32(v) => write!(f, "Int32({})", v),
            Value::Int64(v) => write!(f, "Int64({})", v),
            Value::Size(v) => write!(f, "Size({})", v),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::Double(v) => write!(f, "Double({})", v),
            Value::Pointer(p) => write!(f, "Pointer({:#x})", p.addr()),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Rect(r) => write!(f, "{:?}", r),
            Value::Object(o) => write!(f, "Object({:p})", Arc::as_ptr(o)),
            Value::Message(m) => write!(f, "Message({:?})", m),
        }
    }
}

/// A typed, keyed record addressed to a handler.
#[derive(Debug, Clone, Default)]
pub struct Message {
    what: u32,
    /// Handler id captured by `set_target`, kept for diagnostics.
    target: HandlerId,
    handler: Weak<Handler>,
    looper: Weak<Looper>,
    entries: IndexMap<SmolStr, Value>,
    /// Reserved slot for a synchronous request's reply token.
    reply_token: Option<ReplyToken>,
}

impl Message {
    /// Create an untargeted message.
    pub fn new(what: u32) -> Self {
        Self {
            what,
            ..Self::default()
        }
    }

    /// Create a message targeted at `handler`.
    pub fn with_target(what: u32, handler: &Handler) -> Self {
        let mut msg = Self::new(what);
        msg.set_target(Some(handler));
        msg
    }

    pub fn what(&self) -> u32 {
        self.what
    }

    pub fn set_what(&mut self, what: u32) {
        self.what = what;
    }

    /// Id of the handler this message was targeted at, or
    /// [`HandlerId::UNREGISTERED`].
    pub fn target(&self) -> HandlerId {
        self.target
    }

    /// Bind the message to `handler` and the looper it is registered on right
    /// now. Re-registering the handler later does not affect this message.
    /// `None` clears the target.
    pub fn set_target(&mut self, handler: Option<&Handler>) {
        match handler {
            Some(handler) => {
                let (id, looper) = handler.binding();
                self.target = id;
                self.handler = handler.downgrade();
                self.looper = looper;
            }
            None => {
                self.target = HandlerId::UNREGISTERED;
                self.handler = Weak::new();
                self.looper = Weak::new();
            }
        }
    }

    /// Deep copy. Nested messages are copied, shared objects are shared.
    pub fn dup(&self) -> Message {
        self.clone()
    }

    /// Remove all entries and any pending reply token.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.reply_token = None;
    }

    pub fn count_entries(&self) -> usize {
        self.entries.len()
    }

    /// Key of the entry at `index`, in insertion order.
    pub fn entry_name_at(&self, index: usize) -> Option<&str> {
        self.entries.get_index(index).map(|(key, _)| key.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Kind of the value stored under `key`.
    pub fn kind_of(&self, key: &str) -> Option<ValueKind> {
        self.entries.get(key).map(Value::kind)
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.shift_remove(key).is_some()
    }

    /// Store `value` under `key`, replacing (and dropping) any previous value.
    ///
    /// # Panics
    ///
    /// Panics if the message already holds [`MAX_ENTRIES`] other keys.
    pub fn set_value(&mut self, key: &str, value: Value) {
        if let Some(slot) = self.entries.get_mut(key) {
            *slot = value;
            return;
        }

        assert!(
            self.entries.len() < MAX_ENTRIES,
            "message {:#x} exceeds {} entries",
            self.what,
            MAX_ENTRIES
        );
        self.entries.insert(SmolStr::new(key), value);
    }

    pub fn find_value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn set_int32(&mut self, key: &str, value: i32) {
        self.set_value(key, Value::Int32(value));
    }

    pub fn set_int64(&mut self, key: &str, value: i64) {
        self.set_value(key, Value::Int64(value));
    }

    pub fn set_size(&mut self, key: &str, value: usize) {
        self.set_value(key, Value::Size(value));
    }

    pub fn set_float(&mut self, key: &str, value: f32) {
        self.set_value(key, Value::Float(value));
    }

    pub fn set_double(&mut self, key: &str, value: f64) {
        self.set_value(key, Value::Double(value));
    }

    pub fn set_pointer(&mut self, key: &str, value: OpaquePtr) {
        self.set_value(key, Value::Pointer(value));
    }

    pub fn set_string(&mut self, key: &str, value: impl Into<String>) {
        self.set_value(key, Value::String(value.into()));
    }

    pub fn set_rect(&mut self, key: &str, left: i32, top: i32, right: i32, bottom: i32) {
        self.set_value(key, Value::Rect(Rect::new(left, top, right, bottom)));
    }

    pub fn set_object(&mut self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        self.set_value(key, Value::Object(value));
    }

    pub fn set_message(&mut self, key: &str, value: Message) {
        self.set_value(key, Value::Message(Box::new(value)));
    }

    pub fn find_int32(&self, key: &str) -> Option<i32> {
        match self.entries.get(key)? {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn find_int64(&self, key: &str) -> Option<i64> {
        match self.entries.get(key)? {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn find_size(&self, key: &str) -> Option<usize> {
        match self.entries.get(key)? {
            Value::Size(v) => Some(*v),
            _ => None,
        }
    }

    pub fn find_float(&self, key: &str) -> Option<f32> {
        match self.entries.get(key)? {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn find_double(&self, key: &str) -> Option<f64> {
        match self.entries.get(key)? {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn find_pointer(&self, key: &str) -> Option<OpaquePtr> {
        match self.entries.get(key)? {
            Value::Pointer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn find_string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key)? {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn find_rect(&self, key: &str) -> Option<Rect> {
        match self.entries.get(key)? {
            Value::Rect(v) => Some(*v),
            _ => None,
        }
    }

    pub fn find_object(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        match self.entries.get(key)? {
            Value::Object(v) => Some(Arc::clone(v)),
            _ => None,
        }
    }

    pub fn find_message(&self, key: &str) -> Option<&Message> {
        match self.entries.get(key)? {
            Value::Message(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Any numeric value, converted to `f32`.
    pub fn find_as_float(&self, key: &str) -> Option<f32> {
        match self.entries.get(key)? {
            Value::Int32(v) => Some(*v as f32),
            Value::Int64(v) => Some(*v as f32),
            Value::Size(v) => Some(*v as f32),
            Value::Float(v) => Some(*v),
            Value::Double(v) => Some(*v as f32),
            _ => None,
        }
    }

    /// An int32 or int64 value, widened to `i64`.
    pub fn find_as_int64(&self, key: &str) -> Option<i64> {
        match self.entries.get(key)? {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Queue the message on its target's looper `delay_us` microseconds from
    /// now. A zero or negative delay means "as soon as possible".
    ///
    /// Fails with [`LooperError::NotFound`] if the message has no target or
    /// the target's looper is gone.
    pub fn post(self, delay_us: i64) -> Result<()> {
        let looper = self.resolve_looper()?;
        looper.post(self, delay_us);
        Ok(())
    }

    /// Queue the message for delivery at the absolute time `when_us`, on the
    /// [`Looper::now_us`] clock.
    pub fn post_at(self, when_us: i64) -> Result<()> {
        let looper = self.resolve_looper()?;
        looper.post_at(self, when_us);
        Ok(())
    }

    /// Post the message and block until the handler replies.
    ///
    /// Fails with [`LooperError::NotFound`] if the looper is gone or stops
    /// before a reply arrives. Must not be called from the target looper's
    /// own thread: that thread cannot deliver the request while it waits.
    pub fn post_and_await_response(mut self) -> Result<Message> {
        let looper = self.resolve_looper()?;

        let token = looper.create_reply_token();
        self.reply_token = Some(token.clone());

        looper.post(self, 0);
        looper.await_response(&token)
    }

    /// If the sender is blocked in [`post_and_await_response`], take the reply
    /// token out of the message. The handler must answer it with
    /// [`post_reply`]. Returns `None` on every later call.
    ///
    /// [`post_and_await_response`]: Message::post_and_await_response
    /// [`post_reply`]: Message::post_reply
    pub fn sender_awaits_response(&mut self) -> Option<ReplyToken> {
        self.reply_token.take()
    }

    /// Send this message as the response for `token`.
    pub fn post_reply(self, token: &ReplyToken) -> Result<()> {
        let Some(looper) = token.looper() else {
            warn!("failed to post reply as target looper is gone");
            return Err(LooperError::NotFound);
        };
        looper.post_reply(token, self)
    }

    /// Hand the message to its target handler on the current thread.
    pub(crate) fn deliver(self) {
        let Some(handler) = self.handler.upgrade() else {
            warn!(handler = %self.target, what = self.what, "failed to deliver message as target handler is gone");
            return;
        };
        trace!(handler = %self.target, what = self.what, "delivering message");
        handler.deliver_message(self);
    }

    fn resolve_looper(&self) -> Result<Arc<Looper>> {
        self.looper.upgrade().ok_or_else(|| {
            warn!(handler = %self.target, what = self.what, "failed to post message as target looper is gone");
            LooperError::NotFound
        })
    }
}

/// Render `what` as a four-character code when it is printable.
fn fourcc(what: u32) -> Option<String> {
    let bytes = what.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        Some(bytes.iter().map(|b| *b as char).collect())
    } else {
        None
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match fourcc(self.what) {
            Some(code) => write!(f, "Message(what = '{}'", code)?,
            None => write!(f, "Message(what = {:#010x}", self.what)?,
        }
        if self.target.is_registered() {
            write!(f, ", target = {}", self.target)?;
        }
        writeln!(f, ") = {{")?;

        for (key, value) in &self.entries {
            write!(f, "  {} {} = ", value.kind(), key)?;
            match value {
                Value::Int32(v) => writeln!(f, "{}", v)?,
                Value::Int64(v) => writeln!(f, "{}", v)?,
                Value::Size(v) => writeln!(f, "{}", v)?,
                Value::Float(v) => writeln!(f, "{}f", v)?,
                Value::Double(v) => writeln!(f, "{}", v)?,
                Value::Pointer(p) => writeln!(f, "{:#x}", p.addr())?,
                Value::String(s) => writeln!(f, "\"{}\"", s)?,
                Value::Rect(r) => writeln!(f, "{}, {} to {}, {}", r.left, r.top, r.right, r.bottom)?,
                Value::Object(o) => writeln!(f, "{:p}", Arc::as_ptr(o))?,
                Value::Message(m) => {
                    for (i, line) in m.to_string().lines().enumerate() {
                        if i == 0 {
                            writeln!(f, "{}", line)?;
                        } else {
                            writeln!(f, "  {}", line)?;
                        }
                    }
                }
            }
        }

        write!(f, "}}")
    }
}
