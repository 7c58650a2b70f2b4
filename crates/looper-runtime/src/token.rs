//! One-shot reply tokens for synchronous requests.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::{LooperError, Result};
use crate::looper::Looper;
use crate::message::Message;

struct ReplySlot {
    replied: bool,
    reply: Option<Message>,
}

struct TokenInner {
    looper: Weak<Looper>,
    slot: Mutex<ReplySlot>,
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        trace!("reply token dropped");
    }
}

/// Pairs a blocked `post_and_await_response` call with its eventual reply.
///
/// Minted by the looper that carries the request, handed to the handler via
/// [`Message::sender_awaits_response`], and answered exactly once with
/// [`Message::post_reply`]. Clones refer to the same token.
#[derive(Clone)]
pub struct ReplyToken {
    inner: Arc<TokenInner>,
}

impl ReplyToken {
    pub(crate) fn new(looper: Weak<Looper>) -> Self {
        trace!("reply token created");
        Self {
            inner: Arc::new(TokenInner {
                looper,
                slot: Mutex::new(ReplySlot {
                    replied: false,
                    reply: None,
                }),
            }),
        }
    }

    /// The looper this token belongs to, if it is still alive.
    pub fn looper(&self) -> Option<Arc<Looper>> {
        self.inner.looper.upgrade()
    }

    /// Whether a reply has been set. Stays true after the reply is retrieved.
    pub fn is_answered(&self) -> bool {
        self.inner.slot.lock().replied
    }

    /// Whether both handles refer to the same token.
    pub fn ptr_eq(&self, other: &ReplyToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Store the reply. A token can only be answered once; a duplicate is
    /// rejected and dropped without touching the stored reply.
    pub(crate) fn set_reply(&self, reply: Message) -> Result<()> {
        let rejected = {
            let mut slot = self.inner.slot.lock();
            if slot.replied {
                Some(reply)
            } else {
                slot.reply = Some(reply);
                slot.replied = true;
                None
            }
        };

        match rejected {
            None => Ok(()),
            Some(reply) => {
                error!(what = reply.what(), "trying to post a duplicate reply");
                Err(LooperError::AlreadyAnswered)
            }
        }
    }

    /// Take the reply out if one has been set. Never blocks; only the first
    /// retrieval after answering returns the message.
    pub(crate) fn retrieve_reply(&self) -> Option<Message> {
        self.inner.slot.lock().reply.take()
    }
}

impl fmt::Debug for ReplyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyToken")
            .field("token", &Arc::as_ptr(&self.inner))
            .field("answered", &self.is_answered())
            .finish()
    }
}
