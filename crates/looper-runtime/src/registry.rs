//! The handler registry.
//!
//! Maps handler ids to the (looper, handler) pair they were registered with.
//! Ids start at 1 and are never reused by a registry. Records hold only weak
//! references, so a registration never keeps its looper or handler alive;
//! records whose looper has gone are swept by
//! [`unregister_stale_handlers`](HandlerRegistry::unregister_stale_handlers),
//! which runs whenever a new looper is created.

use std::io;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{LooperError, Result};
use crate::handler::{Handler, HandlerId};
use crate::looper::Looper;

struct HandlerInfo {
    looper: Weak<Looper>,
    handler: Weak<Handler>,
}

struct RegistryState {
    handlers: FxHashMap<HandlerId, HandlerInfo>,
    next_id: u32,
}

/// Table of registered handlers.
pub struct HandlerRegistry {
    state: Mutex<RegistryState>,
}

static GLOBAL_REGISTRY: OnceLock<HandlerRegistry> = OnceLock::new();

impl HandlerRegistry {
    /// The process-wide registry used by [`Looper::register_handler`].
    pub fn global() -> &'static HandlerRegistry {
        GLOBAL_REGISTRY.get_or_init(HandlerRegistry::new)
    }

    /// Create an empty registry. Outside the crate only [`global`] exists,
    /// so ids stay unique for the life of the process.
    ///
    /// [`global`]: HandlerRegistry::global
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                handlers: FxHashMap::default(),
                next_id: 1,
            }),
        }
    }

    /// Bind `handler` to `looper` under a fresh id.
    ///
    /// Fails with [`LooperError::AlreadyRegistered`] if the handler already
    /// carries an id; the existing registration is left untouched.
    pub fn register_handler(
        &self,
        looper: &Arc<Looper>,
        handler: &Arc<Handler>,
    ) -> Result<HandlerId> {
        let mut state = self.state.lock();

        let current = handler.id();
        if current.is_registered() {
            warn!(id = %current, "handler is already registered");
            return Err(LooperError::AlreadyRegistered(current));
        }

        let id = HandlerId::new(state.next_id);
        state.next_id += 1;

        state.handlers.insert(
            id,
            HandlerInfo {
                looper: Arc::downgrade(looper),
                handler: Arc::downgrade(handler),
            },
        );
        handler.set_id(id, Arc::downgrade(looper));
        // The looper config can turn verbose stats on, never off.
        if looper.config().verbose_stats {
            handler.set_verbose_stats(true);
        }

        debug!(id = %id, looper = %looper.name(), "handler registered");
        Ok(id)
    }

    /// Remove a registration and clear the handler's binding. Unknown ids
    /// are ignored.
    pub fn unregister_handler(&self, id: HandlerId) {
        let handler = {
            let mut state = self.state.lock();
            let Some(info) = state.handlers.remove(&id) else {
                return;
            };

            let handler = info.handler.upgrade();
            if let Some(handler) = &handler {
                handler.clear();
            }
            handler
        };

        debug!(id = %id, "handler unregistered");
        // Released outside the lock: this may be the last handle.
        drop(handler);
    }

    /// Drop every registration whose looper no longer exists. Returns the
    /// number of records removed.
    pub fn unregister_stale_handlers(&self) -> usize {
        let mut live_loopers = Vec::new();

        let removed = {
            let mut state = self.state.lock();
            let before = state.handlers.len();

            state.handlers.retain(|id, info| match info.looper.upgrade() {
                Some(looper) => {
                    live_loopers.push(looper);
                    true
                }
                None => {
                    debug!(id = %id, "unregistering stale handler");
                    false
                }
            });

            before - state.handlers.len()
        };

        // Dropping these may run a looper's destructor, which must not happen
        // under the registry lock.
        drop(live_loopers);
        removed
    }

    /// Number of registrations, stale ones included.
    pub fn handler_count(&self) -> usize {
        self.state.lock().handlers.len()
    }

    /// Write a report of every registration to `out`.
    ///
    /// Recognized `args`: `-c`/`--clear` resets each handler's statistics
    /// after reporting them; `-von`/`-voff` turn verbose per-`what` statistics
    /// on or off.
    pub fn dump(&self, out: &mut dyn io::Write, args: &[String]) -> io::Result<()> {
        let mut clear = false;
        let mut verbose = None;
        for arg in args {
            match arg.as_str() {
                "-c" | "--clear" => clear = true,
                "-von" => verbose = Some(true),
                "-voff" => verbose = Some(false),
                _ => {}
            }
        }

        let mut entries: Vec<_> = {
            let state = self.state.lock();
            state
                .handlers
                .iter()
                .map(|(id, info)| (*id, info.looper.upgrade(), info.handler.upgrade()))
                .collect()
        };
        entries.sort_unstable_by_key(|(id, _, _)| *id);

        writeln!(out, "{} registered handlers:", entries.len())?;
        for (id, looper, handler) in &entries {
            write!(out, "  {}: ", id)?;
            match looper {
                Some(looper) => write!(out, "looper({}) ", looper.name())?,
                None => write!(out, "<stale looper> ")?,
            }

            let Some(handler) = handler else {
                writeln!(out, "<dead handler>")?;
                continue;
            };

            write!(out, "messages({})", handler.message_count())?;
            let histogram = handler.message_histogram();
            if !histogram.is_empty() {
                let counts: Vec<String> = histogram
                    .iter()
                    .map(|(what, count)| format!("{:#x}: {}", what, count))
                    .collect();
                write!(out, " {{ {} }}", counts.join(", "))?;
            }
            writeln!(out)?;

            if clear {
                handler.reset_stats();
            }
            if let Some(enabled) = verbose {
                handler.set_verbose_stats(enabled);
            }
        }

        Ok(())
    }
}
