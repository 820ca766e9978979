//! Subscribers for unsolicited messages, and multi-step consumers.
//!
//! A [`Handler`] is a standing subscriber registered in a [`HandlerChain`];
//! it sees every message no blocking wait claimed, until it reports
//! [`Disposition::Done`] or is removed. A [`Consumer`] is short-lived: it
//! is handed every inbound step of one blocking call and decides when that
//! call is complete.
//!
//! The chain is copy-on-write. `add` and `remove` build a new snapshot and
//! swap it in; `dispatch` captures the current snapshot once and iterates
//! it, so handlers may register or unregister (themselves or others) from
//! inside `observe` without disturbing the pass in progress.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use crate::message::{ATTR_SEQUENCE_ID, Message};

// ── Disposition ──────────────────────────────────────────────────

/// What a handler or consumer did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not interested; let the next subscriber see it.
    Ignored,
    /// Claimed; nobody after this sees the message.
    Consumed,
    /// Finished for good. A handler is removed from the chain and the
    /// message continues to the next handler; a consumer ends its wait.
    Done,
}

// ── Handler ──────────────────────────────────────────────────────

pub trait Handler: Send + Sync {
    fn observe(&self, msg: &Message) -> Disposition;

    /// Called when the connection is torn down while still registered.
    fn close(&self) {}
}

impl<F> Handler for F
where
    F: Fn(&Message) -> Disposition + Send + Sync,
{
    fn observe(&self, msg: &Message) -> Disposition {
        self(msg)
    }
}

pub type HandlerRef = Arc<dyn Handler>;

fn same_handler(a: &HandlerRef, b: &HandlerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ── HandlerChain ─────────────────────────────────────────────────

/// Ordered, copy-on-write set of handlers. Clones share the same chain.
#[derive(Clone)]
pub struct HandlerChain {
    slot: Arc<RwLock<Arc<[HandlerRef]>>>,
}

impl Default for HandlerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerChain {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(RwLock::new(Arc::from(Vec::new()))),
        }
    }

    /// The list as it is right now. Later changes produce a new list and
    /// leave this one untouched.
    pub fn snapshot(&self) -> Arc<[HandlerRef]> {
        Arc::clone(&self.slot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn swap(&self, f: impl FnOnce(&[HandlerRef]) -> Option<Vec<HandlerRef>>) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        match f(&slot) {
            Some(next) => {
                *slot = next.into();
                true
            }
            None => false,
        }
    }

    /// Append `handler`. Registering the same handler twice is ignored;
    /// returns `false` in that case.
    pub fn add(&self, handler: HandlerRef) -> bool {
        self.swap(|current| {
            if current.iter().any(|h| same_handler(h, &handler)) {
                return None;
            }
            let mut next = current.to_vec();
            next.push(handler);
            Some(next)
        })
    }

    /// Unregister `handler`. Returns `false` if it was not registered.
    pub fn remove(&self, handler: &HandlerRef) -> bool {
        self.swap(|current| {
            let pos = current.iter().position(|h| same_handler(h, handler))?;
            let mut next = current.to_vec();
            next.remove(pos);
            Some(next)
        })
    }

    pub fn contains(&self, handler: &HandlerRef) -> bool {
        self.snapshot().iter().any(|h| same_handler(h, handler))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Offer `msg` to each handler in registration order. Returns `true`
    /// if a handler consumed it.
    pub fn dispatch(&self, msg: &Message) -> bool {
        let handlers = self.snapshot();
        for handler in handlers.iter() {
            match handler.observe(msg) {
                Disposition::Ignored => {}
                Disposition::Consumed => return true,
                Disposition::Done => {
                    info!("handler finished; removing it");
                    self.remove(handler);
                }
            }
        }
        false
    }

    /// Close and unregister every handler.
    pub fn close_all(&self) {
        let handlers = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, Arc::from(Vec::new()))
        };
        for handler in handlers.iter() {
            handler.close();
        }
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.len())
            .finish()
    }
}

// ── Consumer ─────────────────────────────────────────────────────

/// Stateful receiver for the run of messages that belongs to one blocking
/// call. `None` is an idle tick (no data within the read timeout).
pub trait Consumer {
    fn advance(&mut self, msg: Option<&Message>) -> Disposition;
}

impl<F> Consumer for F
where
    F: FnMut(Option<&Message>) -> Disposition,
{
    fn advance(&mut self, msg: Option<&Message>) -> Disposition {
        self(msg)
    }
}

// ── BuildEvents ──────────────────────────────────────────────────

/// Waits for a build or run to finish.
///
/// Tracks `BEGIN`/`END` nesting of `BuildEvent`s and reports `Done` when
/// the level returns to zero, however many sub-phases ran in between.
#[derive(Debug, Default)]
pub struct BuildEvents {
    level: i32,
}

impl BuildEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Consumer for BuildEvents {
    fn advance(&mut self, msg: Option<&Message>) -> Disposition {
        let Some(msg) = msg else {
            return Disposition::Ignored;
        };
        let Some(event) = msg.find_where("event", "type", "BuildEvent") else {
            return Disposition::Ignored;
        };

        let kind = event.child("type");
        let phase = kind.and_then(|t| t.attr("name")).unwrap_or_default();
        let status = kind.and_then(|t| t.attr("status")).unwrap_or_default();
        let project = event.child("project").and_then(|p| p.attr("name"));
        debug!(
            project = project.unwrap_or("-"),
            elapsed = msg.attr("elapsed").unwrap_or("-"),
            "build event {phase}/{status}"
        );

        match status {
            "BEGIN" => self.level += 1,
            "END" => self.level -= 1,
            _ => {}
        }

        if self.level == 0 {
            Disposition::Done
        } else {
            Disposition::Consumed
        }
    }
}

// ── ResponseHook ─────────────────────────────────────────────────

type ResponseCallback = Box<dyn FnOnce(&Message) + Send>;

/// One-shot handler running a callback for the response to one command,
/// then withdrawing from the chain.
pub struct ResponseHook {
    id: String,
    callback: Mutex<Option<ResponseCallback>>,
}

impl ResponseHook {
    pub fn new(id: impl Into<String>, callback: impl FnOnce(&Message) + Send + 'static) -> Self {
        Self {
            id: id.into(),
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }
}

impl Handler for ResponseHook {
    fn observe(&self, msg: &Message) -> Disposition {
        if msg.attr(ATTR_SEQUENCE_ID) != Some(self.id.as_str()) {
            return Disposition::Ignored;
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match callback {
            Some(callback) => {
                callback(msg);
                Disposition::Done
            }
            None => Disposition::Ignored,
        }
    }
}
