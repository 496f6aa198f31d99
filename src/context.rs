//! Cancellation contexts.
//!
//! A [`Context`] tells a waiter how long it may block. Contexts form a tree
//! rooted at [`Context::background`]: a derived context is done once it is
//! cancelled through its [`CancelHandle`], once its deadline passes, or once
//! any ancestor is done. Nothing here interrupts running code; work that
//! wants to stop early has to poll [`Context::is_done`] itself.
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, Sender};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Clone, Default)]
pub struct Context {
    node: Option<Arc<Node>>,
}

struct Node {
    parent: Context,
    deadline: Option<Instant>,
    reason: OnceCell<(ContextError, Instant)>,
    // Dropping the sender disconnects `released`, waking every `Select` on it.
    release: Mutex<Option<Sender<()>>>,
    released: Receiver<()>,
}

/// Cancels the [`Context`] it was created with. Clones cancel the same context.
#[derive(Clone)]
pub struct CancelHandle {
    ctx: Context,
}

impl Context {
    /// The root context: no deadline, never cancelled.
    pub fn background() -> Self {
        Self { node: None }
    }

    pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
        Self::derive(parent, None)
    }

    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelHandle) {
        Self::derive(parent, Some(deadline))
    }

    /// Derives a context that expires `timeout` from now.
    ///
    /// A timeout too large to represent as an [`Instant`] never expires.
    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, CancelHandle) {
        Self::derive(parent, Instant::now().checked_add(timeout))
    }

    fn derive(parent: &Context, deadline: Option<Instant>) -> (Context, CancelHandle) {
        let (release, released) = bounded(0);
        let ctx = Context {
            node: Some(Arc::new(Node {
                parent: parent.clone(),
                deadline,
                reason: OnceCell::new(),
                release: Mutex::new(Some(release)),
                released,
            })),
        };
        let cancel = CancelHandle { ctx: ctx.clone() };
        (ctx, cancel)
    }

    /// Why this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        let node = self.node.as_ref()?;
        if let Some((reason, _)) = node.reason.get() {
            return Some(*reason);
        }
        if node.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(ContextError::DeadlineExceeded);
        }
        node.parent.err()
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The earliest deadline of this context and its ancestors.
    pub fn deadline(&self) -> Option<Instant> {
        self.nodes().filter_map(|node| node.deadline).min()
    }

    /// When this context became done and why, taking the earliest event along
    /// the ancestry. `None` while it is still live.
    pub(crate) fn done_since(&self) -> Option<(Instant, ContextError)> {
        let now = Instant::now();
        self.nodes()
            .flat_map(|node| {
                let cancelled = node.reason.get().map(|(reason, at)| (*at, *reason));
                let expired = node
                    .deadline
                    .filter(|deadline| *deadline <= now)
                    .map(|deadline| (deadline, ContextError::DeadlineExceeded));
                cancelled.into_iter().chain(expired)
            })
            .min_by_key(|(at, _)| *at)
    }

    /// Receivers that disconnect when this context or an ancestor is cancelled.
    pub(crate) fn cancel_signals(&self) -> Vec<&Receiver<()>> {
        self.nodes().map(|node| &node.released).collect()
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> {
        let mut next = self.node.as_deref();
        std::iter::from_fn(move || {
            let node = next?;
            next = node.parent.node.as_deref();
            Some(node)
        })
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline())
            .field("err", &self.err())
            .finish()
    }
}

impl CancelHandle {
    /// Cancels the context. Calling it again, or after the context is already
    /// done, keeps the first reason.
    pub fn cancel(&self) {
        let Some(node) = self.ctx.node.as_ref() else {
            return;
        };
        if self.ctx.err().is_none() {
            let _ = node.reason.set((ContextError::Cancelled, Instant::now()));
        }
        node.release.lock().take();
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelHandle").field(&self.ctx).finish()
    }
}
