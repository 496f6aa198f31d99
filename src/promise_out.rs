//! promiseOut backed by a supervised thread.
//!
//! The worker thread is the only producer: it writes the outcome into a
//! write-once cell and then drops the only [`Sender`] of the completion
//! channel. Waiters treat the disconnect as "settled", so they can never see
//! the signal before the outcome.
//!
//! A `PromiseOut` can also be `.await`ed: [`IntoFuture`] hands the blocking
//! wait to a helper thread and resolves through a oneshot channel.
use std::{
    fmt,
    future::{Future, IntoFuture},
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, Select, Sender, TryRecvError};
use futures::{channel::oneshot, FutureExt};
use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::{config, launch, CancelHandle, Completion, Context, ContextError, Error};

/// A unit of work running on its own thread, with a single outcome.
///
/// # Examples
///
/// ```
/// use promise_task::{Error, PromiseOut};
/// use std::{thread, time::Duration};
///
/// let slow = PromiseOut::with_timeout(Duration::from_millis(10), || {
///     thread::sleep(Duration::from_secs(1));
///     Ok("too late")
/// });
/// assert!(slow.wait().unwrap_err().is_deadline());
///
/// let failed = PromiseOut::<()>::new(|| Err(Error::work("no luck")));
/// assert_eq!(failed.wait().unwrap_err().to_string(), "no luck");
/// ```
pub struct PromiseOut<T> {
    ctx: Context,
    outcome: Arc<OnceCell<Result<T, Error>>>,
    settled_at: Arc<OnceCell<Instant>>,
    settled: Receiver<()>,
    verdict: OnceCell<Verdict>,
}

#[derive(Debug, Clone, Copy)]
enum Verdict {
    Settled,
    Expired(ContextError),
}

/// Configures a [`PromiseOut`] before spawning it.
///
/// With neither a timeout nor a context set, the process-wide
/// [`default_timeout`](config::default_timeout) applies. A timeout set
/// together with a context is derived from that context.
#[derive(Debug, Default)]
pub struct Builder {
    timeout: Option<Duration>,
    context: Option<Context>,
    name: Option<String>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn context(mut self, ctx: Context) -> Self {
        self.context = Some(ctx);
        self
    }

    /// Names the worker thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn spawn<T, F>(self, work: F) -> PromiseOut<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let timeout = match (self.timeout, &self.context) {
            (Some(timeout), _) => Some(timeout),
            (None, None) => Some(config::default_timeout()),
            (None, Some(_)) => None,
        };
        let parent = self.context.unwrap_or_default();
        match timeout {
            Some(timeout) => {
                let (ctx, cancel) = Context::with_timeout(&parent, timeout);
                PromiseOut::spawn(self.name, ctx, Some(cancel), work)
            }
            None => PromiseOut::spawn(self.name, parent, None, work),
        }
    }
}

impl<T> PromiseOut<T>
where
    T: Send + Sync + 'static,
{
    /// Starts `work` bounded by the process-wide default timeout.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        Self::with_timeout(config::default_timeout(), work)
    }

    /// Starts `work` bounded by `timeout`. The timeout's context is cancelled
    /// once `work` has returned and its outcome is published.
    pub fn with_timeout<F>(timeout: Duration, work: F) -> Self
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (ctx, cancel) = Context::with_timeout(&Context::background(), timeout);
        Self::spawn(None, ctx, Some(cancel), work)
    }

    /// Starts `work` bounded by `ctx`.
    ///
    /// `work` may keep a clone of `ctx` and poll [`Context::is_done`] to stop
    /// early; nothing else interrupts it.
    pub fn with_context<F>(ctx: Context, work: F) -> Self
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        Self::spawn(None, ctx, None, work)
    }

    /// Same as [`Builder::new`], for call sites that already name `T`.
    pub fn builder() -> Builder {
        Builder::new()
    }

    fn spawn<F>(name: Option<String>, ctx: Context, release: Option<CancelHandle>, work: F) -> Self
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (settle, settled): (Sender<()>, Receiver<()>) = bounded(0);
        let outcome = Arc::new(OnceCell::new());

        let slot = outcome.clone();
        let task = move || {
            let _ = slot.set(work());
        };

        let settled_at = Arc::new(OnceCell::new());

        let slot = outcome.clone();
        let stamp = settled_at.clone();
        let on_complete: Completion = Box::new(move |result| {
            if let Err(err) = result {
                debug!(error = %err, "promise work faulted");
                let _ = slot.set(Err(err));
            }
            let _ = stamp.set(Instant::now());
            drop(settle);
            if let Some(release) = release {
                release.cancel();
            }
        });

        launch::spawn_supervised(name, Context::background(), task, Some(on_complete));

        Self {
            ctx,
            outcome,
            settled_at,
            settled,
            verdict: OnceCell::new(),
        }
    }
}

impl<T> PromiseOut<T> {
    /// Whether the outcome has been published.
    pub fn is_settled(&self) -> bool {
        matches!(self.settled.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn decide(&self) -> Verdict {
        if let Some(verdict) = self.verdict.get() {
            return *verdict;
        }
        let verdict = self.race();
        *self.verdict.get_or_init(|| verdict)
    }

    fn race(&self) -> Verdict {
        loop {
            if self.is_settled() {
                // A late waiter still has to honor a context that was done
                // before the work settled.
                let settled_at = self.settled_at.get().copied();
                return match (settled_at, self.ctx.done_since()) {
                    (Some(settled_at), Some((done_at, err))) if done_at < settled_at => {
                        trace!(error = %err, "context was done before the work settled");
                        Verdict::Expired(err)
                    }
                    _ => Verdict::Settled,
                };
            }
            if let Some(err) = self.ctx.err() {
                trace!(error = %err, "deadline won the race");
                return Verdict::Expired(err);
            }

            let mut select = Select::new();
            select.recv(&self.settled);
            for signal in self.ctx.cancel_signals() {
                select.recv(signal);
            }
            match self.ctx.deadline() {
                Some(deadline) => {
                    let _ = select.ready_deadline(deadline);
                }
                None => {
                    select.ready();
                }
            }
        }
    }
}

impl<T: Clone> PromiseOut<T> {
    /// Blocks until the work settles or the context is done, whichever comes
    /// first.
    ///
    /// The first answer sticks: every later or concurrent call returns the
    /// same thing. When the context wins, the work keeps running and its
    /// outcome is never read.
    pub fn wait(&self) -> Result<T, Error> {
        match self.decide() {
            Verdict::Expired(err) => Err(Error::Deadline(err)),
            Verdict::Settled => match self.outcome.get() {
                Some(outcome) => outcome.clone(),
                None => Err(Error::Abandoned),
            },
        }
    }
}

impl<T> IntoFuture for PromiseOut<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, Error>;
    type IntoFuture = Waiting<T>;

    /// Waits on a helper thread so the caller's executor is never blocked.
    fn into_future(self) -> Self::IntoFuture {
        let (tx, rx) = oneshot::channel();
        launch::launch(
            move || {
                let _ = tx.send(self.wait());
            },
            None,
        );
        Waiting { rx }
    }
}

/// Future returned by `PromiseOut::into_future`; resolves to the same value
/// [`PromiseOut::wait`] would.
#[derive(Debug)]
pub struct Waiting<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> Future for Waiting<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match self.rx.poll_unpin(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The helper thread went away without sending.
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for PromiseOut<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseOut")
            .field("ctx", &self.ctx)
            .field("settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}
