//! Supervised task launcher.
//!
//! Every launch gets its own thread. A panic inside the task is caught at the
//! top of that thread and handed to the completion callback as an [`Error`],
//! so it never reaches whoever launched the task.
//!
//! The first launch installs a panic hook that sends panics raised inside a
//! supervised task to `tracing` at `debug` level instead of stderr. Panics
//! anywhere else still reach the hook that was installed before it. A hook
//! set with [`std::panic::set_hook`] after the first launch replaces it.
//!
//! ```
//! use promise_task::launch;
//! use crossbeam_channel::bounded;
//!
//! let (tx, rx) = bounded::<Result<(), promise_task::Error>>(1);
//! launch(|| panic!("💥"), Some(Box::new(move |result| {
//!     let _ = tx.send(result);
//! })));
//! assert!(rx.recv().unwrap().unwrap_err().to_string().contains("💥"));
//! ```
use std::{
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::Duration,
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{Context, Error};

thread_local! {
    static SUPERVISED: Cell<bool> = const { Cell::new(false) };
}

static PANIC_HOOK: Lazy<()> = Lazy::new(|| {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if SUPERVISED.with(Cell::get) {
            debug!(panic = %info, "supervised task panicked");
        } else {
            previous(info);
        }
    }));
});

fn run_supervised<F>(task: F) -> Result<(), Error>
where
    F: FnOnce(),
{
    SUPERVISED.with(|flag| flag.set(true));
    let result = panic::catch_unwind(AssertUnwindSafe(task));
    SUPERVISED.with(|flag| flag.set(false));
    result.map_err(Error::from_panic)
}

/// Called exactly once when a launched task finishes; `Ok(())` means it returned normally.
pub type Completion = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// The completion used when none is given: failures are logged and dropped.
pub fn log_completion(result: Result<(), Error>) {
    if let Err(err) = result {
        warn!(error = %err, "supervised task failed");
    }
}

/// Runs `task` on a new thread and returns immediately.
pub fn launch<F>(task: F, on_complete: Option<Completion>)
where
    F: FnOnce() + Send + 'static,
{
    launch_with_context(&Context::background(), task, on_complete)
}

/// Like [`launch`], but bound to a fresh timeout context that is cancelled
/// after `on_complete` runs. The timeout does not stop `task`.
pub fn launch_with_timeout<F>(timeout: Duration, task: F, on_complete: Option<Completion>)
where
    F: FnOnce() + Send + 'static,
{
    let (ctx, cancel) = Context::with_timeout(&Context::background(), timeout);
    let on_complete = on_complete.unwrap_or_else(|| Box::new(log_completion));
    launch_with_context(
        &ctx,
        task,
        Some(Box::new(move |result| {
            on_complete(result);
            cancel.cancel();
        })),
    )
}

/// Like [`launch`], but skips `task` entirely when `ctx` is already done by the
/// time the thread starts. A skipped task fires no completion.
///
/// The check happens once, before `task` runs. A task that has started runs
/// to the end no matter what happens to `ctx` afterwards.
pub fn launch_with_context<F>(ctx: &Context, task: F, on_complete: Option<Completion>)
where
    F: FnOnce() + Send + 'static,
{
    spawn_supervised(None, ctx.clone(), task, on_complete)
}

pub(crate) fn spawn_supervised<F>(
    name: Option<String>,
    ctx: Context,
    task: F,
    on_complete: Option<Completion>,
) where
    F: FnOnce() + Send + 'static,
{
    Lazy::force(&PANIC_HOOK);
    let on_complete = on_complete.unwrap_or_else(|| Box::new(log_completion));
    // Shared with the worker so the callback still fires once if the spawn fails.
    let handoff = Arc::new(Mutex::new(Some(on_complete)));
    let worker = handoff.clone();

    let mut builder = thread::Builder::new();
    if let Some(name) = name {
        builder = builder.name(name);
    }

    let spawned = builder.spawn(move || {
        if let Some(err) = ctx.err() {
            debug!(error = %err, "context already done, skipping task");
            return;
        }
        let result = run_supervised(task);
        trace!(ok = result.is_ok(), "task finished");
        let on_complete = worker.lock().take();
        if let Some(on_complete) = on_complete {
            on_complete(result);
        }
    });

    if let Err(err) = spawned {
        warn!(error = %err, "failed to spawn task thread");
        let on_complete = handoff.lock().take();
        if let Some(on_complete) = on_complete {
            on_complete(Err(Error::Spawn(Arc::new(err))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        launch, launch_with_context, launch_with_timeout, run_supervised, spawn_supervised,
        Completion, SUPERVISED,
    };
    use crate::{Context, Error};
    use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
    use std::{
        panic::panic_any,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn report(tx: Sender<Result<(), Error>>) -> Option<Completion> {
        Some(Box::new(move |result| {
            tx.send(result).unwrap();
        }))
    }

    #[test]
    fn completes_once_with_ok() {
        let (tx, rx) = bounded(2);
        launch(|| {}, report(tx));
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
        // The sender went away with the callback; nothing else was sent.
        assert_eq!(rx.recv_timeout(WAIT).unwrap_err(), RecvTimeoutError::Disconnected);
    }

    #[test]
    fn panic_becomes_fault() {
        let (tx, rx) = bounded(1);
        launch(|| panic!("boom"), report(tx));
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert!(matches!(err, Error::Fault(ref msg) if msg == "boom"));
    }

    #[test]
    fn error_payload_passes_through() {
        let (tx, rx) = bounded(1);
        launch(|| panic_any(Error::work("typed")), report(tx));
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert!(matches!(err, Error::Work(_)));
    }

    #[test]
    fn supervision_ends_before_completion() {
        let (tx, rx) = bounded(1);
        launch(
            || assert!(SUPERVISED.with(|flag| flag.get())),
            Some(Box::new(move |result: Result<(), Error>| {
                tx.send((result, SUPERVISED.with(|flag| flag.get()))).unwrap();
            })),
        );
        let (result, supervised) = rx.recv_timeout(WAIT).unwrap();
        assert!(result.is_ok());
        assert!(!supervised);
    }

    #[test]
    fn supervised_panic_is_caught_on_the_calling_thread() {
        let err = run_supervised(|| panic!("quiet")).unwrap_err();
        assert!(matches!(err, Error::Fault(ref msg) if msg == "quiet"));
        assert!(!SUPERVISED.with(|flag| flag.get()));
    }

    #[test]
    fn default_completion_swallows_faults() {
        // Nothing to observe but the absence of a crash.
        launch(|| panic!("logged, not raised"), None);
        launch(|| {}, None);
        thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn done_context_skips_task_and_callback() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        cancel.cancel();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let (tx, rx) = bounded(1);
        launch_with_context(
            &ctx,
            move || flag.store(true, Ordering::SeqCst),
            report(tx),
        );
        // The callback is dropped unused, which disconnects the channel.
        assert_eq!(rx.recv_timeout(WAIT).unwrap_err(), RecvTimeoutError::Disconnected);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn started_task_ignores_later_cancel() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let (started_tx, started_rx) = bounded(1);
        let (tx, rx) = bounded(1);
        launch_with_context(
            &ctx,
            move || {
                started_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            },
            report(tx),
        );
        started_rx.recv_timeout(WAIT).unwrap();
        cancel.cancel();
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    }

    #[test]
    fn timeout_launch_runs_past_its_deadline() {
        let (tx, rx) = bounded(1);
        launch_with_timeout(
            Duration::from_millis(200),
            || thread::sleep(Duration::from_millis(400)),
            report(tx),
        );
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    }

    #[test]
    fn named_worker_thread() {
        let (tx, rx) = bounded(1);
        spawn_supervised(
            Some("promise-worker".to_string()),
            Context::background(),
            move || {
                tx.send(thread::current().name().map(str::to_owned)).unwrap();
            },
            None,
        );
        assert_eq!(rx.recv_timeout(WAIT).unwrap().as_deref(), Some("promise-worker"));
    }
}
