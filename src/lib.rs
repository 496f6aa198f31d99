//! promiseOut-style futures backed by supervised threads.
//!
//! A [`PromiseOut`] runs a unit of work on its own thread the moment it is
//! constructed. The work's result (or the panic it raised, turned into an
//! [`Error`]) is published once, and [`PromiseOut::wait`] races that
//! publication against a [`Context`] deadline.
//!
//! # Examples
//!
//! ```
//! use promise_task::PromiseOut;
//! use std::time::Duration;
//!
//! let answer = PromiseOut::with_timeout(Duration::from_secs(1), || Ok(42));
//! assert_eq!(answer.wait().unwrap(), 42);
//!
//! let boom = PromiseOut::<i32>::new(|| panic!("boom"));
//! assert!(boom.wait().unwrap_err().to_string().contains("boom"));
//! ```
//!
//! Cancellation is advisory: when the deadline wins, `wait` returns early
//! but the work keeps running until it returns on its own.
use std::{any::Any, error::Error as StdError, io, sync::Arc};

use thiserror::Error;

pub mod config;
pub mod context;
pub mod launch;
pub mod promise_out;

pub use context::{CancelHandle, Context, ContextError};
pub use launch::{launch, launch_with_context, launch_with_timeout, log_completion, Completion};
pub use promise_out::{Builder, PromiseOut, Waiting};

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Returned by the unit of work itself.
    #[error("{0}")]
    Work(Arc<dyn StdError + Send + Sync>),
    /// The unit of work panicked.
    #[error("task panicked: {0}")]
    Fault(String),
    #[error(transparent)]
    Deadline(#[from] ContextError),
    #[error("failed to spawn task thread: {0}")]
    Spawn(Arc<io::Error>),
    #[error("task finished without producing an outcome")]
    Abandoned,
}

impl Error {
    /// Wraps any error (or message) returned by a unit of work.
    ///
    /// ```
    /// use promise_task::Error;
    /// let err = Error::work("disk full");
    /// assert_eq!(err.to_string(), "disk full");
    /// ```
    pub fn work<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::Work(Arc::from(err.into()))
    }

    /// Normalizes a panic payload caught at the top of a worker thread.
    ///
    /// A payload that already is an [`Error`] is passed through unchanged, and
    /// other error values panicked with `panic_any` become [`Error::Work`].
    /// Only messages are wrapped into [`Error::Fault`].
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Error>() {
            Ok(err) => return *err,
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<Arc<dyn StdError + Send + Sync>>() {
            Ok(err) => return Error::Work(*err),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<Box<dyn StdError + Send + Sync>>() {
            Ok(err) => return Error::Work(Arc::from(*err)),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<io::Error>() {
            Ok(err) => return Error::Work(Arc::new(*err)),
            Err(payload) => payload,
        };
        if let Some(msg) = payload.downcast_ref::<&str>() {
            Error::Fault((*msg).to_string())
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            Error::Fault(msg.clone())
        } else {
            Error::Fault("unknown panic payload".to_string())
        }
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, Error::Deadline(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Error::Fault(_))
    }
}
