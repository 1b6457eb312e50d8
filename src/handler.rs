//! Handler signatures and per-invocation failure isolation.
//!
//! Handlers are opaque user code. Whatever they do, an error return or a panic, is caught at
//! the invocation boundary, logged, and reported to the optional failure observer; it never
//! unwinds into a worker, the scheduler or the receive loop.

use crate::timer::TimerId;
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Return type of every handler.
pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Callback receiving every isolated handler failure.
pub type FailureObserver = Arc<dyn Fn(&HandlerFailure) + Send + Sync>;

/// What triggered the failing invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOrigin {
    Message { message_type: String },
    Timer { timer: TimerId, firing: u64 },
}

impl fmt::Display for HandlerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOrigin::Message { message_type } => write!(f, "{message_type} handler"),
            HandlerOrigin::Timer { timer, firing } => write!(f, "{timer} firing #{firing}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The handler returned `Err`.
    Error(String),
    /// The handler panicked; carries the panic message when it was a string.
    Panic(String),
}

/// An isolated handler failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub origin: HandlerOrigin,
    pub cause: FailureCause,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            FailureCause::Error(message) => write!(f, "{} failed: {message}", self.origin),
            FailureCause::Panic(message) => write!(f, "{} panicked: {message}", self.origin),
        }
    }
}

/// Run `handler`, converting an error return or a panic into a [`HandlerFailure`].
///
/// # Arguments
/// * `origin` - builds the failure's origin; only called when the handler fails
/// * `handler` - the user callback, already bound to its message or timer context
///
/// # Returns
/// `None` when the handler returned `Ok(())`, otherwise the captured failure.
pub(crate) fn invoke_guarded<O, F>(origin: O, handler: F) -> Option<HandlerFailure>
where
    O: FnOnce() -> HandlerOrigin,
    F: FnOnce() -> HandlerResult,
{
    let cause = match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(())) => return None,
        Ok(Err(err)) => FailureCause::Error(err.to_string()),
        Err(payload) => FailureCause::Panic(panic_message(payload.as_ref())),
    };
    Some(HandlerFailure {
        origin: origin(),
        cause,
    })
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
