//! Error types shared by the registry, timer queue, worker pool and engine.

use std::io;
use thiserror::Error;

/// Errors returned synchronously by the dispatch core.
///
/// Handler failures are never reported through this type: they are isolated per invocation
/// and surfaced as [`crate::handler::HandlerFailure`] instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler stack exists for the requested message type.
    #[error("no handler stack registered for message type `{0}`")]
    NotRegistered(String),
    /// The stack exists but every handler has already been popped.
    #[error("handler stack for message type `{0}` is empty")]
    EmptyStack(String),
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("engine has been stopped")]
    Stopped,
    #[error("engine has not been started")]
    NotRunning,
    #[error("timer period must be greater than zero")]
    InvalidPeriod,
    #[error("worker pool is closed")]
    PoolClosed,
    /// The pool's configured backlog cap was reached and the job was rejected.
    #[error("worker pool backlog is full ({limit} pending jobs)")]
    Backlogged { limit: usize },
    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl DispatchError {
    /// True for both registry lookup failures (unknown type or empty stack).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DispatchError::NotRegistered(_) | DispatchError::EmptyStack(_)
        )
    }
}

/// Errors raised by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// End of stream: the link was closed by the remote side or the feeder went away.
    #[error("transport closed")]
    Closed,
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_are_not_found() {
        assert!(DispatchError::NotRegistered("HEARTBEAT".into()).is_not_found());
        assert!(DispatchError::EmptyStack("HEARTBEAT".into()).is_not_found());
        assert!(!DispatchError::PoolClosed.is_not_found());
        assert!(!DispatchError::Stopped.is_not_found());
    }

    #[test]
    fn messages_name_the_message_type() {
        let err = DispatchError::EmptyStack("ATTITUDE".into());
        assert_eq!(
            err.to_string(),
            "handler stack for message type `ATTITUDE` is empty"
        );
        let err = DispatchError::Backlogged { limit: 8 };
        assert_eq!(err.to_string(), "worker pool backlog is full (8 pending jobs)");
    }

    #[test]
    fn io_errors_convert_into_transport_errors() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err: TransportError = io_err.into();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
