//! Transport seam between the link layer and the dispatch engine.
//!
//! The engine owns no wire protocol. It only needs a blocking "receive next message" call,
//! bounded by a timeout so the receive loop can observe `stop()` between messages.

use crate::error::TransportError;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Source of decoded messages, driven by the engine's receive thread.
pub trait Transport<M>: Send + 'static {
    /// Block for at most `timeout` waiting for the next message.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Any error ends the receive loop;
    /// [`TransportError::Closed`] signals a clean end of stream.
    fn recv_message(&mut self, timeout: Duration) -> Result<Option<M>, TransportError>;
}

/// In-memory transport fed through a crossbeam channel.
///
/// The stream ends once every [`Sender`] has been dropped and the channel is drained.
pub struct ChannelTransport<M> {
    receiver: Receiver<M>,
}

impl<M> ChannelTransport<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Number of messages waiting to be received.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl<M: Send + 'static> Transport<M> for ChannelTransport<M> {
    fn recv_message(&mut self, timeout: Duration) -> Result<Option<M>, TransportError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

/// Create a connected sender / [`ChannelTransport`] pair.
pub fn channel_transport<M>() -> (Sender<M>, ChannelTransport<M>) {
    let (tx, rx) = unbounded();
    (tx, ChannelTransport::new(rx))
}
