//! Message contract expected from the decoding layer.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static ENVELOPE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A decoded telemetry message. The core only ever looks at the type identifier.
pub trait Message: Send + Sync + 'static {
    /// Identifier used to select the handler stack, e.g. `"HEARTBEAT"`.
    fn message_type(&self) -> &str;
}

/// Generic message carrying a type name and an opaque payload.
///
/// Useful for transports that only split frames by message name and leave decoding to the
/// handlers themselves. The receive timestamp is taken when the envelope is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub message_type: String,
    pub payload: Vec<u8>,
    #[serde(skip, default = "Instant::now")]
    pub received_at: Instant,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Envelope {
            id: ENVELOPE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            message_type: message_type.into(),
            payload,
            received_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl Message for Envelope {
    fn message_type(&self) -> &str {
        &self.message_type
    }
}
