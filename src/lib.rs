//! Event-dispatch core for telemetry links.
//!
//! Incoming messages are routed by type to a stack of handlers, periodic timers fire on a
//! fixed cadence, and every handler invocation runs on a worker pool so that neither the
//! receive loop nor the timer scheduler is ever blocked by user code.
//!
//! ```no_run
//! use mavdispatch::{DispatchEngine, EngineConfig, Envelope};
//! use std::time::Duration;
//!
//! let engine: DispatchEngine<Envelope> = DispatchEngine::new(EngineConfig::default());
//! engine.push_handler("HEARTBEAT", |msg: &Envelope| {
//!     println!("heartbeat #{}", msg.id);
//!     Ok(())
//! });
//! engine.add_timer(Duration::from_secs(1), |_| Ok(())).unwrap();
//! engine.run_scoped(|engine| {
//!     engine.dispatch(Envelope::new("HEARTBEAT", vec![])).unwrap();
//! }).unwrap();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod timer;
pub mod transport;
pub mod worker_pool;

// Re-export the types most callers need
pub use config::{EngineConfig, ShutdownPolicy, WorkerPoolConfig};
pub use engine::{
    DispatchEngine, DispatchEngineBuilder, EngineGuard, EngineStats, MessageHandler, TimerContext,
    TimerHandler,
};
pub use error::{DispatchError, TransportError};
pub use handler::{FailureCause, FailureObserver, HandlerFailure, HandlerOrigin, HandlerResult};
pub use lifecycle::EngineState;
pub use message::{Envelope, Message};
pub use registry::HandlerRegistry;
pub use timer::{TimerEntry, TimerHandle, TimerId, TimerQueue};
pub use transport::{channel_transport, ChannelTransport, Transport};
pub use worker_pool::{PoolStats, WorkerPool};
