//! Dispatch engine orchestration.
//!
//! The engine wires the handler registry, the timer queue and the worker pool together and
//! owns the two long-lived threads:
//!
//! - `<prefix>-timers` waits on the timer queue and hands every due entry to the pool. The
//!   pool job runs the handler, advances the entry by one period from its previous due time
//!   and puts it back, so firings of one timer never overlap and the cadence never drifts.
//! - `<prefix>-receive` (only with an attached transport) reads messages and submits one job
//!   per handler found in a snapshot of that message type's stack.
//!
//! Neither thread ever runs handler code. `stop()` flips the lifecycle, wakes the scheduler
//! and closes the pool without waiting on any handler, so handlers may call it. `join()`
//! waits for the threads, and [`EngineGuard`] does both when a scope ends.

use crate::config::EngineConfig;
use crate::error::{DispatchError, TransportError};
use crate::handler::{
    invoke_guarded, panic_message, FailureObserver, HandlerFailure, HandlerOrigin, HandlerResult,
};
use crate::lifecycle::{EngineState, Lifecycle};
use crate::message::Message;
use crate::registry::HandlerRegistry;
use crate::timer::{TimerEntry, TimerHandle, TimerId, TimerQueue};
use crate::transport::Transport;
use crate::worker_pool::{PoolStats, WorkerPool};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Handler installed on a message type's stack.
pub type MessageHandler<M> = Arc<dyn Fn(&M) -> HandlerResult + Send + Sync>;

/// Handler run by a periodic timer.
pub type TimerHandler<M> = Arc<dyn Fn(&TimerContext<M>) -> HandlerResult + Send + Sync>;

/// Passed to timer handlers: the engine plus details of the current firing.
pub struct TimerContext<M: Message> {
    engine: DispatchEngine<M>,
    timer: TimerId,
    due: Instant,
    firing: u64,
}

impl<M: Message> TimerContext<M> {
    /// The engine running this timer; handlers may push handlers, add timers or stop it.
    pub fn engine(&self) -> &DispatchEngine<M> {
        &self.engine
    }

    pub fn timer(&self) -> TimerId {
        self.timer
    }

    /// Scheduled due time of this firing.
    pub fn due(&self) -> Instant {
        self.due
    }

    /// 1-based firing number.
    pub fn firing(&self) -> u64 {
        self.firing
    }

    /// How far past its due time this firing started.
    pub fn lateness(&self) -> Duration {
        Instant::now().saturating_duration_since(self.due)
    }
}

#[derive(Debug, Default)]
struct EngineCounters {
    messages_received: AtomicU64,
    messages_unhandled: AtomicU64,
    handler_invocations: AtomicU64,
    timer_firings: AtomicU64,
    timer_firings_skipped: AtomicU64,
    handler_failures: AtomicU64,
}

/// Snapshot of engine activity.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub messages_received: u64,
    /// Messages for which no handler was installed at lookup time.
    pub messages_unhandled: u64,
    /// Message handler jobs accepted by the pool.
    pub handler_invocations: u64,
    /// Completed timer firings, failed ones included.
    pub timer_firings: u64,
    /// Due firings the pool refused; the timer moved on to its next period.
    pub timer_firings_skipped: u64,
    pub handler_failures: u64,
    pub timers_queued: usize,
    pub registered_handlers: usize,
    /// `None` until the engine has been started.
    pub pool: Option<PoolStats>,
}

struct Shared<M: Message> {
    config: EngineConfig,
    lifecycle: Lifecycle,
    registry: HandlerRegistry<MessageHandler<M>>,
    timers: TimerQueue<TimerHandler<M>>,
    /// Created by `start`, kept after `stop` for its statistics
    pool: RwLock<Option<Arc<WorkerPool>>>,
    /// Taken by the receive thread on `start`
    transport: Mutex<Option<Box<dyn Transport<M>>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    observer: Option<FailureObserver>,
    counters: EngineCounters,
    next_timer_id: AtomicU64,
}

/// Message and timer dispatch engine. Cloning yields another handle to the same engine.
///
/// Engine threads hold their own handles, so dropping every user handle does not stop a
/// running engine; call [`DispatchEngine::shutdown`] or use [`DispatchEngine::enter`].
pub struct DispatchEngine<M: Message> {
    shared: Arc<Shared<M>>,
}

impl<M: Message> Clone for DispatchEngine<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: Message> DispatchEngine<M> {
    /// Engine without a transport; messages are fed through [`DispatchEngine::dispatch`].
    pub fn new(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> DispatchEngineBuilder<M> {
        DispatchEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> EngineState {
        self.shared.lifecycle.state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.is_running()
    }

    /// Launch the worker pool, the timer scheduler and, if attached, the receive loop.
    ///
    /// The launch happens under the lifecycle lock. A concurrent `stop()` either lands first,
    /// and this returns [`DispatchError::Stopped`], or waits until the pool exists and then
    /// closes it.
    ///
    /// # Errors
    /// [`DispatchError::AlreadyRunning`] / [`DispatchError::Stopped`] from the wrong state,
    /// [`DispatchError::Spawn`] if a thread cannot be created (the engine is then stopped).
    pub fn start(&self) -> Result<(), DispatchError> {
        match self.shared.lifecycle.begin_with(|| self.launch()) {
            Ok(()) => {}
            Err(err @ (DispatchError::AlreadyRunning | DispatchError::Stopped)) => {
                return Err(err);
            }
            Err(err) => {
                log::error!("dispatch engine failed to start: {err}");
                self.abort_launch();
                return Err(err);
            }
        }
        log::info!(
            "dispatch engine started: {} workers, {} timers queued, {} handlers installed",
            self.shared.config.pool.workers.max(1),
            self.shared.timers.len(),
            self.shared.registry.len()
        );
        Ok(())
    }

    fn launch(&self) -> Result<(), DispatchError> {
        let pool = Arc::new(WorkerPool::start(self.shared.config.pool.clone())?);
        *self.shared.pool.write() = Some(pool);

        let prefix = self.shared.config.pool.thread_name_prefix.clone();
        let scheduler = self.clone();
        let timers = spawn_named(format!("{prefix}-timers"), move || scheduler.timer_loop())?;
        self.shared.threads.lock().push(timers);

        let transport = self.shared.transport.lock().take();
        if let Some(transport) = transport {
            let receiver = self.clone();
            let handle = spawn_named(format!("{prefix}-receive"), move || {
                receiver.receive_loop(transport);
            })?;
            self.shared.threads.lock().push(handle);
        }
        Ok(())
    }

    /// Tear down a launch that failed part way; the lifecycle is already `Stopped`.
    fn abort_launch(&self) {
        self.shared.timers.wake_all();
        if let Some(pool) = self.shared.pool.read().as_ref() {
            pool.close();
        }
        self.join();
    }

    /// Request shutdown. Safe from any thread, including handlers.
    ///
    /// Never waits for handlers or engine threads; at most it waits for a `start()` in
    /// progress to finish spawning. The scheduler is woken and exits, the receive loop exits
    /// after its current read, and the pool stops accepting work. Running handlers are not
    /// interrupted.
    pub fn stop(&self) {
        // The lifecycle lock is released before the queue lock is taken in wake_all.
        let Some(previous) = self.shared.lifecycle.finish() else {
            return;
        };
        self.shared.timers.wake_all();
        if let Some(pool) = self.shared.pool.read().as_ref() {
            pool.close();
        }
        log::info!("dispatch engine stopping (was {previous})");
    }

    /// Wait for the engine threads and the worker pool to finish.
    ///
    /// Blocks until [`DispatchEngine::stop`] has been called (here or elsewhere). Called from
    /// an engine thread, that thread is skipped instead of joined.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.threads.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("engine").to_string();
            if handle.join().is_err() {
                log::error!("{name} thread exited by panic");
            }
        }
        let pool = self.shared.pool.read().clone();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }

    /// [`stop`](DispatchEngine::stop) followed by [`join`](DispatchEngine::join).
    pub fn shutdown(&self) {
        self.stop();
        self.join();
    }

    /// Start the engine and tie its lifetime to the returned guard.
    ///
    /// # Errors
    /// Whatever [`DispatchEngine::start`] returns.
    pub fn enter(&self) -> Result<EngineGuard<'_, M>, DispatchError> {
        self.start()?;
        Ok(EngineGuard { engine: self })
    }

    /// Run `f` with the engine started; the engine is shut down however `f` exits.
    ///
    /// # Errors
    /// Whatever [`DispatchEngine::start`] returns.
    pub fn run_scoped<R>(&self, f: impl FnOnce(&Self) -> R) -> Result<R, DispatchError> {
        let _guard = self.enter()?;
        Ok(f(self))
    }

    /// Install `handler` on top of the stack for `message_type`.
    pub fn push_handler<F>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(&M) -> HandlerResult + Send + Sync + 'static,
    {
        self.push_shared_handler(message_type, Arc::new(handler));
    }

    /// Install an already shared handler, e.g. one returned by `pop_handler`.
    pub fn push_shared_handler(&self, message_type: impl Into<String>, handler: MessageHandler<M>) {
        let message_type = message_type.into();
        log::debug!("installing handler for {message_type}");
        self.shared.registry.push(message_type, handler);
    }

    /// Remove and return the most recently installed handler for `message_type`.
    ///
    /// # Errors
    /// [`DispatchError::NotRegistered`] or [`DispatchError::EmptyStack`].
    pub fn pop_handler(&self, message_type: &str) -> Result<MessageHandler<M>, DispatchError> {
        self.shared.registry.pop(message_type)
    }

    /// Drop the handler stack for one message type, or all of them with `None`.
    ///
    /// # Errors
    /// [`DispatchError::NotRegistered`] if the named type has no stack.
    pub fn clear_handler(&self, message_type: Option<&str>) -> Result<(), DispatchError> {
        self.shared.registry.clear(message_type)
    }

    /// Number of handlers installed for `message_type`.
    pub fn handler_depth(&self, message_type: &str) -> usize {
        self.shared.registry.depth(message_type)
    }

    /// Register a periodic handler first due one `period` from now.
    ///
    /// Accepted before `start` (queued until the scheduler runs) and while running.
    ///
    /// # Arguments
    /// * `period` - interval between due times; each due time is the previous one plus `period`
    /// * `handler` - runs on a worker thread with a [`TimerContext`] for the firing
    ///
    /// # Returns
    /// A [`TimerHandle`] for cancelling the timer and reading its firing count.
    ///
    /// # Errors
    /// [`DispatchError::InvalidPeriod`] for a zero period, [`DispatchError::Stopped`] once
    /// the engine has been stopped.
    pub fn add_timer<F>(&self, period: Duration, handler: F) -> Result<TimerHandle, DispatchError>
    where
        F: Fn(&TimerContext<M>) -> HandlerResult + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(DispatchError::InvalidPeriod);
        }
        if self.shared.lifecycle.is_stopped() {
            return Err(DispatchError::Stopped);
        }
        let id = TimerId(self.shared.next_timer_id.fetch_add(1, AtomicOrdering::Relaxed));
        let handler: TimerHandler<M> = Arc::new(handler);
        let entry = TimerEntry::new(id, period, handler, Instant::now());
        let handle = entry.handle();
        self.shared.timers.insert(entry);
        log::debug!("added {id} with period {period:?}");
        Ok(handle)
    }

    /// Route one message to every handler currently installed for its type.
    ///
    /// The stack is snapshotted at lookup time and one pool job is submitted per handler, in
    /// installation order.
    ///
    /// # Returns
    /// Number of handler jobs the pool accepted; `0` when no handler is installed.
    ///
    /// # Errors
    /// [`DispatchError::NotRunning`] before `start`, [`DispatchError::Stopped`] after `stop`,
    /// or the pool's rejection if not a single handler job could be submitted.
    pub fn dispatch(&self, message: M) -> Result<usize, DispatchError> {
        match self.shared.lifecycle.state() {
            EngineState::Idle => return Err(DispatchError::NotRunning),
            EngineState::Stopped => return Err(DispatchError::Stopped),
            EngineState::Running => {}
        }
        let counters = &self.shared.counters;
        counters.messages_received.fetch_add(1, AtomicOrdering::Relaxed);

        let handlers = self.shared.registry.snapshot(message.message_type());
        if handlers.is_empty() {
            counters.messages_unhandled.fetch_add(1, AtomicOrdering::Relaxed);
            log::trace!("no handlers for {}", message.message_type());
            return Ok(0);
        }

        let message = Arc::new(message);
        let mut submitted = 0;
        let mut last_error = None;
        for handler in handlers {
            let engine = self.clone();
            let job_message = message.clone();
            match self.submit(move || engine.run_message_handler(&handler, &job_message)) {
                Ok(()) => submitted += 1,
                Err(err) => {
                    log::warn!("{} handler not submitted: {err}", message.message_type());
                    last_error = Some(err);
                }
            }
        }
        counters
            .handler_invocations
            .fetch_add(submitted as u64, AtomicOrdering::Relaxed);
        log::trace!("{} routed to {submitted} handlers", message.message_type());

        match last_error {
            Some(err) if submitted == 0 => Err(err),
            _ => Ok(submitted),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        EngineStats {
            state: self.state(),
            messages_received: counters.messages_received.load(AtomicOrdering::Relaxed),
            messages_unhandled: counters.messages_unhandled.load(AtomicOrdering::Relaxed),
            handler_invocations: counters.handler_invocations.load(AtomicOrdering::Relaxed),
            timer_firings: counters.timer_firings.load(AtomicOrdering::Relaxed),
            timer_firings_skipped: counters.timer_firings_skipped.load(AtomicOrdering::Relaxed),
            handler_failures: counters.handler_failures.load(AtomicOrdering::Relaxed),
            timers_queued: self.shared.timers.len(),
            registered_handlers: self.shared.registry.len(),
            pool: self.shared.pool.read().as_ref().map(|pool| pool.stats()),
        }
    }

    fn submit<F>(&self, job: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.shared.pool.read().as_ref() {
            Some(pool) => pool.submit(job),
            None => Err(DispatchError::NotRunning),
        }
    }

    /// Scheduler thread: hand each due timer to the pool until the engine stops.
    fn timer_loop(&self) {
        log::debug!("timer scheduler started");
        let lifecycle = &self.shared.lifecycle;
        while let Some(entry) = self.shared.timers.next_due(|| lifecycle.is_running()) {
            self.fire_timer(entry);
        }
        log::debug!("timer scheduler exiting");
    }

    fn fire_timer(&self, mut entry: TimerEntry<TimerHandler<M>>) {
        if entry.is_cancelled() {
            return;
        }
        let engine = self.clone();
        let job_entry = entry.clone();
        if let Err(err) = self.submit(move || engine.run_timer(job_entry)) {
            // The job never ran, so this copy is the only one left: re-arm it here.
            log::warn!("{} firing skipped: {err}", entry.id());
            self.shared
                .counters
                .timer_firings_skipped
                .fetch_add(1, AtomicOrdering::Relaxed);
            entry.rearm();
            self.shared.timers.insert(entry);
        }
    }

    /// Worker side of a timer firing: run, count, re-arm, reinsert.
    fn run_timer(&self, mut entry: TimerEntry<TimerHandler<M>>) {
        let timer = entry.id();
        let firing = entry.handle().fired() + 1;
        let context = TimerContext {
            engine: self.clone(),
            timer,
            due: entry.next_due(),
            firing,
        };
        let handler = entry.handler().clone();
        if let Some(failure) = invoke_guarded(
            || HandlerOrigin::Timer { timer, firing },
            || handler(&context),
        ) {
            self.report_failure(failure);
        }
        entry.record_firing();
        self.shared
            .counters
            .timer_firings
            .fetch_add(1, AtomicOrdering::Relaxed);

        if entry.is_cancelled() {
            log::debug!("{timer} cancelled, not re-armed");
            return;
        }
        entry.rearm();
        self.shared.timers.insert(entry);
    }

    fn run_message_handler(&self, handler: &MessageHandler<M>, message: &M) {
        let origin = || HandlerOrigin::Message {
            message_type: message.message_type().to_string(),
        };
        if let Some(failure) = invoke_guarded(origin, || handler(message)) {
            self.report_failure(failure);
        }
    }

    fn report_failure(&self, failure: HandlerFailure) {
        self.shared
            .counters
            .handler_failures
            .fetch_add(1, AtomicOrdering::Relaxed);
        log::error!("{failure}");
        let Some(observer) = self.shared.observer.as_ref() else {
            return;
        };
        // Observer code runs on the timer's firing path; it must not unwind past the re-arm.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(&failure))) {
            log::error!(
                "failure observer panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }

    /// Receive thread: read and dispatch until the engine stops or the transport ends.
    fn receive_loop(&self, mut transport: Box<dyn Transport<M>>) {
        log::debug!("receive loop started");
        let timeout = self.shared.config.receive_timeout;
        while self.shared.lifecycle.is_running() {
            match transport.recv_message(timeout) {
                Ok(Some(message)) => match self.dispatch(message) {
                    Ok(_) | Err(DispatchError::Stopped) => {}
                    Err(err) => log::warn!("message dropped: {err}"),
                },
                Ok(None) => {}
                Err(TransportError::Closed) => {
                    log::info!("transport closed, stopping dispatch engine");
                    self.stop();
                    break;
                }
                Err(err) => {
                    log::error!("transport failed: {err}; stopping dispatch engine");
                    self.stop();
                    break;
                }
            }
        }
        log::debug!("receive loop exiting");
    }
}

fn spawn_named<F>(name: String, f: F) -> Result<JoinHandle<()>, DispatchError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| DispatchError::Spawn { name, source })
}

/// Keeps the engine running for as long as it lives; dropping it shuts the engine down.
pub struct EngineGuard<'a, M: Message> {
    engine: &'a DispatchEngine<M>,
}

impl<M: Message> Deref for EngineGuard<'_, M> {
    type Target = DispatchEngine<M>;

    fn deref(&self) -> &Self::Target {
        self.engine
    }
}

impl<M: Message> Drop for EngineGuard<'_, M> {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

/// Assembles a [`DispatchEngine`] with an optional transport and failure observer.
pub struct DispatchEngineBuilder<M: Message> {
    config: EngineConfig,
    transport: Option<Box<dyn Transport<M>>>,
    observer: Option<FailureObserver>,
}

impl<M: Message> DispatchEngineBuilder<M> {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            transport: None,
            observer: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Source the receive loop reads from once the engine starts.
    pub fn transport(mut self, transport: impl Transport<M>) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Called on a worker thread for every handler error or panic, after it is logged.
    pub fn on_handler_failure<F>(mut self, observer: F) -> Self
    where
        F: Fn(&HandlerFailure) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> DispatchEngine<M> {
        DispatchEngine {
            shared: Arc::new(Shared {
                config: self.config,
                lifecycle: Lifecycle::new(),
                registry: HandlerRegistry::new(),
                timers: TimerQueue::new(),
                pool: RwLock::new(None),
                transport: Mutex::new(self.transport),
                threads: Mutex::new(Vec::new()),
                observer: self.observer,
                counters: EngineCounters::default(),
                next_timer_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<M: Message> Default for DispatchEngineBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}
