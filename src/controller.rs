//! The coalescing single-worker controller.
//!
//! Producers call [`SingleTaskController::submit`] from any thread. Requests are
//! queued under the controller's mutex; the first request that finds no active
//! worker starts one. The worker drains the queue in batches and folds each batch
//! into an accumulated result through the user's [`Processor`]. When a drain comes
//! back empty the worker asks the controller, under the same mutex, whether it may
//! retire: if requests raced in meanwhile, a replacement worker is started and
//! inherits the accumulated result, otherwise the slot is cleared and the result
//! is queued for the [`ResultSink`].
//!
//! Queued results are handed to the sink in retirement order by whichever thread
//! finds the queue idle; others only enqueue, so a sink may submit again even on
//! an executor that runs workers inline.
//!
//! Cancellation is cooperative and checked between batches. A canceled worker
//! discards its partial fold; if requests are pending it starts a fresh worker
//! while unwinding, so two workers never overlap.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::cancel::{child_token_factory, CancelToken, Cancellation, TokenFactory};
use crate::delivery::{OwnerCallback, ResultSink};
use crate::error::{ControllerError, ProcessError, ScheduleError};
use crate::executor::{BackgroundExecutor, ThreadExecutor, WorkHandle};
use crate::lifecycle::Lifecycle;
use crate::owner::OwnerContext;
use crate::pool::panic_message;
use crate::stats::{ControllerStats, ControllerStatsSnapshot};
use crate::sync::{CondMutex, DefaultMutexLockStrategy, MutexLockStrategy};

type Lock = DefaultMutexLockStrategy;

/// Folds a batch of requests into a result.
///
/// Runs on the worker thread. Requests arrive in submission order and
/// `previous` is the result of the worker's earlier batches, if any. The
/// controller only checks cancellation between batches; long folds should poll
/// `token` themselves (`token.check_canceled()?` stops with
/// [`ProcessError::Canceled`]).
pub trait Processor<Q, R>: 'static + Send + Sync {
    fn process(&self, requests: Vec<Q>, previous: Option<R>, token: &dyn Cancellation) -> Result<R, ProcessError>;
}

impl<Q, R, F> Processor<Q, R> for F
where
    F: Fn(Vec<Q>, Option<R>, &dyn Cancellation) -> Result<R, ProcessError> + Send + Sync + 'static
{
    fn process(&self, requests: Vec<Q>, previous: Option<R>, token: &dyn Cancellation) -> Result<R, ProcessError> {
        self(requests, previous, token)
    }
}

struct ActiveTask {
    id: u64,
    token: Arc<dyn Cancellation>,
    handle: Option<Box<dyn WorkHandle>>
}

struct Reservation {
    id: u64,
    token: Arc<dyn Cancellation>
}

struct ControllerState<Q, R> {
    pending: Vec<Q>,
    active: Option<ActiveTask>,
    /// Result of a retired worker whose replacement has not drained yet.
    carry: Option<R>,
    ready: VecDeque<R>,
    draining: bool,
    sink_thread: Option<ThreadId>,
    retired: Option<Box<dyn WorkHandle>>,
    next_worker: u64,
    closed: bool
}

impl<Q, R> ControllerState<Q, R> {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            active: None,
            carry: None,
            ready: VecDeque::new(),
            draining: false,
            sink_thread: None,
            retired: None,
            next_worker: 0,
            closed: false
        }
    }

    /// Claims the worker slot for a new worker.
    fn reserve(&mut self, tokens: &TokenFactory) -> Reservation {
        let id = self.next_worker;
        self.next_worker += 1;

        let token = tokens();
        self.active = Some(ActiveTask { id, token: token.clone(), handle: None });
        Reservation { id, token }
    }

    fn is_active(&self, id: u64) -> bool {
        self.active.as_ref().map_or(false, |a| a.id == id)
    }

    fn is_idle(&self) -> bool {
        self.active.is_none() && self.ready.is_empty() && !self.draining
    }
}

enum Finished {
    /// The slot was cleared and the result queued for delivery.
    Deliver,
    /// Requests raced in; the reserved replacement takes over.
    Replaced(Reservation),
    /// Nothing left to do: no result, or the worker no longer owns the slot.
    Done
}

enum Exit {
    Canceled,
    Failed
}

struct Shared<Q, R> {
    name: String,
    processor: Box<dyn Processor<Q, R>>,
    sink: Box<dyn ResultSink<R>>,
    executor: Arc<dyn BackgroundExecutor>,
    tokens: TokenFactory,
    root: CancelToken,
    lifecycle: Lifecycle,
    state: CondMutex<ControllerState<Q, R>>,
    stats: ControllerStats
}

impl<Q: 'static + Send, R: 'static + Send> Shared<Q, R> {
    fn submit(self: &Arc<Self>, requests: Vec<Q>) -> Result<(), ControllerError> {
        let reservation = {
            let mut st = Lock::lock(&self.state.mutex);
            if st.closed {
                tracing::debug!(controller = %self.name, requests = requests.len(), "controller disposed; ignoring submit");
                return Ok(());
            }

            self.stats.record_submitted(requests.len());
            if requests.is_empty() {
                return Ok(());
            }

            st.pending.extend(requests);
            if st.active.is_some() {
                return Ok(());
            }
            st.reserve(&self.tokens)
        };

        self.launch(reservation).map_err(|source| ControllerError::Schedule { name: self.name.clone(), source })
    }

    /// Schedules the worker for a reservation. Runs without the state lock held,
    /// so executors may run the work inline.
    fn launch(self: &Arc<Self>, reservation: Reservation) -> Result<(), ScheduleError> {
        let Reservation { id, token } = reservation;
        let shared = Arc::clone(self);
        let worker_token = token.clone();
        let scheduled = self.executor.schedule(Box::new(move || shared.run_worker(id, worker_token)));

        let mut st = Lock::lock(&self.state.mutex);
        match scheduled {
            Ok(handle) => {
                self.stats.record_worker_started();
                tracing::debug!(controller = %self.name, worker = id, "worker scheduled");

                match st.active.as_mut() {
                    Some(active) if active.id == id => active.handle = Some(handle),
                    _ => {
                        if token.is_canceled() {
                            handle.cancel();
                        }
                        if st.closed {
                            st.retired = Some(handle);
                        }
                    }
                }
                Ok(())
            }
            Err(err) => {
                if st.is_active(id) {
                    st.active = None;
                    self.state.condvar.notify_all();
                }
                Err(err)
            }
        }
    }

    fn relaunch(self: &Arc<Self>, reservation: Reservation) {
        let id = reservation.id;
        if let Err(err) = self.launch(reservation) {
            tracing::error!(
                controller = %self.name,
                worker = id,
                error = %err,
                "failed to start replacement worker; pending requests and the carried result wait for the next submit"
            );
        }
    }

    fn run_worker(self: Arc<Self>, id: u64, token: Arc<dyn Cancellation>) {
        let mut result = None;
        let mut first_drain = true;

        loop {
            if token.is_canceled() {
                return self.worker_exit(id, Exit::Canceled);
            }

            let batch = {
                let mut st = Lock::lock(&self.state.mutex);
                if !st.is_active(id) {
                    return;
                }
                if first_drain {
                    first_drain = false;
                    result = st.carry.take();
                }
                std::mem::take(&mut st.pending)
            };

            if batch.is_empty() {
                match self.worker_finished(id, result) {
                    Finished::Deliver => self.drain_deliveries(),
                    Finished::Replaced(next) => self.relaunch(next),
                    Finished::Done => {}
                }
                return;
            }

            let size = batch.len();
            let previous = result.take();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| self.processor.process(batch, previous, &*token)));

            match outcome {
                Ok(Ok(folded)) => {
                    self.stats.record_batch();
                    tracing::trace!(controller = %self.name, worker = id, requests = size, "folded batch");
                    result = Some(folded);
                }
                Ok(Err(ProcessError::Canceled(_))) => return self.worker_exit(id, Exit::Canceled),
                Ok(Err(ProcessError::Failed(err))) => {
                    tracing::error!(controller = %self.name, worker = id, error = %err, "unexpected failure while processing requests");
                    return self.worker_exit(id, Exit::Failed);
                }
                Err(panic) => {
                    tracing::error!(controller = %self.name, worker = id, panic = %panic_message(panic.as_ref()), "request processing panicked");
                    return self.worker_exit(id, Exit::Failed);
                }
            }
        }
    }

    /// Called after an empty drain. Clears the slot only if nothing raced in;
    /// otherwise `result` is carried over to the replacement.
    fn worker_finished(&self, id: u64, result: Option<R>) -> Finished {
        let mut st = Lock::lock(&self.state.mutex);
        if !st.is_active(id) {
            return Finished::Done;
        }

        if !st.pending.is_empty() {
            tracing::debug!(controller = %self.name, worker = id, "requests arrived while retiring; handing over to a replacement");
            st.carry = result;
            return Finished::Replaced(st.reserve(&self.tokens));
        }

        st.active = None;
        self.state.condvar.notify_all();
        match result {
            Some(result) => {
                st.ready.push_back(result);
                Finished::Deliver
            }
            None => Finished::Done
        }
    }

    fn worker_exit(self: &Arc<Self>, id: u64, exit: Exit) {
        match exit {
            Exit::Canceled => {
                self.stats.record_cancellation();
                tracing::debug!(controller = %self.name, worker = id, "worker canceled; partial result discarded");
            }
            Exit::Failed => self.stats.record_failure()
        }

        let restart = {
            let mut st = Lock::lock(&self.state.mutex);
            if !st.is_active(id) {
                return;
            }

            match exit {
                Exit::Canceled if !st.closed && !st.pending.is_empty() => Some(st.reserve(&self.tokens)),
                _ => {
                    st.active = None;
                    self.state.condvar.notify_all();
                    None
                }
            }
        };

        if let Some(reservation) = restart {
            self.relaunch(reservation);
        }
    }

    /// Hands queued results to the sink in order. Returns at once if another
    /// call up the stack or on another thread is already doing so.
    fn drain_deliveries(&self) {
        let mut st = Lock::lock(&self.state.mutex);
        if st.draining {
            return;
        }
        st.draining = true;

        while let Some(result) = st.ready.pop_front() {
            let skip = st.closed || self.lifecycle.is_disposed();
            if !skip {
                st.sink_thread = Some(std::thread::current().id());
            }
            drop(st);

            if skip {
                self.stats.record_dropped();
                tracing::trace!(controller = %self.name, "controller disposed; dropping result");
            }
            else {
                match std::panic::catch_unwind(AssertUnwindSafe(|| self.sink.deliver(result))) {
                    Ok(()) => self.stats.record_delivered(),
                    Err(panic) => {
                        tracing::error!(controller = %self.name, panic = %panic_message(panic.as_ref()), "result delivery panicked");
                    }
                }
            }

            st = Lock::lock(&self.state.mutex);
            st.sink_thread = None;
            self.state.condvar.notify_all();
        }

        st.draining = false;
        self.state.condvar.notify_all();
    }

    fn cancel_current(&self) {
        let st = Lock::lock(&self.state.mutex);
        if let Some(active) = &st.active {
            tracing::debug!(controller = %self.name, worker = active.id, "canceling current worker");
            active.token.cancel();
        }
    }

    /// Runs once, from the controller lifecycle's dispose hook. Returns after
    /// any sink call in progress on another thread has finished.
    fn shutdown(&self) {
        let (active, pending, carry) = {
            let mut st = Lock::lock(&self.state.mutex);
            if st.closed {
                return;
            }
            st.closed = true;
            (st.active.take(), std::mem::take(&mut st.pending), st.carry.take())
        };
        self.state.condvar.notify_all();
        tracing::debug!(controller = %self.name, dropped_requests = pending.len(), "controller disposed");
        drop(pending);
        drop(carry);

        self.root.cancel();
        let retired = active.and_then(|active| {
            active.token.cancel();
            let handle = active.handle?;
            if handle.cancel() {
                tracing::debug!(controller = %self.name, worker = active.id, "revoked worker before it started");
            }
            Some(handle)
        });

        let me = std::thread::current().id();
        let mut st = Lock::lock(&self.state.mutex);
        if retired.is_some() {
            st.retired = retired;
        }
        while st.sink_thread.map_or(false, |thread| thread != me) {
            st = Lock::wait(&self.state.condvar, st);
        }
    }

    fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = Lock::lock(&self.state.mutex);
        while !st.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = Lock::wait_timeout(&self.state.condvar, st, deadline - now).0;
        }

        true
    }
}

/// Runs at most one background worker at a time over a stream of requests.
///
/// Dropping the controller disposes it.
pub struct SingleTaskController<Q: 'static + Send, R: 'static + Send> {
    shared: Arc<Shared<Q, R>>
}

impl<Q: 'static + Send, R: 'static + Send> SingleTaskController<Q, R> {
    pub fn builder(name: impl Into<String>) -> ControllerBuilder {
        ControllerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues `request`, starting a worker if none is active.
    ///
    /// Fails only when a worker had to be started and the executor refused it;
    /// the request then stays queued for the next submit. After
    /// [`dispose`](Self::dispose) this is a silent no-op.
    pub fn submit(&self, request: Q) -> Result<(), ControllerError> {
        self.shared.submit(vec![request])
    }

    /// Queues several requests in order, starting at most one worker.
    pub fn submit_all(&self, requests: impl IntoIterator<Item = Q>) -> Result<(), ControllerError> {
        self.shared.submit(requests.into_iter().collect())
    }

    /// Cancels the active worker without closing the controller. Pending and
    /// future requests are handled by a fresh worker once it has unwound.
    pub fn cancel_current(&self) {
        self.shared.cancel_current();
    }

    /// Cancels the active worker, drops pending requests and suppresses delivery.
    /// Idempotent.
    ///
    /// If the sink is being called on another thread, waits for that call to
    /// return, so no result reaches the sink after `dispose` returns.
    pub fn dispose(&self) {
        self.shared.lifecycle.dispose();
    }

    /// Disposes, then waits up to `timeout` for a canceled worker to unwind.
    /// Must not be called from the worker or from a synchronous result callback.
    pub fn dispose_and_wait(&self, timeout: Duration) -> bool {
        self.dispose();
        let retired = Lock::lock(&self.shared.state.mutex).retired.take();
        let Some(handle) = retired else {
            return true;
        };

        let finished = handle.wait_timeout(timeout);
        if !finished {
            Lock::lock(&self.shared.state.mutex).retired.get_or_insert(handle);
        }
        finished
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lifecycle.is_disposed()
    }

    /// No worker is active and no result is being handed over.
    pub fn is_idle(&self) -> bool {
        Lock::lock(&self.shared.state.mutex).is_idle()
    }

    /// Blocks until [`is_idle`](Self::is_idle) holds or `timeout` elapses.
    /// Must not be called from a synchronous result callback.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.shared.wait_for_idle(timeout)
    }

    pub fn pending_len(&self) -> usize {
        Lock::lock(&self.shared.state.mutex).pending.len()
    }

    pub fn stats(&self) -> ControllerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// The controller's own lifecycle, a child of the owner lifecycle if one was given.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.shared.lifecycle
    }
}

impl<Q: 'static + Send, R: 'static + Send> Drop for SingleTaskController<Q, R> {
    fn drop(&mut self) {
        self.shared.lifecycle.dispose();
    }
}

impl<Q: 'static + Send, R: 'static + Send> fmt::Debug for SingleTaskController<Q, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleTaskController")
            .field("name", &self.shared.name)
            .field("disposed", &self.is_disposed())
            .field("idle", &self.is_idle())
            .field("pending", &self.pending_len())
            .finish()
    }
}

/// Configures and builds a [`SingleTaskController`].
///
/// Defaults: a [`ThreadExecutor`] named after the controller, worker tokens that
/// are children of a per-controller [`CancelToken`], and no owner lifecycle.
pub struct ControllerBuilder {
    name: String,
    executor: Option<Arc<dyn BackgroundExecutor>>,
    tokens: Option<TokenFactory>,
    owner: Option<Lifecycle>
}

impl ControllerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), executor: None, tokens: None, owner: None }
    }

    pub fn executor(self, executor: impl BackgroundExecutor) -> Self {
        self.shared_executor(Arc::new(executor))
    }

    pub fn shared_executor(mut self, executor: Arc<dyn BackgroundExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the factory for the token each worker polls.
    pub fn cancellation<C: Cancellation>(mut self, factory: impl Fn() -> C + Send + Sync + 'static) -> Self {
        self.tokens = Some(Arc::new(move || Arc::new(factory()) as Arc<dyn Cancellation>));
        self
    }

    /// Disposes the controller when `owner` is disposed.
    pub fn lifecycle(mut self, owner: &Lifecycle) -> Self {
        self.owner = Some(owner.clone());
        self
    }

    pub fn build<Q, R>(self, processor: impl Processor<Q, R>, sink: impl ResultSink<R>) -> Result<SingleTaskController<Q, R>, ControllerError>
    where
        Q: 'static + Send,
        R: 'static + Send
    {
        self.build_with(processor, move |_| Box::new(sink) as Box<dyn ResultSink<R>>)
    }

    /// Builds a controller that delivers each result to `callback` on `context`,
    /// skipping delivery once the controller or its owner is disposed.
    pub fn build_with_callback<Q, R>(
        self,
        processor: impl Processor<Q, R>,
        context: Arc<dyn OwnerContext>,
        callback: impl Fn(R) + Send + Sync + 'static
    ) -> Result<SingleTaskController<Q, R>, ControllerError>
    where
        Q: 'static + Send,
        R: 'static + Send
    {
        self.build_with(processor, move |lifecycle: &Lifecycle| Box::new(OwnerCallback::new(context, lifecycle.clone(), callback)) as Box<dyn ResultSink<R>>)
    }

    fn build_with<Q, R>(
        self,
        processor: impl Processor<Q, R>,
        sink: impl FnOnce(&Lifecycle) -> Box<dyn ResultSink<R>>
    ) -> Result<SingleTaskController<Q, R>, ControllerError>
    where
        Q: 'static + Send,
        R: 'static + Send
    {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ControllerError::InvalidConfig("controller name must not be empty".into()));
        }

        let lifecycle = match &self.owner {
            Some(owner) => owner.child(),
            None => Lifecycle::new()
        };
        let executor = self.executor.unwrap_or_else(|| Arc::new(ThreadExecutor::new(name.clone())));
        let root = CancelToken::new();
        let tokens = self.tokens.unwrap_or_else(|| child_token_factory(root.clone()));

        let shared = Arc::new(Shared {
            sink: sink(&lifecycle),
            name,
            processor: Box::new(processor),
            executor,
            tokens,
            root,
            lifecycle: lifecycle.clone(),
            state: CondMutex::new(ControllerState::new()),
            stats: ControllerStats::default()
        });

        let weak = Arc::downgrade(&shared);
        lifecycle.on_dispose(move || {
            if let Some(shared) = weak.upgrade() {
                shared.shutdown();
            }
        });

        Ok(SingleTaskController { shared })
    }
}
