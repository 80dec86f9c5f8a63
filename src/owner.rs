//! Owner execution contexts: where results are handed back.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{mpsc, Arc};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::pool::panic_message;
use crate::sync::{CondMutex, DefaultMutexLockStrategy, MutexLockStrategy, Mutex};

type Action = Box<dyn FnOnce() + Send>;

/// A single-threaded execution context that owns some state.
pub trait OwnerContext: 'static + Send + Sync {
    /// Whether the calling thread is this context.
    fn is_current(&self) -> bool;

    /// Schedules `action` to run on this context. Must not block on the action.
    fn dispatch(&self, action: Action);
}

impl<C: OwnerContext + ?Sized> OwnerContext for Arc<C> {
    fn is_current(&self) -> bool {
        (**self).is_current()
    }

    fn dispatch(&self, action: Action) {
        (**self).dispatch(action)
    }
}

fn run_action(action: Action) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(action)) {
        tracing::error!(panic = %panic_message(panic.as_ref()), "owner action panicked");
    }
}

/// Owner context bound to the thread that created it. Dispatched actions run
/// only when that thread calls [`PumpedContext::pump`].
pub struct PumpedContext {
    owner: ThreadId,
    queue: CondMutex<VecDeque<Action>>
}

impl PumpedContext {
    pub fn new() -> Self {
        Self { owner: std::thread::current().id(), queue: CondMutex::new(VecDeque::new()) }
    }

    /// Runs every queued action. Returns how many ran; always zero off the owner thread.
    pub fn pump(&self) -> usize {
        if !self.is_current() {
            tracing::warn!("pump called off the owner thread");
            return 0;
        }

        let mut ran = 0;
        loop {
            let action = DefaultMutexLockStrategy::lock(&self.queue.mutex).pop_front();
            match action {
                Some(action) => {
                    run_action(action);
                    ran += 1;
                }
                None => return ran
            }
        }
    }

    /// Waits up to `timeout` for at least one action, then pumps.
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut queue = DefaultMutexLockStrategy::lock(&self.queue.mutex);
        while queue.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            queue = DefaultMutexLockStrategy::wait_timeout(&self.queue.condvar, queue, deadline - now).0;
        }
        drop(queue);

        self.pump()
    }

    pub fn pending(&self) -> usize {
        DefaultMutexLockStrategy::lock(&self.queue.mutex).len()
    }
}

impl Default for PumpedContext {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerContext for PumpedContext {
    fn is_current(&self) -> bool {
        std::thread::current().id() == self.owner
    }

    fn dispatch(&self, action: Action) {
        DefaultMutexLockStrategy::lock(&self.queue.mutex).push_back(action);
        self.queue.condvar.notify_all();
    }
}

/// Owner context backed by a dedicated thread that runs dispatched actions in order.
pub struct EventLoop {
    thread: ThreadId,
    sender: Mutex<Option<mpsc::Sender<Action>>>,
    join: Mutex<Option<JoinHandle<()>>>
}

impl EventLoop {
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Action>();
        let join = std::thread::Builder::new().name(name.into()).spawn(move || {
            while let Ok(action) = receiver.recv() {
                run_action(action);
            }
        })?;

        Ok(Self { thread: join.thread().id(), sender: Mutex::new(Some(sender)), join: Mutex::new(Some(join)) })
    }

    /// Stops accepting actions, lets queued ones finish and joins the thread.
    ///
    /// Called on the loop's own thread it only stops accepting actions.
    pub fn shutdown(&self) {
        drop(DefaultMutexLockStrategy::lock(&self.sender).take());
        if self.is_current() {
            return;
        }

        let join = DefaultMutexLockStrategy::lock(&self.join).take();
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!("event loop thread panicked");
            }
        }
    }
}

impl OwnerContext for EventLoop {
    fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    fn dispatch(&self, action: Action) {
        let sent = match DefaultMutexLockStrategy::lock(&self.sender).as_ref() {
            Some(sender) => sender.send(action).is_ok(),
            None => false
        };

        if !sent {
            tracing::trace!("event loop is shut down; dropping action");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
