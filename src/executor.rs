//! The seam between controllers and whatever runs their workers.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ScheduleError;
use crate::sync::{CondMutex, DefaultMutexLockStrategy, MutexLockStrategy};

/// Runs zero-argument units of work off the caller's thread.
pub trait BackgroundExecutor: 'static + Send + Sync {
    fn schedule(&self, work: Box<dyn FnOnce() + Send>) -> Result<Box<dyn WorkHandle>, ScheduleError>;
}

impl<E: BackgroundExecutor + ?Sized> BackgroundExecutor for Arc<E> {
    fn schedule(&self, work: Box<dyn FnOnce() + Send>) -> Result<Box<dyn WorkHandle>, ScheduleError> {
        (**self).schedule(work)
    }
}

/// Handle to a unit of work accepted by a [`BackgroundExecutor`].
pub trait WorkHandle: Send + Sync {
    /// Revokes the work if it has not started yet. Returns `true` when the work
    /// was revoked and will never run; running work is left alone.
    fn cancel(&self) -> bool;

    fn is_finished(&self) -> bool;

    /// Blocks until the work finished or was revoked. Returns `false` on timeout.
    fn wait_timeout(&self, timeout: Duration) -> bool;
}

pub(crate) struct Completion<M: MutexLockStrategy = DefaultMutexLockStrategy> {
    state: CondMutex<bool>,
    data: PhantomData<M>
}

impl<M: MutexLockStrategy> Completion<M> {
    pub fn new() -> Self {
        Self { state: CondMutex::new(false), data: PhantomData }
    }

    pub fn finish(&self) {
        *M::lock(&self.state.mutex) = true;
        self.state.condvar.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        *M::lock(&self.state.mutex)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = M::lock(&self.state.mutex);
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            done = M::wait_timeout(&self.state.condvar, done, deadline - now).0;
        }

        true
    }
}

/// Marks a [`Completion`] finished when dropped, including during unwinding.
pub(crate) struct FinishOnDrop<M: MutexLockStrategy>(pub Arc<Completion<M>>);

impl<M: MutexLockStrategy> Drop for FinishOnDrop<M> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Starts a dedicated OS thread for every unit of work.
///
/// A controller never occupies more than one worker at a time, so this is a
/// reasonable default when no shared pool is available.
#[derive(Clone, Debug)]
pub struct ThreadExecutor {
    name: String
}

impl ThreadExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new("single-task-worker")
    }
}

impl BackgroundExecutor for ThreadExecutor {
    fn schedule(&self, work: Box<dyn FnOnce() + Send>) -> Result<Box<dyn WorkHandle>, ScheduleError> {
        let completion = Arc::new(Completion::<DefaultMutexLockStrategy>::new());
        let done = FinishOnDrop(completion.clone());

        std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _done = done;
                work();
            })
            .map_err(|err| ScheduleError::Rejected(err.to_string()))?;

        Ok(Box::new(ThreadHandle { completion }))
    }
}

struct ThreadHandle {
    completion: Arc<Completion>
}

impl WorkHandle for ThreadHandle {
    fn cancel(&self) -> bool {
        false
    }

    fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_thread_executor_runs_work() {
        let (tx, rx) = mpsc::channel();
        let handle = ThreadExecutor::new("test-worker").schedule(Box::new(move || {
            tx.send(std::thread::current().name().map(str::to_owned)).unwrap();
        })).unwrap();

        assert!(handle.wait_timeout(Duration::from_secs(5)));
        assert!(handle.is_finished());
        assert!(!handle.cancel());
        assert_eq!(rx.recv().unwrap().as_deref(), Some("test-worker"));
    }

    #[test]
    fn test_completion_finishes_on_panic() {
        let completion = Arc::new(Completion::<DefaultMutexLockStrategy>::new());
        let done = FinishOnDrop(completion.clone());
        let _ = std::thread::spawn(move || {
            let _done = done;
            panic!("worker blew up");
        }).join();

        assert!(completion.wait_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_completion_times_out() {
        let completion = Completion::<DefaultMutexLockStrategy>::new();
        assert!(!completion.wait_timeout(Duration::from_millis(5)));
    }
}
