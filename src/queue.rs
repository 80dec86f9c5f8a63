use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use fxhash::FxBuildHasher;
use priority_queue::PriorityQueue;
use takecell::TakeOwnCell;

use crate::error::ScheduleError;
use crate::executor::{BackgroundExecutor, Completion, FinishOnDrop, WorkHandle};
use crate::pool::{ClosureWorkUnit, WorkProvider, WorkUnit, IDLE_POLL};
use crate::sync::{CondMutex, DefaultMutexLockStrategy, MutexLockStrategy};

/// A group of work units handed out one at a time.
trait WorkCollection: 'static + Send + Sync {
    fn next_unit(&self) -> Option<Box<dyn WorkUnit>>;

    /// Called when the collection is removed from a queue before being drained.
    fn revoke(&self) {}
}

/// Priority-ordered [`WorkProvider`]. Higher priorities are served first.
///
/// A queue can be served by a [`TaskPool`](crate::TaskPool), drained on the
/// current thread with [`TaskQueue::run_pending`], or both.
#[derive(Clone)]
pub struct TaskQueue<P: Send + Clone + Ord = i32, M: MutexLockStrategy = DefaultMutexLockStrategy> {
    state: Arc<CondMutex<TaskQueueState<P>>>,
    data: PhantomData<M>
}

impl<P: 'static + Send + Clone + Ord, M: MutexLockStrategy> TaskQueue<P, M> {
    fn spawn<T: WorkCollection>(&self, task: T, priority: P) -> Result<QueueHandle<P, M>, ScheduleError> {
        let mut tqs = M::lock(&self.state.mutex);
        if tqs.closed {
            return Err(ScheduleError::Shutdown);
        }

        let work: Arc<dyn WorkCollection> = Arc::new(task);
        let work = WorkReference::from(work);
        tqs.push_task(work.clone(), priority);
        drop(tqs);

        self.wake_listeners();
        Ok(QueueHandle { state: self.state.clone(), work, completion: None, data: PhantomData })
    }

    /// Queues a closure that runs exactly once.
    pub fn spawn_once(&self, func: impl FnOnce() + Send + 'static, priority: P) -> Result<QueueHandle<P, M>, ScheduleError> {
        let func: Box<dyn FnOnce() + Send> = Box::new(func);
        let completion = Arc::new(Completion::new());
        let task = OnceWork { func: TakeOwnCell::new(func), completion: completion.clone() };
        let mut handle = self.spawn(task, priority)?;
        handle.completion = Some(completion);
        Ok(handle)
    }

    /// Returns a [`BackgroundExecutor`] that schedules onto this queue at `priority`.
    pub fn executor(&self, priority: P) -> QueueExecutor<P, M> {
        QueueExecutor { queue: self.clone(), priority }
    }

    /// Executes every queued unit on the calling thread, including units that
    /// those units enqueue. Returns how many units ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let unit = M::lock(&self.state.mutex).next_unit();
            match unit {
                Some(unit) => {
                    unit.execute();
                    ran += 1;
                }
                None => return ran
            }
        }
    }

    pub fn len(&self) -> usize {
        let tqs = M::lock(&self.state.mutex);
        tqs.queue.len() + usize::from(tqs.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects all further work and revokes everything still queued.
    pub fn close(&self) {
        let revoked = {
            let mut tqs = M::lock(&self.state.mutex);
            tqs.closed = true;
            tqs.drain()
        };

        for work in revoked {
            work.revoke();
        }
        self.wake_listeners();
    }

    pub fn is_closed(&self) -> bool {
        M::lock(&self.state.mutex).closed
    }
}

impl<P: 'static + Send + Clone + Ord, M: MutexLockStrategy> Default for TaskQueue<P, M> {
    fn default() -> Self {
        let state = Arc::new(CondMutex::new(TaskQueueState::default()));
        Self { state, data: PhantomData }
    }
}

impl<P: 'static + Send + Clone + Ord, M: MutexLockStrategy> WorkProvider for TaskQueue<P, M> {
    fn next_unit(&self) -> Option<Box<dyn WorkUnit>> {
        let mut tqs = M::lock(&self.state.mutex);
        let res = tqs.next_unit();

        if res.is_none() && !tqs.closed {
            let _ = M::wait_timeout(&self.state.condvar, tqs, IDLE_POLL);
        }

        res
    }

    fn wake_listeners(&self) {
        self.state.condvar.notify_all();
    }
}

/// Schedules work onto a [`TaskQueue`] at a fixed priority.
#[derive(Clone)]
pub struct QueueExecutor<P: Send + Clone + Ord = i32, M: MutexLockStrategy = DefaultMutexLockStrategy> {
    queue: TaskQueue<P, M>,
    priority: P
}

impl<P: 'static + Send + Sync + Clone + Ord, M: MutexLockStrategy> BackgroundExecutor for QueueExecutor<P, M> {
    fn schedule(&self, work: Box<dyn FnOnce() + Send>) -> Result<Box<dyn WorkHandle>, ScheduleError> {
        let handle = self.queue.spawn_once(work, self.priority.clone())?;
        Ok(Box::new(handle))
    }
}

struct TaskQueueState<P: Ord + Clone> {
    current: Option<WorkReference<dyn WorkCollection>>,
    queue: PriorityQueue<WorkReference<dyn WorkCollection>, P, FxBuildHasher>,
    closed: bool
}

impl<P: Ord + Clone> TaskQueueState<P> {
    /// Removes `task` if it is still waiting. Returns `true` when it was removed.
    fn cancel_task(&mut self, task: &WorkReference<dyn WorkCollection>) -> bool {
        if self.queue.remove(task).is_some() {
            return true;
        }

        if self.current.as_ref().map_or(false, |x| x == task) {
            self.current = None;
        }
        false
    }

    fn next_unit(&mut self) -> Option<Box<dyn WorkUnit>> {
        if self.current.is_none() {
            self.current = self.queue.pop().map(|(x, _)| x);
        }

        while let Some(wf) = &self.current {
            if let Some(unit) = wf.next_unit() {
                return Some(unit);
            }

            self.current = self.queue.pop().map(|(x, _)| x);
        }

        None
    }

    fn push_task(&mut self, task: WorkReference<dyn WorkCollection>, priority: P) {
        let _ = self.queue.push(task, priority);
    }

    fn drain(&mut self) -> Vec<WorkReference<dyn WorkCollection>> {
        let mut drained: Vec<_> = self.current.take().into_iter().collect();
        while let Some((work, _)) = self.queue.pop() {
            drained.push(work);
        }
        drained
    }
}

impl<P: Ord + Clone> Default for TaskQueueState<P> {
    fn default() -> Self {
        let current = None;
        let queue = PriorityQueue::with_default_hasher();
        Self { current, queue, closed: false }
    }
}

struct OnceWork<M: MutexLockStrategy> {
    func: TakeOwnCell<Box<dyn FnOnce() + Send>>,
    completion: Arc<Completion<M>>
}

impl<M: MutexLockStrategy> WorkCollection for OnceWork<M> {
    fn next_unit(&self) -> Option<Box<dyn WorkUnit>> {
        let func = self.func.take()?;
        let done = FinishOnDrop(self.completion.clone());
        Some(Box::new(ClosureWorkUnit { func: move || {
            let _done = done;
            func();
        } }))
    }

    fn revoke(&self) {
        drop(self.func.take());
        self.completion.finish();
    }
}

struct WorkReference<T: ?Sized> {
    work: Arc<T>
}

impl<T: ?Sized> From<Arc<T>> for WorkReference<T> {
    fn from(work: Arc<T>) -> Self {
        Self { work }
    }
}

impl<T: ?Sized> Clone for WorkReference<T> {
    fn clone(&self) -> Self {
        Self { work: Arc::clone(&self.work) }
    }
}

impl<T: ?Sized> Deref for WorkReference<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.work
    }
}

impl<T: ?Sized> std::hash::Hash for WorkReference<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.work) as *const ()).hash(state)
    }
}

impl<T: ?Sized> PartialEq for WorkReference<T> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.work), Arc::as_ptr(&other.work))
    }
}

impl<T: ?Sized> Eq for WorkReference<T> {}

/// Handle to work queued on a [`TaskQueue`].
pub struct QueueHandle<P: Ord + Clone, M: MutexLockStrategy> {
    state: Arc<CondMutex<TaskQueueState<P>>>,
    work: WorkReference<dyn WorkCollection>,
    completion: Option<Arc<Completion<M>>>,
    data: PhantomData<M>
}

impl<P: Ord + Clone, M: MutexLockStrategy> QueueHandle<P, M> {
    fn revoke(&self) -> bool {
        let revoked = M::lock(&self.state.mutex).cancel_task(&self.work);
        if revoked {
            self.work.revoke();
        }
        revoked
    }
}

impl<P: Send + Ord + Clone, M: MutexLockStrategy> WorkHandle for QueueHandle<P, M> {
    fn cancel(&self) -> bool {
        self.revoke()
    }

    fn is_finished(&self) -> bool {
        self.completion.as_ref().map_or(false, |c| c.is_finished())
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.as_ref().map_or(false, |c| c.wait_timeout(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TaskPool;
    use std::sync::mpsc;
    use std::sync::Mutex;

    #[test]
    fn test_pool_executes_queue() {
        let pool: TaskPool = TaskPool::new(4);
        let queue: TaskQueue = TaskQueue::default();
        pool.set_work_provider(queue.clone());

        let (tx, rx) = mpsc::channel();
        let handles: Vec<_> = (2..5).map(|x| {
            let tx = tx.clone();
            queue.spawn_once(move || tx.send(x * 2).unwrap(), 0).unwrap()
        }).collect();

        for handle in &handles {
            assert!(handle.wait_timeout(Duration::from_secs(5)));
        }

        let mut res: Vec<_> = rx.try_iter().collect();
        res.sort();
        assert_eq!(res, vec![4, 6, 8]);
    }

    #[test]
    fn test_run_pending_respects_priority() {
        let queue: TaskQueue = TaskQueue::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
            let order = order.clone();
            queue.spawn_once(move || order.lock().unwrap().push(name), priority).unwrap();
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.run_pending(), 3);
        assert!(queue.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_cancel_revokes_unstarted_work() {
        let queue: TaskQueue = TaskQueue::default();
        let (tx, rx) = mpsc::channel::<()>();
        let handle = queue.spawn_once(move || tx.send(()).unwrap(), 0).unwrap();

        assert!(handle.cancel());
        assert!(handle.is_finished());
        assert_eq!(queue.run_pending(), 0);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_cancel_after_start_is_not_revoked() {
        let queue: TaskQueue = TaskQueue::default();
        let handle = queue.spawn_once(|| {}, 0).unwrap();
        assert_eq!(queue.run_pending(), 1);
        assert!(!handle.cancel());
        assert!(handle.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_closed_queue_rejects_work() {
        let queue: TaskQueue = TaskQueue::default();
        let pending = queue.spawn_once(|| {}, 0).unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert!(pending.is_finished());
        assert!(matches!(queue.spawn_once(|| {}, 0), Err(ScheduleError::Shutdown)));
        assert!(queue.executor(0).schedule(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_executor_schedules_at_priority() {
        let queue: TaskQueue<u8> = TaskQueue::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        let low = queue.executor(1);
        let high = queue.executor(9);

        let o = order.clone();
        let first = low.schedule(Box::new(move || o.lock().unwrap().push("low"))).unwrap();
        let o = order.clone();
        let second = high.schedule(Box::new(move || o.lock().unwrap().push("high"))).unwrap();

        queue.run_pending();
        assert!(first.is_finished() && second.is_finished());
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }
}
