use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;

use crate::sync::{CondMutex, DefaultMutexLockStrategy, MutexLockStrategy};

/// How long an idle pool thread sleeps before re-checking its provider.
pub(crate) const IDLE_POLL: Duration = Duration::from_millis(50);

pub trait WorkUnit: Send {
    fn execute(self: Box<Self>);
}

impl WorkUnit for dyn FnOnce() + Send {
    fn execute(self: Box<Self>) {
        self()
    }
}

pub(crate) struct ClosureWorkUnit<F: FnOnce() + Send> {
    pub func: F
}

impl<F: FnOnce() + Send> WorkUnit for ClosureWorkUnit<F> {
    fn execute(self: Box<Self>) {
        (self.func)()
    }
}

/// Source of work for the threads of a [`TaskPool`].
///
/// `next_unit` may block while no work is available, but should return
/// periodically (or after [`WorkProvider::wake_listeners`]) so that threads can
/// notice a provider change.
pub trait WorkProvider: 'static + Send + Sync {
    fn next_unit(&self) -> Option<Box<dyn WorkUnit>>;
    fn wake_listeners(&self);
}

struct ProviderSlot(Arc<dyn WorkProvider>);

/// Fixed set of threads that execute units pulled from the current [`WorkProvider`].
///
/// Dropping the pool releases its threads once they finish the unit in hand.
pub struct TaskPool<M: MutexLockStrategy = DefaultMutexLockStrategy> {
    provider: Arc<ArcSwapOption<ProviderSlot>>,
    data: PhantomData<M>
}

impl<M: MutexLockStrategy> TaskPool<M> {
    pub fn new(threads: usize) -> Self {
        Self::new_with_spawner(threads, |id, f| {
            if let Err(err) = std::thread::Builder::new().name(format!("task-pool-{id}")).spawn(f) {
                tracing::error!(thread = id, error = %err, "failed to spawn pool thread");
            }
        })
    }

    pub fn new_with_spawner(threads: usize, mut spawner: impl FnMut(usize, Box<dyn FnOnce() + Send + 'static>)) -> Self {
        let initial: Arc<dyn WorkProvider> = Arc::new(EmptyWorkProvider::<M>::default());
        let provider = Arc::new(ArcSwapOption::new(Some(Arc::new(ProviderSlot(initial)))));

        for id in 0..threads {
            Self::start_thread(id, provider.clone(), &mut spawner);
        }

        Self { data: PhantomData, provider }
    }

    pub fn work_provider(&self) -> Option<Arc<dyn WorkProvider>> {
        self.provider.load_full().map(|slot| slot.0.clone())
    }

    pub fn set_work_provider(&self, provider: impl WorkProvider) {
        self.set_provider_option(Some(Arc::new(provider)));
    }

    pub fn set_work_provider_boxed(&self, provider: Arc<dyn WorkProvider>) {
        self.set_provider_option(Some(provider));
    }

    fn set_provider_option(&self, provider: Option<Arc<dyn WorkProvider>>) {
        let old = self.provider.swap(provider.map(|p| Arc::new(ProviderSlot(p))));
        if let Some(old) = old {
            old.0.wake_listeners();
        }
    }

    fn start_thread(id: usize, provider: Arc<ArcSwapOption<ProviderSlot>>, spawner: &mut impl FnMut(usize, Box<dyn FnOnce() + Send + 'static>)) {
        spawner(id, Box::new(move || {
            tracing::debug!(thread = id, "pool thread started");
            while let Some(slot) = provider.load_full() {
                if let Some(unit) = slot.0.next_unit() {
                    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| unit.execute())) {
                        tracing::error!(thread = id, panic = %panic_message(panic.as_ref()), "work unit panicked");
                    }
                }
            }
            tracing::debug!(thread = id, "pool thread stopped");
        }));
    }
}

impl<M: MutexLockStrategy> Drop for TaskPool<M> {
    fn drop(&mut self) {
        self.set_provider_option(None);
    }
}

#[derive(Default)]
pub struct EmptyWorkProvider<M: MutexLockStrategy = DefaultMutexLockStrategy> {
    state: CondMutex<()>,
    data: PhantomData<M>
}

impl<M: MutexLockStrategy> WorkProvider for EmptyWorkProvider<M> {
    fn next_unit(&self) -> Option<Box<dyn WorkUnit>> {
        let _ = M::wait_timeout(&self.state.condvar, M::lock(&self.state.mutex), IDLE_POLL);
        None
    }

    fn wake_listeners(&self) {
        self.state.condvar.notify_all();
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    }
    else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    }
    else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Mutex;

    struct ChannelProvider {
        rx: Mutex<mpsc::Receiver<Box<dyn FnOnce() + Send>>>
    }

    impl WorkProvider for ChannelProvider {
        fn next_unit(&self) -> Option<Box<dyn WorkUnit>> {
            let f = self.rx.lock().unwrap().recv_timeout(IDLE_POLL).ok()?;
            Some(Box::new(ClosureWorkUnit { func: f }))
        }

        fn wake_listeners(&self) {}
    }

    #[test]
    fn test_pool_runs_units_from_provider() {
        let pool: TaskPool = TaskPool::new(2);
        let (work_tx, work_rx) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        pool.set_work_provider(ChannelProvider { rx: Mutex::new(work_rx) });

        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            work_tx.send(Box::new(move || tx.send(i * 2).unwrap())).unwrap();
        }

        let mut res: Vec<_> = (0..4).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        res.sort();
        assert_eq!(res, vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_pool_survives_panicking_unit() {
        let pool: TaskPool = TaskPool::new(1);
        let (work_tx, work_rx) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        pool.set_work_provider(ChannelProvider { rx: Mutex::new(work_rx) });

        let (tx, rx) = mpsc::channel();
        work_tx.send(Box::new(|| panic!("bad unit"))).unwrap();
        work_tx.send(Box::new(move || tx.send(()).unwrap())).unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_drop_stops_threads() {
        let (tx, rx) = mpsc::channel();
        let pool: TaskPool = TaskPool::new_with_spawner(1, |_, f| {
            let tx = tx.clone();
            std::thread::spawn(move || {
                f();
                tx.send(()).unwrap();
            });
        });

        assert!(pool.work_provider().is_some());
        drop(pool);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&7u8), "unknown panic payload");
    }
}
