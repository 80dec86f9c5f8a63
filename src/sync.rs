use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
pub use std::sync::{Condvar, Mutex};
#[cfg(target_arch = "wasm32")]
pub use wasm_sync::{Condvar, Mutex};

/// Determines how the crate's mutexes and condition variables are acquired.
///
/// Poisoned locks are recovered rather than propagated.
pub trait MutexLockStrategy: 'static + Default + Clone + Send + Sync {
    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for at most `timeout`. The flag is `true` when the wait timed out.
    fn wait_timeout<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>, timeout: Duration) -> (MutexGuard<'a, T>, bool) {
        let (guard, res) = condvar.wait_timeout(guard, timeout).unwrap_or_else(PoisonError::into_inner);
        (guard, res.timed_out())
    }
}

#[derive(Default, Clone, Debug)]
pub struct DefaultMutexLockStrategy {}
impl MutexLockStrategy for DefaultMutexLockStrategy {}

#[derive(Default)]
pub(crate) struct CondMutex<T> {
    pub condvar: Condvar,
    pub mutex: Mutex<T>
}

impl<T> CondMutex<T> {
    pub fn new(data: T) -> Self {
        Self { mutex: Mutex::new(data), condvar: Condvar::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let m = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _g = m.lock().unwrap();
            panic!("poison");
        }).join();

        assert!(mutex.is_poisoned());
        *DefaultMutexLockStrategy::lock(&mutex) += 1;
        assert_eq!(*DefaultMutexLockStrategy::lock(&mutex), 2);
    }

    #[test]
    fn test_wait_timeout_reports_timeout() {
        let state = CondMutex::new(());
        let guard = DefaultMutexLockStrategy::lock(&state.mutex);
        let (_guard, timed_out) = DefaultMutexLockStrategy::wait_timeout(&state.condvar, guard, Duration::from_millis(5));
        assert!(timed_out);
    }
}
