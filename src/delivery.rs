use std::sync::Arc;

use crate::lifecycle::Lifecycle;
use crate::owner::OwnerContext;

/// Receives the final result of each completed worker.
pub trait ResultSink<R>: 'static + Send + Sync {
    fn deliver(&self, result: R);
}

/// Hands results to a callback on the owner's context, unless the owner is disposed.
///
/// The lifecycle is checked before marshaling and again right before the
/// callback runs. On the owner thread itself the callback runs synchronously.
pub struct OwnerCallback<R> {
    context: Arc<dyn OwnerContext>,
    lifecycle: Lifecycle,
    callback: Arc<dyn Fn(R) + Send + Sync>
}

impl<R: 'static + Send> OwnerCallback<R> {
    pub fn new(context: Arc<dyn OwnerContext>, lifecycle: Lifecycle, callback: impl Fn(R) + Send + Sync + 'static) -> Self {
        Self { context, lifecycle, callback: Arc::new(callback) }
    }
}

impl<R: 'static + Send> ResultSink<R> for OwnerCallback<R> {
    fn deliver(&self, result: R) {
        if self.lifecycle.is_disposed() {
            tracing::trace!("owner disposed; dropping result");
            return;
        }

        if self.context.is_current() {
            (self.callback)(result);
            return;
        }

        let lifecycle = self.lifecycle.clone();
        let callback = self.callback.clone();
        self.context.dispatch(Box::new(move || {
            if lifecycle.is_disposed() {
                tracing::trace!("owner disposed while result was in flight; dropping it");
                return;
            }
            callback(result);
        }));
    }
}

impl<R: 'static, F: Fn(R) + Send + Sync + 'static> ResultSink<R> for F {
    fn deliver(&self, result: R) {
        self(result)
    }
}

/// Creates a channel whose receiver is the owner's handle on delivered results.
///
/// Closing or dropping the receiver invalidates delivery: later results are
/// dropped by the sender without being stored.
pub fn result_channel<R: 'static + Send>() -> (ResultSender<R>, ResultReceiver<R>) {
    let (sender, receiver) = async_channel::unbounded();
    (ResultSender { sender }, ResultReceiver { receiver })
}

pub struct ResultSender<R> {
    sender: async_channel::Sender<R>
}

impl<R> ResultSender<R> {
    /// Whether the receiver still accepts results.
    pub fn is_valid(&self) -> bool {
        !self.sender.is_closed()
    }
}

impl<R> Clone for ResultSender<R> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone() }
    }
}

impl<R: 'static + Send> ResultSink<R> for ResultSender<R> {
    fn deliver(&self, result: R) {
        if self.sender.try_send(result).is_err() {
            tracing::trace!("result receiver closed; dropping result");
        }
    }
}

pub struct ResultReceiver<R> {
    receiver: async_channel::Receiver<R>
}

impl<R> ResultReceiver<R> {
    pub fn try_recv(&self) -> Option<R> {
        self.receiver.try_recv().ok()
    }

    /// Blocks for the next result. Returns `None` once the channel is closed or
    /// every sender is gone and nothing is buffered.
    #[cfg(not(target_family = "wasm"))]
    pub fn recv_blocking(&self) -> Option<R> {
        self.receiver.recv_blocking().ok()
    }

    /// Resolves with the next result, or `None` under the same conditions as
    /// [`recv_blocking`](Self::recv_blocking).
    pub async fn recv(&self) -> Option<R> {
        self.receiver.recv().await.ok()
    }

    /// Invalidates the channel, discards buffered results and wakes every
    /// pending receive.
    pub fn close(&self) {
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owner::PumpedContext;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recording_callback(context: Arc<dyn OwnerContext>, lifecycle: Lifecycle) -> (OwnerCallback<u32>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        (OwnerCallback::new(context, lifecycle, move |r: u32| s.lock().unwrap().push(r)), seen)
    }

    #[test]
    fn test_callback_runs_synchronously_on_owner() {
        let context = Arc::new(PumpedContext::new());
        let (sink, seen) = recording_callback(context.clone(), Lifecycle::new());

        sink.deliver(7);
        assert_eq!(context.pending(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_callback_is_marshaled_from_other_threads() {
        let context = Arc::new(PumpedContext::new());
        let (sink, seen) = recording_callback(context.clone(), Lifecycle::new());

        std::thread::scope(|s| {
            s.spawn(|| sink.deliver(3));
        });

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(context.pump(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_disposal_while_in_flight_drops_result() {
        let context = Arc::new(PumpedContext::new());
        let lifecycle = Lifecycle::new();
        let (sink, seen) = recording_callback(context.clone(), lifecycle.clone());

        std::thread::scope(|s| {
            s.spawn(|| sink.deliver(3));
        });
        lifecycle.dispose();

        assert_eq!(context.pump(), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disposed_owner_is_never_dispatched_to() {
        let context = Arc::new(PumpedContext::new());
        let lifecycle = Lifecycle::new();
        lifecycle.dispose();
        let (sink, seen) = recording_callback(context.clone(), lifecycle);

        sink.deliver(1);
        std::thread::scope(|s| {
            s.spawn(|| sink.deliver(2));
        });

        assert_eq!(context.pending(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_channel_delivers_in_order() {
        let (tx, rx) = result_channel();
        tx.deliver(1);
        tx.deliver(2);

        assert!(tx.is_valid());
        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(rx.recv_blocking(), Some(2));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_closed_receiver_invalidates_sender() {
        let (tx, rx) = result_channel();
        tx.deliver(1);
        rx.close();
        tx.deliver(2);

        assert!(!tx.is_valid());
        assert!(rx.is_closed());
        assert_eq!(rx.try_recv(), None);
        assert_eq!(rx.recv_blocking(), None);

        drop(rx);
        tx.deliver(3);
    }

    #[test]
    fn test_async_recv_waits_for_sender() {
        let (tx, rx) = result_channel();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.deliver("done");
        });

        assert_eq!(futures_executor::block_on(rx.recv()), Some("done"));
        handle.join().unwrap();
        assert_eq!(futures_executor::block_on(rx.recv()), None);
    }

    #[test]
    fn test_concurrent_receives_are_all_woken() {
        let (tx, rx) = result_channel::<u32>();

        let mut got = std::thread::scope(|s| {
            let first = s.spawn(|| futures_executor::block_on(rx.recv()));
            let second = s.spawn(|| futures_executor::block_on(rx.recv()));
            std::thread::sleep(Duration::from_millis(20));
            tx.deliver(1);
            tx.deliver(2);
            vec![first.join().unwrap(), second.join().unwrap()]
        });

        got.sort();
        assert_eq!(got, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_close_wakes_pending_receive() {
        let (tx, rx) = result_channel::<u32>();

        std::thread::scope(|s| {
            let waiting = s.spawn(|| futures_executor::block_on(rx.recv()));
            std::thread::sleep(Duration::from_millis(20));
            rx.close();
            assert_eq!(waiting.join().unwrap(), None);
        });
        assert!(!tx.is_valid());
    }
}
