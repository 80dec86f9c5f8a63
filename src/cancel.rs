use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Canceled;

/// A cooperative cancellation signal that running work polls.
pub trait Cancellation: 'static + Send + Sync {
    fn cancel(&self);
    fn is_canceled(&self) -> bool;

    fn check_canceled(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            Err(Canceled)
        }
        else {
            Ok(())
        }
    }
}

/// Creates a fresh token for every worker a controller starts.
pub type TokenFactory = Arc<dyn Fn() -> Arc<dyn Cancellation> + Send + Sync>;

/// Token factory that hands out children of `parent`, so canceling the parent
/// cancels every worker token it produced.
pub fn child_token_factory(parent: CancelToken) -> TokenFactory {
    Arc::new(move || Arc::new(parent.child()) as Arc<dyn Cancellation>)
}

/// Default token, backed by [`CancellationToken`]. Clones share the same state.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token canceled together with `self`, but cancelable on its own.
    pub fn child(&self) -> Self {
        Self { inner: self.inner.child_token() }
    }
}

impl From<CancellationToken> for CancelToken {
    fn from(inner: CancellationToken) -> Self {
        Self { inner }
    }
}

impl Cancellation for CancelToken {
    fn cancel(&self) {
        self.inner.cancel();
    }

    fn is_canceled(&self) -> bool {
        self.inner.is_cancelled()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken").field("canceled", &self.is_canceled()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(other.check_canceled().is_ok());

        token.cancel();
        assert!(other.is_canceled());
        assert_eq!(other.check_canceled(), Err(Canceled));
    }

    #[test]
    fn test_factory_children_follow_parent() {
        let parent = CancelToken::new();
        let factory = child_token_factory(parent.clone());
        let a = factory();
        let b = factory();

        a.cancel();
        assert!(a.is_canceled());
        assert!(!b.is_canceled());
        assert!(!parent.is_canceled());

        parent.cancel();
        assert!(b.is_canceled());
    }
}
