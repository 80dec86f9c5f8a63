use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use fxhash::FxHashMap;

use crate::sync::{DefaultMutexLockStrategy, MutexLockStrategy, Mutex};

/// Identifies a hook registered with [`Lifecycle::on_dispose`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Disposal state of an owner, shared by everything that must stop working for it.
///
/// Disposal is one-way and idempotent. Hooks run once, in reverse registration
/// order, on the thread that disposes. Children are disposed with their parent.
#[derive(Clone, Default)]
pub struct Lifecycle {
    inner: Arc<LifecycleInner>
}

#[derive(Default)]
struct LifecycleInner {
    disposed: AtomicBool,
    hooks: Mutex<Hooks>,
    parent: Mutex<Option<(Weak<LifecycleInner>, HookId)>>
}

#[derive(Default)]
struct Hooks {
    next_id: u64,
    registered: FxHashMap<u64, Box<dyn FnOnce() + Send>>
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a lifecycle that is disposed together with `self`.
    ///
    /// A child of an already disposed lifecycle starts out disposed.
    pub fn child(&self) -> Lifecycle {
        let child = Lifecycle::new();
        let weak = Arc::downgrade(&child.inner);
        let hook = self.on_dispose(move || {
            if let Some(inner) = weak.upgrade() {
                Lifecycle { inner }.dispose();
            }
        });

        if let Some(hook) = hook {
            *DefaultMutexLockStrategy::lock(&child.inner.parent) = Some((Arc::downgrade(&self.inner), hook));
        }
        child
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Disposes this lifecycle and its children. Later calls do nothing.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut hooks: Vec<_> = std::mem::take(&mut DefaultMutexLockStrategy::lock(&self.inner.hooks).registered).into_iter().collect();
        hooks.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        tracing::debug!(hooks = hooks.len(), "disposing lifecycle");
        for (_, hook) in hooks {
            hook();
        }

        let parent = DefaultMutexLockStrategy::lock(&self.inner.parent).take();
        if let Some((parent, hook)) = parent {
            if let Some(inner) = parent.upgrade() {
                Lifecycle { inner }.remove_hook(hook);
            }
        }
    }

    /// Registers `hook` to run on disposal. When already disposed, the hook runs
    /// immediately and `None` is returned.
    pub fn on_dispose(&self, hook: impl FnOnce() + Send + 'static) -> Option<HookId> {
        {
            let mut hooks = DefaultMutexLockStrategy::lock(&self.inner.hooks);
            if !self.is_disposed() {
                let id = hooks.next_id;
                hooks.next_id += 1;
                hooks.registered.insert(id, Box::new(hook));
                return Some(HookId(id));
            }
        }

        hook();
        None
    }

    /// Unregisters a hook that has not run yet. Returns `true` if it was removed.
    pub fn remove_hook(&self, id: HookId) -> bool {
        DefaultMutexLockStrategy::lock(&self.inner.hooks).registered.remove(&id.0).is_some()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle").field("disposed", &self.is_disposed()).finish()
    }
}
