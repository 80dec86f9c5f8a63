//! Coalescing single-worker task controller.
//!
//! A [`SingleTaskController`] accepts requests from any thread and folds them on
//! at most one background worker at a time. Requests that arrive while a worker
//! is busy are picked up by that worker in its next batch; only the final
//! accumulated result of a worker is handed to the owner. The owner can cancel
//! the current fold or dispose the controller, after which no further result is
//! delivered.
//!
//! Workers run on a [`BackgroundExecutor`]: a thread per worker by default, or
//! a [`TaskQueue`] served by a [`TaskPool`]. Results are delivered through a
//! [`ResultSink`], for example a callback marshaled to an [`OwnerContext`] or a
//! [`result_channel`].

mod cancel;
mod controller;
mod delivery;
mod error;
mod executor;
mod lifecycle;
mod owner;
mod pool;
mod queue;
mod stats;
mod sync;

pub use cancel::*;
pub use controller::*;
pub use delivery::*;
pub use error::*;
pub use executor::*;
pub use lifecycle::*;
pub use owner::*;
pub use pool::*;
pub use queue::*;
pub use stats::*;
pub use sync::{DefaultMutexLockStrategy, MutexLockStrategy};
