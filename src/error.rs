//! Error types for controllers, executors and user folds.

use thiserror::Error;

/// Boxed error returned by a user fold.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Cooperative cancellation was observed.
///
/// Not a failure: workers that see it unwind silently.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation canceled")]
pub struct Canceled;

/// The executor could not start a unit of work.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The executor has been shut down and accepts no more work.
    #[error("executor is shut down")]
    Shutdown,

    /// The executor refused the work for another reason.
    #[error("executor rejected work: {0}")]
    Rejected(String),
}

/// Errors surfaced by a [`SingleTaskController`](crate::SingleTaskController) to its callers.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Starting a worker failed. Not retried by the controller.
    #[error("controller `{name}` failed to schedule a worker: {source}")]
    Schedule {
        name: String,
        #[source]
        source: ScheduleError,
    },

    /// The builder was given unusable settings.
    #[error("invalid controller configuration: {0}")]
    InvalidConfig(String),
}

/// Outcome of a failed [`Processor::process`](crate::Processor::process) call.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The fold observed cancellation and stopped early.
    #[error(transparent)]
    Canceled(#[from] Canceled),

    /// The fold failed; logged as unexpected and the worker stops.
    #[error("fold failed: {0}")]
    Failed(#[source] BoxError),
}

impl ProcessError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        Self::Failed(err.into())
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_converts_into_process_error() {
        fn check() -> Result<(), ProcessError> {
            Err::<(), _>(Canceled)?;
            Ok(())
        }

        assert!(check().unwrap_err().is_canceled());
    }

    #[test]
    fn test_schedule_error_names_controller() {
        let err = ControllerError::Schedule { name: "log-filter".into(), source: ScheduleError::Shutdown };
        assert_eq!(err.to_string(), "controller `log-filter` failed to schedule a worker: executor is shut down");
    }

    #[test]
    fn test_failed_wraps_message() {
        let err = ProcessError::failed("bad index");
        assert!(!err.is_canceled());
        assert_eq!(err.to_string(), "fold failed: bad index");
    }
}
