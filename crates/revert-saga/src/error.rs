use std::any::Any;
use std::fmt;

use thiserror::Error;

use crate::action::BoxError;
use crate::context::CancelReason;

/// How a single user-supplied action went wrong.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Fault {
    /// The action returned an error.
    #[error(transparent)]
    Returned(BoxError),

    /// The action panicked; the payload is rendered as a message.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl Fault {
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            String::from("non-string panic payload")
        };
        Self::Panicked(message)
    }

    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Downcast the returned error, if any, to a concrete type.
    #[must_use]
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: std::error::Error + 'static,
    {
        match self {
            Self::Returned(error) => error.downcast_ref::<T>(),
            Self::Panicked(_) => None,
        }
    }
}

/// A step's forward action failed or panicked.
#[derive(Debug, Error)]
#[error("step '{step}' failed: {fault}")]
pub struct StepError {
    /// Name of the step that failed.
    pub step: String,
    /// What went wrong.
    #[source]
    pub fault: Fault,
}

impl StepError {
    pub(crate) fn new(step: impl Into<String>, fault: Fault) -> Self {
        Self {
            step: step.into(),
            fault,
        }
    }

    fn cancel_reason(&self) -> Option<CancelReason> {
        self.fault.downcast_ref::<CancelReason>().copied()
    }
}

/// One or more members of a concurrent group failed.
///
/// Failures are kept in the group's declaration order.
#[derive(Debug)]
pub struct GroupError {
    failures: Vec<StepError>,
}

impl GroupError {
    pub(crate) fn new(failures: Vec<StepError>) -> Self {
        Self { failures }
    }

    #[must_use]
    pub fn failures(&self) -> &[StepError] {
        &self.failures
    }
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} group member(s) failed", self.failures.len())?;
        for (index, failure) in self.failures.iter().enumerate() {
            let separator = if index == 0 { ": " } else { "; " };
            write!(f, "{separator}{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for GroupError {}

/// The failure that started a rollback.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Trigger {
    /// A sequential step failed.
    #[error(transparent)]
    Step(StepError),

    /// A concurrent group failed.
    #[error(transparent)]
    Group(GroupError),

    /// The context was done before the next work item started.
    #[error("workflow interrupted: {0}")]
    Cancelled(CancelReason),
}

impl Trigger {
    /// Names of the steps whose forward action failed.
    #[must_use]
    pub fn failed_steps(&self) -> Vec<&str> {
        match self {
            Self::Step(error) => vec![error.step.as_str()],
            Self::Group(error) => error.failures.iter().map(|e| e.step.as_str()).collect(),
            Self::Cancelled(_) => Vec::new(),
        }
    }

    /// Why the run was interrupted, if cancellation caused the failure.
    ///
    /// Covers both the check between work items and actions that gave up
    /// with a [`CancelReason`] of their own, such as a retry whose backoff
    /// was cut short.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Self::Cancelled(reason) => Some(*reason),
            Self::Step(error) => error.cancel_reason(),
            Self::Group(error) => error.failures.iter().find_map(StepError::cancel_reason),
        }
    }
}

/// Error from a failed compensation operation.
#[derive(Debug, Error)]
#[error("compensation failed for step '{step}' ({description}): {fault}")]
pub struct CompensationError {
    /// Name of the step whose compensation failed.
    pub step: String,
    /// Description of what the compensation was trying to do.
    pub description: String,
    /// What went wrong.
    #[source]
    pub fault: Fault,
}

/// Error from a workflow run.
///
/// A run that rolls back always fails, whether or not the rollback itself
/// succeeded; the variant only tells the two situations apart.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SagaError {
    /// The run failed and every committed step was compensated.
    #[error("{trigger}; rolled back {compensated} step(s)")]
    RolledBack {
        /// What started the rollback.
        #[source]
        trigger: Trigger,
        /// Number of committed steps that were compensated.
        compensated: usize,
    },

    /// The run failed and some compensations also failed.
    #[error("{trigger}; rollback incomplete, {} compensation(s) failed", compensation_errors.len())]
    CompensationFailed {
        /// What started the rollback.
        #[source]
        trigger: Trigger,
        /// Number of committed steps that were compensated.
        compensated: usize,
        /// Errors from failed compensations, in the order they were attempted.
        compensation_errors: Vec<CompensationError>,
    },
}

impl SagaError {
    #[must_use]
    pub fn trigger(&self) -> &Trigger {
        match self {
            Self::RolledBack { trigger, .. } | Self::CompensationFailed { trigger, .. } => trigger,
        }
    }

    #[must_use]
    pub fn compensated(&self) -> usize {
        match self {
            Self::RolledBack { compensated, .. } | Self::CompensationFailed { compensated, .. } => {
                *compensated
            }
        }
    }

    /// Compensation failures, empty when the rollback completed cleanly.
    #[must_use]
    pub fn compensation_errors(&self) -> &[CompensationError] {
        match self {
            Self::RolledBack { .. } => &[],
            Self::CompensationFailed {
                compensation_errors,
                ..
            } => compensation_errors,
        }
    }

    /// Names of the steps whose forward action failed.
    #[must_use]
    pub fn failed_steps(&self) -> Vec<&str> {
        self.trigger().failed_steps()
    }

    /// Whether the run failed because its context was cancelled or expired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.trigger().cancel_reason().is_some()
    }
}
