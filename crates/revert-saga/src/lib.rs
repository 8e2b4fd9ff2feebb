//! Saga pattern for reversible multi-step async operations.
//!
//! A [`Workflow`] runs an ordered list of [`Step`]s and concurrent
//! [`Group`]s. Every step pairs a forward action with an optional
//! compensation. If any step, group, or the supplied [`Context`] fails, the
//! steps that already succeeded are compensated in reverse commit order and
//! the run returns one [`SagaError`] holding the trigger plus every
//! compensation failure.
//!
//! Forward actions can be decorated with [`with_retry`] to get bounded retries
//! with exponential backoff; the decorated action is still a plain action, so
//! the workflow never sees the individual attempts.
//!
//! Panics inside actions are caught at the step boundary and reported like
//! ordinary failures.

mod action;
mod audit;
mod context;
mod error;
mod retry;
mod step;
mod workflow;

pub use action::{Action, ActionResult, BoxError};
pub use audit::{SagaAuditLog, StepRecord, StepStatus};
pub use context::{CancelHandle, CancelReason, Context};
pub use error::{CompensationError, Fault, GroupError, SagaError, StepError, Trigger};
pub use retry::{ActionExt, Retry, RetryPolicy, with_retry};
pub use step::{Group, Step, WorkItem};
pub use workflow::Workflow;
