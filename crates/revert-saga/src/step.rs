use std::fmt;
use std::future::Future;

use crate::action::{Action, ActionResult, contain};
use crate::context::Context;
use crate::error::{CompensationError, StepError};

/// A reversible unit of work: a forward action plus an optional compensation.
///
/// A step without a compensation is fire-and-forget; undoing it is a no-op.
/// Names are for diagnostics only and may repeat within a workflow.
pub struct Step {
    name: String,
    execute: Box<dyn Action>,
    compensate: Option<Box<dyn Action>>,
    compensation_description: Option<String>,
}

impl Step {
    /// Create a step from an async closure.
    #[must_use]
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        Self::from_action(name, execute)
    }

    /// Create a step from any [`Action`] implementation.
    #[must_use]
    pub fn from_action(name: impl Into<String>, execute: impl Action + 'static) -> Self {
        Self {
            name: name.into(),
            execute: Box::new(execute),
            compensate: None,
            compensation_description: None,
        }
    }

    /// Attach the action that undoes this step.
    ///
    /// The compensation runs only if this step succeeded and something later
    /// in the workflow fails.
    #[must_use]
    pub fn with_compensation<F, Fut>(self, compensate: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        self.with_compensation_action(compensate)
    }

    #[must_use]
    pub fn with_compensation_action(mut self, compensate: impl Action + 'static) -> Self {
        self.compensate = Some(Box::new(compensate));
        self
    }

    /// Human-readable description of what compensation will do.
    #[must_use]
    pub fn with_compensation_description(mut self, description: impl Into<String>) -> Self {
        self.compensation_description = Some(description.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }

    /// Description used in compensation errors and the audit log.
    ///
    /// Defaults to `undo <name>`.
    #[must_use]
    pub fn compensation_description(&self) -> String {
        self.compensation_description
            .clone()
            .unwrap_or_else(|| format!("undo {}", self.name))
    }

    /// Run the forward action.
    ///
    /// # Errors
    ///
    /// Returns a [`StepError`] naming this step if the action fails or panics.
    pub async fn execute(&self, ctx: &Context) -> Result<(), StepError> {
        contain(self.execute.as_ref(), ctx)
            .await
            .map_err(|fault| StepError::new(&self.name, fault))
    }

    /// Run the compensation, if there is one.
    ///
    /// # Errors
    ///
    /// Returns a [`CompensationError`] naming this step if the compensation
    /// fails or panics.
    pub async fn compensate(&self, ctx: &Context) -> Result<(), CompensationError> {
        let Some(compensate) = &self.compensate else {
            return Ok(());
        };

        contain(compensate.as_ref(), ctx)
            .await
            .map_err(|fault| CompensationError {
                step: self.name.clone(),
                description: self.compensation_description(),
                fault,
            })
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("has_compensation", &self.has_compensation())
            .finish_non_exhaustive()
    }
}

/// Steps that run concurrently as one unit of a workflow.
///
/// Either every member succeeds or the whole group fails. Member order only
/// fixes the order of reported failures.
#[derive(Debug, Default)]
pub struct Group {
    steps: Vec<Step>,
}

impl Group {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl FromIterator<Step> for Group {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<Step>> for Group {
    fn from(steps: Vec<Step>) -> Self {
        Self { steps }
    }
}

impl IntoIterator for Group {
    type Item = Step;
    type IntoIter = std::vec::IntoIter<Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.into_iter()
    }
}

/// One entry of a workflow's backlog.
#[derive(Debug)]
pub enum WorkItem {
    Step(Step),
    Group(Group),
}

impl WorkItem {
    /// Number of steps this item contributes.
    #[must_use]
    pub fn step_count(&self) -> usize {
        match self {
            Self::Step(_) => 1,
            Self::Group(group) => group.len(),
        }
    }
}

impl From<Step> for WorkItem {
    fn from(step: Step) -> Self {
        Self::Step(step)
    }
}

impl From<Group> for WorkItem {
    fn from(group: Group) -> Self {
        Self::Group(group)
    }
}
