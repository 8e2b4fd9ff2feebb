use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::audit::SagaAuditLog;
use crate::context::Context;
use crate::error::{CompensationError, GroupError, SagaError, StepError, Trigger};
use crate::step::{Group, Step, WorkItem};

/// A step together with its registration position.
struct Entry {
    position: usize,
    step: Step,
}

/// State shared between the forward pass and the members of a group.
///
/// The lock is only ever held for an append or a take, never across an
/// action call.
#[derive(Default)]
struct Ledger {
    committed: Vec<Entry>,
    audit: SagaAuditLog,
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    // Actions run outside the lock, so a poisoned ledger still holds
    // consistent data.
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An ordered list of steps and concurrent groups with LIFO compensation.
///
/// Items run strictly one after another; the members of a [`Group`] run
/// concurrently and are joined before the next item starts. When a step, a
/// group, or the context fails, every step that already succeeded is
/// compensated in reverse commit order.
///
/// # Example
/// ```ignore
/// let result = Workflow::new()
///     .step(Step::new("reserve_ip", reserve).with_compensation(release))
///     .group(
///         Group::new()
///             .step(Step::new("create_dns", create_dns).with_compensation(delete_dns))
///             .step(Step::new("create_vm", create_vm).with_compensation(delete_vm)),
///     )
///     .step(Step::new("notify", notify))
///     .run(&Context::background())
///     .await;
/// ```
#[derive(Debug, Default)]
pub struct Workflow {
    items: Vec<WorkItem>,
}

impl Workflow {
    /// Create an empty workflow.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step to run on its own.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.items.push(WorkItem::Step(step));
        self
    }

    /// Append a group whose members run concurrently.
    #[must_use]
    pub fn group(mut self, group: Group) -> Self {
        self.items.push(WorkItem::Group(group));
        self
    }

    /// Append any work item.
    pub fn push(&mut self, item: impl Into<WorkItem>) {
        self.items.push(item.into());
    }

    #[must_use]
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run every item in order, rolling back on the first failure.
    ///
    /// The workflow is consumed: a run cannot be repeated or shared.
    ///
    /// Every action, group members included, is polled by the returned
    /// future. Dropping it stops in-flight steps at their next await point,
    /// but steps that already committed are not compensated; cancel through
    /// `ctx` to get a rollback.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::RolledBack` if a step, a group or the context failed
    /// and all compensations succeeded.
    /// Returns `SagaError::CompensationFailed` if some compensations also failed.
    pub async fn run(self, ctx: &Context) -> Result<(), SagaError> {
        let (result, _audit_log) = self.run_with_audit(ctx).await;
        result
    }

    /// Run the workflow and return both the result and an audit log.
    ///
    /// The audit log tracks all step executions and compensations.
    pub async fn run_with_audit(
        self,
        ctx: &Context,
    ) -> (Result<(), SagaError>, SagaAuditLog) {
        let ledger = Mutex::new(Ledger::default());
        let result = self.drive(&ledger, ctx).await;
        let audit_log = std::mem::take(&mut lock(&ledger).audit);
        (result, audit_log)
    }

    async fn drive(self, ledger: &Mutex<Ledger>, ctx: &Context) -> Result<(), SagaError> {
        let mut position = 0;

        for item in self.items {
            if let Some(reason) = ctx.err() {
                warn!(%reason, "workflow cancelled before next item");
                return Err(rollback(ledger, ctx, Trigger::Cancelled(reason)).await);
            }

            let outcome = match item {
                WorkItem::Step(step) => {
                    let entry = Entry { position, step };
                    position += 1;
                    run_step(ledger, ctx, entry).await.map_err(Trigger::Step)
                }
                WorkItem::Group(group) => {
                    let members = group
                        .into_iter()
                        .map(|step| {
                            let entry = Entry { position, step };
                            position += 1;
                            entry
                        })
                        .collect();
                    run_group(ledger, ctx, members).await.map_err(Trigger::Group)
                }
            };

            if let Err(trigger) = outcome {
                return Err(rollback(ledger, ctx, trigger).await);
            }
        }

        debug!(steps = position, "workflow completed");
        Ok(())
    }
}

impl<T: Into<WorkItem>> Extend<T> for Workflow {
    fn extend<I: IntoIterator<Item = T>>(&mut self, items: I) {
        self.items.extend(items.into_iter().map(Into::into));
    }
}

impl<T: Into<WorkItem>> FromIterator<T> for Workflow {
    fn from_iter<I: IntoIterator<Item = T>>(items: I) -> Self {
        let mut workflow = Self::new();
        workflow.extend(items);
        workflow
    }
}

async fn run_step(ledger: &Mutex<Ledger>, ctx: &Context, entry: Entry) -> Result<(), StepError> {
    let name = entry.step.name();
    lock(ledger).audit.record_start(entry.position, name);
    debug!(step = name, position = entry.position, "executing step");

    let outcome = entry.step.execute(ctx).await;
    match outcome {
        Ok(()) => {
            let description = entry.step.compensation_description();
            let mut ledger = lock(ledger);
            ledger.audit.record_success(entry.position, description);
            debug!(
                step = name,
                committed = ledger.committed.len() + 1,
                "step committed"
            );
            ledger.committed.push(entry);
            Ok(())
        }
        Err(error) => {
            lock(ledger).audit.record_failure(entry.position);
            warn!(step = name, %error, "step failed");
            Err(error)
        }
    }
}

async fn run_group(
    ledger: &Mutex<Ledger>,
    ctx: &Context,
    members: Vec<Entry>,
) -> Result<(), GroupError> {
    debug!(members = members.len(), "executing group");

    // Members are polled inside the run future, so dropping the run drops
    // them too. A failing sibling does not stop the rest.
    let outcomes = join_all(
        members
            .into_iter()
            .map(|entry| run_step(ledger, ctx, entry)),
    )
    .await;

    let failures: Vec<StepError> = outcomes.into_iter().filter_map(Result::err).collect();
    if failures.is_empty() {
        Ok(())
    } else {
        warn!(failed = failures.len(), "group failed");
        Err(GroupError::new(failures))
    }
}

/// Compensate every committed step, newest first, and build the run error.
async fn rollback(ledger: &Mutex<Ledger>, ctx: &Context, trigger: Trigger) -> SagaError {
    let committed = std::mem::take(&mut lock(ledger).committed);
    let rollback_ctx = ctx.without_cancel();

    warn!(%trigger, steps = committed.len(), "rolling back workflow");

    let mut compensated = 0;
    let mut compensation_errors: Vec<CompensationError> = Vec::new();

    for entry in committed.iter().rev() {
        match entry.step.compensate(&rollback_ctx).await {
            Ok(()) => {
                lock(ledger).audit.record_compensated(entry.position);
                compensated += 1;
            }
            Err(error) => {
                lock(ledger).audit.record_compensation_failed(entry.position);
                warn!(step = entry.step.name(), %error, "compensation failed");
                compensation_errors.push(error);
            }
        }
    }

    info!(
        compensated,
        failed = compensation_errors.len(),
        "rollback finished"
    );

    if compensation_errors.is_empty() {
        SagaError::RolledBack {
            trigger,
            compensated,
        }
    } else {
        SagaError::CompensationFailed {
            trigger,
            compensated,
            compensation_errors,
        }
    }
}
