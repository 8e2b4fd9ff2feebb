use std::time::{Duration, Instant};

/// Where a step stands at the end of (or during) a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StepStatus {
    /// The forward action is running or has committed.
    Executed,
    /// The forward action returned an error or panicked.
    Failed,
    /// The step committed and was later undone.
    Compensated,
    /// The step committed and undoing it went wrong.
    CompensationFailed,
}

impl StepStatus {
    fn glyph(self) -> &'static str {
        match self {
            Self::Executed => "✓",
            Self::Failed => "✗",
            Self::Compensated => "↩",
            Self::CompensationFailed => "⚠",
        }
    }
}

/// What happened to one registered step.
#[derive(Debug)]
pub struct StepRecord {
    /// Registration position; group members each take their own position.
    pub position: usize,
    pub name: String,
    pub status: StepStatus,
    pub started_at: Instant,
    /// Last time the status changed, `None` while the forward action runs.
    pub completed_at: Option<Instant>,
    /// Set once the step commits.
    pub compensation_description: Option<String>,
}

impl StepRecord {
    /// Time from start to the last status change.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.completed_at
            .map(|completed| completed.saturating_duration_since(self.started_at))
    }
}

/// Per-run history of every step that started.
///
/// Records are appended when a step starts, so members of a group appear in
/// whatever order the group happened to poll them. Look records up by
/// position with [`SagaAuditLog::record`] when the declaration order matters.
/// Steps after the failure point never start and have no record.
#[derive(Debug, Default)]
pub struct SagaAuditLog {
    records: Vec<StepRecord>,
}

impl SagaAuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_start(&mut self, position: usize, name: &str) {
        self.records.push(StepRecord {
            position,
            name: name.to_string(),
            status: StepStatus::Executed,
            started_at: Instant::now(),
            completed_at: None,
            compensation_description: None,
        });
    }

    pub(crate) fn record_failure(&mut self, position: usize) {
        self.transition(position, StepStatus::Failed);
    }

    pub(crate) fn record_success(&mut self, position: usize, compensation_description: String) {
        if let Some(record) = self.transition(position, StepStatus::Executed) {
            record.compensation_description = Some(compensation_description);
        }
    }

    pub(crate) fn record_compensated(&mut self, position: usize) {
        self.transition(position, StepStatus::Compensated);
    }

    pub(crate) fn record_compensation_failed(&mut self, position: usize) {
        self.transition(position, StepStatus::CompensationFailed);
    }

    fn transition(&mut self, position: usize, status: StepStatus) -> Option<&mut StepRecord> {
        let record = self
            .records
            .iter_mut()
            .find(|record| record.position == position)?;
        record.status = status;
        record.completed_at = Some(Instant::now());
        Some(record)
    }

    /// Records in the order their steps started.
    #[must_use]
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// The record of the step registered at `position`, if it ever started.
    #[must_use]
    pub fn record(&self, position: usize) -> Option<&StepRecord> {
        self.records
            .iter()
            .find(|record| record.position == position)
    }

    /// One line per started step: status glyph, name and position.
    #[must_use]
    pub fn summary(&self) -> String {
        self.records
            .iter()
            .map(|record| {
                format!(
                    "{} {} #{}",
                    record.status.glyph(),
                    record.name,
                    record.position
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
