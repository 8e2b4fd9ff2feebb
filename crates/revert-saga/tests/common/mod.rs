//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use revert_saga::{ActionResult, Context, Step};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TestError(pub String);

/// Stands in for an action body that panics partway through.
pub fn explode(message: &str) -> ActionResult {
    panic!("{message}")
}

/// Thread-safe record of everything the steps of a test did.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .expect("journal lock")
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("journal lock").clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    /// Entries written by compensations, in the order they ran.
    pub fn compensations(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with("compensate "))
            .collect()
    }

    /// A step that succeeds and records both its execution and compensation.
    pub fn step(&self, name: &str) -> Step {
        let forward = self.recorder(format!("execute {name}"));
        let backward = self.recorder(format!("compensate {name}"));
        Step::new(name, forward).with_compensation(backward)
    }

    /// A step whose forward action records an attempt and then fails.
    pub fn failing_step(&self, name: &str, message: &str) -> Step {
        let journal = self.clone();
        let entry = format!("attempt {name}");
        let message = message.to_string();
        let forward = move |_ctx: Context| {
            let journal = journal.clone();
            let entry = entry.clone();
            let message = message.clone();
            async move {
                journal.record(entry);
                ActionResult::Err(Box::new(TestError(message)))
            }
        };
        let backward = self.recorder(format!("compensate {name}"));
        Step::new(name, forward).with_compensation(backward)
    }

    /// A step that succeeds but whose compensation records itself and fails.
    pub fn step_with_failing_compensation(&self, name: &str, message: &str) -> Step {
        let journal = self.clone();
        let entry = format!("compensate {name}");
        let message = message.to_string();
        let backward = move |_ctx: Context| {
            let journal = journal.clone();
            let entry = entry.clone();
            let message = message.clone();
            async move {
                journal.record(entry);
                ActionResult::Err(Box::new(TestError(message)))
            }
        };
        Step::new(name, self.recorder(format!("execute {name}"))).with_compensation(backward)
    }

    fn recorder(
        &self,
        entry: String,
    ) -> impl Fn(Context) -> std::future::Ready<ActionResult> + Send + Sync + 'static {
        let journal = self.clone();
        move |_ctx| {
            journal.record(entry.clone());
            std::future::ready(Ok(()))
        }
    }
}
