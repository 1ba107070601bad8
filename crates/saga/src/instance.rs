//! Persisted saga instance and its step records.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::state::{SagaState, StepStatus};
use crate::step::SagaContext;

/// Progress of one step of a saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub completed_at: Option<DateTime<Utc>>,
    /// Error of the forward action, if it failed.
    pub error: Option<String>,
    /// Error of the compensating action, if it failed. The step stays
    /// [`StepStatus::Done`] in that case.
    pub compensation_error: Option<String>,
}

impl StepRecord {
    fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            completed_at: None,
            error: None,
            compensation_error: None,
        }
    }
}

/// A compensation that could not be applied and needs manual reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step: String,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// The persisted state of one business transaction.
///
/// `version` is the version last read from or written to the repository;
/// a fresh instance has version 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: SagaId,
    pub saga_type: String,
    pub steps: Vec<StepRecord>,
    pub state: SagaState,
    pub context: SagaContext,
    pub failure_reason: Option<String>,
    pub compensation_failures: Vec<CompensationFailure>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl SagaInstance {
    /// Creates a running instance with every step pending.
    pub fn new<I, S>(saga_type: impl Into<String>, step_names: I, context: SagaContext) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            saga_type: saga_type.into(),
            steps: step_names.into_iter().map(StepRecord::pending).collect(),
            state: SagaState::Running,
            context,
            failure_reason: None,
            compensation_failures: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Index of the next forward step to run while running.
    pub fn next_pending(&self) -> Option<usize> {
        if self.state != SagaState::Running {
            return None;
        }
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::Pending)
    }

    /// Index of the next step to compensate while compensating.
    ///
    /// Steps complete in declared order, so the latest completed step that
    /// has not been compensated (or attempted) comes first.
    pub fn next_to_compensate(&self) -> Option<usize> {
        if self.state != SagaState::Compensating {
            return None;
        }
        self.steps
            .iter()
            .rposition(|s| s.status == StepStatus::Done && s.compensation_error.is_none())
    }

    pub fn mark_done(&mut self, index: usize) {
        let now = Utc::now();
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Done;
            step.completed_at = Some(now);
            step.error = None;
        }
        self.updated_at = now;
    }

    /// Records a failed forward action and starts compensating.
    pub fn fail_step(&mut self, index: usize, error: impl Into<String>) {
        let error = error.into();
        let reason = match self.steps.get_mut(index) {
            Some(step) => {
                step.error = Some(error.clone());
                format!("step '{}' failed: {error}", step.name)
            }
            None => error,
        };
        self.begin_compensation(reason);
    }

    /// Switches to compensating with the given reason.
    pub fn begin_compensation(&mut self, reason: impl Into<String>) {
        self.state = SagaState::Compensating;
        self.failure_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    pub fn mark_compensated(&mut self, index: usize) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Compensated;
            step.compensation_error = None;
        }
        self.updated_at = Utc::now();
    }

    /// Records a failed compensation; the sweep moves on to earlier steps.
    pub fn record_compensation_failure(&mut self, index: usize, error: impl Into<String>) {
        let error = error.into();
        let now = Utc::now();
        if let Some(step) = self.steps.get_mut(index) {
            step.compensation_error = Some(error.clone());
            self.compensation_failures.push(CompensationFailure {
                step: step.name.clone(),
                error,
                occurred_at: now,
            });
        }
        self.updated_at = now;
    }

    pub fn complete(&mut self) {
        self.finish(SagaState::Completed);
    }

    pub fn fail(&mut self) {
        self.finish(SagaState::Failed);
    }

    fn finish(&mut self, state: SagaState) {
        let now = Utc::now();
        self.state = state;
        self.updated_at = now;
        self.archived_at = Some(now);
    }

    /// Names of the steps whose forward action completed, in order.
    pub fn completed_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.completed_at.is_some())
            .map(|s| s.name.clone())
            .collect()
    }

    /// Names of the compensated steps, in compensation order.
    pub fn compensated_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.status == StepStatus::Compensated)
            .map(|s| s.name.clone())
            .collect()
    }

    /// True when a failed compensation left side effects behind.
    pub fn needs_reconciliation(&self) -> bool {
        !self.compensation_failures.is_empty()
    }
}
