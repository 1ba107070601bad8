//! Saga orchestrator: drives persisted instances forward and compensates on failure.

use std::collections::HashMap;

use chrono::Utc;
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::instance::{CompensationFailure, SagaInstance};
use crate::repository::SagaRepository;
use crate::state::SagaState;
use crate::step::SagaContext;

/// Reason recorded when a saga is compensated because of an abort request.
pub const ABORT_REASON: &str = "abort requested";

/// Outcome of driving a saga as far as it could go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaReport {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub state: SagaState,
    pub completed_steps: Vec<String>,
    pub compensated_steps: Vec<String>,
    pub failure_reason: Option<String>,
    pub compensation_failures: Vec<CompensationFailure>,
}

impl SagaReport {
    pub fn is_completed(&self) -> bool {
        self.state == SagaState::Completed
    }

    /// True when some compensation could not be applied.
    pub fn needs_reconciliation(&self) -> bool {
        !self.compensation_failures.is_empty()
    }
}

impl From<&SagaInstance> for SagaReport {
    fn from(instance: &SagaInstance) -> Self {
        Self {
            saga_id: instance.id,
            saga_type: instance.saga_type.clone(),
            state: instance.state,
            completed_steps: instance.completed_steps(),
            compensated_steps: instance.compensated_steps(),
            failure_reason: instance.failure_reason.clone(),
            compensation_failures: instance.compensation_failures.clone(),
        }
    }
}

/// Runs registered saga definitions against a [`SagaRepository`].
///
/// Every state change is saved before the next action runs, so any
/// orchestrator sharing the repository can [`resume`](Self::resume) an
/// instance after a crash. Forward steps run one at a time in declared
/// order; on failure or abort the completed steps are compensated in
/// reverse order.
pub struct SagaOrchestrator<R>
where
    R: SagaRepository,
{
    repository: R,
    definitions: HashMap<String, SagaDefinition>,
}

impl<R> SagaOrchestrator<R>
where
    R: SagaRepository,
{
    /// Creates an orchestrator with no registered definitions.
    pub fn new(repository: R) -> Self {
        Self {
            repository,
            definitions: HashMap::new(),
        }
    }

    /// Registers a definition under its saga type, replacing any previous one.
    pub fn register(mut self, definition: SagaDefinition) -> Self {
        self.definitions
            .insert(definition.saga_type().to_string(), definition);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    fn definition(&self, saga_type: &str) -> Result<&SagaDefinition> {
        self.definitions
            .get(saga_type)
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }

    /// Persists a new running instance without executing any step.
    pub async fn create(&self, saga_type: &str, context: SagaContext) -> Result<SagaId> {
        let definition = self.definition(saga_type)?;
        let mut instance = SagaInstance::new(saga_type, definition.step_names(), context);
        self.repository.save(&mut instance).await?;

        metrics::counter!("saga_executions_total", "saga_type" => saga_type.to_string())
            .increment(1);
        tracing::info!(saga_id = %instance.id, saga_type, "saga created");
        Ok(instance.id)
    }

    /// Creates an instance and drives it to a terminal state.
    #[tracing::instrument(skip(self, context))]
    pub async fn start(&self, saga_type: &str, context: SagaContext) -> Result<SagaReport> {
        let saga_id = self.create(saga_type, context).await?;
        self.resume(saga_id).await
    }

    /// Continues a persisted instance from its step records.
    ///
    /// A running instance continues at its first pending step, a compensating
    /// one at its latest completed step that is not compensated yet. A
    /// terminal instance is reported unchanged.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, saga_id: SagaId) -> Result<SagaReport> {
        let mut instance = self
            .repository
            .get(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;

        if !instance.is_terminal() {
            let definition = self.definition(&instance.saga_type)?;
            check_definition(&instance, definition)?;
            self.drive(definition, &mut instance).await?;
        }

        Ok(SagaReport::from(&instance))
    }

    /// Resumes every non-terminal instance, oldest first.
    ///
    /// Instances that cannot be resumed (for example because another
    /// orchestrator saved them first) are logged and skipped.
    #[tracing::instrument(skip(self))]
    pub async fn resume_all(&self) -> Result<Vec<SagaReport>> {
        let active = self.repository.list_active().await?;
        let mut reports = Vec::with_capacity(active.len());

        for instance in active {
            match self.resume(instance.id).await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    tracing::warn!(saga_id = %instance.id, error = %err, "saga not resumed");
                }
            }
        }

        tracing::info!(resumed = reports.len(), "saga recovery finished");
        Ok(reports)
    }

    /// Asks a running saga to stop and compensate.
    ///
    /// The mark is honoured before the next step starts. Returns false if the
    /// saga already finished.
    pub async fn request_abort(&self, saga_id: SagaId) -> Result<bool> {
        let marked = self.repository.request_abort(saga_id).await?;
        tracing::info!(%saga_id, marked, "saga abort requested");
        Ok(marked)
    }

    pub async fn get(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        self.repository.get(saga_id).await
    }

    /// Failed sagas with compensations that must be reconciled by hand.
    pub async fn needing_reconciliation(&self) -> Result<Vec<SagaReport>> {
        let failed = self.repository.list_needing_reconciliation().await?;
        Ok(failed.iter().map(SagaReport::from).collect())
    }

    async fn drive(&self, definition: &SagaDefinition, instance: &mut SagaInstance) -> Result<()> {
        let saga_id = instance.id;

        loop {
            match instance.state {
                SagaState::Running => {
                    if self.repository.is_abort_requested(saga_id).await? {
                        tracing::warn!(%saga_id, "saga aborted, compensating");
                        instance.begin_compensation(ABORT_REASON);
                        self.repository.save(instance).await?;
                        continue;
                    }

                    let Some(index) = instance.next_pending() else {
                        instance.complete();
                        self.repository.save(instance).await?;
                        self.record_finished(instance);
                        return Ok(());
                    };

                    let step = &definition.steps()[index];
                    tracing::info!(%saga_id, step = step.name(), "saga step started");

                    let mut context = instance.context.clone();
                    match step.execute(&mut context).await {
                        Ok(()) => {
                            instance.context = context;
                            instance.mark_done(index);
                            tracing::info!(%saga_id, step = step.name(), "saga step completed");
                        }
                        Err(err) => {
                            tracing::warn!(
                                %saga_id,
                                step = step.name(),
                                error = %err,
                                "saga step failed, compensating"
                            );
                            instance.fail_step(index, err.message);
                        }
                    }
                    self.repository.save(instance).await?;
                }
                SagaState::Compensating => {
                    let Some(index) = instance.next_to_compensate() else {
                        instance.fail();
                        self.repository.save(instance).await?;
                        self.record_finished(instance);
                        return Ok(());
                    };

                    let step = &definition.steps()[index];
                    match step.compensate(&instance.context).await {
                        Ok(()) => {
                            instance.mark_compensated(index);
                            tracing::info!(%saga_id, step = step.name(), "saga step compensated");
                        }
                        Err(err) => {
                            metrics::counter!(
                                "saga_compensation_failures_total",
                                "saga_type" => instance.saga_type.clone(),
                                "step" => step.name().to_string()
                            )
                            .increment(1);
                            tracing::error!(
                                %saga_id,
                                step = step.name(),
                                error = %err,
                                "compensation failed, manual reconciliation required"
                            );
                            instance.record_compensation_failure(index, err.message);
                        }
                    }
                    self.repository.save(instance).await?;
                }
                SagaState::Completed | SagaState::Failed => return Ok(()),
            }
        }
    }

    fn record_finished(&self, instance: &SagaInstance) {
        let duration = (Utc::now() - instance.created_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        metrics::histogram!("saga_duration_seconds", "saga_type" => instance.saga_type.clone())
            .record(duration);

        match instance.state {
            SagaState::Completed => {
                metrics::counter!("saga_completed").increment(1);
                tracing::info!(saga_id = %instance.id, duration, "saga completed successfully");
            }
            _ => {
                metrics::counter!("saga_failed").increment(1);
                tracing::warn!(
                    saga_id = %instance.id,
                    reason = instance.failure_reason.as_deref().unwrap_or("unknown"),
                    compensation_failures = instance.compensation_failures.len(),
                    "saga failed"
                );
            }
        }
    }
}

fn check_definition(instance: &SagaInstance, definition: &SagaDefinition) -> Result<()> {
    let persisted = instance.steps.iter().map(|s| s.name.as_str());
    let declared = definition.steps().iter().map(|s| s.name());

    if persisted.ne(declared) {
        return Err(SagaError::DefinitionMismatch {
            saga_id: instance.id,
            saga_type: instance.saga_type.clone(),
            reason: format!(
                "persisted steps {:?}, registered steps {:?}",
                instance.steps.iter().map(|s| &s.name).collect::<Vec<_>>(),
                definition.step_names()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::repository::InMemorySagaRepository;
    use crate::state::StepStatus;
    use crate::step::{SagaStep, StepError};

    type Journal = Arc<Mutex<Vec<String>>>;

    struct RecordingStep {
        name: &'static str,
        journal: Journal,
        fail_execute: bool,
        fail_compensate: bool,
    }

    impl RecordingStep {
        fn new(name: &'static str, journal: &Journal) -> Self {
            Self {
                name,
                journal: journal.clone(),
                fail_execute: false,
                fail_compensate: false,
            }
        }

        fn failing(mut self) -> Self {
            self.fail_execute = true;
            self
        }

        fn failing_compensation(mut self) -> Self {
            self.fail_compensate = true;
            self
        }
    }

    #[async_trait]
    impl SagaStep for RecordingStep {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, ctx: &mut SagaContext) -> std::result::Result<(), StepError> {
            self.journal.lock().unwrap().push(format!("execute:{}", self.name));
            if self.fail_execute {
                return Err(StepError::new(format!("{} failed", self.name)));
            }
            ctx.insert(self.name, &true)?;
            Ok(())
        }

        async fn compensate(&self, ctx: &SagaContext) -> std::result::Result<(), StepError> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("compensate:{}", self.name));
            assert!(ctx.contains(self.name), "compensating a step that never ran");
            if self.fail_compensate {
                return Err(StepError::new(format!("cannot undo {}", self.name)));
            }
            Ok(())
        }
    }

    fn orchestrator(definition: SagaDefinition) -> SagaOrchestrator<InMemorySagaRepository> {
        SagaOrchestrator::new(InMemorySagaRepository::new()).register(definition)
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_all_steps_complete() {
        let journal = Journal::default();
        let orchestrator = orchestrator(
            SagaDefinition::new("Test")
                .step(RecordingStep::new("a", &journal))
                .step(RecordingStep::new("b", &journal)),
        );

        let report = orchestrator.start("Test", SagaContext::new()).await.unwrap();

        assert_eq!(report.state, SagaState::Completed);
        assert_eq!(report.completed_steps, vec!["a", "b"]);
        assert!(report.compensated_steps.is_empty());
        assert_eq!(entries(&journal), vec!["execute:a", "execute:b"]);

        let stored = orchestrator.get(report.saga_id).await.unwrap().unwrap();
        assert!(stored.archived_at.is_some());
        assert!(stored.context.contains("b"));
    }

    #[tokio::test]
    async fn test_failing_step_compensates_completed_steps_in_reverse() {
        let journal = Journal::default();
        let orchestrator = orchestrator(
            SagaDefinition::new("Test")
                .step(RecordingStep::new("a", &journal))
                .step(RecordingStep::new("b", &journal))
                .step(RecordingStep::new("c", &journal).failing())
                .step(RecordingStep::new("d", &journal)),
        );

        let report = orchestrator.start("Test", SagaContext::new()).await.unwrap();

        assert_eq!(report.state, SagaState::Failed);
        assert_eq!(report.compensated_steps, vec!["b", "a"]);
        assert_eq!(
            report.failure_reason.as_deref(),
            Some("step 'c' failed: c failed")
        );
        assert_eq!(
            entries(&journal),
            vec![
                "execute:a",
                "execute:b",
                "execute:c",
                "compensate:b",
                "compensate:a"
            ]
        );

        let stored = orchestrator.get(report.saga_id).await.unwrap().unwrap();
        assert_eq!(stored.steps[2].status, StepStatus::Pending);
        assert_eq!(stored.steps[3].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_compensation_failure_is_reported_and_sweep_continues() {
        let journal = Journal::default();
        let orchestrator = orchestrator(
            SagaDefinition::new("Test")
                .step(RecordingStep::new("a", &journal))
                .step(RecordingStep::new("b", &journal).failing_compensation())
                .step(RecordingStep::new("c", &journal).failing()),
        );

        let report = orchestrator.start("Test", SagaContext::new()).await.unwrap();

        assert_eq!(report.state, SagaState::Failed);
        assert!(report.needs_reconciliation());
        assert_eq!(report.compensation_failures.len(), 1);
        assert_eq!(report.compensation_failures[0].step, "b");
        assert_eq!(report.compensated_steps, vec!["a"]);
        assert_eq!(
            entries(&journal),
            vec![
                "execute:a",
                "execute:b",
                "execute:c",
                "compensate:b",
                "compensate:a"
            ]
        );

        let pending = orchestrator.needing_reconciliation().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].saga_id, report.saga_id);
    }

    #[tokio::test]
    async fn test_abort_before_first_step_runs_nothing() {
        let journal = Journal::default();
        let orchestrator =
            orchestrator(SagaDefinition::new("Test").step(RecordingStep::new("a", &journal)));

        let saga_id = orchestrator.create("Test", SagaContext::new()).await.unwrap();
        assert!(orchestrator.request_abort(saga_id).await.unwrap());

        let report = orchestrator.resume(saga_id).await.unwrap();
        assert_eq!(report.state, SagaState::Failed);
        assert_eq!(report.failure_reason.as_deref(), Some(ABORT_REASON));
        assert!(entries(&journal).is_empty());
    }

    #[tokio::test]
    async fn test_resume_of_terminal_saga_is_a_no_op() {
        let journal = Journal::default();
        let orchestrator =
            orchestrator(SagaDefinition::new("Test").step(RecordingStep::new("a", &journal)));

        let report = orchestrator.start("Test", SagaContext::new()).await.unwrap();
        let again = orchestrator.resume(report.saga_id).await.unwrap();

        assert_eq!(again, report);
        assert_eq!(entries(&journal), vec!["execute:a"]);
        assert!(!orchestrator.request_abort(report.saga_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_saga_type() {
        let orchestrator = SagaOrchestrator::new(InMemorySagaRepository::new());
        let err = orchestrator
            .start("Missing", SagaContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::UnknownSagaType(t) if t == "Missing"));
    }

    #[tokio::test]
    async fn test_definition_mismatch_is_rejected() {
        let journal = Journal::default();
        let repository = InMemorySagaRepository::new();
        let old = SagaOrchestrator::new(repository.clone())
            .register(SagaDefinition::new("Test").step(RecordingStep::new("a", &journal)));
        let saga_id = old.create("Test", SagaContext::new()).await.unwrap();

        let new = SagaOrchestrator::new(repository)
            .register(SagaDefinition::new("Test").step(RecordingStep::new("x", &journal)));
        let err = new.resume(saga_id).await.unwrap_err();

        assert!(matches!(err, SagaError::DefinitionMismatch { .. }));
        assert!(entries(&journal).is_empty());
    }
}
