//! Saga definitions: an ordered list of steps registered under a type name.

use std::fmt;
use std::sync::Arc;

use crate::step::SagaStep;

/// The ordered steps of one saga type.
#[derive(Clone)]
pub struct SagaDefinition {
    saga_type: String,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl SagaDefinition {
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step; steps run in the order they are added.
    pub fn step(mut self, step: impl SagaStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn shared_step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    pub(crate) fn find(&self, name: &str) -> Option<&Arc<dyn SagaStep>> {
        self.steps.iter().find(|s| s.name() == name)
    }
}

impl fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("saga_type", &self.saga_type)
            .field("steps", &self.step_names())
            .finish()
    }
}
