//! Saga definitions: the registered templates sagas are instantiated from.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use saga::{Saga, SagaStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

/// One step of a saga definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub service_name: String,
    pub action_type: String,
    #[serde(default)]
    pub action_payload: Value,
    #[serde(default)]
    pub compensation_action_type: Option<String>,
    #[serde(default)]
    pub compensation_payload: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// A named, ordered list of steps that can be started many times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub saga_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retry_attempts: Option<u32>,
    pub steps: Vec<StepDefinition>,
}

/// Values used where a definition leaves a setting open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceDefaults {
    pub max_retries: u32,
    pub max_retry_attempts: u32,
    pub saga_timeout: Option<Duration>,
}

impl Default for InstanceDefaults {
    fn default() -> Self {
        Self {
            max_retries: saga::DEFAULT_MAX_RETRIES,
            max_retry_attempts: saga::DEFAULT_MAX_RETRY_ATTEMPTS,
            saga_timeout: None,
        }
    }
}

impl SagaDefinition {
    /// Checks that the definition can produce a runnable saga.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> { Err(OrchestratorError::InvalidDefinition(reason)) };

        if self.saga_type.trim().is_empty() {
            return invalid("saga_type must not be empty".to_string());
        }
        if self.steps.is_empty() {
            return invalid(format!("{} has no steps", self.saga_type));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty()
                || step.service_name.trim().is_empty()
                || step.action_type.trim().is_empty()
            {
                return invalid(format!(
                    "{}: every step needs a name, service_name and action_type",
                    self.saga_type
                ));
            }
            if !names.insert(step.name.as_str()) {
                return invalid(format!(
                    "{}: duplicate step name '{}'",
                    self.saga_type, step.name
                ));
            }
        }
        Ok(())
    }

    /// Builds a new `Created` saga from this definition.
    pub fn instantiate(
        &self,
        correlation_id: impl Into<String>,
        context: BTreeMap<String, Value>,
        defaults: &InstanceDefaults,
    ) -> Saga {
        let mut builder = Saga::builder(&self.saga_type, &self.name, correlation_id)
            .description(&self.description)
            .max_retry_attempts(self.max_retry_attempts.unwrap_or(defaults.max_retry_attempts))
            .context(context);

        if let Some(timeout) = self.timeout_ms.map(Duration::from_millis).or(defaults.saga_timeout) {
            builder = builder.timeout(timeout);
        }

        for step in &self.steps {
            let mut saga_step = SagaStep::new(
                &step.name,
                &step.service_name,
                &step.action_type,
                step.action_payload.clone(),
            )
            .with_max_retries(step.max_retries.unwrap_or(defaults.max_retries));

            if let Some(action) = step.compensation_action_type.as_deref().filter(|a| !a.is_empty()) {
                saga_step = saga_step.with_compensation(action, step.compensation_payload.clone());
            }
            if let Some(timeout_ms) = step.timeout_ms {
                saga_step = saga_step.with_timeout(Duration::from_millis(timeout_ms));
            }
            builder = builder.step(saga_step);
        }

        builder.build()
    }
}

/// Thread-safe registry of saga definitions keyed by saga type.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: Arc<RwLock<HashMap<String, SagaDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a definition, replacing any previous one of the
    /// same type. Returns the replaced definition.
    pub fn register(&self, definition: SagaDefinition) -> Result<Option<SagaDefinition>> {
        definition.validate()?;
        tracing::info!(saga_type = %definition.saga_type, steps = definition.steps.len(), "saga definition registered");
        Ok(self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.saga_type.clone(), definition))
    }

    /// Parses a JSON array of definitions and registers each of them.
    /// Nothing is registered if any definition is invalid.
    pub fn load_json(&self, json: &str) -> Result<usize> {
        let definitions: Vec<SagaDefinition> = serde_json::from_str(json)
            .map_err(|e| OrchestratorError::InvalidDefinition(e.to_string()))?;
        for definition in &definitions {
            definition.validate()?;
        }
        let count = definitions.len();
        for definition in definitions {
            self.register(definition)?;
        }
        Ok(count)
    }

    pub fn get(&self, saga_type: &str) -> Option<SagaDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(saga_type)
            .cloned()
    }

    /// Returns all definitions ordered by saga type.
    pub fn list(&self) -> Vec<SagaDefinition> {
        let mut definitions: Vec<SagaDefinition> = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.saga_type.cmp(&b.saga_type));
        definitions
    }

    pub fn len(&self) -> usize {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
