use async_trait::async_trait;
use flowcore::{FlowError, Step, StepContext, StepError, StepOutcome, WorkflowError};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating step instances
pub trait StepFactory: Send + Sync {
    /// Create a fresh step instance for one run
    fn create(&self) -> Result<Box<dyn Step>, StepError>;

    /// Get step type identifier
    fn step_type(&self) -> &str;

    /// Optional: Get step metadata (description, declared inputs)
    fn metadata(&self) -> StepMetadata {
        StepMetadata::default()
    }
}

/// Metadata about a step type
#[derive(Debug, Clone)]
pub struct StepMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PropertyDefinition>,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

type StepFn = dyn Fn(&mut StepContext) -> Result<StepOutcome, StepError> + Send + Sync;

/// Step backed by a synchronous closure
#[derive(Clone)]
pub struct FnStep {
    step_type: String,
    func: Arc<StepFn>,
}

impl FnStep {
    pub fn new<F>(step_type: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut StepContext) -> Result<StepOutcome, StepError> + Send + Sync + 'static,
    {
        Self {
            step_type: step_type.into(),
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl Step for FnStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        (self.func)(ctx)
    }
}

impl StepFactory for FnStep {
    fn create(&self) -> Result<Box<dyn Step>, StepError> {
        Ok(Box::new(self.clone()))
    }

    fn step_type(&self) -> &str {
        &self.step_type
    }
}

/// Registry of available step types
pub struct StepRegistry {
    factories: HashMap<String, Arc<dyn StepFactory>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a step factory; a later registration replaces an earlier one
    pub fn register(&mut self, factory: Arc<dyn StepFactory>) {
        let step_type = factory.step_type().to_string();
        tracing::debug!(step_type = %step_type, "Registering step type");
        self.factories.insert(step_type, factory);
    }

    /// Register a closure as a step type
    pub fn register_fn<F>(&mut self, step_type: impl Into<String>, func: F)
    where
        F: Fn(&mut StepContext) -> Result<StepOutcome, StepError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnStep::new(step_type, func)));
    }

    /// Create a step instance for a step type
    pub fn create_step(&self, step_type: &str) -> Result<Box<dyn Step>, FlowError> {
        let factory = self
            .factories
            .get(step_type)
            .ok_or_else(|| WorkflowError::UnknownStepType(step_type.to_string()))?;

        factory.create().map_err(|e| {
            tracing::error!(step_type, error = %e, "Failed to create step");
            FlowError::Step(e)
        })
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.contains_key(step_type)
    }

    /// Get all registered step types, sorted
    pub fn list_step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, step_type: &str) -> Option<StepMetadata> {
        self.factories.get(step_type).map(|f| f.metadata())
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}
