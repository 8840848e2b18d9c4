//! Name → workflow/activity function mapping.
//!
//! Registration captures the function's parameter and return types through
//! the serde bounds on the typed wrappers, so argument binding at execution
//! time uses the registered signature as its type hint.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::activity::ActivityContext;
use crate::converter::{Converter, JsonConverter, Payload};
use crate::error::WorkflowError;
use crate::workflow::WorkflowContext;

/// Trait implemented by workflow handlers invocable by the executor.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: Payload) -> Result<Payload, WorkflowError>;
}

/// Function wrapper that implements [`WorkflowHandler`].
pub struct FnWorkflow<F>(pub F);

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F>
where
    F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, input: Payload) -> Result<Payload, WorkflowError> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers invocable by the activity executor.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, WorkflowError>;
}

pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, WorkflowError> {
        (self.0)(ctx, input).await
    }
}

/// Immutable registry shared by workers and executors.
#[derive(Clone, Default)]
pub struct Registry {
    workflows: Arc<HashMap<String, Arc<dyn WorkflowHandler>>>,
    activities: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            workflows: HashMap::new(),
            activities: HashMap::new(),
        }
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.workflows.get(name).cloned()
    }

    pub fn activity(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.activities.get(name).cloned()
    }

    pub fn workflow_names(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }

    pub fn activity_names(&self) -> Vec<String> {
        self.activities.keys().cloned().collect()
    }
}

pub struct RegistryBuilder {
    workflows: HashMap<String, Arc<dyn WorkflowHandler>>,
    activities: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl RegistryBuilder {
    /// Register a typed workflow function.
    ///
    /// # Panics
    ///
    /// Panics if a workflow with the same name was already registered.
    pub fn register_workflow<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        let name = name.into();
        let wrapper = move |ctx: WorkflowContext, input: Payload| {
            let f = f.clone();
            async move {
                let input: In = JsonConverter.from_payload(&input).map_err(WorkflowError::from)?;
                let out = f(ctx, input).await?;
                JsonConverter.to_payload(&out).map_err(WorkflowError::from)
            }
        };
        let prev = self
            .workflows
            .insert(name.clone(), Arc::new(FnWorkflow(wrapper)));
        if prev.is_some() {
            panic!("duplicate workflow registration: {name}");
        }
        self
    }

    /// Register a workflow taking and returning raw payloads.
    ///
    /// # Panics
    ///
    /// Panics if a workflow with the same name was already registered.
    pub fn register_workflow_raw<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
    {
        let name = name.into();
        let prev = self.workflows.insert(name.clone(), Arc::new(FnWorkflow(f)));
        if prev.is_some() {
            panic!("duplicate workflow registration: {name}");
        }
        self
    }

    /// Register a typed activity function.
    ///
    /// # Panics
    ///
    /// Panics if an activity with the same name was already registered.
    pub fn register_activity<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        let name = name.into();
        let wrapper = move |ctx: ActivityContext, input: Payload| {
            let f = f.clone();
            async move {
                let input: In = JsonConverter.from_payload(&input).map_err(WorkflowError::from)?;
                let out = f(ctx, input).await?;
                JsonConverter.to_payload(&out).map_err(WorkflowError::from)
            }
        };
        let prev = self
            .activities
            .insert(name.clone(), Arc::new(FnActivity(wrapper)));
        if prev.is_some() {
            panic!("duplicate activity registration: {name}");
        }
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            workflows: Arc::new(self.workflows),
            activities: Arc::new(self.activities),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let registry = Registry::builder()
            .register_workflow("w1", |_ctx: WorkflowContext, x: i32| async move { Ok(x) })
            .register_activity("a1", |_ctx: ActivityContext, x: i32| async move { Ok(x + 1) })
            .build();

        assert!(registry.workflow("w1").is_some());
        assert!(registry.workflow("nope").is_none());
        assert!(registry.activity("a1").is_some());
        assert!(registry.activity("w1").is_none());
    }

    #[test]
    #[should_panic(expected = "duplicate workflow registration")]
    fn duplicate_workflow_panics() {
        let _ = Registry::builder()
            .register_workflow("w1", |_ctx: WorkflowContext, x: i32| async move { Ok(x) })
            .register_workflow("w1", |_ctx: WorkflowContext, x: i32| async move { Ok(x) });
    }
}
