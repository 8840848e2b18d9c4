//! Durable workflow engine with deterministic replay.
//!
//! Workflow code reads as straight-line async Rust but executes as a series
//! of crash-resumable episodes backed by an append-only event history. The
//! crate provides:
//!
//! - A [`WorkflowContext`] with suspending primitives (activities, timers,
//!   signals, sub-workflows, side effects, continue-as-new) driven by a
//!   single-threaded cooperative fiber
//! - The replay executor that reconciles emitted commands against recorded
//!   history and fails non-deterministic code
//! - A [`Backend`] trait for pluggable storage/queues, with an in-memory
//!   implementation, plus the [`Worker`] poll loops and a [`Client`]
//!
//! ```no_run
//! use std::sync::Arc;
//! use durable_workflows::{
//!     ActivityContext, Client, InMemoryBackend, Registry, Worker,
//!     WorkflowContext, WorkflowInstanceOptions,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::builder()
//!     .register_workflow("greet", |ctx: WorkflowContext, name: String| async move {
//!         let greeting: String = ctx.execute_activity("format", &name).await?;
//!         Ok(greeting)
//!     })
//!     .register_activity("format", |_ctx: ActivityContext, name: String| async move {
//!         Ok(format!("Hello, {name}!"))
//!     })
//!     .build();
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let handle = Worker::new(backend.clone(), registry).start();
//!
//! let client = Client::new(backend);
//! let instance = client
//!     .create_workflow_instance(WorkflowInstanceOptions::default(), "greet", &"world")
//!     .await?;
//! # handle.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod backend;
pub mod client;
pub mod command;
pub mod converter;
pub mod core;
pub mod error;
pub mod history;
pub mod registry;
pub mod worker;
pub mod workflow;

pub use crate::activity::{ActivityContext, ActivityExecutor};
pub use crate::backend::memory::{InMemoryBackend, InMemoryBackendOptions};
pub use crate::backend::{ActivityTask, Backend, WorkflowEvent, WorkflowTask};
pub use crate::client::{Client, WorkflowInstanceOptions};
pub use crate::command::{Command, CommandAttributes, CommandState};
pub use crate::converter::{Converter, JsonConverter, Payload};
pub use crate::core::{
    InstanceState, Metadata, ParentInstance, WorkflowInstance, WorkflowInstanceState,
};
pub use crate::error::{BackendError, ClientError, WorkflowError};
pub use crate::history::{Event, EventAttributes, EventType};
pub use crate::registry::{Registry, RegistryBuilder};
pub use crate::worker::{Worker, WorkerHandle, WorkerOptions};
pub use crate::workflow::{
    Selector, SignalChannel, SubWorkflowOptions, WorkflowContext, WorkflowExecutor,
    WorkflowFuture, WorkflowTaskResult,
};
