#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use durable_workflows::{
    Client, Converter, Event, EventAttributes, InMemoryBackend, InMemoryBackendOptions,
    JsonConverter, Metadata, Registry, Worker, WorkerHandle,
};

/// Backend with short leases and block timeouts suitable for tests.
pub fn test_backend() -> Arc<InMemoryBackend> {
    Arc::new(InMemoryBackend::with_options(InMemoryBackendOptions {
        workflow_lock_timeout: Duration::from_secs(5),
        activity_lock_timeout: Duration::from_secs(5),
        block_timeout: Duration::from_millis(200),
    }))
}

pub fn start_worker(backend: Arc<InMemoryBackend>, registry: Registry) -> (Client, WorkerHandle) {
    let handle = Worker::new(backend.clone(), registry).start();
    (Client::new(backend), handle)
}

/// A `WorkflowExecutionStarted` event as a backend would enqueue it.
pub fn started_event<T: Serialize>(name: &str, input: &T) -> Event {
    Event::new(EventAttributes::WorkflowExecutionStarted {
        name: name.to_string(),
        input: JsonConverter.to_payload(input).unwrap(),
        metadata: Metadata::default(),
    })
}

/// Poll an async condition until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
