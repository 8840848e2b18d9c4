//! The worker: long-poll loops that lease tasks from the backend, fan them
//! out to the executors, and commit the results.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::activity::ActivityExecutor;
use crate::backend::{ActivityTask, Backend, WorkflowTask};
use crate::error::BackendError;
use crate::registry::Registry;
use crate::workflow::{WorkflowExecutor, WorkflowTaskResult};

const POLL_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Concurrent long-poll loops for workflow tasks.
    pub workflow_pollers: usize,
    /// Upper bound on workflow tasks executing at once.
    pub max_parallel_workflow_tasks: usize,
    /// Concurrent long-poll loops for activity tasks.
    pub activity_pollers: usize,
    /// Upper bound on activities executing at once.
    pub max_parallel_activity_tasks: usize,
    /// Cadence of lease extension while a task is running. Keep this well
    /// under the backend's lock timeouts.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            workflow_pollers: 2,
            max_parallel_workflow_tasks: 8,
            activity_pollers: 2,
            max_parallel_activity_tasks: 16,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

pub struct Worker {
    backend: Arc<dyn Backend>,
    registry: Registry,
    options: WorkerOptions,
}

/// Handle to a running worker's background loops.
pub struct WorkerHandle {
    joins: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Abort all poll loops. In-flight tasks are dropped; their leases lapse
    /// and the backend redelivers.
    pub fn shutdown(self) {
        for join in &self.joins {
            join.abort();
        }
    }
}

impl Worker {
    pub fn new(backend: Arc<dyn Backend>, registry: Registry) -> Self {
        Self::with_options(backend, registry, WorkerOptions::default())
    }

    pub fn with_options(backend: Arc<dyn Backend>, registry: Registry, options: WorkerOptions) -> Self {
        Self {
            backend,
            registry,
            options,
        }
    }

    /// Spawn the workflow and activity poll loops.
    pub fn start(self) -> WorkerHandle {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let worker = Arc::new(self);
        let mut joins = Vec::new();

        let workflow_slots = Arc::new(Semaphore::new(worker.options.max_parallel_workflow_tasks));
        for _ in 0..worker.options.workflow_pollers {
            let worker = worker.clone();
            let slots = workflow_slots.clone();
            joins.push(tokio::spawn(async move {
                worker.run_workflow_poller(slots).await;
            }));
        }

        let activity_executor = Arc::new(ActivityExecutor::new(worker.registry.clone()));
        let activity_slots = Arc::new(Semaphore::new(worker.options.max_parallel_activity_tasks));
        for _ in 0..worker.options.activity_pollers {
            let worker = worker.clone();
            let slots = activity_slots.clone();
            let executor = activity_executor.clone();
            joins.push(tokio::spawn(async move {
                worker.run_activity_poller(slots, executor).await;
            }));
        }

        WorkerHandle { joins }
    }

    async fn run_workflow_poller(self: Arc<Self>, slots: Arc<Semaphore>) {
        loop {
            // Take capacity before dequeuing so a leased task never waits
            // behind a full worker.
            let permit = match slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            match self.backend.get_workflow_task().await {
                Ok(Some(task)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process_workflow_task(task).await;
                        drop(permit);
                    });
                }
                Ok(None) => drop(permit),
                Err(err) => {
                    warn!(error = %err, "workflow poll failed; backing off");
                    drop(permit);
                    tokio::time::sleep(POLL_BACKOFF).await;
                }
            }
        }
    }

    async fn process_workflow_task(&self, task: WorkflowTask) {
        debug!(
            instance_id = %task.instance.instance_id,
            task_id = %task.task_id,
            new_events = task.new_events.len(),
            "processing workflow task"
        );
        let heartbeat = self.spawn_workflow_heartbeat(&task);
        let result = self.execute_workflow_task(&task).await;
        heartbeat.abort();

        match result {
            Ok(result) => {
                let WorkflowTaskResult {
                    state,
                    executed_events,
                    activity_events,
                    timer_events,
                    workflow_events,
                } = result;
                if let Err(err) = self
                    .backend
                    .complete_workflow_task(
                        &task,
                        state,
                        executed_events,
                        activity_events,
                        timer_events,
                        workflow_events,
                    )
                    .await
                {
                    match err {
                        BackendError::TaskLeaseLost(_) => warn!(
                            instance_id = %task.instance.instance_id,
                            task_id = %task.task_id,
                            "workflow task lease lost; discarding results"
                        ),
                        err => warn!(error = %err, "failed to complete workflow task"),
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to execute workflow task"),
        }
    }

    async fn execute_workflow_task(
        &self,
        task: &WorkflowTask,
    ) -> Result<WorkflowTaskResult, BackendError> {
        // Cold start on every task: fetch the committed history and let the
        // executor replay it before applying the new events.
        let history = if task.last_sequence_id > 0 {
            self.backend
                .get_workflow_instance_history(&task.instance)
                .await?
        } else {
            Vec::new()
        };
        let mut executor = WorkflowExecutor::new(self.registry.clone(), task.instance.clone());
        Ok(executor.execute_task(&history, &task.new_events))
    }

    fn spawn_workflow_heartbeat(&self, task: &WorkflowTask) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let task_id = task.task_id.clone();
        let instance = task.instance.clone();
        let interval = self.options.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = backend.extend_workflow_task(&task_id, &instance).await {
                    warn!(%task_id, error = %err, "failed to extend workflow task lease");
                    return;
                }
            }
        })
    }

    async fn run_activity_poller(self: Arc<Self>, slots: Arc<Semaphore>, executor: Arc<ActivityExecutor>) {
        loop {
            let permit = match slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            match self.backend.get_activity_task().await {
                Ok(Some(task)) => {
                    let worker = self.clone();
                    let executor = executor.clone();
                    tokio::spawn(async move {
                        worker.process_activity_task(&executor, task).await;
                        drop(permit);
                    });
                }
                Ok(None) => drop(permit),
                Err(err) => {
                    warn!(error = %err, "activity poll failed; backing off");
                    drop(permit);
                    tokio::time::sleep(POLL_BACKOFF).await;
                }
            }
        }
    }

    async fn process_activity_task(&self, executor: &ActivityExecutor, task: ActivityTask) {
        let heartbeat = self.spawn_activity_heartbeat(&task);
        let event = executor.execute_task(&task).await;
        heartbeat.abort();
        if let Err(err) = self
            .backend
            .complete_activity_task(&task.instance, &task.task_id, event)
            .await
        {
            match err {
                BackendError::TaskLeaseLost(_) => warn!(
                    task_id = %task.task_id,
                    "activity task lease lost; discarding result"
                ),
                err => warn!(error = %err, "failed to complete activity task"),
            }
        }
    }

    fn spawn_activity_heartbeat(&self, task: &ActivityTask) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let task_id = task.task_id.clone();
        let interval = self.options.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = backend.extend_activity_task(&task_id).await {
                    warn!(%task_id, error = %err, "failed to extend activity task lease");
                    return;
                }
            }
        })
    }
}
