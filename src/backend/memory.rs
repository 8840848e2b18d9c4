//! In-memory backend: the dev/test implementation of the [`Backend`]
//! contract and the reference semantics for its atomicity requirements.
//!
//! All shared state sits behind one async mutex, so `complete_workflow_task`
//! is trivially atomic: sequence assignment, history append, pending-stream
//! truncation, timer staging, activity enqueue, and workflow-event routing
//! happen under a single lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{InstanceState, Metadata, WorkflowInstance, WorkflowInstanceState};
use crate::error::{BackendError, WorkflowError};
use crate::history::{Event, EventAttributes, EventType};

use super::{ActivityTask, Backend, WorkflowEvent, WorkflowTask};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct InMemoryBackendOptions {
    /// Lease duration for workflow tasks.
    pub workflow_lock_timeout: Duration,
    /// Lease duration for activity tasks.
    pub activity_lock_timeout: Duration,
    /// How long `get_*_task` blocks before returning `None`.
    pub block_timeout: Duration,
}

impl Default for InMemoryBackendOptions {
    fn default() -> Self {
        Self {
            workflow_lock_timeout: Duration::from_secs(30),
            activity_lock_timeout: Duration::from_secs(60),
            block_timeout: Duration::from_secs(2),
        }
    }
}

struct ExecutionRecord {
    state: InstanceState,
    history: Vec<Event>,
    pending: VecDeque<Event>,
}

struct InstanceRecord {
    active_execution_id: String,
    executions: HashMap<String, ExecutionRecord>,
}

struct FutureEvent {
    instance_id: String,
    execution_id: String,
    event: Event,
}

struct Lease {
    task_id: String,
    deadline: DateTime<Utc>,
}

struct QueuedActivity {
    instance: WorkflowInstance,
    event: Event,
}

struct ActivityLease {
    item: QueuedActivity,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct Store {
    instances: HashMap<String, InstanceRecord>,
    /// Delayed events ordered only by their `visible_at`; scanned on poll.
    future_events: Vec<FutureEvent>,
    workflow_queue: VecDeque<String>,
    queued: HashSet<String>,
    /// instance id → outstanding lease. One entry per instance, which is the
    /// at-most-one-task invariant.
    workflow_leases: HashMap<String, Lease>,
    activity_queue: VecDeque<QueuedActivity>,
    activity_leases: HashMap<String, ActivityLease>,
}

impl Store {
    fn enqueue_workflow(&mut self, instance_id: &str) {
        if self.queued.insert(instance_id.to_string()) {
            self.workflow_queue.push_back(instance_id.to_string());
        }
    }

    /// Move due future events into their instance's pending stream. Events
    /// for executions that moved on (continue-as-new) or finished are
    /// dropped.
    fn promote_due_future_events(&mut self, now: DateTime<Utc>) {
        let staged = std::mem::take(&mut self.future_events);
        let mut keep = Vec::with_capacity(staged.len());
        let mut woken = Vec::new();
        for fe in staged {
            if fe.event.visible_at.is_some_and(|at| at > now) {
                keep.push(fe);
                continue;
            }
            let FutureEvent {
                instance_id,
                execution_id,
                mut event,
            } = fe;
            let mut delivered = false;
            if let Some(record) = self.instances.get_mut(&instance_id) {
                if record.active_execution_id == execution_id {
                    if let Some(execution) = record.executions.get_mut(&execution_id) {
                        if !execution.state.state.is_terminal() {
                            // Stamp the delivery time; the event still carries
                            // its scheduling-time stamp, and the workflow
                            // clock follows event timestamps.
                            event.timestamp = now;
                            execution.pending.push_back(event);
                            delivered = true;
                        }
                    }
                }
            }
            if delivered {
                woken.push(instance_id);
            }
        }
        self.future_events = keep;
        for instance_id in woken {
            self.enqueue_workflow(&instance_id);
        }
    }

    /// Reclaim expired workflow leases so their instances become deliverable
    /// again.
    fn reclaim_expired_workflow_leases(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .workflow_leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(instance_id, _)| instance_id.clone())
            .collect();
        for instance_id in expired {
            warn!(%instance_id, "workflow task lease expired; instance redeliverable");
            self.workflow_leases.remove(&instance_id);
            self.enqueue_workflow(&instance_id);
        }
    }

    /// Append an event to the pending stream of the targeted execution and
    /// enqueue the instance. Events for unknown instances or terminal
    /// executions are dropped.
    fn route_event(&mut self, target: &WorkflowInstance, event: Event) {
        let Some(record) = self.instances.get_mut(&target.instance_id) else {
            warn!(instance_id = %target.instance_id, "dropping event for unknown instance");
            return;
        };
        let execution_id = if target.execution_id.is_empty() {
            record.active_execution_id.clone()
        } else {
            target.execution_id.clone()
        };
        let Some(execution) = record.executions.get_mut(&execution_id) else {
            warn!(instance_id = %target.instance_id, %execution_id, "dropping event for unknown execution");
            return;
        };
        if execution.state.state.is_terminal() {
            debug!(
                instance_id = %target.instance_id,
                event_type = ?event.event_type(),
                "dropping event for terminal execution"
            );
            return;
        }
        execution.pending.push_back(event);
        self.enqueue_workflow(&target.instance_id);
    }

    /// Create a new execution for `target`. Fails when the instance already
    /// has an active execution.
    fn start_execution(
        &mut self,
        target: &WorkflowInstance,
        metadata: Metadata,
        event: Event,
    ) -> Result<(), ()> {
        if let Some(record) = self.instances.get(&target.instance_id) {
            if let Some(active) = record.executions.get(&record.active_execution_id) {
                if !active.state.state.is_terminal() {
                    return Err(());
                }
            }
        }
        let execution = ExecutionRecord {
            state: InstanceState {
                instance: target.clone(),
                state: WorkflowInstanceState::Active,
                metadata,
                created_at: Utc::now(),
                last_sequence_id: 0,
            },
            history: Vec::new(),
            pending: VecDeque::from([event]),
        };
        let record = self
            .instances
            .entry(target.instance_id.clone())
            .or_insert_with(|| InstanceRecord {
                active_execution_id: String::new(),
                executions: HashMap::new(),
            });
        record.active_execution_id = target.execution_id.clone();
        record.executions.insert(target.execution_id.clone(), execution);
        self.enqueue_workflow(&target.instance_id);
        Ok(())
    }
}

pub struct InMemoryBackend {
    store: Mutex<Store>,
    workflow_signal: Notify,
    activity_signal: Notify,
    options: InMemoryBackendOptions,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_options(InMemoryBackendOptions::default())
    }

    pub fn with_options(options: InMemoryBackendOptions) -> Self {
        Self {
            store: Mutex::new(Store::default()),
            workflow_signal: Notify::new(),
            activity_signal: Notify::new(),
            options,
        }
    }

    fn lease_deadline(&self, lock_timeout: Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(lock_timeout).unwrap_or(chrono::Duration::MAX)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        metadata: Metadata,
        event: Event,
    ) -> Result<(), BackendError> {
        {
            let mut guard = self.store.lock().await;
            let store = &mut *guard;
            if store.instances.contains_key(&instance.instance_id) {
                return Err(BackendError::InstanceAlreadyExists);
            }
            store
                .start_execution(&instance, metadata, event)
                .map_err(|_| BackendError::InstanceAlreadyExists)?;
        }
        self.workflow_signal.notify_waiters();
        Ok(())
    }

    async fn cancel_workflow_instance(
        &self,
        instance_id: &str,
        event: Event,
    ) -> Result<(), BackendError> {
        {
            let mut guard = self.store.lock().await;
            let store = &mut *guard;
            if !store.instances.contains_key(instance_id) {
                return Err(BackendError::InstanceNotFound);
            }
            store.route_event(&WorkflowInstance::active(instance_id), event);
        }
        self.workflow_signal.notify_waiters();
        Ok(())
    }

    async fn signal_workflow(&self, instance_id: &str, event: Event) -> Result<(), BackendError> {
        {
            let mut guard = self.store.lock().await;
            let store = &mut *guard;
            if !store.instances.contains_key(instance_id) {
                return Err(BackendError::InstanceNotFound);
            }
            store.route_event(&WorkflowInstance::active(instance_id), event);
        }
        self.workflow_signal.notify_waiters();
        Ok(())
    }

    async fn get_workflow_task(&self) -> Result<Option<WorkflowTask>, BackendError> {
        let deadline = tokio::time::Instant::now() + self.options.block_timeout;
        loop {
            {
                let mut guard = self.store.lock().await;
                let store = &mut *guard;
                let now = Utc::now();
                store.promote_due_future_events(now);
                store.reclaim_expired_workflow_leases(now);

                while let Some(instance_id) = store.workflow_queue.pop_front() {
                    store.queued.remove(&instance_id);
                    if store.workflow_leases.contains_key(&instance_id) {
                        continue;
                    }
                    let Some(record) = store.instances.get_mut(&instance_id) else {
                        continue;
                    };
                    let execution_id = record.active_execution_id.clone();
                    let Some(execution) = record.executions.get_mut(&execution_id) else {
                        continue;
                    };
                    if execution.state.state.is_terminal() {
                        execution.pending.clear();
                        continue;
                    }
                    if execution.pending.is_empty() {
                        continue;
                    }
                    let task = WorkflowTask {
                        task_id: Uuid::new_v4().to_string(),
                        instance: execution.state.instance.clone(),
                        state: execution.state.state,
                        metadata: execution.state.metadata.clone(),
                        last_sequence_id: execution.state.last_sequence_id,
                        new_events: execution.pending.iter().cloned().collect(),
                        custom_data: None,
                    };
                    store.workflow_leases.insert(
                        instance_id,
                        Lease {
                            task_id: task.task_id.clone(),
                            deadline: self.lease_deadline(self.options.workflow_lock_timeout),
                        },
                    );
                    return Ok(Some(task));
                }
            }
            tokio::select! {
                _ = self.workflow_signal.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn extend_workflow_task(
        &self,
        task_id: &str,
        instance: &WorkflowInstance,
    ) -> Result<(), BackendError> {
        let deadline = self.lease_deadline(self.options.workflow_lock_timeout);
        let mut guard = self.store.lock().await;
        match guard.workflow_leases.get_mut(&instance.instance_id) {
            Some(lease) if lease.task_id == task_id => {
                lease.deadline = deadline;
                Ok(())
            }
            _ => Err(BackendError::TaskLeaseLost(task_id.to_string())),
        }
    }

    async fn complete_workflow_task(
        &self,
        task: &WorkflowTask,
        state: WorkflowInstanceState,
        executed_events: Vec<Event>,
        activity_events: Vec<Event>,
        timer_events: Vec<Event>,
        workflow_events: Vec<WorkflowEvent>,
    ) -> Result<(), BackendError> {
        {
            let mut guard = self.store.lock().await;
            let store = &mut *guard;
            let lease_valid = store
                .workflow_leases
                .get(&task.instance.instance_id)
                .is_some_and(|lease| lease.task_id == task.task_id);
            if !lease_valid {
                return Err(BackendError::TaskLeaseLost(task.task_id.clone()));
            }
            store.workflow_leases.remove(&task.instance.instance_id);

            let canceled_timers: Vec<u64> = executed_events
                .iter()
                .filter(|e| e.event_type() == EventType::TimerCanceled)
                .filter_map(|e| e.schedule_event_id)
                .collect();

            let has_more_pending;
            {
                let record = store
                    .instances
                    .get_mut(&task.instance.instance_id)
                    .ok_or(BackendError::InstanceNotFound)?;
                let execution = record
                    .executions
                    .get_mut(&task.instance.execution_id)
                    .ok_or(BackendError::InstanceNotFound)?;

                let mut sequence_id = execution.state.last_sequence_id;
                for mut event in executed_events {
                    sequence_id += 1;
                    event.sequence_id = sequence_id;
                    execution.history.push(event);
                }
                execution.state.last_sequence_id = sequence_id;
                execution.state.state = state;

                let consumed: HashSet<Uuid> = task.new_events.iter().map(|e| e.id).collect();
                execution.pending.retain(|e| !consumed.contains(&e.id));
                has_more_pending = !execution.pending.is_empty();
            }

            store.future_events.retain(|fe| {
                !(fe.instance_id == task.instance.instance_id
                    && fe
                        .event
                        .schedule_event_id
                        .is_some_and(|sid| canceled_timers.contains(&sid)))
            });
            for event in timer_events {
                store.future_events.push(FutureEvent {
                    instance_id: task.instance.instance_id.clone(),
                    execution_id: task.instance.execution_id.clone(),
                    event,
                });
            }

            for event in activity_events {
                store.activity_queue.push_back(QueuedActivity {
                    instance: task.instance.clone(),
                    event,
                });
            }

            for WorkflowEvent { target, event } in workflow_events {
                if event.event_type() == EventType::WorkflowExecutionStarted {
                    let metadata = match &event.attributes {
                        EventAttributes::WorkflowExecutionStarted { metadata, .. } => {
                            metadata.clone()
                        }
                        _ => Metadata::default(),
                    };
                    if store.start_execution(&target, metadata, event).is_err() {
                        // Creation collided with an existing active execution:
                        // the creator learns through a synthetic failure; the
                        // existing instance is left untouched.
                        match &target.parent {
                            Some(parent) => {
                                let failure = Event::new(EventAttributes::SubWorkflowFailed {
                                    error: WorkflowError::sub_workflow(
                                        BackendError::InstanceAlreadyExists.to_string(),
                                    ),
                                })
                                .with_schedule_event_id(parent.schedule_event_id);
                                store.route_event(&parent.instance, failure);
                            }
                            None => warn!(
                                instance_id = %target.instance_id,
                                "dropping duplicate instance creation with no parent"
                            ),
                        }
                    }
                } else {
                    store.route_event(&target, event);
                }
            }

            if state == WorkflowInstanceState::Active && has_more_pending {
                store.enqueue_workflow(&task.instance.instance_id);
            }
        }
        self.workflow_signal.notify_waiters();
        self.activity_signal.notify_waiters();
        Ok(())
    }

    async fn get_workflow_instance_history(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Vec<Event>, BackendError> {
        let guard = self.store.lock().await;
        let record = guard
            .instances
            .get(&instance.instance_id)
            .ok_or(BackendError::InstanceNotFound)?;
        let execution_id = if instance.execution_id.is_empty() {
            &record.active_execution_id
        } else {
            &instance.execution_id
        };
        let execution = record
            .executions
            .get(execution_id)
            .ok_or(BackendError::InstanceNotFound)?;
        Ok(execution.history.clone())
    }

    async fn get_workflow_instance_state(
        &self,
        instance_id: &str,
    ) -> Result<InstanceState, BackendError> {
        let guard = self.store.lock().await;
        let record = guard
            .instances
            .get(instance_id)
            .ok_or(BackendError::InstanceNotFound)?;
        let execution = record
            .executions
            .get(&record.active_execution_id)
            .ok_or(BackendError::InstanceNotFound)?;
        Ok(execution.state.clone())
    }

    async fn get_activity_task(&self) -> Result<Option<ActivityTask>, BackendError> {
        let deadline = tokio::time::Instant::now() + self.options.block_timeout;
        loop {
            {
                let mut guard = self.store.lock().await;
                let store = &mut *guard;
                let now = Utc::now();
                let expired: Vec<String> = store
                    .activity_leases
                    .iter()
                    .filter(|(_, lease)| lease.deadline <= now)
                    .map(|(task_id, _)| task_id.clone())
                    .collect();
                for task_id in expired {
                    if let Some(lease) = store.activity_leases.remove(&task_id) {
                        warn!(%task_id, "activity task lease expired; redelivering");
                        store.activity_queue.push_back(lease.item);
                    }
                }
                if let Some(item) = store.activity_queue.pop_front() {
                    let task_id = Uuid::new_v4().to_string();
                    let task = ActivityTask {
                        task_id: task_id.clone(),
                        instance: item.instance.clone(),
                        event: item.event.clone(),
                    };
                    store.activity_leases.insert(
                        task_id,
                        ActivityLease {
                            item,
                            deadline: self.lease_deadline(self.options.activity_lock_timeout),
                        },
                    );
                    return Ok(Some(task));
                }
            }
            tokio::select! {
                _ = self.activity_signal.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn extend_activity_task(&self, task_id: &str) -> Result<(), BackendError> {
        let deadline = self.lease_deadline(self.options.activity_lock_timeout);
        let mut guard = self.store.lock().await;
        match guard.activity_leases.get_mut(task_id) {
            Some(lease) => {
                lease.deadline = deadline;
                Ok(())
            }
            None => Err(BackendError::TaskLeaseLost(task_id.to_string())),
        }
    }

    async fn complete_activity_task(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        event: Event,
    ) -> Result<(), BackendError> {
        {
            let mut guard = self.store.lock().await;
            let store = &mut *guard;
            if store.activity_leases.remove(task_id).is_none() {
                return Err(BackendError::TaskLeaseLost(task_id.to_string()));
            }
            // Deliver to the exact execution that scheduled the activity;
            // completions for executions that moved on are dropped inside.
            store.route_event(instance, event);
        }
        self.workflow_signal.notify_waiters();
        Ok(())
    }
}
