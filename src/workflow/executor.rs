//! The workflow executor: drives one workflow task by replaying recorded
//! history, applying new events, and reconciling the commands emitted by the
//! fiber against the events the history says were produced.
//!
//! Replay correctness rests on one rule: a fiber re-executed over its own
//! history emits exactly the same sequence of command ids and types as the
//! run that produced it. Every `*Scheduled`-style event in history is the
//! echo of a command and must match a pending command with the same id and
//! kind; a mismatch is non-determinism and fatal to the execution.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::backend::WorkflowEvent;
use crate::command::{Command, CommandAttributes, CommandState};
use crate::converter::Payload;
use crate::core::{Metadata, WorkflowInstance, WorkflowInstanceState};
use crate::error::WorkflowError;
use crate::history::{Event, EventAttributes};
use crate::registry::Registry;

use super::context::WorkflowContext;
use super::fiber::{WorkflowBody, WorkflowFiber};
use super::state::WorkflowState;

/// Output of one workflow task: the history delta for this instance plus the
/// events the backend must route elsewhere (activity queue, future-events
/// store, other instances).
#[derive(Debug)]
pub struct WorkflowTaskResult {
    pub state: WorkflowInstanceState,
    pub executed_events: Vec<Event>,
    pub activity_events: Vec<Event>,
    pub timer_events: Vec<Event>,
    pub workflow_events: Vec<WorkflowEvent>,
}

pub struct WorkflowExecutor {
    registry: Registry,
    instance: Arc<WorkflowInstance>,
    context: WorkflowContext,
    state: Arc<Mutex<WorkflowState>>,
    fiber: Option<WorkflowFiber>,
    workflow_name: Option<String>,
    metadata: Metadata,
    result: Option<Result<Payload, WorkflowError>>,
    fatal: Option<WorkflowError>,
    history_terminal: Option<WorkflowInstanceState>,
    replayed: bool,
}

impl WorkflowExecutor {
    pub fn new(registry: Registry, instance: WorkflowInstance) -> Self {
        let state = Arc::new(Mutex::new(WorkflowState::new()));
        let instance = Arc::new(instance);
        let context = WorkflowContext::new(state.clone(), instance.clone());
        Self {
            registry,
            instance,
            context,
            state,
            fiber: None,
            workflow_name: None,
            metadata: Metadata::default(),
            result: None,
            fatal: None,
            history_terminal: None,
            replayed: false,
        }
    }

    /// Execute one workflow task.
    ///
    /// On the first call the committed history is replayed with the replay
    /// flag set; new events always apply live. A warm executor keeps its
    /// fiber between calls and only consumes new events.
    pub fn execute_task(
        &mut self,
        committed_history: &[Event],
        new_events: &[Event],
    ) -> WorkflowTaskResult {
        if !self.replayed {
            self.replayed = true;
            if !committed_history.is_empty() {
                self.state.lock().unwrap().set_replaying(true);
                for event in committed_history {
                    if self.fatal.is_some() {
                        break;
                    }
                    self.apply_event(event);
                }
            }
        }
        self.state.lock().unwrap().set_replaying(false);

        let mut executed_events = Vec::new();
        for event in new_events {
            if self.fatal.is_some() || self.terminal() {
                debug!(
                    instance_id = %self.instance.instance_id,
                    event_type = ?event.event_type(),
                    "dropping event delivered to a terminal execution"
                );
                continue;
            }
            executed_events.push(event.clone());
            self.apply_event(event);
        }

        self.collect(executed_events)
    }

    /// Terminal result of the workflow, once it has one.
    pub fn workflow_result(&self) -> Option<&Result<Payload, WorkflowError>> {
        self.result.as_ref()
    }

    fn terminal(&self) -> bool {
        self.fatal.is_some()
            || self.history_terminal.is_some()
            || self.fiber.as_ref().is_some_and(|f| f.completed())
    }

    fn apply_event(&mut self, event: &Event) {
        self.state.lock().unwrap().set_time(event.timestamp);
        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted {
                name,
                input,
                metadata,
            } => self.start_fiber(name, input, metadata),
            EventAttributes::WorkflowExecutionFinished { .. } => {
                self.history_terminal = Some(WorkflowInstanceState::Finished);
            }
            EventAttributes::WorkflowExecutionCanceled { reason } => self.handle_cancel(reason),
            EventAttributes::WorkflowExecutionTerminated { reason } => {
                self.fatal = Some(WorkflowError::terminated(reason.clone()));
            }
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                self.match_command_echo(event);
                self.history_terminal = Some(WorkflowInstanceState::ContinuedAsNew);
            }
            EventAttributes::ActivityScheduled { .. }
            | EventAttributes::TimerScheduled { .. }
            | EventAttributes::TimerCanceled
            | EventAttributes::SubWorkflowScheduled { .. }
            | EventAttributes::SubWorkflowCancellationRequested => self.match_command_echo(event),
            EventAttributes::ActivityCompleted { result } => {
                self.resolve_completion(event, Ok(result.clone()))
            }
            EventAttributes::ActivityFailed { error } => {
                self.resolve_completion(event, Err(error.clone()))
            }
            EventAttributes::TimerFired { .. } => {
                self.resolve_completion(event, Ok(Payload::null()))
            }
            EventAttributes::SubWorkflowCompleted { result } => {
                self.resolve_completion(event, Ok(result.clone()))
            }
            EventAttributes::SubWorkflowFailed { error } => {
                self.resolve_completion(event, Err(error.clone()))
            }
            EventAttributes::SideEffectResult { result } => {
                self.resolve_completion(event, Ok(result.clone()))
            }
            EventAttributes::SignalReceived { name, payload } => {
                self.state
                    .lock()
                    .unwrap()
                    .deliver_signal(name, payload.clone());
                self.resume();
            }
        }
    }

    fn start_fiber(&mut self, name: &str, input: &Payload, metadata: &Metadata) {
        if self.fiber.is_some() {
            warn!(
                instance_id = %self.instance.instance_id,
                "duplicate WorkflowExecutionStarted; ignoring"
            );
            return;
        }
        self.workflow_name = Some(name.to_string());
        self.metadata = metadata.clone();
        match self.registry.workflow(name) {
            Some(handler) => {
                let ctx = self.context.clone();
                let input = input.clone();
                let body: WorkflowBody = Box::pin(async move { handler.invoke(ctx, input).await });
                self.fiber = Some(WorkflowFiber::start(body));
                self.resume();
            }
            None => {
                self.fatal = Some(WorkflowError::application(format!(
                    "workflow not registered: {name}"
                )));
            }
        }
    }

    fn resume(&mut self) {
        if let Some(fiber) = self.fiber.as_mut() {
            if !fiber.completed() {
                fiber.resume();
            }
        }
    }

    /// Match a replayed command echo against the fiber's command buffer.
    fn match_command_echo(&mut self, event: &Event) {
        if self.fatal.is_some() {
            return;
        }
        let event_type = event.event_type();
        let Some(schedule_event_id) = event.schedule_event_id else {
            self.fatal = Some(WorkflowError::non_deterministic(format!(
                "replayed {event_type:?} event carries no schedule event id"
            )));
            return;
        };
        let failure = {
            let mut state = self.state.lock().unwrap();
            let command = state.commands_mut().iter_mut().find(|c| {
                c.state == CommandState::Pending && c.echo_schedule_event_id() == schedule_event_id
            });
            match command {
                Some(command) if command.matches_event(&event.attributes) => {
                    command.state = CommandState::Committed;
                    None
                }
                Some(command) => Some(format!(
                    "history expects {event_type:?} for schedule event {schedule_event_id}, \
                     workflow produced {:?}",
                    command.attributes
                )),
                None => Some(format!(
                    "history expects {event_type:?} for schedule event {schedule_event_id}, \
                     workflow produced no matching command"
                )),
            }
        };
        if let Some(message) = failure {
            warn!(instance_id = %self.instance.instance_id, %message, "non-deterministic workflow");
            self.fatal = Some(WorkflowError::non_deterministic(message));
        }
    }

    fn resolve_completion(&mut self, event: &Event, value: Result<Payload, WorkflowError>) {
        let event_type = event.event_type();
        let Some(schedule_event_id) = event.schedule_event_id else {
            warn!(?event_type, "completion event carries no schedule event id; dropping");
            return;
        };
        let resolved = self
            .state
            .lock()
            .unwrap()
            .resolve_future(schedule_event_id, value);
        if !resolved {
            // Legal under at-least-once delivery: duplicates, or a fired
            // timer whose command was canceled.
            debug!(schedule_event_id, ?event_type, "no pending future for completion; dropping");
            return;
        }
        self.resume();
    }

    /// Apply a cancellation event: request cancellation of unresolved
    /// sub-workflows, then resolve every pending future with a cancellation
    /// error so the fiber can unwind. The new commands go through the
    /// deterministic counter, so replaying the cancellation regenerates them.
    fn handle_cancel(&mut self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if state.canceled() {
                return;
            }
            state.set_canceled();
            for (sub_workflow_id, instance_id) in state.pending_sub_workflows() {
                let id = state.next_schedule_event_id();
                state.add_command(Command::new(
                    id,
                    CommandAttributes::CancelSubWorkflow {
                        sub_workflow_id,
                        instance_id,
                    },
                ));
            }
            state.resolve_all_pending(WorkflowError::canceled(reason));
        }
        self.resume();
    }

    fn collect(&mut self, mut executed_events: Vec<Event>) -> WorkflowTaskResult {
        let mut activity_events = Vec::new();
        let mut timer_events = Vec::new();
        let mut workflow_events = Vec::new();
        let mut continued_as_new: Option<(u64, Payload)> = None;

        if self.fatal.is_none() {
            let pending: Vec<Command> = {
                let mut state = self.state.lock().unwrap();
                state
                    .commands_mut()
                    .iter_mut()
                    .filter(|c| c.state == CommandState::Pending)
                    .map(|c| {
                        c.state = CommandState::Committed;
                        c.clone()
                    })
                    .collect()
            };
            for command in pending {
                match command.attributes {
                    CommandAttributes::ScheduleActivity { name, input } => {
                        let event =
                            Event::new(EventAttributes::ActivityScheduled { name, input })
                                .with_schedule_event_id(command.id);
                        executed_events.push(event.clone());
                        activity_events.push(event);
                    }
                    CommandAttributes::ScheduleTimer { fire_at } => {
                        executed_events.push(
                            Event::new(EventAttributes::TimerScheduled { fire_at })
                                .with_schedule_event_id(command.id)
                                .with_visible_at(fire_at),
                        );
                        // The backend holds the fired event in its
                        // future-events store until `visible_at`.
                        timer_events.push(
                            Event::new(EventAttributes::TimerFired { fire_at })
                                .with_schedule_event_id(command.id)
                                .with_visible_at(fire_at),
                        );
                    }
                    CommandAttributes::CancelTimer { timer_id } => {
                        executed_events.push(
                            Event::new(EventAttributes::TimerCanceled)
                                .with_schedule_event_id(timer_id),
                        );
                    }
                    CommandAttributes::ScheduleSubWorkflow {
                        name,
                        instance_id,
                        input,
                    } => {
                        executed_events.push(
                            Event::new(EventAttributes::SubWorkflowScheduled {
                                name: name.clone(),
                                instance_id: instance_id.clone(),
                                input: input.clone(),
                            })
                            .with_schedule_event_id(command.id),
                        );
                        let child = WorkflowInstance::with_random_execution(instance_id)
                            .with_parent((*self.instance).clone(), command.id);
                        workflow_events.push(WorkflowEvent {
                            target: child,
                            event: Event::new(EventAttributes::WorkflowExecutionStarted {
                                name,
                                input,
                                metadata: self.metadata.clone(),
                            }),
                        });
                    }
                    CommandAttributes::CancelSubWorkflow {
                        sub_workflow_id,
                        instance_id,
                    } => {
                        executed_events.push(
                            Event::new(EventAttributes::SubWorkflowCancellationRequested)
                                .with_schedule_event_id(sub_workflow_id),
                        );
                        workflow_events.push(WorkflowEvent {
                            target: WorkflowInstance::active(instance_id),
                            event: Event::new(EventAttributes::WorkflowExecutionCanceled {
                                reason: "parent workflow canceled".to_string(),
                            }),
                        });
                    }
                    CommandAttributes::SignalWorkflow {
                        instance_id,
                        name,
                        payload,
                    } => {
                        workflow_events.push(WorkflowEvent {
                            target: WorkflowInstance::active(instance_id),
                            event: Event::new(EventAttributes::SignalReceived { name, payload }),
                        });
                    }
                    CommandAttributes::SideEffect { result } => {
                        executed_events.push(
                            Event::new(EventAttributes::SideEffectResult { result })
                                .with_schedule_event_id(command.id),
                        );
                    }
                    CommandAttributes::ContinueAsNew { input } => {
                        continued_as_new = Some((command.id, input));
                    }
                }
            }
        }

        if self.result.is_none() {
            if let Some(fiber) = &self.fiber {
                if fiber.completed() {
                    self.result = fiber.result().cloned();
                }
            }
        }

        let mut state = self
            .history_terminal
            .unwrap_or(WorkflowInstanceState::Active);

        if let Some(error) = self.fatal.take() {
            executed_events.push(Event::new(EventAttributes::WorkflowExecutionFinished {
                result: None,
                error: Some(error.clone()),
            }));
            state = WorkflowInstanceState::Finished;
            self.history_terminal = Some(state);
            if let Some(parent) = &self.instance.parent {
                workflow_events.push(WorkflowEvent {
                    target: (*parent.instance).clone(),
                    event: Event::new(EventAttributes::SubWorkflowFailed {
                        error: error.clone(),
                    })
                    .with_schedule_event_id(parent.schedule_event_id),
                });
            }
            self.result = Some(Err(error));
        } else if let Some((command_id, input)) = continued_as_new {
            executed_events.push(
                Event::new(EventAttributes::WorkflowExecutionContinuedAsNew {
                    input: input.clone(),
                })
                .with_schedule_event_id(command_id),
            );
            state = WorkflowInstanceState::ContinuedAsNew;
            self.history_terminal = Some(state);
            let mut next = WorkflowInstance::with_random_execution(self.instance.instance_id.clone());
            next.parent = self.instance.parent.clone();
            workflow_events.push(WorkflowEvent {
                target: next,
                event: Event::new(EventAttributes::WorkflowExecutionStarted {
                    name: self.workflow_name.clone().unwrap_or_default(),
                    input,
                    metadata: self.metadata.clone(),
                }),
            });
        } else if self.history_terminal.is_none() {
            if let Some(result) = self.result.clone() {
                let (result_payload, error) = match result {
                    Ok(payload) => (Some(payload), None),
                    Err(error) => (None, Some(error)),
                };
                executed_events.push(Event::new(EventAttributes::WorkflowExecutionFinished {
                    result: result_payload.clone(),
                    error: error.clone(),
                }));
                state = WorkflowInstanceState::Finished;
                self.history_terminal = Some(state);
                if let Some(parent) = &self.instance.parent {
                    let attributes = match (result_payload, error) {
                        (Some(result), None) => EventAttributes::SubWorkflowCompleted { result },
                        (_, Some(error)) => EventAttributes::SubWorkflowFailed { error },
                        (None, None) => EventAttributes::SubWorkflowCompleted {
                            result: Payload::null(),
                        },
                    };
                    workflow_events.push(WorkflowEvent {
                        target: (*parent.instance).clone(),
                        event: Event::new(attributes)
                            .with_schedule_event_id(parent.schedule_event_id),
                    });
                }
            }
        }

        WorkflowTaskResult {
            state,
            executed_events,
            activity_events,
            timer_events,
            workflow_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde::Serialize;

    use super::*;
    use crate::converter::{Converter, JsonConverter};
    use crate::history::EventType;
    use crate::workflow::{Selector, SubWorkflowOptions};

    fn started_with<T: Serialize>(name: &str, input: &T) -> Event {
        Event::new(EventAttributes::WorkflowExecutionStarted {
            name: name.to_string(),
            input: JsonConverter.to_payload(input).unwrap(),
            metadata: Metadata::default(),
        })
    }

    fn activity_completed<T: Serialize>(schedule_event_id: u64, result: &T) -> Event {
        Event::new(EventAttributes::ActivityCompleted {
            result: JsonConverter.to_payload(result).unwrap(),
        })
        .with_schedule_event_id(schedule_event_id)
    }

    fn signal_received<T: Serialize>(name: &str, payload: &T) -> Event {
        Event::new(EventAttributes::SignalReceived {
            name: name.to_string(),
            payload: JsonConverter.to_payload(payload).unwrap(),
        })
    }

    fn decoded_result<T: serde::de::DeserializeOwned>(executor: &WorkflowExecutor) -> T {
        let payload = executor
            .workflow_result()
            .expect("workflow result")
            .as_ref()
            .expect("workflow success");
        JsonConverter.from_payload(payload).unwrap()
    }

    #[test]
    fn trivial_workflow_completes_in_one_task() {
        let hits = Arc::new(AtomicUsize::new(0));
        let wf_hits = hits.clone();
        let registry = Registry::builder()
            .register_workflow("w1", move |_ctx: WorkflowContext, _input: ()| {
                let hits = wf_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();

        let mut executor = WorkflowExecutor::new(registry, WorkflowInstance::new("i1", "e1"));
        let result = executor.execute_task(&[], &[started_with("w1", &())]);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(result.state, WorkflowInstanceState::Finished);
        assert_eq!(
            result.executed_events.last().unwrap().event_type(),
            EventType::WorkflowExecutionFinished
        );
        assert!(result.activity_events.is_empty());
    }

    #[test]
    fn one_activity_workflow_hits_twice_and_replays_twice() {
        let hits = Arc::new(AtomicUsize::new(0));
        let wf_hits = hits.clone();
        let registry = Registry::builder()
            .register_workflow("w1", move |ctx: WorkflowContext, _input: ()| {
                let hits = wf_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let sum: i64 = ctx.execute_activity("add", &(35, 12)).await?;
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(sum)
                }
            })
            .build();

        // First episode: the workflow schedules the activity and suspends.
        let mut executor =
            WorkflowExecutor::new(registry.clone(), WorkflowInstance::new("i1", "e1"));
        let first = executor.execute_task(&[], &[started_with("w1", &())]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(first.state, WorkflowInstanceState::Active);
        assert_eq!(first.activity_events.len(), 1);
        assert_eq!(first.activity_events[0].schedule_event_id, Some(0));
        let kinds: Vec<EventType> = first
            .executed_events
            .iter()
            .map(|e| e.event_type())
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventType::WorkflowExecutionStarted,
                EventType::ActivityScheduled
            ]
        );

        // Second episode on the warm executor: the completion resolves the
        // future and the workflow returns.
        let second = executor.execute_task(&[], &[activity_completed(0, &47i64)]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(second.state, WorkflowInstanceState::Finished);
        assert_eq!(decoded_result::<i64>(&executor), 47);

        // Full replay of the committed history: same hit count again, no new
        // commands, same result.
        let mut history: Vec<Event> = Vec::new();
        history.extend(first.executed_events);
        history.extend(second.executed_events);

        hits.store(0, Ordering::SeqCst);
        let mut replayer = WorkflowExecutor::new(registry, WorkflowInstance::new("i1", "e1"));
        let replayed = replayer.execute_task(&history, &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(replayed.executed_events.is_empty());
        assert!(replayed.activity_events.is_empty());
        assert!(replayed.timer_events.is_empty());
        assert!(replayed.workflow_events.is_empty());
        assert_eq!(decoded_result::<i64>(&replayer), 47);
    }

    #[test]
    fn mismatched_command_is_non_deterministic_and_emits_nothing() {
        // The recorded history scheduled activity "a1"; the workflow now
        // schedules a timer instead.
        let registry = Registry::builder()
            .register_workflow("w1", |ctx: WorkflowContext, _input: ()| async move {
                let _: () = ctx.schedule_timer(Duration::from_secs(5)).await?;
                Ok(())
            })
            .build();

        let history = vec![
            started_with("w1", &()),
            Event::new(EventAttributes::ActivityScheduled {
                name: "a1".to_string(),
                input: JsonConverter.to_payload(&1).unwrap(),
            })
            .with_schedule_event_id(0),
        ];

        let mut executor = WorkflowExecutor::new(registry, WorkflowInstance::new("i1", "e1"));
        let result = executor.execute_task(&history, &[]);

        assert_eq!(result.state, WorkflowInstanceState::Finished);
        assert!(result.timer_events.is_empty());
        assert!(result.activity_events.is_empty());
        let finished = result.executed_events.last().unwrap();
        match &finished.attributes {
            EventAttributes::WorkflowExecutionFinished { error: Some(e), .. } => {
                assert!(e.is_non_deterministic())
            }
            other => panic!("expected failed terminal event, got {other:?}"),
        }
    }

    #[test]
    fn side_effect_runs_once_across_replays() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wf_calls = calls.clone();
        let registry = Registry::builder()
            .register_workflow("w1", move |ctx: WorkflowContext, _input: ()| {
                let calls = wf_calls.clone();
                async move {
                    let value: u64 = ctx
                        .side_effect(move |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            17
                        })
                        .await?;
                    let _: () = ctx.schedule_timer(Duration::from_secs(1)).await?;
                    Ok(value)
                }
            })
            .build();

        let mut executor =
            WorkflowExecutor::new(registry.clone(), WorkflowInstance::new("i1", "e1"));
        let first = executor.execute_task(&[], &[started_with("w1", &())]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let side_effect_events: Vec<&Event> = first
            .executed_events
            .iter()
            .filter(|e| e.event_type() == EventType::SideEffectResult)
            .collect();
        assert_eq!(side_effect_events.len(), 1);

        // Replay: the recorded value resolves the future, the closure does
        // not run again, and no new side-effect event is produced.
        let mut replayer = WorkflowExecutor::new(registry, WorkflowInstance::new("i1", "e1"));
        let replayed = replayer.execute_task(&first.executed_events, &[]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(replayed.executed_events.is_empty());
    }

    #[test]
    fn signal_before_receive_is_buffered() {
        let registry = Registry::builder()
            .register_workflow("w1", |ctx: WorkflowContext, _input: ()| async move {
                let _: () = ctx.schedule_timer(Duration::from_secs(1)).await?;
                let payload: String = ctx.wait_for_signal("go").await?;
                Ok(payload)
            })
            .build();

        let mut executor = WorkflowExecutor::new(registry, WorkflowInstance::new("i1", "e1"));
        let first = executor.execute_task(&[], &[started_with("w1", &())]);
        assert_eq!(first.timer_events.len(), 1);

        // The signal arrives while the workflow is still waiting on its
        // timer; no receiver is registered yet.
        let second = executor.execute_task(&[], &[signal_received("go", &"buffered")]);
        assert_eq!(second.state, WorkflowInstanceState::Active);

        let fired = Event::new(EventAttributes::TimerFired {
            fire_at: chrono::Utc::now(),
        })
        .with_schedule_event_id(0);
        let third = executor.execute_task(&[], &[fired]);
        assert_eq!(third.state, WorkflowInstanceState::Finished);
        assert_eq!(decoded_result::<String>(&executor), "buffered");
    }

    #[test]
    fn select_tie_break_follows_registration_order() {
        let registry = Registry::builder()
            .register_workflow("sel", |ctx: WorkflowContext, _input: ()| async move {
                let activity = ctx.execute_activity::<_, i32>("a1", &1);
                let timer = ctx.schedule_timer(Duration::from_secs(5));
                // Gate so both completions are already buffered before the
                // selector ever runs.
                let _: () = ctx.wait_for_signal("gate").await?;

                let order = Arc::new(Mutex::new(Vec::new()));
                let timer_order = order.clone();
                let activity_order = order.clone();
                let mut selector = Selector::new();
                selector
                    .add_future(&timer, move |_| timer_order.lock().unwrap().push("timer"))
                    .add_future(&activity, move |_| {
                        activity_order.lock().unwrap().push("activity")
                    });
                selector.select(&ctx).await;
                selector.select(&ctx).await;
                drop(selector);

                let order = order.lock().unwrap().join(",");
                Ok(order)
            })
            .build();

        let mut executor = WorkflowExecutor::new(registry, WorkflowInstance::new("i1", "e1"));
        executor.execute_task(&[], &[started_with("sel", &())]);

        // The activity completes first in history, but the timer was
        // registered first with the selector and must win the tie.
        let fired = Event::new(EventAttributes::TimerFired {
            fire_at: chrono::Utc::now(),
        })
        .with_schedule_event_id(1);
        let result = executor.execute_task(
            &[],
            &[
                activity_completed(0, &5i32),
                fired,
                signal_received("gate", &()),
            ],
        );
        assert_eq!(result.state, WorkflowInstanceState::Finished);
        assert_eq!(decoded_result::<String>(&executor), "timer,activity");
    }

    #[test]
    fn canceled_timer_emits_echo_and_discards_late_fire() {
        let registry = Registry::builder()
            .register_workflow("w1", |ctx: WorkflowContext, _input: ()| async move {
                let timer = ctx.schedule_timer(Duration::from_secs(60));
                let result: i32 = ctx.execute_activity("a1", &1).await?;
                ctx.cancel_timer(&timer);
                Ok(result)
            })
            .build();

        let mut executor = WorkflowExecutor::new(registry, WorkflowInstance::new("i1", "e1"));
        let first = executor.execute_task(&[], &[started_with("w1", &())]);
        assert_eq!(first.timer_events.len(), 1);

        let second = executor.execute_task(&[], &[activity_completed(1, &9i32)]);
        assert_eq!(second.state, WorkflowInstanceState::Finished);
        assert!(second
            .executed_events
            .iter()
            .any(|e| e.event_type() == EventType::TimerCanceled
                && e.schedule_event_id == Some(0)));

        // A fired event for the canceled timer is dropped silently.
        let fired = Event::new(EventAttributes::TimerFired {
            fire_at: chrono::Utc::now(),
        })
        .with_schedule_event_id(0);
        let third = executor.execute_task(&[], &[fired]);
        assert!(third.executed_events.is_empty());
    }

    #[test]
    fn canceling_a_fired_timer_is_a_no_op() {
        let registry = Registry::builder()
            .register_workflow("w1", |ctx: WorkflowContext, _input: ()| async move {
                let mut timer = ctx.schedule_timer(Duration::from_millis(10));
                let _: () = (&mut timer).await?;
                ctx.cancel_timer(&timer);
                Ok(())
            })
            .build();

        let mut executor = WorkflowExecutor::new(registry, WorkflowInstance::new("i1", "e1"));
        let first = executor.execute_task(&[], &[started_with("w1", &())]);
        assert_eq!(first.timer_events.len(), 1);

        let fired = Event::new(EventAttributes::TimerFired {
            fire_at: chrono::Utc::now(),
        })
        .with_schedule_event_id(0);
        let second = executor.execute_task(&[], &[fired]);
        assert_eq!(second.state, WorkflowInstanceState::Finished);
        // No cancellation record for a timer that already fired.
        let kinds: Vec<EventType> = second
            .executed_events
            .iter()
            .map(|e| e.event_type())
            .collect();
        assert_eq!(
            kinds,
            vec![EventType::TimerFired, EventType::WorkflowExecutionFinished]
        );
    }

    #[test]
    fn continue_as_new_ends_execution_and_starts_next() {
        let registry = Registry::builder()
            .register_workflow("counter", |ctx: WorkflowContext, count: i64| async move {
                if count < 3 {
                    return Err(ctx.continue_as_new(&(count + 1)));
                }
                Ok(count)
            })
            .build();

        let mut executor = WorkflowExecutor::new(registry, WorkflowInstance::new("i1", "e1"));
        let result = executor.execute_task(&[], &[started_with("counter", &0i64)]);

        assert_eq!(result.state, WorkflowInstanceState::ContinuedAsNew);
        assert_eq!(
            result.executed_events.last().unwrap().event_type(),
            EventType::WorkflowExecutionContinuedAsNew
        );
        assert_eq!(result.workflow_events.len(), 1);
        let next = &result.workflow_events[0];
        assert_eq!(next.target.instance_id, "i1");
        assert_ne!(next.target.execution_id, "e1");
        match &next.event.attributes {
            EventAttributes::WorkflowExecutionStarted { name, input, .. } => {
                assert_eq!(name, "counter");
                let next_input: i64 = JsonConverter.from_payload(input).unwrap();
                assert_eq!(next_input, 1);
            }
            other => panic!("expected started event for next execution, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_unwinds_workflow_and_cancels_children() {
        let registry = Registry::builder()
            .register_workflow("parent", |ctx: WorkflowContext, _input: ()| async move {
                let child: i32 = ctx
                    .create_sub_workflow(SubWorkflowOptions::default(), "child", &())
                    .await?;
                Ok(child)
            })
            .build();

        let mut executor = WorkflowExecutor::new(registry, WorkflowInstance::new("p1", "e1"));
        let first = executor.execute_task(&[], &[started_with("parent", &())]);
        assert_eq!(first.workflow_events.len(), 1);

        let canceled = Event::new(EventAttributes::WorkflowExecutionCanceled {
            reason: "operator request".to_string(),
        });
        let second = executor.execute_task(&[], &[canceled]);

        assert_eq!(second.state, WorkflowInstanceState::Finished);
        assert!(second
            .executed_events
            .iter()
            .any(|e| e.event_type() == EventType::SubWorkflowCancellationRequested));
        // One cancellation routed to the child.
        assert!(second.workflow_events.iter().any(|we| matches!(
            we.event.attributes,
            EventAttributes::WorkflowExecutionCanceled { .. }
        )));
        match executor.workflow_result() {
            Some(Err(error)) => assert!(error.is_canceled()),
            other => panic!("expected canceled result, got {other:?}"),
        }
    }

    #[test]
    fn terminal_execution_drops_late_events() {
        let registry = Registry::builder()
            .register_workflow("w1", |_ctx: WorkflowContext, _input: ()| async move { Ok(1) })
            .build();

        let mut executor = WorkflowExecutor::new(registry, WorkflowInstance::new("i1", "e1"));
        let first = executor.execute_task(&[], &[started_with("w1", &())]);
        assert_eq!(first.state, WorkflowInstanceState::Finished);

        let late = executor.execute_task(&[], &[signal_received("late", &())]);
        assert!(late.executed_events.is_empty());
        assert_eq!(late.state, WorkflowInstanceState::Finished);
    }

    #[test]
    fn child_completion_is_routed_to_parent() {
        let registry = Registry::builder()
            .register_workflow("child", |_ctx: WorkflowContext, x: i64| async move { Ok(x * 2) })
            .build();

        let parent = WorkflowInstance::new("p1", "pe1");
        let child = WorkflowInstance::new("c1", "ce1").with_parent(parent.clone(), 7);
        let mut executor = WorkflowExecutor::new(registry, child);
        let result = executor.execute_task(&[], &[started_with("child", &21i64)]);

        assert_eq!(result.state, WorkflowInstanceState::Finished);
        let routed = result
            .workflow_events
            .iter()
            .find(|we| we.target == parent)
            .expect("completion routed to parent");
        assert_eq!(routed.event.schedule_event_id, Some(7));
        match &routed.event.attributes {
            EventAttributes::SubWorkflowCompleted { result } => {
                let value: i64 = JsonConverter.from_payload(result).unwrap();
                assert_eq!(value, 42);
            }
            other => panic!("expected sub-workflow completion, got {other:?}"),
        }
    }
}
