//! One-shot futures and the deterministic selector.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::converter::{Converter, JsonConverter, Payload};
use crate::error::WorkflowError;

use super::context::{SignalChannel, WorkflowContext};

/// Single-assignment cell resolved by the executor when the matching history
/// event arrives. The first `set` wins; later calls are dropped.
#[derive(Clone, Debug, Default)]
pub(crate) struct FutureCell {
    inner: Arc<Mutex<Option<Result<Payload, WorkflowError>>>>,
}

impl FutureCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, value: Result<Payload, WorkflowError>) {
        let mut slot = self.inner.lock().unwrap();
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    pub(crate) fn ready(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    pub(crate) fn get(&self) -> Option<Result<Payload, WorkflowError>> {
        self.inner.lock().unwrap().clone()
    }
}

/// Typed future returned by the suspending workflow primitives. Awaiting it
/// yields the fiber until the executor resolves the underlying cell from a
/// history event.
pub struct WorkflowFuture<T> {
    pub(crate) schedule_event_id: Option<u64>,
    pub(crate) cell: FutureCell,
    _result: PhantomData<fn() -> T>,
}

impl<T> WorkflowFuture<T> {
    pub(crate) fn new(schedule_event_id: Option<u64>, cell: FutureCell) -> Self {
        Self {
            schedule_event_id,
            cell,
            _result: PhantomData,
        }
    }

    /// Non-blocking readiness check.
    pub fn ready(&self) -> bool {
        self.cell.ready()
    }

    /// The command id this future is correlated to, if any.
    pub fn schedule_event_id(&self) -> Option<u64> {
        self.schedule_event_id
    }
}

impl<T: DeserializeOwned> Future for WorkflowFuture<T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.cell.get() {
            Some(Ok(payload)) => {
                Poll::Ready(JsonConverter.from_payload(&payload).map_err(WorkflowError::from))
            }
            Some(Err(error)) => Poll::Ready(Err(error)),
            None => Poll::Pending,
        }
    }
}

enum RegistrationKind {
    Future { cell: FutureCell },
    Signal { name: String },
}

struct Registration<'a> {
    kind: RegistrationKind,
    handler: Box<dyn FnMut(Result<Payload, WorkflowError>) + Send + 'a>,
    fired: bool,
}

/// Multi-way wait with a deterministic tie-break.
///
/// Registrations are checked in the order they were added; when several are
/// ready at once the earliest wins, which keeps the choice identical across
/// replays. Exactly one handler fires per [`Selector::select`] call, and a
/// fired registration does not fire again. A default handler makes `select`
/// non-blocking: it fires whenever nothing else is ready.
pub struct Selector<'a> {
    registrations: Vec<Registration<'a>>,
    default: Option<Box<dyn FnMut() + Send + 'a>>,
}

impl<'a> Selector<'a> {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            default: None,
        }
    }

    pub fn add_future<T, H>(&mut self, future: &WorkflowFuture<T>, mut handler: H) -> &mut Self
    where
        T: DeserializeOwned + 'a,
        H: FnMut(Result<T, WorkflowError>) + Send + 'a,
    {
        let cell = future.cell.clone();
        self.registrations.push(Registration {
            kind: RegistrationKind::Future { cell },
            handler: Box::new(move |value| {
                handler(value.and_then(|payload| {
                    JsonConverter
                        .from_payload(&payload)
                        .map_err(WorkflowError::from)
                }))
            }),
            fired: false,
        });
        self
    }

    pub fn add_signal<T, H>(&mut self, channel: &SignalChannel, mut handler: H) -> &mut Self
    where
        T: DeserializeOwned + 'a,
        H: FnMut(Result<T, WorkflowError>) + Send + 'a,
    {
        self.registrations.push(Registration {
            kind: RegistrationKind::Signal {
                name: channel.name().to_string(),
            },
            handler: Box::new(move |value| {
                handler(value.and_then(|payload| {
                    JsonConverter
                        .from_payload(&payload)
                        .map_err(WorkflowError::from)
                }))
            }),
            fired: false,
        });
        self
    }

    /// Install the default arm; it fires iff no registration is ready when
    /// `select` is called.
    pub fn add_default<H>(&mut self, handler: H) -> &mut Self
    where
        H: FnMut() + Send + 'a,
    {
        self.default = Some(Box::new(handler));
        self
    }

    pub async fn select(&mut self, ctx: &WorkflowContext) {
        std::future::poll_fn(|_cx| {
            for registration in self.registrations.iter_mut() {
                if registration.fired {
                    continue;
                }
                let value = match &registration.kind {
                    RegistrationKind::Future { cell } => cell.get(),
                    RegistrationKind::Signal { name } => ctx.pop_signal(name).map(Ok),
                };
                if let Some(value) = value {
                    registration.fired = true;
                    (registration.handler)(value);
                    return Poll::Ready(());
                }
            }
            if let Some(default) = self.default.as_mut() {
                default();
                return Poll::Ready(());
            }
            Poll::Pending
        })
        .await
    }
}

impl<'a> Default for Selector<'a> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_first_set_wins() {
        let cell = FutureCell::new();
        assert!(!cell.ready());
        cell.set(Ok(Payload::from_json("1")));
        cell.set(Ok(Payload::from_json("2")));
        assert_eq!(cell.get().unwrap().unwrap(), Payload::from_json("1"));
    }

    #[test]
    fn future_decodes_on_ready() {
        let cell = FutureCell::new();
        let mut future = WorkflowFuture::<i32>::new(Some(0), cell.clone());
        let mut cx = Context::from_waker(std::task::Waker::noop());
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());
        cell.set(Ok(Payload::from_json("41")));
        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Ready(Ok(v)) => assert_eq!(v, 41),
            other => panic!("unexpected poll outcome: {other:?}"),
        }
    }

    #[test]
    fn future_propagates_errors() {
        let cell = FutureCell::new();
        cell.set(Err(WorkflowError::canceled("gone")));
        let mut future = WorkflowFuture::<i32>::new(None, cell);
        let mut cx = Context::from_waker(std::task::Waker::noop());
        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Ready(Err(e)) => assert!(e.is_canceled()),
            other => panic!("unexpected poll outcome: {other:?}"),
        }
    }
}
