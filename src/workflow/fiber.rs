//! The cooperative fiber driving user workflow code.
//!
//! A workflow body is an ordinary Rust future polled with a no-op waker:
//! `resume` is one poll, yielding is returning `Poll::Pending` from a
//! suspending primitive. At any moment either the executor or the fiber is
//! running, never both, which is what makes workflow code observably
//! deterministic.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use crate::converter::Payload;
use crate::error::{panic_message, WorkflowError};

pub(crate) type WorkflowBody =
    Pin<Box<dyn Future<Output = Result<Payload, WorkflowError>> + Send>>;

pub(crate) struct WorkflowFiber {
    body: Option<WorkflowBody>,
    result: Option<Result<Payload, WorkflowError>>,
}

impl WorkflowFiber {
    pub(crate) fn start(body: WorkflowBody) -> Self {
        Self {
            body: Some(body),
            result: None,
        }
    }

    /// Run the fiber until it yields or completes. A panic in the body is
    /// captured and recorded as a workflow failure.
    pub(crate) fn resume(&mut self) {
        let Some(body) = self.body.as_mut() else {
            return;
        };
        let mut cx = Context::from_waker(Waker::noop());
        match catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {}
            Ok(Poll::Ready(result)) => {
                self.result = Some(result);
                self.body = None;
            }
            Err(payload) => {
                self.result = Some(Err(WorkflowError::panic(panic_message(payload.as_ref()))));
                self.body = None;
            }
        }
    }

    pub(crate) fn completed(&self) -> bool {
        self.result.is_some()
    }

    pub(crate) fn result(&self) -> Option<&Result<Payload, WorkflowError>> {
        self.result.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiber_completes_after_pending_poll() {
        let mut polled_once = false;
        let body: WorkflowBody = Box::pin(std::future::poll_fn(move |_| {
            if polled_once {
                Poll::Ready(Ok(Payload::null()))
            } else {
                polled_once = true;
                Poll::Pending
            }
        }));
        let mut fiber = WorkflowFiber::start(body);
        fiber.resume();
        assert!(!fiber.completed());
        fiber.resume();
        assert!(fiber.completed());
        assert!(fiber.result().unwrap().is_ok());
    }

    #[test]
    fn panic_is_captured_as_workflow_failure() {
        let body: WorkflowBody = Box::pin(async { panic!("boom") });
        let mut fiber = WorkflowFiber::start(body);
        fiber.resume();
        assert!(fiber.completed());
        let err = fiber.result().unwrap().as_ref().unwrap_err();
        assert!(err.is_panic());
        assert_eq!(err.message, "boom");
    }
}
