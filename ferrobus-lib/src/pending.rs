//! Client-side handle for an outstanding method invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::*;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use ferrobus_common::errors::{Error, Result};
use ferrobus_common::message::Message;

type Continuation = Box<dyn FnOnce(Result<Message>) + Send>;

enum State {
    /// Waiting for completion, optionally with a continuation to run.
    Waiting(Option<Continuation>),
    /// Terminal. The slot is `None` once a waiter took the outcome.
    Complete(Option<Result<Message>>),
}

struct Inner {
    serial: u32,
    state: Mutex<State>,
    cancelled: AtomicBool,
    notify: Notify,
    timer: Mutex<Option<AbortHandle>>,
}

/// Handle for a call in flight. Completion latches exactly one terminal
/// outcome: a reply, an error reply, a timeout or a cancellation; anything
/// arriving after that is dropped.
#[derive(Clone)]
pub struct PendingCall {
    inner: Arc<Inner>,
}

impl PendingCall {
    pub(crate) fn new(serial: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                serial,
                state: Mutex::new(State::Waiting(None)),
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Serial of the call this handle tracks.
    pub fn serial(&self) -> u32 {
        self.inner.serial
    }

    pub fn is_complete(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), State::Complete(_))
    }

    /// Move the call to a terminal state. A no-op once terminal.
    pub(crate) fn complete(&self, outcome: Result<Message>) {
        let continuation = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                State::Complete(_) => {
                    trace!(
                        "Dropping late completion for call {}",
                        self.inner.serial
                    );
                    return;
                }
                State::Waiting(continuation) => {
                    let continuation = continuation.take();
                    match continuation {
                        Some(continuation) => {
                            *state = State::Complete(None);
                            Some((continuation, outcome))
                        }
                        None => {
                            *state = State::Complete(Some(outcome));
                            None
                        }
                    }
                }
            }
        };

        if let Some(handle) = self.inner.timer.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.notify.notify_waiters();

        // run the continuation outside the state lock
        if let Some((continuation, outcome)) = continuation {
            continuation(outcome);
        }
    }

    /// Cancel the call. Idempotent, callable from any thread; a reply that
    /// arrives later is dropped.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.complete(Err(Error::Cancelled));
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register the continuation run on completion. At most one can be
    /// registered; if the call already completed it runs right here with
    /// the stored outcome.
    pub fn on_complete(&self, f: impl FnOnce(Result<Message>) + Send + 'static) {
        let mut f = Some(Box::new(f) as Continuation);

        let run_now = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                State::Waiting(slot) => {
                    debug_assert!(slot.is_none(), "a continuation is already registered");
                    *slot = f.take();
                    None
                }
                State::Complete(outcome) => {
                    Some(outcome.take().unwrap_or(Err(Error::Cancelled)))
                }
            }
        };

        if let (Some(outcome), Some(f)) = (run_now, f) {
            f(outcome);
        }
    }

    /// Await the outcome. Consumes the terminal value; a second waiter on
    /// another clone of the handle observes a cancellation.
    pub async fn wait(self) -> Result<Message> {
        loop {
            let notified = self.inner.notify.notified();

            {
                let mut state = self.inner.state.lock().unwrap();
                if let State::Complete(outcome) = &mut *state {
                    return outcome.take().unwrap_or(Err(Error::Cancelled));
                }
            }

            notified.await;
        }
    }

    pub(crate) fn set_timer(&self, handle: AbortHandle) {
        let mut timer = self.inner.timer.lock().unwrap();
        if self.is_complete() {
            handle.abort();
        } else {
            *timer = Some(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn first_completion_wins() {
        let pending = PendingCall::new(7);
        assert!(!pending.is_complete());

        pending.complete(Err(Error::Timeout));
        // anything after the terminal state is dropped
        pending.complete(Err(Error::Disconnected));
        pending.cancel();

        assert!(pending.is_complete());
        assert_eq!(pending.clone().wait().await.unwrap_err(), Error::Timeout);
    }

    #[tokio::test]
    async fn continuation_runs_once_with_the_outcome() {
        let calls = Arc::new(AtomicU32::new(0));

        let pending = PendingCall::new(7);
        let counter = calls.clone();
        pending.on_complete(move |outcome| {
            assert_eq!(outcome.unwrap_err(), Error::Timeout);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        pending.complete(Err(Error::Timeout));
        pending.complete(Err(Error::Disconnected));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // registering after completion runs right away
        let late = Arc::new(AtomicU32::new(0));
        let counter = late.clone();
        pending.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_latches() {
        let pending = PendingCall::new(9);
        pending.cancel();
        pending.cancel();

        assert!(pending.is_cancelled());
        assert_eq!(pending.clone().wait().await.unwrap_err(), Error::Cancelled);
    }
}
