//! A single-assignment completion cell for one outbound request.
//!
//! A [`FutureMessage`] starts out pending and is completed exactly once, either with a response
//! [`Message`] or with a [`ResponseError`]. Callbacks registered with [`FutureMessage::add_callback`] run
//! exactly once, on whichever thread completes the handle, or immediately on the registering thread if the
//! handle is already complete. Later completion attempts are ignored and reported by returning `false`.
//!
//! The handle is cheaply cloneable: the caller of [`Agent::send`](crate::agent::Agent::send) holds one clone
//! while the pipe's pending table holds another until the response is matched.
//!
//! # Example
//!
//! ```
//! use pipe_agent::{future_message::FutureMessage, message::Message};
//!
//! # tokio_test::block_on(async {
//! let fut = FutureMessage::new();
//! let waiter = fut.clone();
//! fut.mark_completed(Message::response("ok"));
//!
//! let response = waiter.await.unwrap();
//! assert_eq!(response.payload().as_ref(), b"ok");
//! # });
//! ```

use std::{
    fmt,
    future::{Future, IntoFuture},
    mem,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::oneshot;

use crate::{error::ResponseError, message::Message};

/// The outcome a [`FutureMessage`] completes with.
pub type ResponseResult = Result<Message, ResponseError>;

type Callback = Box<dyn FnOnce(&ResponseResult) + Send + 'static>;

enum State {
    Pending {
        callbacks: Vec<Callback>,
        waiters: Vec<oneshot::Sender<ResponseResult>>,
    },
    Completed(ResponseResult),
}

impl State {
    fn pending() -> Self {
        State::Pending {
            callbacks: Vec::new(),
            waiters: Vec::new(),
        }
    }
}

/// A pending response handle.
#[derive(Clone)]
pub struct FutureMessage {
    state: Arc<Mutex<State>>,
}

impl FutureMessage {
    /// Creates a pending handle.
    pub fn new() -> Self {
        FutureMessage {
            state: Arc::new(Mutex::new(State::pending())),
        }
    }

    /// Creates a handle already completed with a message.
    pub fn completed(message: Message) -> Self {
        FutureMessage {
            state: Arc::new(Mutex::new(State::Completed(Ok(message)))),
        }
    }

    /// Creates a handle already completed with an error.
    pub fn errored(err: ResponseError) -> Self {
        FutureMessage {
            state: Arc::new(Mutex::new(State::Completed(Err(err)))),
        }
    }

    /// Completes the handle with a message.
    ///
    /// Returns `false` if the handle was already complete, in which case the message is dropped.
    pub fn mark_completed(&self, message: Message) -> bool {
        self.complete(Ok(message))
    }

    /// Completes the handle with an error.
    ///
    /// Returns `false` if the handle was already complete.
    pub fn set_error(&self, err: impl Into<ResponseError>) -> bool {
        self.complete(Err(err.into()))
    }

    /// Completes the handle with a result.
    pub fn complete(&self, result: ResponseResult) -> bool {
        let (callbacks, waiters) = {
            let mut state = self.lock();
            match mem::replace(&mut *state, State::Completed(result.clone())) {
                State::Pending { callbacks, waiters } => (callbacks, waiters),
                completed @ State::Completed(_) => {
                    *state = completed;
                    return false;
                }
            }
        };

        // Callbacks run outside the lock so they may inspect or clone this handle.
        for callback in callbacks {
            callback(&result);
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }

        true
    }

    /// Returns `true` once the handle has been completed.
    pub fn is_completed(&self) -> bool {
        matches!(*self.lock(), State::Completed(_))
    }

    /// Returns a copy of the outcome if the handle is complete.
    pub fn result(&self) -> Option<ResponseResult> {
        match &*self.lock() {
            State::Pending { .. } => None,
            State::Completed(result) => Some(result.clone()),
        }
    }

    /// Returns the error if the handle completed with one.
    pub fn error(&self) -> Option<ResponseError> {
        match &*self.lock() {
            State::Completed(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Registers a callback invoked exactly once with the outcome.
    ///
    /// If the handle is already complete the callback runs immediately on the calling thread.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&ResponseResult) + Send + 'static,
    {
        let result = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending { callbacks, .. } => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Completed(result) => result.clone(),
            }
        };

        callback(&result);
    }

    /// Waits for the outcome.
    ///
    /// Waiters whose future was dropped, such as after a [`wait_timeout`](FutureMessage::wait_timeout) elapsed,
    /// are pruned on the next call, so polling a slow handle repeatedly does not accumulate state.
    pub fn wait(&self) -> impl Future<Output = ResponseResult> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            match &mut *state {
                State::Pending { waiters, .. } => {
                    waiters.retain(|waiter| !waiter.is_closed());
                    waiters.push(tx);
                }
                State::Completed(result) => {
                    let _ = tx.send(result.clone());
                }
            }
        }

        // Senders are only dropped after sending, so the channel cannot close early.
        rx.map(|res| res.unwrap_or(Err(ResponseError::Shutdown)))
    }

    /// Waits for the outcome, failing with [`ResponseError::Timeout`] after `timeout`.
    ///
    /// A timeout does not complete the handle; a response arriving later is still recorded on it.
    pub async fn wait_timeout(&self, timeout: Duration) -> ResponseResult {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ResponseError::Timeout),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking callback never runs under the lock, so poisoning cannot leave the state torn.
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Default for FutureMessage {
    fn default() -> Self {
        FutureMessage::new()
    }
}

impl IntoFuture for FutureMessage {
    type Output = ResponseResult;
    type IntoFuture = BoxFuture<'static, ResponseResult>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

impl fmt::Debug for FutureMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("FutureMessage");
        match &*self.lock() {
            State::Pending { callbacks, waiters } => d
                .field("state", &"pending")
                .field("callbacks", &callbacks.len())
                .field("waiters", &waiters.len()),
            State::Completed(Ok(msg)) => d.field("state", &"completed").field("id", &msg.id()),
            State::Completed(Err(err)) => d.field("state", &"errored").field("error", err),
        };
        d.finish()
    }
}
