//! Cancelable request handles.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::state::RequestState;
use offsync_common::{Error, Result};

type CancelHook = Box<dyn FnOnce() + Send>;

struct Inner {
    state: Mutex<RequestState>,
    token: CancellationToken,
    hooks: Mutex<Vec<CancelHook>>,
    children: Mutex<Vec<Request>>,
    closed: AtomicBool,
}

/// Handle to one running operation.
///
/// Cloning yields another handle to the same operation. `cancel` is
/// idempotent and may be called from any thread; once it takes effect no
/// further result is delivered for the operation.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

impl Request {
    /// Create an idle request.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RequestState::Idle),
                token: CancellationToken::new(),
                hooks: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> RequestState {
        *self.inner.state.lock()
    }

    /// Whether the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    /// Whether the request and every child reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.state().is_terminal() && self.inner.children.lock().iter().all(Request::is_done)
    }

    /// Token that fires when the request is cancelled.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Cancel the request and every child.
    ///
    /// Has no effect on a request that already finished, or on a second call.
    pub fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = RequestState::Cancelled;
        }
        debug!("Request cancelled");

        self.inner.token.cancel();
        let hooks: Vec<CancelHook> = std::mem::take(&mut *self.inner.hooks.lock());
        for hook in hooks {
            hook();
        }
        let children: Vec<Request> = self.inner.children.lock().clone();
        for child in children {
            child.cancel();
        }
    }

    /// Run `hook` once when the request is cancelled.
    ///
    /// Runs immediately if the request is already cancelled; never runs if
    /// the request finishes normally.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let state = self.inner.state.lock();
        match *state {
            RequestState::Cancelled => {
                drop(state);
                hook();
            }
            s if s.is_terminal() => {}
            _ => self.inner.hooks.lock().push(Box::new(hook)),
        }
    }

    /// Move from `Idle` to `Running`. Returns false if the request was
    /// cancelled before it started.
    pub(crate) fn start(&self) -> bool {
        self.transition(RequestState::Running)
    }

    /// Run `f` while the request is guaranteed not to become terminal.
    ///
    /// Returns `None` without running `f` if the request already finished
    /// or was cancelled.
    pub(crate) fn while_live<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let state = self.inner.state.lock();
        if state.is_terminal() {
            return None;
        }
        Some(f())
    }

    /// Move to a terminal state and run `f` atomically with the move.
    pub(crate) fn finish_with(&self, next: RequestState, f: impl FnOnce()) -> bool {
        let mut state = self.inner.state.lock();
        if !state.can_transition_to(next) {
            return false;
        }
        *state = next;
        f();
        if next.is_terminal() {
            self.inner.hooks.lock().clear();
        }
        true
    }

    fn transition(&self, next: RequestState) -> bool {
        self.finish_with(next, || {})
    }

    fn add_child(&self, child: Request) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidInput(
                "Cannot add to a closed multi-request".to_string(),
            ));
        }
        self.inner.children.lock().push(child.clone());
        if self.is_cancelled() {
            child.cancel();
        }
        Ok(())
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("state", &self.state())
            .field("children", &self.inner.children.lock().len())
            .finish()
    }
}

/// A request composed of child requests.
///
/// Cancelling it cancels every current child and every child added later.
/// It is done once it is closed and every child is done.
#[derive(Clone, Debug, Default)]
pub struct MultiRequest {
    request: Request,
}

impl MultiRequest {
    /// Create an open multi-request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child.
    ///
    /// # Errors
    /// - The multi-request was closed
    pub fn add(&self, child: Request) -> Result<()> {
        self.request.add_child(child)
    }

    /// Stop accepting children.
    pub fn close(&self) {
        self.request.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.request.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether the multi-request is closed and every child is done.
    pub fn is_done(&self) -> bool {
        self.is_closed() && self.children().iter().all(Request::is_done)
    }

    /// Cancel every child.
    pub fn cancel(&self) {
        self.request.cancel();
    }

    /// Current children.
    pub fn children(&self) -> Vec<Request> {
        self.request.inner.children.lock().clone()
    }

    /// The handle of the multi-request itself.
    pub fn request(&self) -> &Request {
        &self.request
    }
}
