//! Completion events and the stream that delivers them.
//!
//! An operation reports through a sequence of [`Event`]s: at most one
//! `Cached` value, then at most one `Refreshed` value, then exactly one
//! terminal event (`Done`, `Failed` or `Cancelled`). Nothing follows the
//! terminal event.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::request::Request;
use crate::state::RequestState;
use offsync_common::{Error, Result};

/// One notification from an operation.
#[derive(Debug)]
pub enum Event<T> {
    /// Value read from the local cache.
    Cached(T),
    /// Value confirmed by (or fetched from) the network.
    Refreshed(T),
    /// The operation finished successfully.
    Done,
    /// The operation failed.
    Failed(Error),
    /// The operation was cancelled.
    Cancelled,
}

impl<T> Event<T> {
    /// Whether nothing can follow this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_) | Self::Cancelled)
    }

    /// The carried value, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Cached(value) | Self::Refreshed(value) => Some(value),
            _ => None,
        }
    }
}

/// Sending half used by a running operation to emit values.
///
/// Emits are dropped silently once the request is cancelled.
pub struct Emitter<T> {
    request: Request,
    tx: mpsc::UnboundedSender<Event<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T> Emitter<T> {
    /// Emit a value read from the cache. Returns false if it was dropped.
    pub fn cached(&self, value: T) -> bool {
        self.emit(Event::Cached(value))
    }

    /// Emit a value from the network. Returns false if it was dropped.
    pub fn refreshed(&self, value: T) -> bool {
        self.emit(Event::Refreshed(value))
    }

    /// The request this emitter reports for.
    pub fn request(&self) -> &Request {
        &self.request
    }

    fn emit(&self, event: Event<T>) -> bool {
        self.request
            .while_live(|| self.tx.send(event).is_ok())
            .unwrap_or(false)
    }
}

/// Terminal half: delivers exactly one `Done` or `Failed`.
pub(crate) struct Completion<T> {
    emitter: Emitter<T>,
}

impl<T: Send + 'static> Completion<T> {
    /// Move the request to `Running`. False if it was cancelled first.
    pub(crate) fn start(&self) -> bool {
        self.emitter.request.start()
    }

    pub(crate) fn emitter(&self) -> Emitter<T> {
        self.emitter.clone()
    }

    /// Deliver the terminal event for `result`.
    ///
    /// A cancelled request already received `Cancelled`; nothing is sent.
    pub(crate) fn finish(self, result: Result<()>) {
        let Emitter { request, tx } = self.emitter;
        let (state, event) = match result {
            Ok(()) => (RequestState::Completed, Event::Done),
            Err(Error::Cancelled) if request.is_cancelled() => return,
            Err(err) => (RequestState::Failed, Event::Failed(err)),
        };
        request.finish_with(state, || {
            let _ = tx.send(event);
        });
    }
}

/// Create the two halves for `request`.
///
/// Cancelling the request delivers `Cancelled` once; the hook holds only a
/// weak sender so the stream still ends when the operation is dropped.
pub(crate) fn channel<T: Send + 'static>(request: Request) -> (Completion<T>, Response<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let weak = tx.downgrade();
    request.on_cancel(move || {
        if let Some(tx) = weak.upgrade() {
            let _ = tx.send(Event::Cancelled);
        }
    });

    let completion = Completion {
        emitter: Emitter {
            request: request.clone(),
            tx,
        },
    };
    (completion, Response { request, rx, finished: false })
}

/// Spawn an operation body and return the caller's side.
///
/// Requires a running tokio runtime.
pub(crate) fn launch<T, F, Fut>(request: Request, body: F) -> Response<T>
where
    T: Send + 'static,
    F: FnOnce(Emitter<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (completion, response) = channel(request);
    tokio::spawn(async move {
        if !completion.start() {
            return;
        }
        let result = body(completion.emitter()).await;
        completion.finish(result);
    });
    response
}

/// The caller's side of an operation: its request handle plus its events.
pub struct Response<T> {
    request: Request,
    rx: mpsc::UnboundedReceiver<Event<T>>,
    finished: bool,
}

impl<T> Response<T> {
    /// The request handle.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Cancel the operation.
    pub fn cancel(&self) {
        self.request.cancel();
    }

    /// Next event, or `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<Event<T>> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        self.finished = event.as_ref().map_or(true, Event::is_terminal);
        event
    }

    /// Every event up to and including the terminal one.
    pub async fn collect(mut self) -> Vec<Event<T>> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    /// The last value delivered, or the failure.
    ///
    /// # Errors
    /// - The operation failed or was cancelled
    /// - The operation finished without delivering a value
    pub async fn value(mut self) -> Result<T> {
        let mut last = None;
        while let Some(event) = self.next_event().await {
            match event {
                Event::Cached(value) | Event::Refreshed(value) => last = Some(value),
                Event::Done => {
                    return last.ok_or_else(|| {
                        Error::InvalidInput("Operation finished without a value".to_string())
                    })
                }
                Event::Failed(err) => return Err(err),
                Event::Cancelled => return Err(Error::Cancelled),
            }
        }
        // Dropped without a terminal event.
        Err(Error::Cancelled)
    }
}

impl<T> Stream for Response<T> {
    type Item = Event<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(event) = &polled {
            self.finished = event.as_ref().map_or(true, Event::is_terminal);
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_values_then_done() {
        let response = launch(Request::new(), |emitter: Emitter<u32>| async move {
            emitter.cached(1);
            emitter.refreshed(2);
            Ok(())
        });

        let events = response.collect().await;
        assert!(matches!(
            events.as_slice(),
            [Event::Cached(1), Event::Refreshed(2), Event::Done]
        ));
    }

    #[tokio::test]
    async fn test_failure_is_terminal() {
        let response = launch(Request::new(), |_: Emitter<u32>| async move {
            Err(Error::NetworkUnreachable("down".to_string()))
        });
        assert!(matches!(
            response.value().await,
            Err(Error::NetworkUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_delivers_cancelled_once() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let response = launch(Request::new(), move |emitter: Emitter<u32>| async move {
            let _ = release_rx.await;
            emitter.refreshed(7);
            Ok(())
        });

        response.cancel();
        response.cancel();
        let _ = release_tx.send(());

        let events: Vec<_> = response.collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_body() {
        let request = Request::new();
        request.cancel();
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let response = launch(request, move |_: Emitter<u32>| async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        assert!(matches!(response.value().await, Err(Error::Cancelled)));
        tokio::task::yield_now().await;
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal() {
        let mut response = launch(Request::new(), |emitter: Emitter<u32>| async move {
            emitter.refreshed(3);
            Ok(())
        });

        assert!(matches!(response.next().await, Some(Event::Refreshed(3))));
        assert!(matches!(response.next().await, Some(Event::Done)));
        assert!(response.next().await.is_none());
    }

    #[tokio::test]
    async fn test_done_without_value() {
        let response = launch(Request::new(), |_: Emitter<u32>| async move { Ok(()) });
        assert!(matches!(response.value().await, Err(Error::InvalidInput(_))));
    }
}
