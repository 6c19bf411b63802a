use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use crate::message::Message;
use crate::part::Part;

type CompletionFn<T, R> = dyn Fn(&T) -> Option<R> + Send + Sync;

struct EventStreamInner<T, R> {
    sender: mpsc::UnboundedSender<T>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<T>>,
    completion: Arc<CompletionFn<T, R>>,
    final_result: Mutex<Option<R>>,
    event_notify: Notify,
    final_notify: Notify,
    done: AtomicBool,
}

/// Cloneable push-fed, pull-consumed event stream.
///
/// Producers `push` events; one or more consumers `next()` them in order.
/// The completion closure may derive a final result from a terminal event;
/// otherwise the producer supplies one via `end`.
pub struct EventStream<T, R> {
    inner: Arc<EventStreamInner<T, R>>,
}

impl<T, R> Clone for EventStream<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> EventStream<T, R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn with_completion<F>(completion: F) -> Self
    where
        F: Fn(&T) -> Option<R> + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EventStreamInner {
                sender,
                receiver: AsyncMutex::new(receiver),
                completion: Arc::new(completion),
                final_result: Mutex::new(None),
                event_notify: Notify::new(),
                final_notify: Notify::new(),
                done: AtomicBool::new(false),
            }),
        }
    }

    pub fn new() -> Self {
        Self::with_completion(|_| None)
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    pub fn push(&self, event: T) {
        if self.is_done() {
            return;
        }

        if let Some(result) = (self.inner.completion)(&event) {
            let mut guard = self
                .inner
                .final_result
                .lock()
                .expect("final_result mutex poisoned");
            if guard.is_none() {
                *guard = Some(result);
                self.inner.done.store(true, Ordering::SeqCst);
            }
            drop(guard);
            self.inner.final_notify.notify_waiters();
        }

        let _ = self.inner.sender.send(event);
        self.inner.event_notify.notify_waiters();
    }

    pub fn end(&self, result: Option<R>) {
        if self.is_done() {
            return;
        }

        if let Some(result) = result {
            let mut guard = self
                .inner
                .final_result
                .lock()
                .expect("final_result mutex poisoned");
            if guard.is_none() {
                *guard = Some(result);
            }
        }

        self.inner.done.store(true, Ordering::SeqCst);
        self.inner.event_notify.notify_waiters();
        self.inner.final_notify.notify_waiters();
    }

    /// Next queued event, or `None` once the stream ended and the queue drained.
    pub async fn next(&self) -> Option<T> {
        loop {
            // Register for the wakeup before checking the queue, so a push
            // landing in between is not lost.
            let mut notified = std::pin::pin!(self.inner.event_notify.notified());
            notified.as_mut().enable();

            {
                let mut receiver = self.inner.receiver.lock().await;
                match receiver.try_recv() {
                    Ok(event) => return Some(event),
                    Err(mpsc::error::TryRecvError::Disconnected) => return None,
                    Err(mpsc::error::TryRecvError::Empty) => {
                        if self.is_done() {
                            return None;
                        }
                    }
                }
            }

            notified.await;
        }
    }

    /// Awaits the final result; `None` if the stream ended without one.
    pub async fn result(&self) -> Option<R> {
        loop {
            let mut notified = std::pin::pin!(self.inner.final_notify.notified());
            notified.as_mut().enable();

            if let Some(result) = self
                .inner
                .final_result
                .lock()
                .expect("final_result mutex poisoned")
                .clone()
            {
                return Some(result);
            }

            if self.is_done() {
                return None;
            }

            notified.await;
        }
    }
}

impl<T, R> Default for EventStream<T, R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// The stream surface a run hands to its consumer: `Part`s while live, a
/// reconstructed `Message` once finished.
pub type PartStream = EventStream<Part, Message>;

/// Producer-side handle for a `PartStream`.
pub struct PartStreamWriter {
    stream: PartStream,
}

impl PartStreamWriter {
    pub fn new(stream: PartStream) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> PartStream {
        self.stream.clone()
    }

    pub fn push(&self, part: Part) {
        self.stream.push(part);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.stream.push(Part::error(message));
    }

    pub fn close(&self, message: Option<Message>) {
        self.stream.end(message);
    }
}
