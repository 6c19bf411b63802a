use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{SkeinError, SkeinErrorCode};
use crate::event_stream::PartStream;
use crate::part::Part;

/// One producer feeding the merger. Dropping a source cancels whatever work
/// drives it.
#[async_trait]
pub trait PartSource: Send {
    async fn next(&mut self) -> Option<Part>;
}

pub type BoxedPartSource = Box<dyn PartSource>;

/// Source backed by a bounded channel; the sender only advances when the
/// merger pulls.
pub struct ChannelSource {
    receiver: mpsc::Receiver<Part>,
}

impl ChannelSource {
    pub fn new(receiver: mpsc::Receiver<Part>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl PartSource for ChannelSource {
    async fn next(&mut self) -> Option<Part> {
        self.receiver.recv().await
    }
}

/// Adapts a `PartStream` (e.g. a model capability stream) as a source.
pub struct StreamSource {
    stream: PartStream,
}

impl StreamSource {
    pub fn new(stream: PartStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl PartSource for StreamSource {
    async fn next(&mut self) -> Option<Part> {
        self.stream.next().await
    }
}

/// Write side of a bounded splice channel into the merger.
#[derive(Clone)]
pub struct PartWriter {
    sender: mpsc::Sender<Part>,
}

impl PartWriter {
    pub async fn write(&self, part: Part) -> Result<(), SkeinError> {
        self.sender.send(part).await.map_err(|_| {
            SkeinError::new(
                SkeinErrorCode::Aborted,
                "Merged stream is closed; part dropped",
            )
        })
    }
}

/// Registers additional sources into a running merge.
#[derive(Clone)]
pub struct SourceRegistrar {
    sender: mpsc::UnboundedSender<BoxedPartSource>,
}

impl SourceRegistrar {
    /// Returns false if the merge has already ended or been cancelled.
    pub fn register(&self, source: BoxedPartSource) -> bool {
        self.sender.send(source).is_ok()
    }

    /// Opens a capacity-1 writer channel registered as a source, for
    /// out-of-band part writes (tool progress, data parts).
    pub fn open_writer(&self) -> PartWriter {
        let (sender, receiver) = mpsc::channel(1);
        self.register(Box::new(ChannelSource { receiver }));
        PartWriter { sender }
    }
}

type PullFuture = Pin<Box<dyn Future<Output = (BoxedPartSource, Option<Part>)> + Send>>;

enum Slot {
    Idle(BoxedPartSource),
    Pulling(PullFuture),
    Vacant,
}

/// Pull-based fan-in of part sources into one ordered sequence.
///
/// The primary source occupies the first slot and is always offered first;
/// later sources interleave in registration order. At most one pull is in
/// flight per source, so in-flight memory is bounded by the source count.
/// The merged sequence ends once every source is exhausted and the last
/// registrar handle is dropped.
pub struct StreamMerger {
    slots: Vec<Slot>,
    incoming: mpsc::UnboundedReceiver<BoxedPartSource>,
    registrar_closed: bool,
    cancelled: bool,
}

impl StreamMerger {
    pub fn new(primary: BoxedPartSource) -> (Self, SourceRegistrar) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                slots: vec![Slot::Idle(primary)],
                incoming: receiver,
                registrar_closed: false,
                cancelled: false,
            },
            SourceRegistrar { sender },
        )
    }

    pub async fn next(&mut self) -> Option<Part> {
        poll_fn(|cx| self.poll_next(cx)).await
    }

    /// Drops every live source (registered or still queued) and ends the
    /// merged sequence.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.slots.clear();
        self.incoming.close();
        while self.incoming.try_recv().is_ok() {}
    }

    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<Part>> {
        if self.cancelled {
            return Poll::Ready(None);
        }
        self.accept_registrations(cx);

        let mut index = 0;
        while index < self.slots.len() {
            let mut future = match std::mem::replace(&mut self.slots[index], Slot::Vacant) {
                Slot::Idle(mut source) => Box::pin(async move {
                    let part = source.next().await;
                    (source, part)
                }) as PullFuture,
                Slot::Pulling(future) => future,
                Slot::Vacant => {
                    self.slots.remove(index);
                    continue;
                }
            };

            match future.as_mut().poll(cx) {
                Poll::Ready((source, Some(part))) => {
                    self.slots[index] = Slot::Idle(source);
                    return Poll::Ready(Some(part));
                }
                Poll::Ready((_, None)) => {
                    self.slots.remove(index);
                }
                Poll::Pending => {
                    self.slots[index] = Slot::Pulling(future);
                    index += 1;
                }
            }
        }

        if self.slots.is_empty() && self.registrar_closed {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    fn accept_registrations(&mut self, cx: &mut Context<'_>) {
        while !self.registrar_closed {
            match self.incoming.poll_recv(cx) {
                Poll::Ready(Some(source)) => self.slots.push(Slot::Idle(source)),
                Poll::Ready(None) => self.registrar_closed = true,
                Poll::Pending => break,
            }
        }
    }
}
