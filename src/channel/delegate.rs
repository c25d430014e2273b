use std::io;
use std::time::Duration;

use futures_lite::future;
use smol::channel::{Receiver, Sender, TryRecvError};
use thiserror::Error;

use crate::message::{Message, MessageError};

/// Fatal conditions reported to a [`Delegate`]
///
/// At most one error is reported per direction: a read-side error stops
/// reading, a write-side error stops writing and discards queued frames.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer disconnected")]
    Disconnected,

    #[error("read failed: {0}")]
    ReadFailed(io::Error),

    #[error("write failed: {0}")]
    WriteFailed(io::Error),

    #[error("malformed message: {0}")]
    MalformedMessage(#[from] MessageError),
}

impl ChannelError {
    /// Whether no further message can be read after this error
    pub fn ends_reading(&self) -> bool {
        !matches!(self, ChannelError::WriteFailed(_))
    }
}

/// Observer of one [`Channel`](crate::Channel)
///
/// Callbacks run on the channel's I/O thread, never while the channel holds
/// a lock, so a delegate may call back into the channel (including
/// [`shut_down`](crate::Channel::shut_down)).
pub trait Delegate: Send + Sync + 'static {
    /// A complete message arrived, with all of its handles
    fn on_channel_message(&self, message: Message);

    /// The channel failed in one direction
    fn on_channel_error(&self, error: ChannelError);
}

/// Event forwarded by [`MessageQueue`]
#[derive(Debug)]
pub enum ChannelEvent {
    Message(Message),
    Error(ChannelError),
}

impl ChannelEvent {
    pub fn into_message(self) -> Option<Message> {
        match self {
            ChannelEvent::Message(message) => Some(message),
            ChannelEvent::Error(_) => None,
        }
    }
}

/// A [`Delegate`] that queues channel events for async or blocking consumers
///
/// Works with any executor: the queue is a `smol` channel and timeouts use
/// an `async-io` timer.
///
/// The queue closes after a read-side error (disconnect, read failure or a
/// malformed frame), since no message can follow one. Events already queued
/// are still returned; after that [`recv`](Self::recv) yields `None`. A write
/// failure leaves the queue open because reads may continue. A channel shut
/// down locally reports nothing; call [`close`](Self::close) to wake waiters.
#[derive(Debug)]
pub struct MessageQueue {
    sender: Sender<ChannelEvent>,
    receiver: Receiver<ChannelEvent>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        let (sender, receiver) = smol::channel::unbounded();
        Self { sender, receiver }
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next event
    pub async fn recv(&self) -> Option<ChannelEvent> {
        self.receiver.recv().await.ok()
    }

    /// Wait for the next event, giving up after `timeout`
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<ChannelEvent> {
        future::or(self.recv(), async {
            async_io::Timer::after(timeout).await;
            None
        })
        .await
    }

    /// Block the calling thread until the next event
    pub fn recv_blocking(&self) -> Option<ChannelEvent> {
        self.receiver.recv_blocking().ok()
    }

    pub fn try_recv(&self) -> Option<ChannelEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    /// Stop accepting events; queued ones can still be received
    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Number of events waiting
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Delegate for MessageQueue {
    fn on_channel_message(&self, message: Message) {
        if self.sender.try_send(ChannelEvent::Message(message)).is_err() {
            tracing::trace!("queue: closed, dropping message");
        }
    }

    fn on_channel_error(&self, error: ChannelError) {
        let terminal = error.ends_reading();
        let _ = self.sender.try_send(ChannelEvent::Error(error));
        if terminal {
            self.sender.close();
        }
    }
}
