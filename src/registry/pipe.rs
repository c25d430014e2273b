//! Queue-backed endpoints
//!
//! [`MessagePipe`] is the endpoint most callers want: messages for it land in
//! an unbounded queue that can be awaited from any executor or drained from a
//! plain thread.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_lite::future;
use smol::channel::{Receiver, Sender, TryRecvError};

use super::{Endpoint, EndpointId, EndpointRegistry};
use crate::error::{Error, Result};
use crate::message::{Message, MessageType};
use crate::sync::lock;

type RunHook = Box<dyn FnOnce(MessagePipe) + Send>;

struct PipeEndpoint {
    sender: Sender<Message>,
    remote: Arc<AtomicU32>,
    /// Handed to the hook when the endpoint first runs
    pending: Mutex<Option<(MessagePipe, RunHook)>>,
}

impl Endpoint for PipeEndpoint {
    fn on_run(&self, _port: u32, remote: EndpointId) {
        self.remote.store(remote.get(), Ordering::Release);
        let pending = lock(&self.pending).take();
        if let Some((pipe, hook)) = pending {
            hook(pipe);
        }
    }

    fn on_message(&self, _port: u32, message: Message) {
        if self.sender.try_send(message).is_err() {
            tracing::trace!("pipe: receiver gone, dropping message");
        }
    }

    fn on_peer_closed(&self, _port: u32) {
        self.sender.close();
        // Dropping an unclaimed pipe detaches it.
        let pending = lock(&self.pending).take();
        drop(pending);
    }
}

/// One end of a logical message pipe
///
/// Dropping the pipe detaches its endpoint. Once the peer closes, messages
/// already queued can still be received; after that every receive returns
/// [`Error::PeerClosed`].
pub struct MessagePipe {
    registry: Arc<EndpointRegistry>,
    id: EndpointId,
    remote: Arc<AtomicU32>,
    receiver: Receiver<Message>,
    closed: AtomicBool,
}

impl MessagePipe {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// The peer's id for this pipe, once running
    pub fn remote_id(&self) -> Option<EndpointId> {
        let remote = EndpointId::new(self.remote.load(Ordering::Acquire));
        remote.is_valid().then_some(remote)
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn write(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelShutDown);
        }
        self.registry.write(self.id, message)
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.write(Message::from_payload(MessageType::Endpoint, bytes)?)
    }

    pub async fn recv(&self) -> Result<Message> {
        self.receiver.recv().await.map_err(|_| Error::PeerClosed)
    }

    /// Like [`recv`](Self::recv), failing with `TimedOut` after `timeout`
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Message> {
        future::or(self.recv(), async {
            async_io::Timer::after(timeout).await;
            Err(Error::Io(io::ErrorKind::TimedOut.into()))
        })
        .await
    }

    pub fn recv_blocking(&self) -> Result<Message> {
        self.receiver.recv_blocking().map_err(|_| Error::PeerClosed)
    }

    /// Next queued message, if any
    pub fn try_recv(&self) -> Result<Option<Message>> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(Error::PeerClosed),
        }
    }

    /// Detach the endpoint; later calls do nothing
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let remote = EndpointId::new(self.remote.load(Ordering::Acquire));
        self.registry.detach_endpoint(self.id, remote);
    }
}

impl Drop for MessagePipe {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MessagePipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePipe")
            .field("id", &self.id)
            .field("remote", &self.remote_id())
            .field("queued", &self.receiver.len())
            .finish()
    }
}

impl EndpointRegistry {
    /// Attach a [`MessagePipe`] endpoint
    pub fn attach_pipe(self: &Arc<Self>, port: u32) -> Result<MessagePipe> {
        let (endpoint, receiver) = self.pipe_endpoint();
        let id = self.attach_pipe_endpoint(&endpoint, port)?;
        Ok(self.make_pipe(id, &endpoint, receiver))
    }

    /// Attach a pipe that is handed to `on_run` when it first runs
    ///
    /// If the peer goes away first the pipe is dropped unclaimed.
    pub(crate) fn attach_pipe_deferred(
        self: &Arc<Self>,
        port: u32,
        on_run: impl FnOnce(MessagePipe) + Send + 'static,
    ) -> Result<EndpointId> {
        let (endpoint, receiver) = self.pipe_endpoint();
        let id = self.attach_pipe_endpoint(&endpoint, port)?;
        let pipe = self.make_pipe(id, &endpoint, receiver);
        *lock(&endpoint.pending) = Some((pipe, Box::new(on_run)));
        Ok(id)
    }

    fn pipe_endpoint(&self) -> (Arc<PipeEndpoint>, Receiver<Message>) {
        let (sender, receiver) = smol::channel::unbounded();
        let endpoint = Arc::new(PipeEndpoint {
            sender,
            remote: Arc::new(AtomicU32::new(EndpointId::INVALID.get())),
            pending: Mutex::new(None),
        });
        (endpoint, receiver)
    }

    fn attach_pipe_endpoint(&self, endpoint: &Arc<PipeEndpoint>, port: u32) -> Result<EndpointId> {
        let id = self.attach_endpoint(endpoint.clone(), port);
        if id.is_valid() {
            Ok(id)
        } else if self.is_closed() {
            Err(Error::ChannelShutDown)
        } else {
            Err(Error::EndpointIdsExhausted)
        }
    }

    fn make_pipe(
        self: &Arc<Self>,
        id: EndpointId,
        endpoint: &PipeEndpoint,
        receiver: Receiver<Message>,
    ) -> MessagePipe {
        MessagePipe {
            registry: self.clone(),
            id,
            remote: endpoint.remote.clone(),
            receiver,
            closed: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::IoContext;
    use crate::config::{ChannelOptions, RegistryOptions};
    use crate::handle::{PlatformHandle, TransportHandle};
    use crate::registry::EndpointState;
    use std::io::{Read, Seek, Write};

    fn pair(io: &IoContext) -> (Arc<EndpointRegistry>, Arc<EndpointRegistry>) {
        let (a, b) = TransportHandle::pair().unwrap();
        let make = |handle| {
            EndpointRegistry::new(
                io,
                handle,
                ChannelOptions::default(),
                RegistryOptions::default(),
            )
            .unwrap()
        };
        (make(a), make(b))
    }

    #[test]
    fn test_deferred_pipe_handed_over_on_run() {
        let io = IoContext::new("pipe-test").unwrap();
        let (a, _b) = pair(&io);
        let (tx, rx) = std::sync::mpsc::channel();
        let id = a
            .attach_pipe_deferred(3, move |pipe| {
                let _ = tx.send(pipe);
            })
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert!(a.run_endpoint(id, EndpointId::new(9)));
        let pipe = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(pipe.id(), id);
        assert_eq!(pipe.remote_id(), Some(EndpointId::new(9)));
        a.shut_down();
    }

    #[test]
    fn test_unclaimed_pipe_detached_on_close() {
        let io = IoContext::new("pipe-test").unwrap();
        let (a, _b) = pair(&io);
        a.attach_pipe_deferred(0, |_| panic!("never runs")).unwrap();
        assert_eq!(a.endpoint_count(), 1);
        a.shut_down();
        assert_eq!(a.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_pipe_carries_file_descriptor() {
        let io = IoContext::new("pipe-test").unwrap();
        let (a, b) = pair(&io);
        let pipe_a = a.attach_pipe(0).unwrap();
        let pipe_b = b.attach_pipe(0).unwrap();
        a.run_endpoint(pipe_a.id(), pipe_b.id());
        b.run_endpoint(pipe_b.id(), pipe_a.id());
        a.start().unwrap();
        b.start().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shared").unwrap();
        file.rewind().unwrap();

        let mut message = Message::new(4, 1, MessageType::Normal).unwrap();
        message.payload_mut().copy_from_slice(b"file");
        message.set_handles(vec![PlatformHandle::from(file)]).unwrap();
        pipe_a.write(message).unwrap();

        let mut received = pipe_b.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(received.message_type(), MessageType::Endpoint);
        assert_eq!(received.payload(), b"file");
        let mut handles = received.take_handles();
        assert_eq!(handles.len(), 1);
        let mut contents = String::new();
        handles
            .remove(0)
            .into_file()
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "shared");

        a.shut_down();
        b.shut_down();
    }

    #[tokio::test]
    async fn test_queued_messages_survive_peer_close() {
        let io = IoContext::new("pipe-test").unwrap();
        let (a, b) = pair(&io);
        let pipe_a = a.attach_pipe(0).unwrap();
        let pipe_b = b.attach_pipe(0).unwrap();
        a.run_endpoint(pipe_a.id(), pipe_b.id());
        b.run_endpoint(pipe_b.id(), pipe_a.id());
        a.start().unwrap();
        b.start().unwrap();

        pipe_a.write_bytes(b"last words").unwrap();
        drop(pipe_a);

        let message = pipe_b.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(message.payload(), b"last words");
        assert!(matches!(
            pipe_b.recv_timeout(Duration::from_secs(5)).await,
            Err(Error::PeerClosed)
        ));

        a.shut_down();
        b.shut_down();
    }

    #[test]
    fn test_write_after_close_rejected() {
        let io = IoContext::new("pipe-test").unwrap();
        let (a, _b) = pair(&io);
        let pipe = a.attach_pipe(0).unwrap();
        pipe.close();
        pipe.close();
        assert!(matches!(pipe.write_bytes(b"x"), Err(Error::ChannelShutDown)));
        assert_eq!(
            a.endpoint_state(pipe.id()),
            Some(EndpointState::WaitRemoteRemoveAck)
        );
        a.shut_down();
    }
}
