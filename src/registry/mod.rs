//! Endpoint multiplexing over one channel
//!
//! An [`EndpointRegistry`] owns a [`Channel`] and lets many logical
//! endpoints share it. Each endpoint gets a local [`EndpointId`]; once the
//! peer's id for the other end is known the endpoint is *run* and messages
//! flow, routed by the source and destination ids in each frame.
//!
//! The first endpoint attached to a fresh registry always gets
//! [`EndpointId::BOOTSTRAP`], so two peers that each attach one endpoint
//! right after connecting agree on its id without a round trip.

mod control;
mod pipe;
mod state;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

pub use pipe::MessagePipe;
pub use state::{EndpointState, RemovalEvent};

use crate::channel::{Channel, ChannelError, Delegate, IoContext};
use crate::config::{ChannelOptions, RegistryOptions};
use crate::error::{Error, Result};
use crate::handle::TransportHandle;
use crate::message::{Message, MessageType, Route};
use crate::sync::lock;
use control::ControlMessage;
use state::{Next, Transition};

/// Local identifier of a multiplexed endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(u32);

impl EndpointId {
    /// Returned when no identifier could be assigned
    pub const INVALID: EndpointId = EndpointId(0);

    /// Identifier of the first endpoint on a fresh registry
    pub const BOOTSTRAP: EndpointId = EndpointId(1);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical endpoint attached to a registry
///
/// Callbacks run on the channel's I/O thread (or on the thread that called
/// [`EndpointRegistry::run_endpoint`]) and never while the registry lock is
/// held, so they may call back into the registry.
pub trait Endpoint: Send + Sync + 'static {
    /// The endpoint became routable; `remote` is the peer's id for it
    fn on_run(&self, port: u32, remote: EndpointId) {
        let _ = (port, remote);
    }

    fn on_message(&self, port: u32, message: Message);

    /// The peer end is gone; the owner should detach
    fn on_peer_closed(&self, port: u32);
}

type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

struct Entry {
    /// `None` once the local owner has detached
    endpoint: Option<Arc<dyn Endpoint>>,
    port: u32,
    remote: EndpointId,
    state: EndpointState,
    /// Detached before the peer's id was known, so no `RemoveEndpoint` went
    /// out; kept until the peer names the entry
    unannounced: bool,
}

struct Table {
    entries: HashMap<EndpointId, Entry>,
    next_id: u32,
    closed: bool,
}

impl Table {
    /// Next free identifier, scanning forward from the last one handed out
    fn allocate(&mut self, max: u32) -> Option<EndpointId> {
        if self.entries.len() >= max as usize {
            return None;
        }
        loop {
            let candidate = EndpointId(self.next_id);
            self.next_id = if self.next_id >= max { 1 } else { self.next_id + 1 };
            if !self.entries.contains_key(&candidate) {
                return Some(candidate);
            }
        }
    }
}

/// Multiplexes logical endpoints over one [`Channel`]
///
/// The registry is the channel's delegate. Any protocol violation by the
/// peer and any channel error is fatal: the channel is shut down, every
/// endpoint is told its peer closed, and the error handler (if set) sees the
/// cause.
pub struct EndpointRegistry {
    channel: OnceLock<Arc<Channel>>,
    table: Mutex<Table>,
    options: RegistryOptions,
    error_handler: Mutex<Option<ErrorHandler>>,
}

impl EndpointRegistry {
    /// Create a registry over `handle`
    ///
    /// The channel is not started yet: attach the endpoints the peer will
    /// address first, then call [`start`](Self::start).
    pub fn new(
        io: &IoContext,
        handle: TransportHandle,
        channel_options: ChannelOptions,
        options: RegistryOptions,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(Self {
            channel: OnceLock::new(),
            table: Mutex::new(Table {
                entries: HashMap::new(),
                next_id: EndpointId::BOOTSTRAP.0,
                closed: false,
            }),
            options,
            error_handler: Mutex::new(None),
        });
        let channel = Channel::new(io, handle, registry.clone(), channel_options)?;
        let _ = registry.channel.set(channel);
        Ok(registry)
    }

    /// Start the underlying channel
    pub fn start(&self) -> Result<()> {
        self.channel()?.start()
    }

    pub fn channel(&self) -> Result<&Arc<Channel>> {
        self.channel.get().ok_or(Error::ChannelShutDown)
    }

    /// Called with the cause whenever the registry fails
    pub fn set_error_handler(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        *lock(&self.error_handler) = Some(Arc::new(handler));
    }

    /// Attach `endpoint` under a fresh local identifier
    ///
    /// Returns [`EndpointId::INVALID`] when the identifier space is exhausted
    /// or the registry has shut down.
    pub fn attach_endpoint(&self, endpoint: Arc<dyn Endpoint>, port: u32) -> EndpointId {
        let mut table = lock(&self.table);
        if table.closed {
            tracing::debug!("registry: attach on a closed registry");
            return EndpointId::INVALID;
        }
        let Some(id) = table.allocate(self.options.max_endpoint_id()) else {
            tracing::warn!(
                max = self.options.max_endpoint_id(),
                "registry: endpoint identifiers exhausted"
            );
            return EndpointId::INVALID;
        };
        table.entries.insert(
            id,
            Entry {
                endpoint: Some(endpoint),
                port,
                remote: EndpointId::INVALID,
                state: EndpointState::Normal,
                unannounced: false,
            },
        );
        tracing::debug!(endpoint = %id, port, "registry: endpoint attached");
        id
    }

    /// Make `local_id` routable with `remote_id` as its peer
    ///
    /// Returns false when `local_id` is unknown or already on its way out.
    pub fn run_endpoint(&self, local_id: EndpointId, remote_id: EndpointId) -> bool {
        let target = {
            let mut table = lock(&self.table);
            let Some(entry) = table.entries.get_mut(&local_id) else {
                return false;
            };
            let Some(endpoint) = entry.endpoint.clone() else {
                return false;
            };
            if !entry.state.is_routable() {
                return false;
            }
            entry.remote = remote_id;
            (endpoint, entry.port)
        };
        tracing::debug!(endpoint = %local_id, remote = %remote_id, "registry: endpoint running");
        let (endpoint, port) = target;
        endpoint.on_run(port, remote_id);
        true
    }

    /// Ask the peer to run its endpoint `remote_id` against our `local_id`
    pub fn run_remote_endpoint(&self, local_id: EndpointId, remote_id: EndpointId) -> Result<()> {
        if !lock(&self.table).entries.contains_key(&local_id) {
            return Err(Error::UnknownEndpoint(local_id));
        }
        self.send_control(ControlMessage::RunEndpoint, local_id, remote_id)
    }

    /// Local half of two-phase removal
    ///
    /// `remote_id` is the peer's id for the endpoint, used when the entry was
    /// never run here. The identifier stays reserved until the peer
    /// acknowledges. An endpoint detached before any remote id is known stays
    /// reserved too, since the peer may already hold its id: it is released
    /// once the peer runs or removes it, or when the registry shuts down.
    pub fn detach_endpoint(&self, local_id: EndpointId, remote_id: EndpointId) {
        if let Err(e) = self.apply(local_id, RemovalEvent::LocalDetach, remote_id) {
            tracing::warn!(endpoint = %local_id, error = %e, "registry: detach failed");
        }
    }

    /// Remove an endpoint on the registry's own initiative
    ///
    /// The peer is told to remove its side and the endpoint is told its peer
    /// closed; the entry goes once the owner detaches and the peer
    /// acknowledges.
    pub fn remove_endpoint(&self, local_id: EndpointId) -> Result<()> {
        self.apply(local_id, RemovalEvent::ForcedRemove, EndpointId::INVALID)
    }

    /// Send `message` from `local_id` to its peer
    pub fn write(&self, local_id: EndpointId, message: Message) -> Result<()> {
        if message.message_type() == MessageType::EndpointControl {
            return Err(Error::UnexpectedMessageType(MessageType::EndpointControl));
        }
        let remote = {
            let table = lock(&self.table);
            if table.closed {
                return Err(Error::ChannelShutDown);
            }
            let entry = table
                .entries
                .get(&local_id)
                .ok_or(Error::UnknownEndpoint(local_id))?;
            match entry.state {
                EndpointState::Normal if entry.remote.is_valid() => entry.remote,
                EndpointState::Normal | EndpointState::WaitRemoteRemoveAck => {
                    return Err(Error::EndpointNotRunning(local_id));
                }
                EndpointState::WaitLocalDetach
                | EndpointState::WaitLocalDetachAndRemoteRemoveAck => {
                    return Err(Error::PeerClosed);
                }
            }
        };

        let mut message = message.into_routed()?;
        message.set_route(Route {
            source: local_id.0,
            destination: remote.0,
        })?;
        self.channel()?.write(message)
    }

    /// Shut the channel down and release every endpoint
    ///
    /// Attached endpoints are told their peer closed. Idempotent.
    pub fn shut_down(&self) {
        if self.close() {
            tracing::debug!("registry: shut down");
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.table).closed
    }

    /// Number of entries in the table, including ones awaiting removal
    pub fn endpoint_count(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn endpoint_state(&self, id: EndpointId) -> Option<EndpointState> {
        lock(&self.table).entries.get(&id).map(|entry| entry.state)
    }

    pub fn remote_id(&self, id: EndpointId) -> Option<EndpointId> {
        lock(&self.table)
            .entries
            .get(&id)
            .map(|entry| entry.remote)
            .filter(|remote| remote.is_valid())
    }

    fn apply(&self, local_id: EndpointId, event: RemovalEvent, remote_hint: EndpointId) -> Result<()> {
        let (transition, remote, notify) = {
            let mut table = lock(&self.table);
            if table.closed {
                return Ok(());
            }
            let entry = table
                .entries
                .get_mut(&local_id)
                .ok_or(Error::UnknownEndpoint(local_id))?;
            if !entry.remote.is_valid() {
                entry.remote = remote_hint;
            }
            let mut transition = entry.state.on_event(event).ok_or(Error::InvalidTransition {
                id: local_id,
                state: entry.state,
                event,
            })?;

            if transition.send_remove && !entry.remote.is_valid() {
                // Nowhere to send the removal yet.
                transition.send_remove = false;
                entry.unannounced = true;
            } else if entry.unannounced && event == RemovalEvent::RemoteRemove {
                // No removal of ours is in flight, so the peer's settles it.
                entry.unannounced = false;
                transition = settle(transition);
            }

            let notify = if transition.notify_peer_closed {
                entry.endpoint.clone().map(|endpoint| (endpoint, entry.port))
            } else {
                None
            };
            if event == RemovalEvent::LocalDetach {
                entry.endpoint = None;
            }
            let remote = entry.remote;
            match transition.next {
                Next::Stay(state) => entry.state = state,
                Next::Remove => {
                    table.entries.remove(&local_id);
                }
            }
            (transition, remote, notify)
        };

        tracing::debug!(
            endpoint = %local_id,
            event = ?event,
            next = ?transition.next,
            "registry: removal progressed"
        );
        if transition.send_ack {
            self.send_control(ControlMessage::RemoveEndpointAck, local_id, remote)?;
        }
        if transition.send_remove {
            self.send_control(ControlMessage::RemoveEndpoint, local_id, remote)?;
        }
        if let Some((endpoint, port)) = notify {
            endpoint.on_peer_closed(port);
        }
        Ok(())
    }

    fn send_control(&self, control: ControlMessage, local_id: EndpointId, remote_id: EndpointId) -> Result<()> {
        let message = control.to_message(Route {
            source: local_id.0,
            destination: remote_id.0,
        })?;
        tracing::trace!(?control, endpoint = %local_id, remote = %remote_id, "registry: control sent");
        self.channel()?.write(message)
    }

    fn route(&self, message: Message) -> Result<()> {
        match message.message_type() {
            MessageType::Endpoint => self.deliver(message),
            MessageType::EndpointControl => self.on_control(message),
            other => Err(Error::UnexpectedMessageType(other)),
        }
    }

    fn deliver(&self, message: Message) -> Result<()> {
        let destination = EndpointId(message.route()?.destination);
        let target = {
            let table = lock(&self.table);
            let entry = table
                .entries
                .get(&destination)
                .ok_or(Error::UnknownEndpoint(destination))?;
            match (&entry.endpoint, entry.state.is_routable()) {
                (Some(endpoint), true) => Some((endpoint.clone(), entry.port)),
                _ => None,
            }
        };
        match target {
            Some((endpoint, port)) => endpoint.on_message(port, message),
            None => {
                tracing::trace!(endpoint = %destination, "registry: dropping message for removed endpoint");
            }
        }
        Ok(())
    }

    fn on_control(&self, message: Message) -> Result<()> {
        let (control, route) = ControlMessage::from_message(&message)?;
        let local_id = EndpointId(route.destination);
        let remote_id = EndpointId(route.source);
        tracing::trace!(?control, endpoint = %local_id, remote = %remote_id, "registry: control received");

        match control {
            ControlMessage::RunEndpoint => {
                if !lock(&self.table).entries.contains_key(&local_id) {
                    return Err(Error::UnknownEndpoint(local_id));
                }
                if self.run_endpoint(local_id, remote_id) {
                    return Ok(());
                }
                if self.announce(local_id, remote_id) {
                    tracing::debug!(endpoint = %local_id, remote = %remote_id, "registry: removing endpoint the peer just ran");
                    return self.send_control(ControlMessage::RemoveEndpoint, local_id, remote_id);
                }
                tracing::debug!(endpoint = %local_id, "registry: ignoring run for a detached endpoint");
                Ok(())
            }
            ControlMessage::RemoveEndpoint => self.apply(local_id, RemovalEvent::RemoteRemove, remote_id),
            ControlMessage::RemoveEndpointAck => {
                self.apply(local_id, RemovalEvent::RemoteRemoveAck, remote_id)
            }
        }
    }

    /// Learn the peer's id for an entry detached before it was known
    fn announce(&self, local_id: EndpointId, remote_id: EndpointId) -> bool {
        let mut table = lock(&self.table);
        match table.entries.get_mut(&local_id) {
            Some(entry) if entry.unannounced => {
                entry.unannounced = false;
                entry.remote = remote_id;
                true
            }
            _ => false,
        }
    }

    /// Mark closed, stop the channel and tell every endpoint; false if already closed
    fn close(&self) -> bool {
        let endpoints: Vec<(Arc<dyn Endpoint>, u32)> = {
            let mut table = lock(&self.table);
            if table.closed {
                return false;
            }
            table.closed = true;
            table
                .entries
                .drain()
                .filter_map(|(_, entry)| entry.endpoint.map(|endpoint| (endpoint, entry.port)))
                .collect()
        };
        if let Some(channel) = self.channel.get() {
            channel.shut_down();
        }
        for (endpoint, port) in endpoints {
            endpoint.on_peer_closed(port);
        }
        true
    }

    fn fail(&self, error: Error) {
        match &error {
            Error::Channel(ChannelError::Disconnected) => {
                tracing::debug!("registry: peer disconnected");
            }
            other => tracing::error!(error = %other, "registry: fatal error, closing channel"),
        }
        if !self.close() {
            return;
        }
        let handler = lock(&self.error_handler).clone();
        if let Some(handler) = handler {
            handler(&error);
        }
    }
}

/// Fold the acknowledgement that will never come into `transition`
fn settle(transition: Transition) -> Transition {
    match transition.next {
        Next::Stay(waiting) => match waiting.on_event(RemovalEvent::RemoteRemoveAck) {
            Some(acked) => Transition {
                next: acked.next,
                ..transition
            },
            None => transition,
        },
        Next::Remove => transition,
    }
}

impl Delegate for EndpointRegistry {
    fn on_channel_message(&self, message: Message) {
        if let Err(e) = self.route(message) {
            self.fail(e);
        }
    }

    fn on_channel_error(&self, error: ChannelError) {
        self.fail(Error::Channel(error));
    }
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = lock(&self.table);
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &table.entries.len())
            .field("closed", &table.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn registry(io: &IoContext, handle: TransportHandle) -> Arc<EndpointRegistry> {
        EndpointRegistry::new(
            io,
            handle,
            ChannelOptions::default(),
            RegistryOptions::default(),
        )
        .unwrap()
    }

    fn connected(io: &IoContext) -> (Arc<EndpointRegistry>, Arc<EndpointRegistry>) {
        let (a, b) = TransportHandle::pair().unwrap();
        (registry(io, a), registry(io, b))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + TIMEOUT;
        while !check() {
            assert!(std::time::Instant::now() < deadline, "condition not reached");
            async_io::Timer::after(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_both_sides_get_bootstrap_id() {
        let io = IoContext::new("registry-test").unwrap();
        let (a, b) = connected(&io);

        let pipe_a = a.attach_pipe(0).unwrap();
        let pipe_b = b.attach_pipe(0).unwrap();
        assert_eq!(pipe_a.id(), EndpointId::BOOTSTRAP);
        assert_eq!(pipe_b.id(), EndpointId::BOOTSTRAP);

        a.shut_down();
        b.shut_down();
    }

    #[tokio::test]
    async fn test_bootstrap_pipe_exchange() {
        let io = IoContext::new("registry-test").unwrap();
        let (a, b) = connected(&io);

        let pipe_a = a.attach_pipe(0).unwrap();
        let pipe_b = b.attach_pipe(0).unwrap();
        assert!(a.run_endpoint(pipe_a.id(), EndpointId::BOOTSTRAP));
        assert!(b.run_endpoint(pipe_b.id(), EndpointId::BOOTSTRAP));
        a.start().unwrap();
        b.start().unwrap();

        pipe_a.write_bytes(b"hello").unwrap();
        assert_eq!(pipe_b.recv_timeout(TIMEOUT).await.unwrap().payload(), b"hello");
        pipe_b.write_bytes(b"hellohello").unwrap();
        assert_eq!(
            pipe_a.recv_timeout(TIMEOUT).await.unwrap().payload(),
            b"hellohello"
        );

        a.shut_down();
        b.shut_down();
    }

    #[tokio::test]
    async fn test_run_remote_endpoint_rendezvous() {
        let io = IoContext::new("registry-test").unwrap();
        let (a, b) = connected(&io);
        a.start().unwrap();
        b.start().unwrap();

        let _bootstrap = a.attach_pipe(0).unwrap();
        let pipe_a = a.attach_pipe(7).unwrap();
        let pipe_b = b.attach_pipe(7).unwrap();
        assert!(matches!(
            pipe_a.write_bytes(b"early"),
            Err(Error::EndpointNotRunning(_))
        ));

        assert!(b.run_endpoint(pipe_b.id(), pipe_a.id()));
        b.run_remote_endpoint(pipe_b.id(), pipe_a.id()).unwrap();
        eventually(|| a.remote_id(pipe_a.id()) == Some(pipe_b.id())).await;

        pipe_a.write_bytes(b"ping").unwrap();
        assert_eq!(pipe_b.recv_timeout(TIMEOUT).await.unwrap().payload(), b"ping");

        a.shut_down();
        b.shut_down();
    }

    #[tokio::test]
    async fn test_two_phase_detach() {
        let io = IoContext::new("registry-test").unwrap();
        let (a, b) = connected(&io);
        let pipe_a = a.attach_pipe(0).unwrap();
        let pipe_b = b.attach_pipe(0).unwrap();
        a.run_endpoint(pipe_a.id(), pipe_b.id());
        b.run_endpoint(pipe_b.id(), pipe_a.id());
        a.start().unwrap();
        b.start().unwrap();

        let id_a = pipe_a.id();
        let id_b = pipe_b.id();
        pipe_a.close();
        assert!(matches!(
            a.endpoint_state(id_a),
            Some(EndpointState::WaitRemoteRemoveAck) | None
        ));
        assert!(matches!(
            a.write(id_a, Message::from_payload(MessageType::Normal, b"late").unwrap()),
            Err(Error::EndpointNotRunning(_) | Error::UnknownEndpoint(_))
        ));

        assert!(matches!(
            pipe_b.recv_timeout(TIMEOUT).await,
            Err(Error::PeerClosed)
        ));
        // the id stays reserved until the owner lets go
        assert_eq!(b.endpoint_state(id_b), Some(EndpointState::WaitLocalDetach));
        assert!(matches!(pipe_b.write_bytes(b"late"), Err(Error::PeerClosed)));

        drop(pipe_b);
        assert_eq!(b.endpoint_count(), 0);
        eventually(|| a.endpoint_count() == 0).await;

        // a fresh attach does not reuse the released id immediately
        let next = a.attach_pipe(0).unwrap();
        assert_eq!(next.id(), EndpointId::new(2));

        a.shut_down();
        b.shut_down();
    }

    #[tokio::test]
    async fn test_forced_remove() {
        let io = IoContext::new("registry-test").unwrap();
        let (a, b) = connected(&io);
        let pipe_a = a.attach_pipe(0).unwrap();
        let pipe_b = b.attach_pipe(0).unwrap();
        a.run_endpoint(pipe_a.id(), pipe_b.id());
        b.run_endpoint(pipe_b.id(), pipe_a.id());
        a.start().unwrap();
        b.start().unwrap();

        a.remove_endpoint(pipe_a.id()).unwrap();
        assert!(matches!(
            pipe_a.recv_timeout(TIMEOUT).await,
            Err(Error::PeerClosed)
        ));
        assert!(matches!(
            pipe_b.recv_timeout(TIMEOUT).await,
            Err(Error::PeerClosed)
        ));

        drop(pipe_b);
        eventually(|| a.endpoint_state(pipe_a.id()) == Some(EndpointState::WaitLocalDetach)).await;
        drop(pipe_a);
        assert_eq!(a.endpoint_count(), 0);

        a.shut_down();
        b.shut_down();
    }

    #[test]
    fn test_identifier_exhaustion() {
        let io = IoContext::new("registry-test").unwrap();
        let (handle, _peer) = TransportHandle::pair().unwrap();
        let registry = EndpointRegistry::new(
            &io,
            handle,
            ChannelOptions::default(),
            RegistryOptions::builder().max_endpoint_id(2).build().unwrap(),
        )
        .unwrap();

        let first = registry.attach_pipe(0).unwrap();
        let _second = registry.attach_pipe(0).unwrap();
        assert!(matches!(
            registry.attach_pipe(0),
            Err(Error::EndpointIdsExhausted)
        ));

        // the peer may already hold the id of a never-run endpoint
        drop(first);
        assert_eq!(
            registry.endpoint_state(EndpointId::new(1)),
            Some(EndpointState::WaitRemoteRemoveAck)
        );
        assert!(matches!(
            registry.attach_pipe(0),
            Err(Error::EndpointIdsExhausted)
        ));

        registry.shut_down();
        assert_eq!(
            registry.attach_endpoint(Arc::new(Noop), 0),
            EndpointId::INVALID
        );
    }

    async fn running_bootstrap(
        a: &Arc<EndpointRegistry>,
        b: &Arc<EndpointRegistry>,
    ) -> (MessagePipe, MessagePipe) {
        let pipe_a = a.attach_pipe(0).unwrap();
        let pipe_b = b.attach_pipe(0).unwrap();
        a.run_endpoint(pipe_a.id(), pipe_b.id());
        b.run_endpoint(pipe_b.id(), pipe_a.id());
        a.start().unwrap();
        b.start().unwrap();
        (pipe_a, pipe_b)
    }

    #[tokio::test]
    async fn test_run_after_early_detach_is_not_fatal() {
        let io = IoContext::new("registry-test").unwrap();
        let (a, b) = connected(&io);
        let (bootstrap_a, bootstrap_b) = running_bootstrap(&a, &b).await;

        let early = a.attach_pipe(0).unwrap();
        let pipe_b = b.attach_pipe(0).unwrap();
        let early_id = early.id();
        assert!(b.run_endpoint(pipe_b.id(), early_id));
        drop(early);
        assert_eq!(
            a.endpoint_state(early_id),
            Some(EndpointState::WaitRemoteRemoveAck)
        );

        // data and the run request both reach the detached entry
        pipe_b.write_bytes(b"in flight").unwrap();
        b.run_remote_endpoint(pipe_b.id(), early_id).unwrap();
        assert!(matches!(
            pipe_b.recv_timeout(TIMEOUT).await,
            Err(Error::PeerClosed)
        ));
        drop(pipe_b);
        eventually(|| a.endpoint_state(early_id).is_none()).await;
        eventually(|| b.endpoint_count() == 1).await;

        assert!(!a.is_closed());
        assert!(!b.is_closed());
        bootstrap_a.write_bytes(b"still up").unwrap();
        assert_eq!(
            bootstrap_b.recv_timeout(TIMEOUT).await.unwrap().payload(),
            b"still up"
        );

        a.shut_down();
        b.shut_down();
    }

    #[tokio::test]
    async fn test_peer_remove_releases_early_detach() {
        let io = IoContext::new("registry-test").unwrap();
        let (a, b) = connected(&io);
        let (_bootstrap_a, _bootstrap_b) = running_bootstrap(&a, &b).await;

        let early = a.attach_pipe(0).unwrap();
        let pipe_b = b.attach_pipe(0).unwrap();
        let early_id = early.id();
        assert!(b.run_endpoint(pipe_b.id(), early_id));
        drop(early);

        // the peer detaches its side first and a acknowledges
        drop(pipe_b);
        eventually(|| a.endpoint_state(early_id).is_none()).await;
        eventually(|| b.endpoint_count() == 1).await;
        assert!(!a.is_closed());
        assert!(!b.is_closed());

        a.shut_down();
        b.shut_down();
    }

    struct Noop;

    impl Endpoint for Noop {
        fn on_message(&self, _port: u32, _message: Message) {}
        fn on_peer_closed(&self, _port: u32) {}
    }

    #[tokio::test]
    async fn test_unknown_destination_is_fatal() {
        let io = IoContext::new("registry-test").unwrap();
        let (local, mut remote) = UnixStream::pair().unwrap();
        let registry = registry(&io, TransportHandle::from(local));

        let (tx, rx) = smol::channel::unbounded();
        registry.set_error_handler(move |error| {
            let _ = tx.try_send(error.to_string());
        });
        let pipe = registry.attach_pipe(0).unwrap();
        registry.run_endpoint(pipe.id(), EndpointId::BOOTSTRAP);
        registry.start().unwrap();

        let mut message = Message::from_payload(MessageType::Endpoint, b"stray").unwrap();
        message
            .set_route(Route {
                source: 1,
                destination: 42,
            })
            .unwrap();
        remote.write_all(&message.serialize().0).unwrap();

        let error = futures_lite::future::or(async { rx.recv().await.ok() }, async {
            async_io::Timer::after(TIMEOUT).await;
            None
        })
        .await;
        assert_eq!(error.as_deref(), Some("unknown endpoint 42"));
        assert!(registry.is_closed());
        assert!(matches!(
            pipe.recv_timeout(TIMEOUT).await,
            Err(Error::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn test_normal_message_is_fatal() {
        let io = IoContext::new("registry-test").unwrap();
        let (local, mut remote) = UnixStream::pair().unwrap();
        let registry = registry(&io, TransportHandle::from(local));
        registry.start().unwrap();

        let message = Message::from_payload(MessageType::Normal, b"plain").unwrap();
        remote.write_all(&message.serialize().0).unwrap();

        eventually(|| registry.is_closed()).await;
    }

    #[test]
    fn test_write_control_type_rejected() {
        let io = IoContext::new("registry-test").unwrap();
        let (a, _b) = connected(&io);
        let pipe = a.attach_pipe(0).unwrap();
        let message = Message::from_payload(MessageType::EndpointControl, b"x").unwrap();
        assert!(matches!(
            a.write(pipe.id(), message),
            Err(Error::UnexpectedMessageType(MessageType::EndpointControl))
        ));
        a.shut_down();
    }
}
