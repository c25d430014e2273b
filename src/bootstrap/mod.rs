//! Connecting a parent process and its children
//!
//! [`IpcSupport`] owns the I/O thread and one [`EndpointRegistry`] per
//! connected peer. Pipes are paired by token: the parent calls
//! [`create_parent_side`](IpcSupport::create_parent_side) and the child calls
//! [`create_child_side`](IpcSupport::create_child_side) with the same token,
//! typically passed on the child's command line. Each side gets a
//! [`PendingEndpoint`] that resolves to a connected [`MessagePipe`].
//!
//! The handshake runs over the bootstrap endpoint, which both registries
//! attach first and therefore agree is id 1:
//!
//! ```text
//! parent                                  child
//!   Hello { version, child_token }  ──▶
//!                                   ◀──   HelloAck { version }
//!   Offer { token, endpoint }       ──▶   attach, run against `endpoint`
//!                                   ◀──   RunEndpoint (registry control)
//!   run the offered endpoint
//! ```
//!
//! Offers for tokens the child has not asked for yet are parked until it
//! does.

mod handshake;
mod launch;
mod token;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::io;
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use executor_core::{Executor, Task};
use futures_lite::future;
use smol::channel::{Receiver, Sender};

pub use launch::{BOOTSTRAP_FD_ENV, prepare_child_command};
pub use token::generate_random_token;

use crate::channel::IoContext;
use crate::config::SupportOptions;
use crate::error::{Error, Result};
use crate::handle::TransportHandle;
use crate::message::Message;
use crate::registry::{Endpoint, EndpointId, EndpointRegistry, MessagePipe};
use crate::sync::lock;
use handshake::{Handshake, PROTOCOL_VERSION};

type Resolver = Sender<Result<MessagePipe>>;

fn resolver() -> (Resolver, PendingEndpoint) {
    let (sender, receiver) = smol::channel::bounded(1);
    (sender, PendingEndpoint { receiver })
}

/// Complete a pending endpoint; the first outcome wins
fn resolve(resolver: &Resolver, outcome: Result<MessagePipe>) {
    if resolver.try_send(outcome).is_err() {
        tracing::trace!("bootstrap: pending endpoint already settled");
    }
}

/// A pipe that connects once the other process claims its token
#[derive(Debug)]
pub struct PendingEndpoint {
    receiver: Receiver<Result<MessagePipe>>,
}

impl PendingEndpoint {
    fn rejected(error: Error) -> Self {
        let (sender, pending) = resolver();
        resolve(&sender, Err(error));
        pending
    }

    pub async fn wait(self) -> Result<MessagePipe> {
        self.receiver.recv().await.unwrap_or(Err(Error::PeerClosed))
    }

    /// Like [`wait`](Self::wait), failing with `TimedOut` after `timeout`
    pub async fn wait_timeout(self, timeout: Duration) -> Result<MessagePipe> {
        future::or(self.wait(), async {
            async_io::Timer::after(timeout).await;
            Err(Error::Io(io::ErrorKind::TimedOut.into()))
        })
        .await
    }

    pub fn wait_blocking(self) -> Result<MessagePipe> {
        self.receiver.recv_blocking().unwrap_or(Err(Error::PeerClosed))
    }
}

struct ChildLink {
    registry: Arc<EndpointRegistry>,
    /// Offered to the child and not yet run
    offered: HashMap<String, Resolver>,
}

#[derive(Default)]
struct State {
    closed: bool,
    /// child_token -> token -> resolver, for children not connected yet
    pending_parent: HashMap<String, HashMap<String, Resolver>>,
    children: HashMap<String, ChildLink>,
    exited: HashSet<String>,
    parent: Option<Arc<EndpointRegistry>>,
    pending_child: HashMap<String, Resolver>,
    parked_offers: HashMap<String, EndpointId>,
}

struct Shared {
    options: SupportOptions,
    state: Mutex<State>,
}

impl Shared {
    fn offer(
        self: &Arc<Self>,
        child_token: &str,
        registry: &Arc<EndpointRegistry>,
        token: String,
        resolver: Resolver,
    ) {
        let gone = {
            let mut state = lock(&self.state);
            let exited = state.exited.contains(child_token);
            match state.children.get_mut(child_token) {
                Some(link) => {
                    link.offered.insert(token.clone(), resolver.clone());
                    None
                }
                None if exited => Some(Error::PeerProcessExited),
                None => Some(Error::PeerClosed),
            }
        };
        if let Some(error) = gone {
            resolve(&resolver, Err(error));
            return;
        }

        let shared = Arc::downgrade(self);
        let (child, name) = (child_token.to_owned(), token.clone());
        let hook = move |pipe: MessagePipe| {
            let waiting = shared
                .upgrade()
                .and_then(|shared| shared.take_offered(&child, &name));
            match waiting {
                Some(resolver) => resolve(&resolver, Ok(pipe)),
                None => tracing::debug!(token = %name, "bootstrap: offer withdrawn, dropping pipe"),
            }
        };
        let offered = registry
            .attach_pipe_deferred(0, hook)
            .and_then(|endpoint| {
                tracing::debug!(%token, %endpoint, "bootstrap: offering pipe");
                let message = Handshake::Offer {
                    token: token.clone(),
                    endpoint,
                }
                .to_message()?;
                registry.write(EndpointId::BOOTSTRAP, message)
            });
        if let Err(e) = offered {
            if let Some(resolver) = self.take_offered(child_token, &token) {
                resolve(&resolver, Err(e));
            }
        }
    }

    /// Forget an offer, returning its resolver if it was still waiting
    fn take_offered(&self, child_token: &str, token: &str) -> Option<Resolver> {
        lock(&self.state)
            .children
            .get_mut(child_token)?
            .offered
            .remove(token)
    }

    fn claim(registry: &EndpointRegistry, pipe: Result<MessagePipe>, remote: EndpointId, resolver: &Resolver) {
        let claimed = pipe.and_then(|pipe| {
            if !registry.run_endpoint(pipe.id(), remote) {
                return Err(Error::EndpointNotRunning(pipe.id()));
            }
            registry.run_remote_endpoint(pipe.id(), remote)?;
            Ok(pipe)
        });
        resolve(resolver, claimed);
    }

    fn on_handshake(&self, role: &Role, registry: &Arc<EndpointRegistry>, message: Message) -> Result<()> {
        let handshake = Handshake::from_message(&message)?;
        match (role, handshake) {
            (Role::Child, Handshake::Hello { version, child_token }) => {
                check_version(version)?;
                tracing::debug!(%child_token, "bootstrap: parent said hello");
                let ack = Handshake::HelloAck {
                    version: PROTOCOL_VERSION,
                }
                .to_message()?;
                registry.write(EndpointId::BOOTSTRAP, ack)
            }
            (Role::Child, Handshake::Offer { token, endpoint }) => {
                let waiting = {
                    let mut state = lock(&self.state);
                    let waiting = state.pending_child.remove(&token);
                    if waiting.is_none() {
                        tracing::debug!(%token, "bootstrap: parking offer");
                        state.parked_offers.insert(token, endpoint);
                    }
                    waiting
                };
                if let Some(resolver) = waiting {
                    Self::claim(registry, registry.attach_pipe(0), endpoint, &resolver);
                }
                Ok(())
            }
            (Role::Parent { child_token }, Handshake::HelloAck { version }) => {
                check_version(version)?;
                tracing::debug!(%child_token, "bootstrap: child acknowledged");
                Ok(())
            }
            (_, other) => Err(Error::HandshakeFailed(format!("unexpected {other:?}"))),
        }
    }

    /// Reject everything waiting on the link `role` names and forget it
    fn on_link_closed(&self, role: &Role, error: impl Fn() -> Error) {
        let rejected: Vec<Resolver> = {
            let mut state = lock(&self.state);
            match role {
                Role::Parent { child_token } => {
                    let mut rejected: Vec<Resolver> = state
                        .children
                        .remove(child_token)
                        .map(|link| link.offered.into_values().collect())
                        .unwrap_or_default();
                    if let Some(pending) = state.pending_parent.remove(child_token) {
                        rejected.extend(pending.into_values());
                    }
                    rejected
                }
                Role::Child => {
                    state.parent = None;
                    state.parked_offers.clear();
                    state.pending_child.drain().map(|(_, resolver)| resolver).collect()
                }
            }
        };
        for resolver in rejected {
            resolve(&resolver, Err(error()));
        }
    }

    fn notify_child_exited(&self, child_token: &str) {
        let (link, pending) = {
            let mut state = lock(&self.state);
            state.exited.insert(child_token.to_owned());
            (
                state.children.remove(child_token),
                state.pending_parent.remove(child_token).unwrap_or_default(),
            )
        };
        tracing::debug!(%child_token, "bootstrap: child exited");
        for resolver in pending.into_values() {
            resolve(&resolver, Err(Error::PeerProcessExited));
        }
        if let Some(link) = link {
            for resolver in link.offered.into_values() {
                resolve(&resolver, Err(Error::PeerProcessExited));
            }
            link.registry.shut_down();
        }
    }
}

fn check_version(version: u32) -> Result<()> {
    if version == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(Error::HandshakeFailed(format!(
            "protocol version {version}, expected {PROTOCOL_VERSION}"
        )))
    }
}

#[derive(Debug, Clone)]
enum Role {
    Parent { child_token: String },
    Child,
}

/// Endpoint 1 on every bootstrap registry
struct BootstrapEndpoint {
    shared: Weak<Shared>,
    role: Role,
    registry: OnceLock<Weak<EndpointRegistry>>,
}

impl BootstrapEndpoint {
    fn context(&self) -> Option<(Arc<Shared>, Arc<EndpointRegistry>)> {
        let shared = self.shared.upgrade()?;
        let registry = self.registry.get()?.upgrade()?;
        Some((shared, registry))
    }
}

impl Endpoint for BootstrapEndpoint {
    fn on_message(&self, _port: u32, message: Message) {
        let Some((shared, registry)) = self.context() else {
            return;
        };
        if let Err(e) = shared.on_handshake(&self.role, &registry, message) {
            tracing::error!(role = ?self.role, error = %e, "bootstrap: handshake failed");
            let reason = e.to_string();
            shared.on_link_closed(&self.role, || Error::HandshakeFailed(reason.clone()));
            registry.shut_down();
        }
    }

    fn on_peer_closed(&self, _port: u32) {
        let Some((shared, registry)) = self.context() else {
            return;
        };
        tracing::debug!(role = ?self.role, "bootstrap: link closed");
        shared.on_link_closed(&self.role, || Error::PeerClosed);
        registry.detach_endpoint(EndpointId::BOOTSTRAP, EndpointId::BOOTSTRAP);
    }
}

/// Process-level IPC context
///
/// Create one per process. Dropping it shuts every registry down and stops
/// the I/O thread.
pub struct IpcSupport {
    io: IoContext,
    shared: Arc<Shared>,
}

impl IpcSupport {
    pub fn new(options: SupportOptions) -> Result<Self> {
        let io = IoContext::new(options.io_thread_name())?;
        Ok(Self {
            io,
            shared: Arc::new(Shared {
                options,
                state: Mutex::new(State::default()),
            }),
        })
    }

    pub fn io_context(&self) -> &IoContext {
        &self.io
    }

    /// Connect to a child over `handle` and offer it every pipe pending for
    /// `child_token`
    pub fn connect_to_child(
        &self,
        child_token: impl Into<String>,
        handle: TransportHandle,
    ) -> Result<Arc<EndpointRegistry>> {
        let child_token = child_token.into();
        {
            let state = lock(&self.shared.state);
            if state.closed {
                return Err(Error::ChannelShutDown);
            }
            if state.children.contains_key(&child_token) {
                return Err(Error::HandshakeFailed(format!(
                    "child {child_token} is already connected"
                )));
            }
        }

        let registry = self.bootstrap_registry(
            handle,
            Role::Parent {
                child_token: child_token.clone(),
            },
        )?;
        let hello = Handshake::Hello {
            version: PROTOCOL_VERSION,
            child_token: child_token.clone(),
        }
        .to_message()?;
        if let Err(e) = registry.write(EndpointId::BOOTSTRAP, hello) {
            registry.shut_down();
            return Err(e);
        }

        let pending = {
            let mut state = lock(&self.shared.state);
            state.children.insert(
                child_token.clone(),
                ChildLink {
                    registry: registry.clone(),
                    offered: HashMap::new(),
                },
            );
            state.pending_parent.remove(&child_token).unwrap_or_default()
        };
        tracing::debug!(%child_token, pending = pending.len(), "bootstrap: connected to child");
        for (token, resolver) in pending {
            self.shared.offer(&child_token, &registry, token, resolver);
        }
        Ok(registry)
    }

    /// Connect to the parent over `handle`
    pub fn connect_to_parent(&self, handle: TransportHandle) -> Result<Arc<EndpointRegistry>> {
        {
            let state = lock(&self.shared.state);
            if state.closed {
                return Err(Error::ChannelShutDown);
            }
            if state.parent.is_some() {
                return Err(Error::HandshakeFailed("already connected to a parent".into()));
            }
        }
        let registry = self.bootstrap_registry(handle, Role::Child)?;
        lock(&self.shared.state).parent = Some(registry.clone());
        tracing::debug!("bootstrap: connected to parent");
        Ok(registry)
    }

    /// Parent side of the pipe named `token`, for the child `child_token`
    pub fn create_parent_side(&self, token: impl Into<String>, child_token: &str) -> PendingEndpoint {
        let token = token.into();
        let (resolver, pending) = resolver();
        let registry = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return PendingEndpoint::rejected(Error::ChannelShutDown);
            }
            if state.exited.contains(child_token) {
                return PendingEndpoint::rejected(Error::PeerProcessExited);
            }
            match state.children.get(child_token) {
                Some(link) => link.registry.clone(),
                None => {
                    state
                        .pending_parent
                        .entry(child_token.to_owned())
                        .or_default()
                        .insert(token, resolver);
                    return pending;
                }
            }
        };
        self.shared.offer(child_token, &registry, token, resolver);
        pending
    }

    /// Child side of the pipe named `token`
    pub fn create_child_side(&self, token: impl Into<String>) -> PendingEndpoint {
        let token = token.into();
        let (resolver, pending) = resolver();
        let parked = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return PendingEndpoint::rejected(Error::ChannelShutDown);
            }
            match (state.parked_offers.remove(&token), state.parent.clone()) {
                (Some(endpoint), Some(registry)) => Some((endpoint, registry)),
                _ => {
                    state.pending_child.insert(token, resolver.clone());
                    None
                }
            }
        };
        if let Some((endpoint, registry)) = parked {
            Shared::claim(&registry, registry.attach_pipe(0), endpoint, &resolver);
        }
        pending
    }

    /// Reject everything pending for `child_token` with
    /// [`Error::PeerProcessExited`] and drop its link
    pub fn notify_child_exited(&self, child_token: &str) {
        self.shared.notify_child_exited(child_token);
    }

    /// Wait for `child` to exit, then [`notify_child_exited`](Self::notify_child_exited)
    ///
    /// The wait runs on the blocking thread pool; poll the future on any
    /// executor.
    pub fn watch_child(
        &self,
        child_token: impl Into<String>,
        mut child: Child,
    ) -> impl Future<Output = io::Result<ExitStatus>> + Send + 'static {
        let child_token = child_token.into();
        let shared = Arc::downgrade(&self.shared);
        async move {
            let status = blocking::unblock(move || child.wait()).await;
            if let Some(shared) = shared.upgrade() {
                shared.notify_child_exited(&child_token);
            }
            status
        }
    }

    /// Spawn [`watch_child`](Self::watch_child) on `executor`
    pub fn watch_child_on<E: Executor + Clone + 'static>(
        &self,
        executor: &E,
        child_token: impl Into<String>,
        child: Child,
    ) {
        executor.spawn(self.watch_child(child_token, child)).detach();
    }

    /// Shut down every registry and stop the I/O thread
    ///
    /// Pending endpoints are rejected. Idempotent.
    pub fn shut_down(&self) {
        let (registries, rejected) = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return;
            }
            state.closed = true;
            let mut registries: Vec<Arc<EndpointRegistry>> = Vec::new();
            let mut rejected: Vec<Resolver> = Vec::new();
            for (_, link) in state.children.drain() {
                registries.push(link.registry);
                rejected.extend(link.offered.into_values());
            }
            registries.extend(state.parent.take());
            for (_, pending) in state.pending_parent.drain() {
                rejected.extend(pending.into_values());
            }
            rejected.extend(state.pending_child.drain().map(|(_, resolver)| resolver));
            state.parked_offers.clear();
            (registries, rejected)
        };
        for resolver in rejected {
            resolve(&resolver, Err(Error::ChannelShutDown));
        }
        for registry in registries {
            registry.shut_down();
        }
        self.io.shut_down();
        tracing::debug!("bootstrap: shut down");
    }

    fn bootstrap_registry(&self, handle: TransportHandle, role: Role) -> Result<Arc<EndpointRegistry>> {
        let options = &self.shared.options;
        let registry = EndpointRegistry::new(
            &self.io,
            handle,
            options.channel().clone(),
            options.registry().clone(),
        )?;
        let endpoint = Arc::new(BootstrapEndpoint {
            shared: Arc::downgrade(&self.shared),
            role,
            registry: OnceLock::new(),
        });
        let _ = endpoint.registry.set(Arc::downgrade(&registry));

        let id = registry.attach_endpoint(endpoint, 0);
        if id != EndpointId::BOOTSTRAP {
            registry.shut_down();
            return Err(Error::HandshakeFailed(format!(
                "bootstrap endpoint got id {id}"
            )));
        }
        registry.run_endpoint(id, EndpointId::BOOTSTRAP);
        if let Err(e) = registry.start() {
            registry.shut_down();
            return Err(e);
        }
        Ok(registry)
    }
}

impl Drop for IpcSupport {
    fn drop(&mut self) {
        self.shut_down();
    }
}

impl fmt::Debug for IpcSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("IpcSupport")
            .field("children", &state.children.len())
            .field("has_parent", &state.parent.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn support() -> IpcSupport {
        IpcSupport::new(SupportOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_pipe_claimed_before_offer() {
        let parent = support();
        let child = support();
        let (parent_end, child_end) = TransportHandle::pair().unwrap();
        let token = generate_random_token();

        let parent_side = parent.create_parent_side(token.clone(), "child-a");
        let child_side = child.create_child_side(token.clone());

        child.connect_to_parent(child_end).unwrap();
        parent.connect_to_child("child-a", parent_end).unwrap();

        let parent_pipe = parent_side.wait_timeout(TIMEOUT).await.unwrap();
        let child_pipe = child_side.wait_timeout(TIMEOUT).await.unwrap();

        parent_pipe.write_bytes(b"hello").unwrap();
        assert_eq!(child_pipe.recv_timeout(TIMEOUT).await.unwrap().payload(), b"hello");
        child_pipe.write_bytes(b"hellohello").unwrap();
        assert_eq!(
            parent_pipe.recv_timeout(TIMEOUT).await.unwrap().payload(),
            b"hellohello"
        );
        parent_pipe.write_bytes(b"quitquitquit").unwrap();
        assert_eq!(
            child_pipe.recv_timeout(TIMEOUT).await.unwrap().payload(),
            b"quitquitquit"
        );
    }

    #[tokio::test]
    async fn test_connected_offers_are_forgotten() {
        let parent = support();
        let child = support();
        let (parent_end, child_end) = TransportHandle::pair().unwrap();
        child.connect_to_parent(child_end).unwrap();
        parent.connect_to_child("child-f", parent_end).unwrap();

        for round in 0..50u8 {
            let token = generate_random_token();
            let parent_side = parent.create_parent_side(token.clone(), "child-f");
            let child_side = child.create_child_side(token);
            let parent_pipe = parent_side.wait_timeout(TIMEOUT).await.unwrap();
            let child_pipe = child_side.wait_timeout(TIMEOUT).await.unwrap();
            parent_pipe.write_bytes(&[round]).unwrap();
            assert_eq!(child_pipe.recv_timeout(TIMEOUT).await.unwrap().payload(), [round]);
        }

        let offered = lock(&parent.shared.state)
            .children
            .get("child-f")
            .map(|link| link.offered.len());
        assert_eq!(offered, Some(0));
    }

    #[tokio::test]
    async fn test_offer_parked_until_claimed() {
        let parent = support();
        let child = support();
        let (parent_end, child_end) = TransportHandle::pair().unwrap();

        let child_registry = child.connect_to_parent(child_end).unwrap();
        let parent_registry = parent.connect_to_child("child-b", parent_end).unwrap();
        let parent_side = parent.create_parent_side("late", "child-b");

        // bootstrap plus the offered endpoint
        let deadline = std::time::Instant::now() + TIMEOUT;
        while lock(&child.shared.state).parked_offers.is_empty() {
            assert!(std::time::Instant::now() < deadline, "offer never arrived");
            async_io::Timer::after(Duration::from_millis(5)).await;
        }
        assert_eq!(parent_registry.endpoint_count(), 2);
        assert_eq!(child_registry.endpoint_count(), 1);

        let child_pipe = child.create_child_side("late").wait_timeout(TIMEOUT).await.unwrap();
        let parent_pipe = parent_side.wait_timeout(TIMEOUT).await.unwrap();
        assert_eq!(child_pipe.remote_id(), Some(parent_pipe.id()));
        assert_eq!(parent_pipe.remote_id(), Some(child_pipe.id()));

        child_pipe.write_bytes(b"ready").unwrap();
        assert_eq!(parent_pipe.recv_timeout(TIMEOUT).await.unwrap().payload(), b"ready");
    }

    #[tokio::test]
    async fn test_child_exit_rejects_pending() {
        let parent = support();
        let before = parent.create_parent_side("t1", "child-c");

        parent.notify_child_exited("child-c");
        assert!(matches!(
            before.wait_timeout(TIMEOUT).await,
            Err(Error::PeerProcessExited)
        ));
        assert!(matches!(
            parent.create_parent_side("t2", "child-c").wait_timeout(TIMEOUT).await,
            Err(Error::PeerProcessExited)
        ));
        // other children are unaffected
        let other = parent.create_parent_side("t3", "child-d");
        assert!(other.receiver.is_empty());
    }

    #[tokio::test]
    async fn test_offered_pipe_rejected_on_exit() {
        let parent = support();
        let (parent_end, _child_end) = TransportHandle::pair().unwrap();
        parent.connect_to_child("child-e", parent_end).unwrap();
        let offered = parent.create_parent_side("never-claimed", "child-e");

        parent.notify_child_exited("child-e");
        assert!(matches!(
            offered.wait_timeout(TIMEOUT).await,
            Err(Error::PeerProcessExited)
        ));
    }

    #[tokio::test]
    async fn test_watch_child_notifies() {
        let parent = support();
        let pending = parent.create_parent_side("t", "child-f");
        let child = std::process::Command::new("true").spawn().unwrap();

        let status = parent.watch_child("child-f", child).await.unwrap();
        assert!(status.success());
        assert!(matches!(
            pending.wait_timeout(TIMEOUT).await,
            Err(Error::PeerProcessExited)
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch_fails_handshake() {
        let child = support();
        let io = IoContext::new("fake-parent").unwrap();
        let (parent_end, child_end) = TransportHandle::pair().unwrap();

        let fake = EndpointRegistry::new(
            &io,
            parent_end,
            Default::default(),
            Default::default(),
        )
        .unwrap();
        let bootstrap = fake.attach_pipe(0).unwrap();
        fake.run_endpoint(bootstrap.id(), EndpointId::BOOTSTRAP);
        fake.start().unwrap();

        let pending = child.create_child_side("x");
        child.connect_to_parent(child_end).unwrap();
        let hello = Handshake::Hello {
            version: PROTOCOL_VERSION + 1,
            child_token: "c".into(),
        };
        bootstrap.write(hello.to_message().unwrap()).unwrap();

        assert!(matches!(
            pending.wait_timeout(TIMEOUT).await,
            Err(Error::HandshakeFailed(_))
        ));
        fake.shut_down();
    }

    #[tokio::test]
    async fn test_parent_disconnect_rejects_child_side() {
        let child = support();
        let (parent_end, child_end) = TransportHandle::pair().unwrap();
        child.connect_to_parent(child_end).unwrap();
        let pending = child.create_child_side("y");

        drop(parent_end);
        assert!(matches!(
            pending.wait_timeout(TIMEOUT).await,
            Err(Error::PeerClosed)
        ));
    }

    #[test]
    fn test_shut_down_rejects_everything() {
        let support = support();
        let pending = support.create_child_side("z");
        support.shut_down();
        support.shut_down();
        assert!(matches!(pending.wait_blocking(), Err(Error::ChannelShutDown)));
        assert!(matches!(
            support.create_parent_side("z", "child").wait_blocking(),
            Err(Error::ChannelShutDown)
        ));
    }
}
