//! Message channel over one duplex transport
//!
//! A [`Channel`] owns a [`TransportHandle`], frames outgoing [`Message`]s onto
//! it and turns incoming bytes back into messages for its [`Delegate`]. All
//! transport I/O and every delegate callback run on the channel's
//! [`IoContext`] thread; [`Channel::write`] may be called from any thread.
//!
//! ```text
//! Created --start()--> Started --shut_down()--> ShutDown
//!    \_____________________shut_down()_________/
//! ```

mod delegate;
mod io_context;
mod reader;

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use polling::Event;

pub use delegate::{ChannelError, ChannelEvent, Delegate, MessageQueue};
pub use io_context::IoContext;
pub(crate) use io_context::IoShared;

use crate::config::ChannelOptions;
use crate::error::{Error, Result};
use crate::handle::TransportHandle;
use crate::message::{Message, MessageError};
use crate::platform::{NativeTransport, Transport};
use crate::sync::lock;
use reader::ReadBuffer;

/// Reads performed per readiness event before yielding to other sources
const MAX_READS_PER_EVENT: usize = 16;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    ShutDown,
}

struct State {
    phase: Phase,
    leak_handle: bool,
}

/// A serialized frame waiting to be written
struct Frame {
    data: Vec<u8>,
    /// Sent with the first chunk of `data`, then dropped
    fds: Vec<OwnedFd>,
    offset: usize,
}

#[derive(Default)]
struct WriteQueue {
    frames: VecDeque<Frame>,
    failed: bool,
}

struct ReadState {
    buffer: ReadBuffer,
    failed: bool,
}

/// One live binding between a transport and a delegate
///
/// Create it with [`Channel::new`], [`start`](Channel::start) it, and always
/// call [`shut_down`](Channel::shut_down) before dropping the last
/// reference. The delegate is held until shutdown and released then.
pub struct Channel {
    id: u64,
    key: usize,
    me: Weak<Channel>,
    io: Arc<IoShared>,
    options: ChannelOptions,
    // Lock order: state, writes, transport. Reads take reads, then transport.
    state: Mutex<State>,
    delegate: Mutex<Option<Arc<dyn Delegate>>>,
    reads: Mutex<ReadState>,
    writes: Mutex<WriteQueue>,
    transport: Mutex<Option<OwnedFd>>,
    read_closed: AtomicBool,
    want_writable: AtomicBool,
}

impl Channel {
    /// Bind `handle` to `delegate`; no I/O happens until [`start`](Self::start)
    pub fn new(
        io: &IoContext,
        handle: TransportHandle,
        delegate: Arc<dyn Delegate>,
        options: ChannelOptions,
    ) -> Result<Arc<Self>> {
        let fd = handle.into_owned_fd();
        NativeTransport::prepare(fd.as_fd())?;

        let shared = Arc::clone(io.shared());
        let channel = Arc::new_cyclic(|me| Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            key: shared.next_key(),
            me: me.clone(),
            io: shared,
            options,
            state: Mutex::new(State {
                phase: Phase::Created,
                leak_handle: false,
            }),
            delegate: Mutex::new(Some(delegate)),
            reads: Mutex::new(ReadState {
                buffer: ReadBuffer::default(),
                failed: false,
            }),
            writes: Mutex::new(WriteQueue::default()),
            transport: Mutex::new(Some(fd)),
            read_closed: AtomicBool::new(false),
            want_writable: AtomicBool::new(false),
        });
        tracing::debug!(channel = channel.id, "channel: created");
        Ok(channel)
    }

    /// Identifier used in log output
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Begin reading; delegate callbacks may fire from now on
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match state.phase {
            Phase::Created => {}
            Phase::Started => return Err(Error::ChannelAlreadyStarted),
            Phase::ShutDown => return Err(Error::ChannelShutDown),
        }

        let me = self.me.clone();
        let key = self.key;
        self.io.post(move |io| {
            let Some(channel) = me.upgrade() else { return };
            if channel.is_shut_down() {
                return;
            }
            if let Err(e) = io.register(key, &channel) {
                tracing::warn!(channel = channel.id, error = %e, "channel: failed to register transport");
                channel.fail_read(ChannelError::ReadFailed(e));
            }
        })?;
        state.phase = Phase::Started;
        tracing::debug!(channel = self.id, "channel: started");
        Ok(())
    }

    /// Queue `message` for transmission
    ///
    /// Returns once the message is accepted, not once it is delivered.
    /// Fails without queuing anything unless the channel is started and its
    /// write direction is healthy.
    pub fn write(&self, message: Message) -> Result<()> {
        let size = message.data().len();
        if size > self.options.max_message_size() {
            return Err(MessageError::TooLarge {
                size,
                max: self.options.max_message_size(),
            }
            .into());
        }
        if message.handle_count() > self.options.max_handles() {
            return Err(MessageError::TooManyHandles {
                count: message.handle_count(),
                max: self.options.max_handles(),
            }
            .into());
        }

        let state = lock(&self.state);
        match state.phase {
            Phase::Created => return Err(Error::ChannelNotStarted),
            Phase::ShutDown => return Err(Error::ChannelShutDown),
            Phase::Started => {}
        }
        let mut writes = lock(&self.writes);
        if writes.failed {
            return Err(Error::WriteClosed);
        }

        let idle = writes.frames.is_empty() && !self.want_writable.load(Ordering::Acquire);
        if idle {
            // The flush task needs the write lock, so it cannot run before
            // the frame below is queued.
            let me = self.me.clone();
            self.io.post(move |_| {
                if let Some(channel) = me.upgrade() {
                    channel.flush();
                    channel.rearm();
                }
            })?;
        }

        let (data, fds) = message.serialize();
        tracing::trace!(channel = self.id, bytes = data.len(), fds = fds.len(), "channel: frame queued");
        writes.frames.push_back(Frame {
            data,
            fds,
            offset: 0,
        });
        drop(writes);
        drop(state);
        Ok(())
    }

    /// Leave the transport descriptor open when the channel shuts down
    pub fn leak_handle(&self) {
        lock(&self.state).leak_handle = true;
    }

    /// Stop all I/O and release the transport and delegate
    ///
    /// Frames not yet written are discarded. After this returns no delegate
    /// callback fires again: off the I/O thread it waits for the I/O thread
    /// to finish any callback in progress and tear the channel down; inside a
    /// callback the dispatcher stops as soon as the callback returns.
    /// Calling it again is a no-op.
    pub fn shut_down(&self) {
        {
            let mut state = lock(&self.state);
            if state.phase == Phase::ShutDown {
                return;
            }
            state.phase = Phase::ShutDown;
        }
        tracing::debug!(channel = self.id, "channel: shutting down");

        if self.io.is_current() {
            self.teardown();
            return;
        }

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let me = self.me.clone();
        let key = self.key;
        let posted = self.io.post(move |io| {
            io.forget(key);
            if let Some(channel) = me.upgrade() {
                channel.teardown();
            }
            let _ = done_tx.send(());
        });
        match posted {
            Ok(()) => {
                let _ = done_rx.recv();
            }
            Err(_) => self.teardown(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).phase == Phase::ShutDown
    }

    fn is_started(&self) -> bool {
        lock(&self.state).phase == Phase::Started
    }

    pub(crate) fn with_transport<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> R) -> Option<R> {
        lock(&self.transport).as_ref().map(|fd| f(fd.as_fd()))
    }

    /// Handle a readiness event on the I/O thread
    pub(crate) fn on_ready(&self, readable: bool, writable: bool) {
        if writable {
            self.want_writable.store(false, Ordering::Release);
            self.flush();
        }
        if readable && self.is_started() {
            self.read_ready();
        }
        self.rearm();
    }

    fn read_ready(&self) {
        for _ in 0..MAX_READS_PER_EVENT {
            let result = {
                let mut reads = lock(&self.reads);
                if reads.failed {
                    return;
                }
                let transport = lock(&self.transport);
                let Some(fd) = transport.as_ref() else { return };
                reads.buffer.fill(fd.as_fd(), &self.options)
            };

            match result {
                Ok(0) => {
                    if lock(&self.reads).buffer.has_pending() {
                        tracing::debug!(channel = self.id, "channel: peer closed mid-frame");
                    }
                    self.fail_read(ChannelError::Disconnected);
                    return;
                }
                Ok(n) => {
                    tracing::trace!(channel = self.id, bytes = n, "channel: read");
                    if !self.dispatch_messages() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    self.fail_read(ChannelError::ReadFailed(e));
                    return;
                }
            }
        }
    }

    /// Deliver every complete buffered message
    ///
    /// Returns false once reading should stop.
    fn dispatch_messages(&self) -> bool {
        loop {
            if !self.is_started() {
                return false;
            }
            let next = {
                let mut reads = lock(&self.reads);
                if reads.failed {
                    return false;
                }
                reads.buffer.next_message(&self.options)
            };
            match next {
                Ok(Some(message)) => {
                    let delegate = lock(&self.delegate).clone();
                    let Some(delegate) = delegate else { return false };
                    delegate.on_channel_message(message);
                }
                Ok(None) => return true,
                Err(e) => {
                    tracing::warn!(channel = self.id, error = %e, "channel: malformed message");
                    self.fail_read(ChannelError::MalformedMessage(e));
                    return false;
                }
            }
        }
    }

    /// Write queued frames until the queue drains or the transport is full
    fn flush(&self) {
        let mut writes = lock(&self.writes);
        if writes.failed {
            return;
        }
        let transport = lock(&self.transport);
        let Some(fd) = transport.as_ref() else { return };

        let mut error = None;
        while let Some(frame) = writes.frames.front_mut() {
            let fds: &[OwnedFd] = if frame.offset == 0 { &frame.fds } else { &[] };
            match NativeTransport::send(fd.as_fd(), &frame.data[frame.offset..], fds) {
                Ok(0) => {
                    error = Some(io::Error::from(io::ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => {
                    // The kernel holds its own references once any byte is out.
                    frame.fds.clear();
                    frame.offset += n;
                    tracing::trace!(channel = self.id, bytes = n, "channel: wrote");
                    if frame.offset == frame.data.len() {
                        writes.frames.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.want_writable.store(true, Ordering::Release);
                    return;
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        self.want_writable.store(false, Ordering::Release);

        if let Some(e) = error {
            writes.failed = true;
            let dropped = writes.frames.len();
            writes.frames.clear();
            drop(transport);
            drop(writes);
            tracing::debug!(channel = self.id, error = %e, dropped, "channel: write failed");
            self.report(ChannelError::WriteFailed(e));
        }
    }

    fn fail_read(&self, error: ChannelError) {
        {
            let mut reads = lock(&self.reads);
            if reads.failed {
                return;
            }
            reads.failed = true;
            reads.buffer.clear();
        }
        self.read_closed.store(true, Ordering::Release);
        match &error {
            ChannelError::Disconnected => tracing::debug!(channel = self.id, "channel: peer disconnected"),
            other => tracing::debug!(channel = self.id, error = %other, "channel: read failed"),
        }
        self.report(error);
    }

    fn report(&self, error: ChannelError) {
        if !self.is_started() {
            return;
        }
        let delegate = lock(&self.delegate).clone();
        if let Some(delegate) = delegate {
            delegate.on_channel_error(error);
        }
    }

    /// Re-arm the oneshot poller registration with the current interest
    fn rearm(&self) {
        let readable = !self.read_closed.load(Ordering::Acquire);
        let writable = self.want_writable.load(Ordering::Acquire);
        let event = match (readable, writable) {
            (true, true) => Event::all(self.key),
            (true, false) => Event::readable(self.key),
            (false, true) => Event::writable(self.key),
            (false, false) => Event::none(self.key),
        };
        let result = self.with_transport(|fd| self.io.poller().modify(fd, event));
        if let Some(Err(e)) = result {
            tracing::warn!(channel = self.id, error = %e, "channel: failed to re-arm transport");
        }
    }

    /// Release the transport, queues and delegate
    fn teardown(&self) {
        self.read_closed.store(true, Ordering::Release);
        self.want_writable.store(false, Ordering::Release);
        let leak = lock(&self.state).leak_handle;
        {
            let mut writes = lock(&self.writes);
            writes.failed = true;
            writes.frames.clear();
        }
        {
            let mut reads = lock(&self.reads);
            reads.failed = true;
            reads.buffer.clear();
        }

        let transport = lock(&self.transport).take();
        if let Some(fd) = transport {
            // Not registered yet, or already removed by the I/O loop.
            let _ = self.io.poller().delete(&fd);
            if leak {
                let raw = fd.into_raw_fd();
                tracing::debug!(channel = self.id, fd = raw, "channel: transport leaked");
            }
        }

        let delegate = lock(&self.delegate).take();
        drop(delegate);
        tracing::debug!(channel = self.id, "channel: shut down");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let phase = lock(&self.state).phase;
        if phase != Phase::ShutDown {
            tracing::warn!(channel = self.id, "channel: dropped without shut_down");
            lock(&self.state).phase = Phase::ShutDown;
            self.teardown();
        }
        let key = self.key;
        let _ = self.io.post(move |io| io.forget(key));
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("phase", &lock(&self.state).phase)
            .finish()
    }
}
