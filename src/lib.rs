//! Tether - message channels between cooperating processes
//!
//! This library moves framed messages, with attached file descriptors,
//! between processes over a connected Unix stream socket. It is layered:
//!
//! - [`Message`] - the wire frame: a 16-byte header, an extra header holding
//!   the route and handle records, and the payload
//! - [`Channel`] - one transport driven by an [`IoContext`] thread, reporting
//!   to a [`Delegate`]
//! - [`EndpointRegistry`] - many logical endpoints multiplexed over one
//!   channel, with two-phase removal
//! - [`IpcSupport`] - the parent/child handshake that pairs pipes by token
//!
//! # Example
//!
//! ```rust,ignore
//! use tether::{IpcSupport, SupportOptions, TransportHandle, generate_random_token};
//!
//! async fn talk_to_child() -> tether::Result<()> {
//!     let support = IpcSupport::new(SupportOptions::default())?;
//!     let (ours, theirs) = TransportHandle::pair()?;
//!
//!     let mut command = std::process::Command::new("my-child");
//!     tether::prepare_child_command(&mut command, &theirs);
//!     let token = generate_random_token();
//!     command.arg(&token);
//!     let child = command.spawn()?;
//!     drop(theirs);
//!
//!     let pending = support.create_parent_side(token, "child");
//!     support.connect_to_child("child", ours)?;
//!     let watcher = support.watch_child("child", child);
//!
//!     let pipe = pending.wait().await?;
//!     pipe.write_bytes(b"hello")?;
//!     let reply = pipe.recv().await?;
//!     println!("child said {}", String::from_utf8_lossy(reply.payload()));
//!
//!     drop(pipe);
//!     watcher.await?;
//!     Ok(())
//! }
//! ```
//!
//! # Channels without a registry
//!
//! A bare [`Channel`] carries [`MessageType::Normal`] frames to any
//! [`Delegate`]; [`MessageQueue`] collects them for async or blocking
//! consumers:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether::{Channel, ChannelOptions, IoContext, MessageQueue, TransportHandle};
//!
//! fn open(handle: TransportHandle) -> tether::Result<()> {
//!     let io = IoContext::new("io")?;
//!     let queue = Arc::new(MessageQueue::new());
//!     let channel = Channel::new(&io, handle, queue.clone(), ChannelOptions::default())?;
//!     channel.start()?;
//!     while let Some(event) = queue.recv_blocking() {
//!         println!("{event:?}");
//!     }
//!     channel.shut_down();
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("tether only supports Unix platforms");

mod bootstrap;
mod channel;
mod config;
mod error;
mod handle;
mod message;
mod platform;
mod registry;
mod sync;

// Re-export public types
pub use bootstrap::{
    BOOTSTRAP_FD_ENV, IpcSupport, PendingEndpoint, generate_random_token, prepare_child_command,
};
pub use channel::{Channel, ChannelError, ChannelEvent, Delegate, IoContext, MessageQueue};
pub use config::{
    ChannelOptions, ChannelOptionsBuilder, DEFAULT_MAX_HANDLES, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_READ_CHUNK_SIZE, RegistryOptions, RegistryOptionsBuilder, SupportOptions,
    SupportOptionsBuilder,
};
pub use error::{Error, Result};
pub use handle::{PlatformHandle, TransportHandle};
pub use message::{HEADER_SIZE, Header, Message, MessageError, MessageType, Route};
pub use registry::{
    Endpoint, EndpointId, EndpointRegistry, EndpointState, MessagePipe, RemovalEvent,
};
