use std::io;
use thiserror::Error;

use crate::channel::ChannelError;
use crate::message::{MessageError, MessageType};
use crate::registry::{EndpointId, EndpointState, RemovalEvent};

/// Result type for channel, registry and bootstrap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tether message layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("channel has not been started")]
    ChannelNotStarted,

    #[error("channel was already started")]
    ChannelAlreadyStarted,

    #[error("channel has been shut down")]
    ChannelShutDown,

    #[error("channel write side has failed")]
    WriteClosed,

    #[error("I/O context has stopped")]
    IoContextStopped,

    #[error("invalid message: {0}")]
    Message(#[from] MessageError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("unexpected {0:?} message on a multiplexed channel")]
    UnexpectedMessageType(MessageType),

    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),

    #[error("endpoint {0} is not running")]
    EndpointNotRunning(EndpointId),

    #[error("endpoint identifier space exhausted")]
    EndpointIdsExhausted,

    #[error("endpoint {id} cannot handle {event:?} in state {state:?}")]
    InvalidTransition {
        id: EndpointId,
        state: EndpointState,
        event: RemovalEvent,
    },

    #[error("peer closed the endpoint")]
    PeerClosed,

    #[error("peer process exited before the handshake completed")]
    PeerProcessExited,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
