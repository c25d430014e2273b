//! Message framing
//!
//! Wire format (all integers little-endian):
//! ```text
//! Header (16 bytes):
//!   [4 bytes: total length (u32)]        header + extra header + payload
//!   [2 bytes: header length (u16)]       16 + extra header size
//!   [2 bytes: handle count (u16)]
//!   [2 bytes: message type (u16)]
//!   [6 bytes: reserved, zero]
//!
//! Extra header (header length - 16 bytes):
//!   [8 bytes: route (u32 source, u32 destination)]   routed types only
//!   [4 bytes per reserved handle slot: record kind (u32)]
//!   padded to a multiple of 8 bytes
//!
//! Payload (total length - header length bytes)
//! ```
//!
//! Handle records describe how each attached handle travels: descriptors go
//! as ancillary data next to the frame bytes, invalid slots exist only as a
//! record. Slots reserved past the handle count are zero and ignored, which
//! lets a sender reserve more room than it ends up using.

use std::fmt;
use std::os::fd::OwnedFd;

use thiserror::Error;

use crate::handle::PlatformHandle;

/// Size of the fixed header
pub const HEADER_SIZE: usize = 16;

const ROUTE_SIZE: usize = 8;
const HANDLE_RECORD_SIZE: usize = 4;

const TOTAL_LENGTH_OFFSET: usize = 0;
const HEADER_LENGTH_OFFSET: usize = 4;
const HANDLE_COUNT_OFFSET: usize = 6;
const MESSAGE_TYPE_OFFSET: usize = 8;

/// Errors produced while validating a frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("frame of {0} bytes is shorter than the 16-byte header")]
    Truncated(usize),

    #[error("header length {0} is smaller than the fixed header")]
    HeaderTooShort(u16),

    #[error("header length {header_length} exceeds total length {total_length}")]
    HeaderExceedsTotal { header_length: u16, total_length: u32 },

    #[error("declared length {declared} exceeds the {available} bytes received")]
    LengthMismatch { declared: usize, available: usize },

    #[error("unknown message type {0}")]
    UnknownType(u16),

    #[error("extra header of {available} bytes cannot hold {needed} bytes of records")]
    ExtraHeaderTooSmall { needed: usize, available: usize },

    #[error("unknown handle record kind {0}")]
    UnknownHandleKind(u32),

    #[error("message of {size} bytes exceeds the {max}-byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("{count} handles exceed the limit of {max}")]
    TooManyHandles { count: usize, max: usize },

    #[error("{0:?} messages carry no route")]
    NotRouted(MessageType),

    #[error("{count} descriptors arrived with no frame to claim them")]
    StrayHandles { count: usize },
}

/// Message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Plain channel message
    Normal = 0,
    /// Application data for a multiplexed endpoint
    Endpoint = 1,
    /// Registry control message
    EndpointControl = 2,
}

impl MessageType {
    /// Whether messages of this type carry a route record
    pub fn is_routed(self) -> bool {
        !matches!(self, MessageType::Normal)
    }

    fn route_size(self) -> usize {
        if self.is_routed() { ROUTE_SIZE } else { 0 }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = MessageError;

    fn try_from(value: u16) -> Result<Self, MessageError> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Endpoint),
            2 => Ok(Self::EndpointControl),
            other => Err(MessageError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum HandleKind {
    Null = 0,
    Inline = 1,
}

impl TryFrom<u32> for HandleKind {
    type Error = MessageError;

    fn try_from(value: u32) -> Result<Self, MessageError> {
        match value {
            0 => Ok(Self::Null),
            1 => Ok(Self::Inline),
            other => Err(MessageError::UnknownHandleKind(other)),
        }
    }
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub total_length: u32,
    pub header_length: u16,
    pub handle_count: u16,
    pub message_type: u16,
}

impl Header {
    /// Decode the fixed header from the front of `bytes`
    ///
    /// Returns `None` when fewer than [`HEADER_SIZE`] bytes are available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            total_length: read_u32(bytes, TOTAL_LENGTH_OFFSET),
            header_length: read_u16(bytes, HEADER_LENGTH_OFFSET),
            handle_count: read_u16(bytes, HANDLE_COUNT_OFFSET),
            message_type: read_u16(bytes, MESSAGE_TYPE_OFFSET),
        })
    }

    /// Check the length fields against each other
    pub fn validate(&self) -> Result<(), MessageError> {
        if (self.header_length as usize) < HEADER_SIZE {
            return Err(MessageError::HeaderTooShort(self.header_length));
        }
        if self.header_length as u32 > self.total_length {
            return Err(MessageError::HeaderExceedsTotal {
                header_length: self.header_length,
                total_length: self.total_length,
            });
        }
        Ok(())
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[TOTAL_LENGTH_OFFSET..TOTAL_LENGTH_OFFSET + 4]
            .copy_from_slice(&self.total_length.to_le_bytes());
        buf[HEADER_LENGTH_OFFSET..HEADER_LENGTH_OFFSET + 2]
            .copy_from_slice(&self.header_length.to_le_bytes());
        buf[HANDLE_COUNT_OFFSET..HANDLE_COUNT_OFFSET + 2]
            .copy_from_slice(&self.handle_count.to_le_bytes());
        buf[MESSAGE_TYPE_OFFSET..MESSAGE_TYPE_OFFSET + 2]
            .copy_from_slice(&self.message_type.to_le_bytes());
        buf[MESSAGE_TYPE_OFFSET + 2..HEADER_SIZE].fill(0);
    }
}

/// Source and destination endpoint identifiers of a routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Route {
    pub source: u32,
    pub destination: u32,
}

/// One framed unit of data plus attached handles
pub struct Message {
    /// Serialized frame: header, extra header, payload
    data: Vec<u8>,
    handles: Vec<PlatformHandle>,
}

impl Message {
    /// Allocate a message with room for `payload_size` bytes and up to
    /// `max_handles` attached handles
    pub fn new(
        payload_size: usize,
        max_handles: usize,
        message_type: MessageType,
    ) -> Result<Self, MessageError> {
        let header_length = max_handles
            .checked_mul(HANDLE_RECORD_SIZE)
            .and_then(align8)
            .and_then(|records| records.checked_add(HEADER_SIZE + message_type.route_size()))
            .ok_or(MessageError::TooManyHandles {
                count: max_handles,
                max: max_handle_slots(message_type),
            })?;
        if header_length > u16::MAX as usize {
            return Err(MessageError::TooManyHandles {
                count: max_handles,
                max: max_handle_slots(message_type),
            });
        }
        let total_length = header_length
            .checked_add(payload_size)
            .filter(|total| *total <= u32::MAX as usize)
            .ok_or(MessageError::TooLarge {
                size: payload_size,
                max: u32::MAX as usize - header_length,
            })?;

        let mut data = vec![0u8; total_length];
        Header {
            total_length: total_length as u32,
            header_length: header_length as u16,
            handle_count: 0,
            message_type: message_type as u16,
        }
        .write_to(&mut data);

        Ok(Self {
            data,
            handles: Vec::new(),
        })
    }

    /// Allocate a message holding a copy of `payload`
    pub fn from_payload(message_type: MessageType, payload: &[u8]) -> Result<Self, MessageError> {
        let mut message = Self::new(payload.len(), 0, message_type)?;
        message.payload_mut().copy_from_slice(payload);
        Ok(message)
    }

    /// Rebuild a message from received frame bytes
    ///
    /// Only the first `total_length` bytes are used. Handles that travel out
    /// of band are not part of `bytes`; the channel attaches them afterwards.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, MessageError> {
        let header = Header::parse(bytes).ok_or(MessageError::Truncated(bytes.len()))?;
        header.validate()?;

        let total_length = header.total_length as usize;
        if total_length > bytes.len() {
            return Err(MessageError::LengthMismatch {
                declared: total_length,
                available: bytes.len(),
            });
        }

        let message_type = MessageType::try_from(header.message_type)?;
        let available = header.header_length as usize - HEADER_SIZE;
        let needed = message_type.route_size() + header.handle_count as usize * HANDLE_RECORD_SIZE;
        if needed > available {
            return Err(MessageError::ExtraHeaderTooSmall { needed, available });
        }

        let message = Self {
            data: bytes[..total_length].to_vec(),
            handles: Vec::new(),
        };
        for index in 0..header.handle_count as usize {
            message.handle_kind(index)?;
        }
        Ok(message)
    }

    /// Size of the frame starting at the front of `bytes`
    ///
    /// Returns `None` until a whole fixed header is available, and an error
    /// when that header is inconsistent.
    pub fn peek_size(bytes: &[u8]) -> Option<Result<usize, MessageError>> {
        let header = Header::parse(bytes)?;
        Some(header.validate().map(|()| header.total_length as usize))
    }

    pub fn header(&self) -> Header {
        // The buffer always starts with a complete header.
        Header::parse(&self.data).unwrap_or(Header {
            total_length: 0,
            header_length: 0,
            handle_count: 0,
            message_type: 0,
        })
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::try_from(read_u16(&self.data, MESSAGE_TYPE_OFFSET)).unwrap_or(MessageType::Normal)
    }

    fn header_length(&self) -> usize {
        read_u16(&self.data, HEADER_LENGTH_OFFSET) as usize
    }

    /// Number of handles declared by the header
    pub fn handle_count(&self) -> usize {
        read_u16(&self.data, HANDLE_COUNT_OFFSET) as usize
    }

    pub fn has_handles(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Serialized frame bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn extra_header(&self) -> &[u8] {
        &self.data[HEADER_SIZE..self.header_length()]
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_length()..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.header_length();
        &mut self.data[start..]
    }

    pub fn route(&self) -> Result<Route, MessageError> {
        let message_type = self.message_type();
        if !message_type.is_routed() {
            return Err(MessageError::NotRouted(message_type));
        }
        Ok(Route {
            source: read_u32(&self.data, HEADER_SIZE),
            destination: read_u32(&self.data, HEADER_SIZE + 4),
        })
    }

    pub fn set_route(&mut self, route: Route) -> Result<(), MessageError> {
        let message_type = self.message_type();
        if !message_type.is_routed() {
            return Err(MessageError::NotRouted(message_type));
        }
        self.data[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&route.source.to_le_bytes());
        self.data[HEADER_SIZE + 4..HEADER_SIZE + 8]
            .copy_from_slice(&route.destination.to_le_bytes());
        Ok(())
    }

    /// Number of handle slots reserved in the extra header
    pub fn max_handles(&self) -> usize {
        let records = self.header_length() - HEADER_SIZE - self.message_type().route_size();
        (records / HANDLE_RECORD_SIZE).min(u16::MAX as usize)
    }

    /// Attach handles, replacing any attached before
    pub fn set_handles(&mut self, handles: Vec<PlatformHandle>) -> Result<(), MessageError> {
        let max = self.max_handles();
        if handles.len() > max {
            return Err(MessageError::TooManyHandles {
                count: handles.len(),
                max,
            });
        }
        write_u16(&mut self.data, HANDLE_COUNT_OFFSET, handles.len() as u16);
        self.handles = handles;
        Ok(())
    }

    pub fn handles(&self) -> &[PlatformHandle] {
        &self.handles
    }

    /// Take ownership of the attached handles
    ///
    /// The header's handle count drops to 0, so writing the message afterwards
    /// sends none. A second call returns an empty list.
    pub fn take_handles(&mut self) -> Vec<PlatformHandle> {
        write_u16(&mut self.data, HANDLE_COUNT_OFFSET, 0);
        std::mem::take(&mut self.handles)
    }

    /// Take the descriptors that travel as ancillary data
    ///
    /// Writes one record per attached handle into the extra header: valid
    /// handles are marked inline and returned in order, invalid slots are
    /// encoded only in the record table.
    pub fn take_handles_for_transport(&mut self) -> Vec<OwnedFd> {
        let handles = std::mem::take(&mut self.handles);
        let mut fds = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let kind = match handle.into_fd() {
                Some(fd) => {
                    fds.push(fd);
                    HandleKind::Inline
                }
                None => HandleKind::Null,
            };
            let offset = self.record_offset(index);
            write_u32(&mut self.data, offset, kind as u32);
        }
        fds
    }

    /// Number of descriptors this message expects as ancillary data
    pub(crate) fn inline_handle_count(&self) -> usize {
        (0..self.handle_count())
            .filter(|index| matches!(self.handle_kind(*index), Ok(HandleKind::Inline)))
            .count()
    }

    /// Rebuild the handle list from received descriptors
    ///
    /// `fds` must hold exactly [`inline_handle_count`](Self::inline_handle_count)
    /// descriptors, in arrival order.
    pub(crate) fn restore_handles(&mut self, fds: Vec<OwnedFd>) {
        let mut fds = fds.into_iter();
        let handles: Vec<PlatformHandle> = (0..self.handle_count())
            .map(|index| match self.handle_kind(index) {
                Ok(HandleKind::Inline) => fds.next().map(PlatformHandle::from).unwrap_or_default(),
                _ => PlatformHandle::invalid(),
            })
            .collect();
        self.handles = handles;
    }

    /// Consume the message into frame bytes and the descriptors to send with them
    pub(crate) fn serialize(mut self) -> (Vec<u8>, Vec<OwnedFd>) {
        let fds = self.take_handles_for_transport();
        (self.data, fds)
    }

    /// Re-frame as an endpoint message, keeping payload and handles
    pub(crate) fn into_routed(mut self) -> Result<Self, MessageError> {
        if self.message_type().is_routed() {
            return Ok(self);
        }
        let handles = self.take_handles();
        let mut routed = Self::new(self.payload().len(), handles.len(), MessageType::Endpoint)?;
        routed.payload_mut().copy_from_slice(self.payload());
        routed.set_handles(handles)?;
        Ok(routed)
    }

    fn record_offset(&self, index: usize) -> usize {
        HEADER_SIZE + self.message_type().route_size() + index * HANDLE_RECORD_SIZE
    }

    fn handle_kind(&self, index: usize) -> Result<HandleKind, MessageError> {
        HandleKind::try_from(read_u32(&self.data, self.record_offset(index)))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.message_type())
            .field("payload_len", &self.payload().len())
            .field("handle_count", &self.handle_count())
            .finish()
    }
}

fn max_handle_slots(message_type: MessageType) -> usize {
    (u16::MAX as usize - HEADER_SIZE - message_type.route_size()) / HANDLE_RECORD_SIZE
}

fn align8(value: usize) -> Option<usize> {
    value.checked_add(7).map(|v| v & !7)
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
