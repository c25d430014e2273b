//! Incoming byte and descriptor buffering

use std::collections::VecDeque;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use crate::config::ChannelOptions;
use crate::message::{Message, MessageError};
use crate::platform::{NativeTransport, Transport};

/// Bytes received but not yet framed, plus descriptors waiting for their frame
///
/// Descriptors travel with the first bytes of the frame that declares them,
/// so each one is tagged with the stream offset where the read that carried
/// it ended. A descriptor whose read ended at or before the start of the
/// frame being parsed belonged to a frame that is already gone.
#[derive(Default)]
pub(crate) struct ReadBuffer {
    bytes: Vec<u8>,
    /// Stream offset of `bytes[0]`
    offset: u64,
    fds: VecDeque<(u64, OwnedFd)>,
}

impl ReadBuffer {
    /// Receive one chunk from the transport
    ///
    /// Returns the number of bytes read; 0 at end of stream.
    pub(crate) fn fill(&mut self, fd: BorrowedFd<'_>, options: &ChannelOptions) -> io::Result<usize> {
        let start = self.bytes.len();
        self.bytes.resize(start + options.read_chunk_size(), 0);

        let mut received = Vec::new();
        let result = NativeTransport::recv(
            fd,
            &mut self.bytes[start..],
            &mut received,
            options.max_handles(),
        );
        let result = match result {
            Ok(n) => {
                self.bytes.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.bytes.truncate(start);
                Err(e)
            }
        };

        let end = self.end();
        self.fds.extend(received.into_iter().map(|fd| (end, fd)));
        result
    }

    /// Pop the next complete message
    ///
    /// `Ok(None)` means more data is needed: the header or body is incomplete,
    /// or the descriptors the frame declares have not all arrived yet.
    pub(crate) fn next_message(
        &mut self,
        options: &ChannelOptions,
    ) -> Result<Option<Message>, MessageError> {
        if self.fds.len() > options.max_handles() {
            return Err(MessageError::TooManyHandles {
                count: self.fds.len(),
                max: options.max_handles(),
            });
        }
        let stray = self
            .fds
            .iter()
            .take_while(|(arrived, _)| *arrived <= self.offset)
            .count();
        if stray > 0 {
            return Err(MessageError::StrayHandles { count: stray });
        }

        let size = match Message::peek_size(&self.bytes) {
            None => return Ok(None),
            Some(size) => size?,
        };
        if size > options.max_message_size() {
            return Err(MessageError::TooLarge {
                size,
                max: options.max_message_size(),
            });
        }
        if self.bytes.len() < size {
            return Ok(None);
        }

        let mut message = Message::deserialize(&self.bytes[..size])?;
        if message.handle_count() > options.max_handles() {
            return Err(MessageError::TooManyHandles {
                count: message.handle_count(),
                max: options.max_handles(),
            });
        }
        let needed = message.inline_handle_count();
        if self.fds.len() < needed {
            tracing::trace!(
                needed,
                available = self.fds.len(),
                "channel: frame complete, waiting for descriptors"
            );
            return Ok(None);
        }

        self.bytes.drain(..size);
        self.offset += size as u64;
        message.restore_handles(self.fds.drain(..needed).map(|(_, fd)| fd).collect());
        Ok(Some(message))
    }

    /// Whether a partial frame or unclaimed descriptors are buffered
    pub(crate) fn has_pending(&self) -> bool {
        !self.bytes.is_empty() || !self.fds.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.offset = self.end();
        self.bytes = Vec::new();
        self.fds.clear();
    }

    /// Stream offset just past the last byte received
    fn end(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }
}
