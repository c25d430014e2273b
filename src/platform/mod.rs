//! Platform transport backends
//!
//! The channel state machine is platform independent. A backend supplies the
//! two hook points it needs: sending frame bytes with descriptors attached,
//! and receiving bytes while collecting any descriptors that arrived with
//! them. Handle encoding in the extra header is done by
//! [`Message::take_handles_for_transport`](crate::Message::take_handles_for_transport).

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) type NativeTransport = unix::UnixTransport;

/// Internal trait for platform-specific transport backends
pub(crate) trait Transport {
    /// Put a freshly adopted transport descriptor into the mode the channel expects
    fn prepare(fd: BorrowedFd<'_>) -> io::Result<()>;

    /// Send as many of `bytes` as the transport accepts
    ///
    /// `handles` travel with the first byte sent. Returns the number of bytes
    /// written; `WouldBlock` when nothing could be written.
    fn send(fd: BorrowedFd<'_>, bytes: &[u8], handles: &[OwnedFd]) -> io::Result<usize>;

    /// Receive into `buf`, appending any descriptors that arrived to `handles`
    ///
    /// Returns 0 at end of stream.
    fn recv(
        fd: BorrowedFd<'_>,
        buf: &mut [u8],
        handles: &mut Vec<OwnedFd>,
        max_handles: usize,
    ) -> io::Result<usize>;
}
