//! Owned OS handles
//!
//! [`TransportHandle`] is the duplex endpoint a channel runs over.
//! [`PlatformHandle`] is a single handle attached to a message; it may be an
//! explicitly invalid slot.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// One end of a connected duplex transport (a Unix stream socket)
///
/// Ownership moves into the [`Channel`](crate::Channel) that runs over it;
/// the descriptor is closed exactly once, when that channel shuts down,
/// unless the channel was asked to leak it.
#[derive(Debug)]
pub struct TransportHandle {
    fd: OwnedFd,
}

impl TransportHandle {
    /// Create a connected pair of transport handles
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from(a), Self::from(b)))
    }

    pub(crate) fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }
}

impl From<UnixStream> for TransportHandle {
    fn from(stream: UnixStream) -> Self {
        Self {
            fd: OwnedFd::from(stream),
        }
    }
}

impl From<OwnedFd> for TransportHandle {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for TransportHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for TransportHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for TransportHandle {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl FromRawFd for TransportHandle {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }
}

/// A handle attached to a message
///
/// Invalid slots are legal: they keep their position in the handle list but
/// travel as a record in the message's extra header instead of as ancillary
/// data.
#[derive(Debug, Default)]
pub struct PlatformHandle {
    fd: Option<OwnedFd>,
}

impl PlatformHandle {
    /// An invalid (null) handle slot
    pub fn invalid() -> Self {
        Self { fd: None }
    }

    pub fn is_valid(&self) -> bool {
        self.fd.is_some()
    }

    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    pub fn into_fd(self) -> Option<OwnedFd> {
        self.fd
    }

    /// Convert into a `File`, for handles that refer to files
    pub fn into_file(self) -> Option<File> {
        self.fd.map(File::from)
    }
}

impl From<OwnedFd> for PlatformHandle {
    fn from(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }
}

impl From<File> for PlatformHandle {
    fn from(file: File) -> Self {
        Self::from(OwnedFd::from(file))
    }
}

impl From<UnixStream> for PlatformHandle {
    fn from(stream: UnixStream) -> Self {
        Self::from(OwnedFd::from(stream))
    }
}

impl From<TransportHandle> for PlatformHandle {
    fn from(handle: TransportHandle) -> Self {
        Self::from(handle.into_owned_fd())
    }
}
