//! Unix backend: stream sockets with `SCM_RIGHTS` descriptor passing

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::platform::Transport;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
const RECV_FLAGS: libc::c_int = 0;

pub(crate) struct UnixTransport;

impl Transport for UnixTransport {
    fn prepare(fd: BorrowedFd<'_>) -> io::Result<()> {
        let raw = fd.as_raw_fd();
        // SAFETY: fcntl on a descriptor we borrow for the duration of the call.
        unsafe {
            let flags = libc::fcntl(raw, libc::F_GETFL);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            let enable: libc::c_int = 1;
            // SAFETY: option value points at a live c_int of the declared size.
            let rc = unsafe {
                libc::setsockopt(
                    raw,
                    libc::SOL_SOCKET,
                    libc::SO_NOSIGPIPE,
                    (&enable as *const libc::c_int).cast(),
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn send(fd: BorrowedFd<'_>, bytes: &[u8], handles: &[OwnedFd]) -> io::Result<usize> {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        // SAFETY: an all-zero msghdr is a valid "no name, no control" header.
        let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;

        // u64 storage keeps the control buffer aligned for cmsghdr.
        let mut control: Vec<u64> = Vec::new();
        if !handles.is_empty() {
            let data_len = handles.len() * mem::size_of::<RawFd>();
            // SAFETY: CMSG_SPACE only computes a size.
            let space = unsafe { libc::CMSG_SPACE(data_len as u32) } as usize;
            control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];
            msghdr.msg_control = control.as_mut_ptr().cast();
            msghdr.msg_controllen = space as _;

            // SAFETY: msghdr points at a control buffer of `space` bytes, which
            // CMSG_SPACE sized for exactly one SCM_RIGHTS header plus payload.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msghdr);
                if cmsg.is_null() {
                    return Err(io::Error::other("failed to build cmsg header"));
                }
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for (index, handle) in handles.iter().enumerate() {
                    data.add(index).write_unaligned(handle.as_raw_fd());
                }
            }
        }

        loop {
            // SAFETY: msghdr and everything it points to outlive the call.
            let n = unsafe { libc::sendmsg(fd.as_raw_fd(), &msghdr, SEND_FLAGS) };
            if n >= 0 {
                drop(control);
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn recv(
        fd: BorrowedFd<'_>,
        buf: &mut [u8],
        handles: &mut Vec<OwnedFd>,
        max_handles: usize,
    ) -> io::Result<usize> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let data_len = max_handles.max(1) * mem::size_of::<RawFd>();
        // SAFETY: CMSG_SPACE only computes a size.
        let space = unsafe { libc::CMSG_SPACE(data_len as u32) } as usize;
        let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

        // SAFETY: an all-zero msghdr is a valid starting point.
        let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
        msghdr.msg_control = control.as_mut_ptr().cast();
        msghdr.msg_controllen = space as _;

        let n = loop {
            // SAFETY: msghdr points at live iovec and control buffers.
            let n = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msghdr, RECV_FLAGS) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let received = collect_fds(&msghdr);
        for raw in received {
            // SAFETY: the kernel installed this descriptor for us; nothing
            // else owns it.
            let owned = unsafe { OwnedFd::from_raw_fd(raw) };
            if RECV_FLAGS == 0 {
                set_cloexec(raw, true)?;
            }
            handles.push(owned);
        }

        if msghdr.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ancillary data truncated: peer sent more descriptors than allowed",
            ));
        }

        drop(control);
        Ok(n)
    }
}

fn collect_fds(msghdr: &libc::msghdr) -> Vec<RawFd> {
    let mut out = Vec::new();
    // SAFETY: msghdr points at a control buffer filled in by recvmsg.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let cmsg_len = (*cmsg).cmsg_len as usize;
                let base_len = libc::CMSG_LEN(0) as usize;
                if cmsg_len > base_len {
                    let count = (cmsg_len - base_len) / mem::size_of::<RawFd>();
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    for index in 0..count {
                        out.push(data.add(index).read_unaligned());
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
    out
}

/// Set or clear `FD_CLOEXEC` on `fd`
pub(crate) fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor owned by the caller.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if enabled {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if libc::fcntl(fd, libc::F_SETFD, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_send_recv_with_descriptor() {
        let (a, b) = UnixStream::pair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello").unwrap();
        let fd = OwnedFd::from(file);

        let sent = UnixTransport::send(a.as_fd(), b"frame", std::slice::from_ref(&fd)).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 16];
        let mut handles = Vec::new();
        let n = UnixTransport::recv(b.as_fd(), &mut buf, &mut handles, 4).unwrap();
        assert_eq!(&buf[..n], b"frame");
        assert_eq!(handles.len(), 1);

        let mut received = File::from(handles.pop().unwrap());
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello");
    }

    #[test]
    fn test_send_does_not_close_sender_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        let fd = OwnedFd::from(tempfile::tempfile().unwrap());

        UnixTransport::send(a.as_fd(), b"x", std::slice::from_ref(&fd)).unwrap();
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags, -1, "sender fd unexpectedly closed");

        let mut buf = [0u8; 1];
        let mut handles = Vec::new();
        UnixTransport::recv(b.as_fd(), &mut buf, &mut handles, 1).unwrap();
        assert_eq!(handles.len(), 1);
    }

    #[test]
    fn test_recv_end_of_stream() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);

        let mut buf = [0u8; 8];
        let mut handles = Vec::new();
        assert_eq!(
            UnixTransport::recv(b.as_fd(), &mut buf, &mut handles, 1).unwrap(),
            0
        );
    }

    #[test]
    fn test_prepare_makes_nonblocking() {
        let (_a, b) = UnixStream::pair().unwrap();
        UnixTransport::prepare(b.as_fd()).unwrap();

        let mut buf = [0u8; 8];
        let mut handles = Vec::new();
        let err = UnixTransport::recv(b.as_fd(), &mut buf, &mut handles, 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
