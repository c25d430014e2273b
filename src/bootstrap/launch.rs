//! Handing the bootstrap transport to a child process
//!
//! The parent keeps one end of a [`TransportHandle::pair`] and lets the child
//! inherit the other. The descriptor number travels in
//! [`BOOTSTRAP_FD_ENV`].

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::handle::TransportHandle;
use crate::platform::unix::set_cloexec;

/// Environment variable holding the inherited descriptor number
pub const BOOTSTRAP_FD_ENV: &str = "TETHER_BOOTSTRAP_FD";

static RECOVERED: AtomicBool = AtomicBool::new(false);

/// Make `handle` inheritable by the process `command` spawns
///
/// The parent should drop its copy of `handle` once the child is running.
pub fn prepare_child_command(command: &mut Command, handle: &TransportHandle) {
    let fd = handle.as_raw_fd();
    command.env(BOOTSTRAP_FD_ENV, fd.to_string());
    let inherit = move || set_cloexec(fd, false);
    // SAFETY: the hook only calls fcntl, which is async-signal-safe.
    unsafe {
        command.pre_exec(inherit);
    }
}

impl TransportHandle {
    /// Recover the transport a parent passed with [`prepare_child_command`]
    ///
    /// Succeeds at most once per process; the descriptor is marked
    /// close-on-exec again so it does not leak into grandchildren.
    pub fn from_parent_process() -> Result<Self> {
        let value = std::env::var(BOOTSTRAP_FD_ENV)
            .map_err(|_| Error::Config(format!("{BOOTSTRAP_FD_ENV} is not set")))?;
        let fd: RawFd = value
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{BOOTSTRAP_FD_ENV} is not a descriptor: {value}")))?;
        if fd < 0 {
            return Err(Error::Config(format!("{BOOTSTRAP_FD_ENV} is negative: {fd}")));
        }
        if RECOVERED.swap(true, Ordering::AcqRel) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "bootstrap transport already recovered",
            )));
        }
        set_cloexec(fd, true)?;
        tracing::debug!(fd, "bootstrap: recovered transport from parent");
        // SAFETY: the parent handed this descriptor to us and the flag above
        // guarantees it is adopted only once.
        Ok(unsafe { TransportHandle::from_raw_fd(fd) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_child_command_exports_descriptor() {
        let (handle, _peer) = TransportHandle::pair().unwrap();
        let mut command = Command::new("true");
        prepare_child_command(&mut command, &handle);

        let exported = command
            .get_envs()
            .find(|(key, _)| *key == BOOTSTRAP_FD_ENV)
            .and_then(|(_, value)| value)
            .and_then(|value| value.to_str())
            .map(str::to_owned);
        assert_eq!(exported, Some(handle.as_raw_fd().to_string()));
    }

    #[test]
    fn test_child_inherits_descriptor() {
        let (handle, _peer) = TransportHandle::pair().unwrap();
        let mut command = Command::new("sh");
        command.arg("-c").arg(format!(
            "test -S /dev/fd/${BOOTSTRAP_FD_ENV} || test -e /proc/self/fd/${BOOTSTRAP_FD_ENV}"
        ));
        prepare_child_command(&mut command, &handle);
        assert!(command.status().unwrap().success());
    }
}
