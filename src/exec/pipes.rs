//! Owned channel endpoints between the worker and the compiler child.
//!
//! Every endpoint is an `OwnedFd` so each descriptor is closed exactly once,
//! on whatever path the job takes. Reads and writes retry on EINTR.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::unistd::pipe;

/// Send-buffer size requested on the child's stdin socket. Large enough to
/// absorb a whole preprocessed source in one gulp on most jobs.
const STDIN_SNDBUF_BYTES: usize = 2 * 1024 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The four channels wired up before the compiler child exists.
///
/// Naming is from the parent's point of view: `*_parent` endpoints stay in
/// the worker, `*_child` endpoints are handed to the child at fork time.
pub(crate) struct ChannelSet {
    /// Child stdin: a stream socketpair so a large send buffer can be
    /// requested. The child end becomes fd 0.
    pub stdin_child: OwnedFd,
    pub stdin_parent: PipeFd,
    /// Child stdout pipe; parent end is nonblocking.
    pub stdout_child: OwnedFd,
    pub stdout_parent: PipeFd,
    /// Child stderr pipe; parent end is nonblocking.
    pub stderr_child: OwnedFd,
    pub stderr_parent: PipeFd,
    /// Exec-failure signal: the child end is marked close-on-exec in the
    /// child, so EOF on the parent end means the compiler image is running.
    pub control_child: OwnedFd,
    pub control_parent: OwnedFd,
}

impl ChannelSet {
    pub(crate) fn create() -> io::Result<Self> {
        let (stdout_r, stdout_w) = pipe().map_err(io::Error::from)?;
        let (stderr_r, stderr_w) = pipe().map_err(io::Error::from)?;
        let (control_r, control_w) = pipe().map_err(io::Error::from)?;

        // Parent-facing output ends are drained opportunistically from the
        // completion loop, so they must never block.
        set_nonblocking(&stdout_r)?;
        set_nonblocking(&stderr_r)?;
        set_cloexec(&stdout_r)?;
        set_cloexec(&stderr_r)?;
        // The child write ends are dup2'ed onto fds 1/2; the originals may
        // close at exec.
        set_cloexec(&stdout_w)?;
        set_cloexec(&stderr_w)?;

        let (stdin_child, stdin_parent) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(io::Error::from)?;

        request_large_sndbuf(&stdin_parent);

        Ok(Self {
            stdin_child,
            stdin_parent: PipeFd::new(stdin_parent),
            stdout_child: stdout_w,
            stdout_parent: PipeFd::new(stdout_r),
            stderr_child: stderr_w,
            stderr_parent: PipeFd::new(stderr_r),
            control_child: control_w,
            control_parent: control_r,
        })
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
    Ok(())
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
    Ok(())
}

/// Ask for a privileged-size send buffer, falling back silently to whatever
/// the unprivileged setsockopt grants.
fn request_large_sndbuf(fd: &OwnedFd) {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::socket::{setsockopt, sockopt};
        if setsockopt(fd, sockopt::SndBufForce, &STDIN_SNDBUF_BYTES).is_err() {
            let _ = setsockopt(fd, sockopt::SndBuf, &STDIN_SNDBUF_BYTES);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        use nix::sys::socket::{setsockopt, sockopt};
        let _ = setsockopt(fd, sockopt::SndBuf, &STDIN_SNDBUF_BYTES);
    }
}
