//! The message-channel boundary between the worker core and its transport.
//!
//! The core never talks to the network itself. It pulls framed input
//! messages from a [`JobChannel`] and watches the channel's descriptor for
//! readiness, which during a running compile only ever means the client hung
//! up. [`LocalSource`] is a loopback implementation used by the CLI harness
//! and the test suite.

use crate::error::Result;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::time::Duration;

/// One framed chunk of preprocessed source.
///
/// `data` holds the already-decompressed bytes to feed to the compiler;
/// the two lengths are what the transport reports for accounting.
#[derive(Debug, Clone)]
pub struct FileChunk {
    pub data: Vec<u8>,
    pub uncompressed_len: u64,
    pub compressed_len: u64,
}

/// A message received from the client connection during input streaming.
///
/// Only chunks and the end marker are legal while a job is being fed;
/// anything else the transport may carry surfaces as [`WireMsg::Other`] and
/// is treated as a protocol violation by the streamer.
#[derive(Debug, Clone)]
pub enum WireMsg {
    FileChunk(FileChunk),
    End,
    Other { kind: u8 },
}

/// Collaborator interface to the client connection for one job.
pub trait JobChannel {
    /// Receive the next framed message, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when the wait times out. Transport failures are
    /// returned as errors; both are protocol failures to the caller.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<WireMsg>>;

    /// The descriptor watched for client liveliness. Readiness on this fd
    /// while the compiler runs means disconnection or cancellation.
    fn liveliness_fd(&self) -> BorrowedFd<'_>;

    /// Tear down the connection after a cancellation was observed. No
    /// further calls are made on the channel afterwards.
    fn hangup(&mut self);
}

/// An in-process channel pre-loaded with messages.
///
/// Backed by a socketpair so it has a real descriptor to poll: the remote
/// end is handed to whoever plays the client, and dropping it (or writing
/// to it) makes the liveliness fd ready, just like a disconnecting client.
pub struct LocalSource {
    queue: VecDeque<WireMsg>,
    local: OwnedFd,
    remote: Option<OwnedFd>,
    fault: Option<String>,
}

impl LocalSource {
    pub fn new() -> Result<Self> {
        use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

        let (local, remote) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(std::io::Error::from)?;

        Ok(Self {
            queue: VecDeque::new(),
            local,
            remote: Some(remote),
            fault: None,
        })
    }

    /// Queue an arbitrary message.
    pub fn push(&mut self, msg: WireMsg) {
        self.queue.push_back(msg);
    }

    /// Queue one uncompressed chunk; both reported lengths equal `data.len()`.
    pub fn push_chunk(&mut self, data: &[u8]) {
        let len = data.len() as u64;
        self.queue.push_back(WireMsg::FileChunk(FileChunk {
            data: data.to_vec(),
            uncompressed_len: len,
            compressed_len: len,
        }));
    }

    /// Queue the end-of-stream marker.
    pub fn finish(&mut self) {
        self.queue.push_back(WireMsg::End);
    }

    /// Arrange for the receive after the queued messages to fail with a
    /// channel error instead of stalling.
    pub fn inject_fault(&mut self, msg: &str) {
        self.fault = Some(msg.to_string());
    }

    /// Take the remote end of the liveliness socketpair.
    ///
    /// While the returned fd is held open the channel looks alive; dropping
    /// it simulates a client disconnect.
    pub fn take_remote(&mut self) -> Option<OwnedFd> {
        self.remote.take()
    }
}

impl JobChannel for LocalSource {
    fn recv_timeout(&mut self, _timeout: Duration) -> Result<Option<WireMsg>> {
        if let Some(msg) = self.queue.pop_front() {
            return Ok(Some(msg));
        }
        match self.fault.take() {
            Some(msg) => Err(crate::error::FarccError::Channel(msg)),
            // An exhausted queue behaves like a stalled transport.
            None => Ok(None),
        }
    }

    fn liveliness_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.local.as_fd()
    }

    fn hangup(&mut self) {
        // Keep the fd itself valid for the owner; just stop the traffic.
        unsafe {
            libc::shutdown(self.local.as_raw_fd(), libc::SHUT_RDWR);
        }
        self.remote = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[test]
    fn test_local_source_yields_in_order() {
        let mut src = LocalSource::new().unwrap();
        src.push_chunk(b"first");
        src.push_chunk(b"second");
        src.finish();

        match src.recv_timeout(TIMEOUT).unwrap() {
            Some(WireMsg::FileChunk(chunk)) => {
                assert_eq!(chunk.data, b"first");
                assert_eq!(chunk.uncompressed_len, 5);
                assert_eq!(chunk.compressed_len, 5);
            }
            other => panic!("expected chunk, got {:?}", other),
        }
        match src.recv_timeout(TIMEOUT).unwrap() {
            Some(WireMsg::FileChunk(chunk)) => assert_eq!(chunk.data, b"second"),
            other => panic!("expected chunk, got {:?}", other),
        }
        assert!(matches!(src.recv_timeout(TIMEOUT).unwrap(), Some(WireMsg::End)));
    }

    #[test]
    fn test_exhausted_queue_reads_as_timeout() {
        let mut src = LocalSource::new().unwrap();
        assert!(src.recv_timeout(TIMEOUT).unwrap().is_none());
    }

    #[test]
    fn test_remote_drop_makes_liveliness_fd_ready() {
        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

        let mut src = LocalSource::new().unwrap();
        let remote = src.take_remote().unwrap();

        // Open remote end: nothing to report.
        {
            let mut fds = [PollFd::new(src.liveliness_fd(), PollFlags::POLLIN)];
            let n = poll(&mut fds, PollTimeout::from(0u16)).unwrap();
            assert_eq!(n, 0);
        }

        drop(remote);

        let mut fds = [PollFd::new(src.liveliness_fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::from(100u16)).unwrap();
        assert_eq!(n, 1);
    }
}
