//! Feeding the preprocessed source to the compiler's stdin.

use std::io::Write;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::pipes::PipeFd;
use crate::channel::{JobChannel, WireMsg};
use crate::job::{JobOutcome, JobStatus};

/// How long the client gets to produce the next input chunk.
pub(crate) const INPUT_RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Pump input chunks from the channel into the child's stdin until the end
/// marker arrives, keeping the outcome's byte counters current.
///
/// Takes the stdin endpoint by value; dropping it on return delivers EOF to
/// the compiler. Errors carry the status the job should be failed with.
pub(crate) fn stream_input(
    channel: &mut dyn JobChannel,
    mut stdin: PipeFd,
    out: &mut JobOutcome,
) -> Result<(), JobStatus> {
    loop {
        match channel.recv_timeout(INPUT_RECV_TIMEOUT) {
            Ok(Some(WireMsg::FileChunk(chunk))) => {
                out.in_uncompressed += chunk.uncompressed_len;
                out.in_compressed += chunk.compressed_len;
                if let Err(e) = stdin.write_all(&chunk.data) {
                    // The usual cause is the child dying mid-stream.
                    debug!(error = %e, "write to compiler stdin failed");
                    return Err(JobStatus::CompilerCrashed);
                }
            }
            Ok(Some(WireMsg::End)) => break,
            Ok(Some(WireMsg::Other { kind })) => {
                warn!(kind, "unexpected message while streaming input");
                return Err(JobStatus::IoError);
            }
            Ok(None) => {
                warn!("timed out waiting for the next input chunk");
                return Err(JobStatus::IoError);
            }
            Err(e) => {
                warn!(error = %e, "input channel failed");
                return Err(JobStatus::IoError);
            }
        }
    }

    trace!(
        uncompressed = out.in_uncompressed,
        compressed = out.in_compressed,
        "input stream complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalSource;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
    use std::io::Read;
    use std::os::fd::OwnedFd;

    fn stdin_pair() -> (PipeFd, OwnedFd) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        (PipeFd::new(a), b)
    }

    #[test]
    fn test_chunks_reach_stdin_in_order() {
        let mut src = LocalSource::new().unwrap();
        src.push_chunk(b"int main() ");
        src.push_chunk(b"{ return 0; }");
        src.finish();

        let (stdin, sink) = stdin_pair();
        let mut out = JobOutcome::new();
        stream_input(&mut src, stdin, &mut out).unwrap();

        let mut got = Vec::new();
        PipeFd::new(sink).read_to_end(&mut got).unwrap();
        assert_eq!(got, b"int main() { return 0; }");
        assert_eq!(out.in_uncompressed, 24);
        assert_eq!(out.in_compressed, 24);
    }

    #[test]
    fn test_stalled_channel_is_io_error() {
        let mut src = LocalSource::new().unwrap();
        src.push_chunk(b"partial");
        // No end marker: the queue runs dry, which reads as a stall.

        let (stdin, _sink) = stdin_pair();
        let mut out = JobOutcome::new();
        let err = stream_input(&mut src, stdin, &mut out).unwrap_err();
        assert_eq!(err, JobStatus::IoError);
        assert_eq!(out.in_uncompressed, 7);
    }

    #[test]
    fn test_channel_fault_is_io_error() {
        let mut src = LocalSource::new().unwrap();
        src.push_chunk(b"head");
        src.inject_fault("connection reset");

        let (stdin, _sink) = stdin_pair();
        let mut out = JobOutcome::new();
        let err = stream_input(&mut src, stdin, &mut out).unwrap_err();
        assert_eq!(err, JobStatus::IoError);
    }

    #[test]
    fn test_foreign_message_is_io_error() {
        let mut src = LocalSource::new().unwrap();
        src.push(WireMsg::Other { kind: 42 });

        let (stdin, _sink) = stdin_pair();
        let mut out = JobOutcome::new();
        let err = stream_input(&mut src, stdin, &mut out).unwrap_err();
        assert_eq!(err, JobStatus::IoError);
    }

    #[test]
    fn test_dead_reader_is_compiler_crashed() {
        crate::exec::reap::install_handlers().unwrap();

        let mut src = LocalSource::new().unwrap();
        src.push_chunk(&vec![0u8; 64 * 1024]);
        src.push_chunk(&vec![0u8; 4 * 1024 * 1024]);
        src.finish();

        let (stdin, sink) = stdin_pair();
        drop(sink);
        let mut out = JobOutcome::new();
        let err = stream_input(&mut src, stdin, &mut out).unwrap_err();
        assert_eq!(err, JobStatus::CompilerCrashed);
    }
}
