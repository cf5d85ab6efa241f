//! Waiting out the compiler: exec confirmation, output capture, reaping,
//! and exit classification.

use std::io::Read;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, OwnedFd};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use super::pipes::PipeFd;
use super::reap;
use crate::channel::JobChannel;
use crate::job::{JobOutcome, JobStatus};
use crate::limits::MemoryBudget;

/// The stderr text gcc prints when its allocator gives out under RLIMIT_AS.
const OOM_MARKER: &str = "virtual memory exhausted: Cannot allocate memory";

/// Memory use above this share of the budget reclassifies a nonzero exit
/// as resource exhaustion.
const OOM_BUDGET_PERCENT: u64 = 85;

/// How long one completion-loop wait lasts when no child exit is pending.
const SUPERVISE_TICK_MS: u16 = 5000;

const DRAIN_BUF: usize = 4096;

/// What the control channel said about the exec.
pub(crate) enum LaunchSignal {
    /// The control fd closed at exec time: the compiler image is running.
    Replaced,
    /// The child reported an exec failure before dying.
    Failed(u8),
}

/// Block until the child either execs (control fd closes) or reports an
/// exec failure with a single byte.
pub(crate) fn await_exec(control: OwnedFd) -> LaunchSignal {
    let mut byte = [0u8; 1];
    loop {
        match nix::unistd::read(&control, &mut byte) {
            Ok(0) => return LaunchSignal::Replaced,
            Ok(_) => return LaunchSignal::Failed(byte[0]),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                debug!(error = %e, "control channel read failed, assuming exec happened");
                return LaunchSignal::Replaced;
            }
        }
    }
}

enum ChildPoll {
    StillRunning,
    Reaped { code: i32, mem_used_kib: u64 },
    Failed,
}

/// Check on the child, blocking only when a SIGCHLD already fired.
///
/// Memory use is reconstructed from the fault counters in `rusage`, the
/// only per-child footprint measure that survives the exit.
fn poll_child(pid: Pid) -> ChildPoll {
    let mut status: libc::c_int = 0;
    let mut usage = MaybeUninit::<libc::rusage>::zeroed();
    let flags = if reap::pending() {
        libc::WUNTRACED
    } else {
        libc::WNOHANG
    };

    let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, flags, usage.as_mut_ptr()) };
    if ret == pid.as_raw() {
        reap::reset();
        let usage = unsafe { usage.assume_init() };
        let page_kib = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64 / 1024;
        let mem_used_kib = (usage.ru_minflt as u64 + usage.ru_majflt as u64) * page_kib;
        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else {
            // Killed by a signal; fold into a generic failing exit.
            1
        };
        trace!(code, mem_used_kib, "compiler child reaped");
        ChildPoll::Reaped { code, mem_used_kib }
    } else if ret == 0 {
        ChildPoll::StillRunning
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            ChildPoll::StillRunning
        } else {
            warn!(error = %err, "wait4 on compiler child failed");
            ChildPoll::Failed
        }
    }
}

enum Wake {
    Timeout,
    Ready { out: bool, err: bool, client: bool },
    Retry,
    Error,
}

/// Watch the running compiler until it exits or the client goes away.
///
/// Output is drained opportunistically so the child never stalls on a full
/// pipe. A wait that times out with nothing readable is the cue to check
/// for an exit; when a SIGCHLD is already pending the wait collapses to a
/// zero-timeout sweep so buffered output is picked up before the reap.
pub(crate) fn supervise(
    pid: Pid,
    mut stdout: PipeFd,
    mut stderr: PipeFd,
    channel: &mut dyn JobChannel,
    budget: MemoryBudget,
    out: &mut JobOutcome,
) -> JobStatus {
    loop {
        let wake = {
            let mut fds = [
                PollFd::new(stdout.as_fd(), PollFlags::POLLIN),
                PollFd::new(stderr.as_fd(), PollFlags::POLLIN),
                PollFd::new(channel.liveliness_fd(), PollFlags::POLLIN),
            ];
            let timeout = if reap::pending() {
                PollTimeout::ZERO
            } else {
                PollTimeout::from(SUPERVISE_TICK_MS)
            };
            match poll(&mut fds, timeout) {
                Ok(0) => Wake::Timeout,
                Ok(_) => Wake::Ready {
                    out: ready(&fds[0]),
                    err: ready(&fds[1]),
                    client: ready(&fds[2]),
                },
                Err(nix::errno::Errno::EINTR) => Wake::Retry,
                Err(e) => {
                    warn!(error = %e, "poll on compiler channels failed");
                    Wake::Error
                }
            }
        };

        match wake {
            Wake::Retry => continue,
            Wake::Error => {
                // The job is failed either way; the child must not outlive it.
                reap::terminate_and_reap(pid);
                return JobStatus::Failed;
            }
            Wake::Timeout => match poll_child(pid) {
                ChildPoll::StillRunning => continue,
                ChildPoll::Failed => {
                    // wait4 is broken for this pid, so signaling is all
                    // that is left to try.
                    let _ = kill(pid, Signal::SIGTERM);
                    return JobStatus::Failed;
                }
                ChildPoll::Reaped { code, mem_used_kib } => {
                    drain(&mut stdout, &mut out.stdout);
                    drain(&mut stderr, &mut out.stderr);
                    return classify_exit(code, mem_used_kib, budget, &out.stderr);
                }
            },
            Wake::Ready { out: o, err: e, client } => {
                if o {
                    drain(&mut stdout, &mut out.stdout);
                }
                if e {
                    drain(&mut stderr, &mut out.stderr);
                }
                if client {
                    debug!(pid = pid.as_raw(), "client went away, terminating compiler");
                    out.stderr.push_str("client cancelled\n");
                    channel.hangup();
                    let _ = kill(pid, Signal::SIGTERM);
                    // The child is collected by process teardown; the job
                    // itself is over the moment the client is gone.
                    return JobStatus::ClientKilled;
                }
            }
        }
    }
}

fn ready(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| !r.is_empty())
}

/// Read everything currently buffered on a nonblocking pipe end.
fn drain(pipe: &mut PipeFd, sink: &mut String) {
    let mut buf = [0u8; DRAIN_BUF];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => sink.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!(error = %e, "draining compiler output failed");
                break;
            }
        }
    }
}

/// Turn a reaped exit into a job status.
///
/// A nonzero exit is upgraded to [`JobStatus::OutOfMemory`] when the fault
/// counters show the child touched more than [`OOM_BUDGET_PERCENT`] of its
/// budget, or when gcc said so itself on stderr.
pub(crate) fn classify_exit(
    code: i32,
    mem_used_kib: u64,
    budget: MemoryBudget,
    stderr: &str,
) -> JobStatus {
    if code == 0 {
        return JobStatus::Success;
    }
    if mem_used_kib * 100 > OOM_BUDGET_PERCENT * budget.as_kib() || stderr.contains(OOM_MARKER) {
        debug!(
            code,
            mem_used_kib,
            budget_kib = budget.as_kib(),
            "classifying compiler failure as out of memory"
        );
        return JobStatus::OutOfMemory;
    }
    JobStatus::CompilerExit(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: MemoryBudget = MemoryBudget::from_mib(100);

    #[test]
    fn test_zero_exit_is_success() {
        assert_eq!(classify_exit(0, u64::MAX / 200, BUDGET, ""), JobStatus::Success);
    }

    #[test]
    fn test_nonzero_exit_passes_through() {
        assert_eq!(
            classify_exit(2, 1024, BUDGET, "syntax error"),
            JobStatus::CompilerExit(2)
        );
    }

    #[test]
    fn test_heavy_memory_use_is_oom() {
        // Budget is 102400 KiB; 85% of it is 87040.
        assert_eq!(
            classify_exit(1, 87041, BUDGET, ""),
            JobStatus::OutOfMemory
        );
        // Exactly at the threshold stays a plain compiler exit.
        assert_eq!(
            classify_exit(1, 87040, BUDGET, ""),
            JobStatus::CompilerExit(1)
        );
    }

    #[test]
    fn test_stderr_marker_is_oom() {
        let stderr = "cc1plus: out of memory allocating 65536 bytes\n\
                      virtual memory exhausted: Cannot allocate memory\n";
        assert_eq!(classify_exit(1, 0, BUDGET, stderr), JobStatus::OutOfMemory);
    }
}
