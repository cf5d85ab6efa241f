//! Child-state signal handling and reaping.
//!
//! A single SIGCHLD handler, shared by every job run in this process, does
//! nothing but raise a flag. The completion loop treats the flag as a hint
//! that a blocking wait is now safe; actually retrieving the exit status
//! always happens in ordinary control flow. Jobs are serialized per process,
//! so the flag never belongs to more than one job at a time.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow, kill, sigaction, sigprocmask,
};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::debug;

/// Set by the SIGCHLD handler when the child changed state.
static CHILD_STATE_CHANGED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigchld(_signo: libc::c_int) {
    // Async-signal context: a single atomic store and nothing else.
    CHILD_STATE_CHANGED.store(true, Ordering::Relaxed);
}

/// Clear the flag at the start of a job.
pub(crate) fn reset() {
    CHILD_STATE_CHANGED.store(false, Ordering::Relaxed);
}

/// Whether the OS has reported a child state change since [`reset`].
pub(crate) fn pending() -> bool {
    CHILD_STATE_CHANGED.load(Ordering::Relaxed)
}

/// Install the process-wide signal setup required before forking.
///
/// SIGPIPE is ignored so a write to a dead child surfaces as EPIPE instead
/// of killing the worker. SIGCHLD gets the flag-raising handler, restricted
/// to terminations (`SA_NOCLDSTOP`), and is explicitly unblocked: an
/// inherited mask (debuggers tend to leave one behind) would starve the
/// completion loop of its wakeup.
pub(crate) fn install_handlers() -> std::io::Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let chld = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    unsafe {
        sigaction(Signal::SIGPIPE, &ignore).map_err(std::io::Error::from)?;
        sigaction(Signal::SIGCHLD, &chld).map_err(std::io::Error::from)?;
    }

    let mut unblock = SigSet::empty();
    unblock.add(Signal::SIGCHLD);
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), None).map_err(std::io::Error::from)?;

    Ok(())
}

/// Wait for the child to terminate, retrying on interruption.
pub(crate) fn reap_blocking(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(nix::errno::Errno::EINTR) => continue,
            Ok(status) => {
                debug!(pid = pid.as_raw(), ?status, "reaped child");
                return;
            }
            Err(e) => {
                debug!(pid = pid.as_raw(), error = %e, "waitpid failed");
                return;
            }
        }
    }
}

/// Terminate the child and collect its status so no zombie outlives the job.
pub(crate) fn terminate_and_reap(pid: Pid) {
    let _ = kill(pid, Signal::SIGTERM);
    reap_blocking(pid);
}
