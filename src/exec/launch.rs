//! Compiler child launch: argv construction, fork, child-side setup, exec.
//!
//! Everything the child needs is prepared before the fork so the child side
//! runs nothing but raw syscalls between `fork()` and `execv()`.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use nix::sys::resource::{Resource, setrlimit};
use nix::unistd::{ForkResult, Pid, fork};
use tracing::debug;

use super::ExecOptions;
use super::pipes::{ChannelSet, PipeFd};
use crate::job::CompileJob;
use crate::limits::{self, MemoryBudget};

/// Exit status of a child that refused to run with root privileges.
pub(crate) const CHILD_STATUS_PRIVILEGED: i32 = 142;
/// Exit status of a child whose exec failed.
pub(crate) const CHILD_STATUS_EXEC_FAILED: i32 = 255;

/// The PATH value forced into the child before exec.
const CHILD_PATH: &str = "/usr/bin";

/// Everything the child needs after the fork, prepared while allocation is
/// still allowed.
#[derive(Debug)]
pub(crate) struct ChildContext {
    prog: CString,
    argv: Vec<CString>,
    path_var: CString,
    path_val: CString,
    rlimit_bytes: u64,
    allow_root: bool,
}

pub(crate) fn build_child_context(
    job: &CompileJob,
    opts: &ExecOptions,
    artifact: &Path,
    budget: MemoryBudget,
) -> io::Result<ChildContext> {
    let mut argv = Vec::with_capacity(job.remote_flags.len() + job.rest_flags.len() + 10);

    argv.push(cstr(opts.compiler.as_os_str().as_encoded_bytes())?);
    for flag in job.flags() {
        argv.push(cstr(flag.as_bytes())?);
    }
    // No input file: the preprocessed source arrives on stdin.
    argv.push(cstr(b"-x")?);
    argv.push(cstr(job.language.selector().as_bytes())?);
    argv.push(cstr(b"-")?);
    argv.push(cstr(b"-o")?);
    argv.push(cstr(artifact.as_os_str().as_encoded_bytes())?);
    argv.push(cstr(b"--param")?);
    argv.push(cstr(format!("ggc-min-expand={}", limits::min_expand_percent(budget)).as_bytes())?);
    argv.push(cstr(b"--param")?);
    argv.push(cstr(format!("ggc-min-heapsize={}", limits::min_heapsize_kib(budget)).as_bytes())?);

    Ok(ChildContext {
        prog: argv[0].clone(),
        argv,
        path_var: cstr(b"PATH")?,
        path_val: cstr(CHILD_PATH.as_bytes())?,
        rlimit_bytes: budget.as_bytes(),
        allow_root: opts.allow_root,
    })
}

fn cstr(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "NUL byte in compiler argument")
    })
}

/// The parent's handles on a running compiler child.
pub(crate) struct Spawned {
    pub pid: Pid,
    pub stdin: PipeFd,
    pub stdout: PipeFd,
    pub stderr: PipeFd,
    pub control: OwnedFd,
    /// The child write ends of the output pipes, kept open in the parent so
    /// the read ends never turn EOF-readable while the child runs. The
    /// completion loop relies on its poll timeout, not EOF, to notice exit.
    pub output_writers: (OwnedFd, OwnedFd),
}

/// Fork and exec the compiler. A fork failure is the only error; exec
/// failures are reported later through the control channel.
pub(crate) fn spawn_compiler(channels: ChannelSet, ctx: &ChildContext) -> io::Result<Spawned> {
    match unsafe { fork() } {
        Err(e) => Err(io::Error::from(e)),
        Ok(ForkResult::Child) => child_exec(ctx, channels),
        Ok(ForkResult::Parent { child }) => {
            let ChannelSet {
                stdin_child,
                stdin_parent,
                stdout_child,
                stdout_parent,
                stderr_child,
                stderr_parent,
                control_child,
                control_parent,
            } = channels;

            // Hand the child its endpoints by closing ours.
            drop(stdin_child);
            drop(control_child);

            debug!(pid = child.as_raw(), "compiler child forked");

            Ok(Spawned {
                pid: child,
                stdin: stdin_parent,
                stdout: stdout_parent,
                stderr: stderr_parent,
                control: control_parent,
                output_writers: (stdout_child, stderr_child),
            })
        }
    }
}

/// Child side: redirect fds, drop privileges-sensitive cases, cap address
/// space, exec. Never returns; on exec failure one byte goes out on the
/// control channel before the child dies with a sentinel status.
fn child_exec(ctx: &ChildContext, channels: ChannelSet) -> ! {
    let ChannelSet {
        stdin_child,
        stdin_parent,
        stdout_child,
        stdout_parent,
        stderr_child,
        stderr_parent,
        control_child,
        control_parent,
    } = channels;

    drop(stdin_parent);
    drop(stdout_parent);
    drop(stderr_parent);
    drop(control_parent);

    unsafe {
        libc::dup2(stdin_child.as_raw_fd(), 0);
        libc::fcntl(stdin_child.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
        // Success is signaled by this fd closing at exec.
        libc::fcntl(control_child.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
        libc::setenv(ctx.path_var.as_ptr(), ctx.path_val.as_ptr(), 1);
    }

    if !ctx.allow_root
        && (nix::unistd::getuid().is_root() || nix::unistd::getgid().as_raw() == 0)
    {
        unsafe { libc::_exit(CHILD_STATUS_PRIVILEGED) }
    }

    if setrlimit(Resource::RLIMIT_AS, ctx.rlimit_bytes, ctx.rlimit_bytes).is_err() {
        // The tracing stack is off-limits between fork and exec.
        let msg = b"farcc: setrlimit(RLIMIT_AS) failed\n";
        unsafe {
            libc::write(2, msg.as_ptr().cast(), msg.len());
        }
    }

    unsafe {
        libc::dup2(stdout_child.as_raw_fd(), 1);
        libc::dup2(stderr_child.as_raw_fd(), 2);
    }

    let _ = nix::unistd::execv(&ctx.prog, &ctx.argv);

    let _ = nix::unistd::write(&control_child, &[1u8]);
    unsafe { libc::_exit(CHILD_STATUS_EXEC_FAILED) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Language;
    use std::path::PathBuf;

    fn args_of(ctx: &ChildContext) -> Vec<String> {
        ctx.argv
            .iter()
            .map(|a| a.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_argv_layout() {
        let job = CompileJob::new(Language::Cxx)
            .with_remote_flags(vec!["-O2".into()])
            .with_rest_flags(vec!["-fPIC".into()]);
        let opts = ExecOptions {
            compiler: PathBuf::from("/usr/bin/gcc"),
            ..ExecOptions::default()
        };
        let ctx = build_child_context(
            &job,
            &opts,
            Path::new("/tmp/farcc-x.o"),
            MemoryBudget::from_mib(512),
        )
        .unwrap();

        assert_eq!(
            args_of(&ctx),
            vec![
                "/usr/bin/gcc",
                "-O2",
                "-fPIC",
                "-x",
                "c++",
                "-",
                "-o",
                "/tmp/farcc-x.o",
                "--param",
                "ggc-min-expand=65",
                "--param",
                "ggc-min-heapsize=65536",
            ]
        );
    }

    #[test]
    fn test_argv_c_language_selector() {
        let job = CompileJob::new(Language::C);
        let opts = ExecOptions::default();
        let ctx = build_child_context(
            &job,
            &opts,
            Path::new("/tmp/out.o"),
            MemoryBudget::from_mib(0),
        )
        .unwrap();

        let args = args_of(&ctx);
        let x = args.iter().position(|a| a == "-x").unwrap();
        assert_eq!(args[x + 1], "c");
        // Clamp floors at zero budget.
        assert!(args.contains(&"ggc-min-expand=30".to_string()));
        assert!(args.contains(&"ggc-min-heapsize=4096".to_string()));
    }

    #[test]
    fn test_nul_in_flag_is_rejected() {
        let job = CompileJob::new(Language::C).with_remote_flags(vec!["-D\0BAD".into()]);
        let opts = ExecOptions::default();
        let err = build_child_context(
            &job,
            &opts,
            Path::new("/tmp/out.o"),
            MemoryBudget::from_mib(512),
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
