//! Running one compile job end to end.
//!
//! The phases mirror the life of the child process: allocate the object
//! file, wire up the channels, fork and exec, stream the input, confirm the
//! exec took, then watch the child until it exits or the client goes away.
//! Infrastructure failures never escape as errors; they are folded into the
//! outcome's status so the caller always has something to report.

mod launch;
mod monitor;
mod pipes;
pub(crate) mod reap;
mod stream;

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::channel::JobChannel;
use crate::error::{FarccError, Result};
use crate::job::{CompileJob, JobOutcome, JobStatus};
use crate::limits::MemoryBudget;

/// Tunable bits of the execution environment.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Compiler image to exec.
    pub compiler: PathBuf,
    /// Directory the temporary object file is allocated in.
    pub tmp_dir: PathBuf,
    /// Let the compiler run with uid or gid 0. Off by default; the child
    /// refuses with a sentinel exit instead.
    pub allow_root: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            compiler: PathBuf::from("/usr/bin/gcc"),
            tmp_dir: std::env::temp_dir(),
            allow_root: false,
        }
    }
}

/// Run one compile job to completion.
///
/// The only hard error is failing to allocate the object file path; with no
/// artifact there is nothing to run against. Everything after that point is
/// reported through [`JobOutcome::status`]. On any status but success the
/// temporary object file is removed before returning.
pub fn run_job(
    job: &CompileJob,
    budget: MemoryBudget,
    channel: &mut dyn JobChannel,
    opts: &ExecOptions,
) -> Result<JobOutcome> {
    let mut out = JobOutcome::new();

    let artifact = alloc_object_path(&opts.tmp_dir)?;
    debug!(path = %artifact.display(), budget = %budget, "starting compile job");

    let status = run_with_artifact(job, budget, channel, opts, &artifact, &mut out);
    out.status = status;

    if out.status.is_success() {
        out.object_path = Some(artifact);
    } else {
        discard_artifact(&artifact);
    }

    info!(
        status = %out.status,
        code = out.status.code(),
        in_bytes = out.in_uncompressed,
        "compile job finished"
    );
    Ok(out)
}

fn run_with_artifact(
    job: &CompileJob,
    budget: MemoryBudget,
    channel: &mut dyn JobChannel,
    opts: &ExecOptions,
    artifact: &Path,
    out: &mut JobOutcome,
) -> JobStatus {
    let ctx = match launch::build_child_context(job, opts, artifact, budget) {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(error = %e, "building the compiler command line failed");
            return JobStatus::Failed;
        }
    };

    if let Err(e) = reap::install_handlers() {
        warn!(error = %e, "signal setup failed");
        return JobStatus::Failed;
    }

    let channels = match pipes::ChannelSet::create() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "channel setup failed");
            return JobStatus::Failed;
        }
    };

    reap::reset();
    let spawned = match launch::spawn_compiler(channels, &ctx) {
        Ok(s) => s,
        Err(e) => {
            // Fork refusing is almost always the kernel out of memory or
            // process slots.
            warn!(error = %e, "fork failed");
            return JobStatus::OutOfMemory;
        }
    };
    let launch::Spawned {
        pid,
        stdin,
        stdout,
        stderr,
        control,
        output_writers,
    } = spawned;

    if let Err(status) = stream::stream_input(&mut *channel, stdin, out) {
        return match status {
            // A broken stdin write usually means the child died, but an
            // exec failure looks identical from this side. The control
            // channel settles it: the failure byte is already waiting.
            JobStatus::CompilerCrashed => {
                let verdict = match monitor::await_exec(control) {
                    monitor::LaunchSignal::Failed(_) => JobStatus::CompilerMissing,
                    monitor::LaunchSignal::Replaced => JobStatus::CompilerCrashed,
                };
                reap::terminate_and_reap(pid);
                verdict
            }
            other => {
                reap::terminate_and_reap(pid);
                other
            }
        };
    }

    if let monitor::LaunchSignal::Failed(_) = monitor::await_exec(control) {
        debug!(compiler = %opts.compiler.display(), "exec failed, compiler missing");
        reap::reap_blocking(pid);
        return JobStatus::CompilerMissing;
    }

    let status = monitor::supervise(pid, stdout, stderr, &mut *channel, budget, out);
    // Held open until here so the output pipes never turned EOF-readable
    // while the child was running.
    drop(output_writers);
    status
}

/// Reserve a unique object file path under `dir`.
///
/// The file is created and kept so no concurrent job can claim the name;
/// the child then truncates it through `-o`.
fn alloc_object_path(dir: &Path) -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("farcc-")
        .suffix(".o")
        .tempfile_in(dir)
        .map_err(FarccError::Artifact)?;
    let (_, path) = file.keep().map_err(|e| FarccError::Artifact(e.error))?;
    Ok(path)
}

fn discard_artifact(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove object file");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LocalSource, WireMsg};
    use crate::job::Language;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// Script body that copies stdin to the `-o` argument, the way a real
    /// compiler consumes "-" and produces an object file.
    const COPY_BODY: &str = r#"out=""
while [ "$#" -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2; continue ;;
  esac
  shift
done
cat > "$out""#;

    fn fake_compiler(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("cc-fake");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn opts_for(dir: &tempfile::TempDir, compiler: PathBuf) -> ExecOptions {
        ExecOptions {
            compiler,
            tmp_dir: dir.path().to_path_buf(),
            allow_root: true,
        }
    }

    const BUDGET: MemoryBudget = MemoryBudget::from_mib(512);

    #[test]
    fn test_success_copies_input_to_object() {
        let _guard = test_support::lock_jobs();
        let dir = tempfile::tempdir().unwrap();
        let opts = opts_for(&dir, fake_compiler(dir.path(), COPY_BODY));

        let mut src = LocalSource::new().unwrap();
        src.push_chunk(b"alpha ");
        src.push_chunk(b"beta");
        src.finish();

        let job = CompileJob::new(Language::C);
        let out = run_job(&job, BUDGET, &mut src, &opts).unwrap();

        assert_eq!(out.status, JobStatus::Success);
        assert!(out.stdout.is_empty());
        assert!(out.stderr.is_empty());
        assert_eq!(out.in_uncompressed, 10);
        assert_eq!(out.in_compressed, 10);
        let obj = out.object_path.expect("object path on success");
        assert_eq!(std::fs::read(&obj).unwrap(), b"alpha beta");
    }

    #[test]
    fn test_missing_compiler() {
        let _guard = test_support::lock_jobs();
        let dir = tempfile::tempdir().unwrap();
        let opts = opts_for(&dir, dir.path().join("no-such-cc"));

        let mut src = LocalSource::new().unwrap();
        src.push_chunk(b"int x;");
        src.finish();

        let job = CompileJob::new(Language::C);
        let out = run_job(&job, BUDGET, &mut src, &opts).unwrap();

        assert_eq!(out.status, JobStatus::CompilerMissing);
        assert_eq!(out.status.code(), 110);
        assert!(out.object_path.is_none());
    }

    #[test]
    fn test_exit_code_passes_through() {
        let _guard = test_support::lock_jobs();
        let dir = tempfile::tempdir().unwrap();
        let body = "cat >/dev/null\necho 'boom' >&2\nexit 7";
        let opts = opts_for(&dir, fake_compiler(dir.path(), body));

        let mut src = LocalSource::new().unwrap();
        src.push_chunk(b"bad source");
        src.finish();

        let job = CompileJob::new(Language::Cxx);
        let out = run_job(&job, BUDGET, &mut src, &opts).unwrap();

        assert_eq!(out.status, JobStatus::CompilerExit(7));
        assert!(out.stderr.contains("boom"));
        assert!(out.object_path.is_none());
    }

    #[test]
    fn test_oom_marker_in_stderr() {
        let _guard = test_support::lock_jobs();
        let dir = tempfile::tempdir().unwrap();
        let body = "cat >/dev/null\n\
                    echo 'virtual memory exhausted: Cannot allocate memory' >&2\n\
                    exit 1";
        let opts = opts_for(&dir, fake_compiler(dir.path(), body));

        let mut src = LocalSource::new().unwrap();
        src.finish();

        let job = CompileJob::new(Language::Cxx);
        let out = run_job(&job, BUDGET, &mut src, &opts).unwrap();

        assert_eq!(out.status, JobStatus::OutOfMemory);
        assert_eq!(out.status.code(), 105);
    }

    #[test]
    fn test_client_cancellation() {
        let _guard = test_support::lock_jobs();
        let dir = tempfile::tempdir().unwrap();
        // The script records the termination signal: `wait` is interruptible
        // by the trap, unlike a foreground sleep.
        let marker = dir.path().join("terminated");
        let body = format!(
            "trap 'echo terminated > {m}; exit 0' TERM\ncat >/dev/null\nsleep 30 &\nwait",
            m = marker.display()
        );
        let opts = opts_for(&dir, fake_compiler(dir.path(), &body));

        let mut src = LocalSource::new().unwrap();
        src.finish();
        let remote = src.take_remote().unwrap();
        let dropper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            drop(remote);
        });

        let job = CompileJob::new(Language::C);
        let out = run_job(&job, BUDGET, &mut src, &opts).unwrap();
        dropper.join().unwrap();

        assert_eq!(out.status, JobStatus::ClientKilled);
        assert_eq!(out.status.code(), 116);
        assert!(out.stderr.contains("client cancelled"));
        assert!(out.object_path.is_none());

        // The compiler child must have received the termination signal.
        let mut signalled = false;
        for _ in 0..100 {
            if marker.exists() {
                signalled = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(signalled, "compiler child never observed SIGTERM");
    }

    #[test]
    fn test_protocol_violation_kills_job() {
        let _guard = test_support::lock_jobs();
        let dir = tempfile::tempdir().unwrap();
        let opts = opts_for(&dir, fake_compiler(dir.path(), "sleep 5"));

        let mut src = LocalSource::new().unwrap();
        src.push(WireMsg::Other { kind: 9 });

        let job = CompileJob::new(Language::C);
        let out = run_job(&job, BUDGET, &mut src, &opts).unwrap();

        assert_eq!(out.status, JobStatus::IoError);
        assert!(out.object_path.is_none());
    }

    #[test]
    fn test_root_refusal() {
        if !nix::unistd::getuid().is_root() {
            return;
        }
        let _guard = test_support::lock_jobs();
        let dir = tempfile::tempdir().unwrap();
        let mut opts = opts_for(&dir, fake_compiler(dir.path(), COPY_BODY));
        opts.allow_root = false;

        let mut src = LocalSource::new().unwrap();
        src.finish();

        let job = CompileJob::new(Language::C);
        let out = run_job(&job, BUDGET, &mut src, &opts).unwrap();

        assert_eq!(out.status, JobStatus::CompilerExit(142));
    }
}
