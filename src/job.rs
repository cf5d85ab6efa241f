//! Compile job description and job result types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Source language of a compile job. Selects the `-x` argument pair passed
/// to the compiler, since input arrives on stdin without a file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cxx,
}

impl Language {
    /// The value for the compiler's `-x` language selector.
    pub fn selector(&self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cxx => "c++",
        }
    }
}

/// Immutable description of one remote compilation request.
///
/// The flag lists are opaque to the core: they are forwarded to the compiler
/// in their given order, remote flags first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileJob {
    /// Source language of the preprocessed input.
    pub language: Language,
    /// Compiler flags chosen by the submitting client for remote execution.
    pub remote_flags: Vec<String>,
    /// Additional flags appended after the remote flags.
    pub rest_flags: Vec<String>,
}

impl CompileJob {
    /// Create a job with no flags.
    pub fn new(language: Language) -> Self {
        Self {
            language,
            remote_flags: Vec::new(),
            rest_flags: Vec::new(),
        }
    }

    /// Set the remote flag list.
    pub fn with_remote_flags(mut self, flags: Vec<String>) -> Self {
        self.remote_flags = flags;
        self
    }

    /// Set the rest flag list.
    pub fn with_rest_flags(mut self, flags: Vec<String>) -> Self {
        self.rest_flags = flags;
        self
    }

    /// All compiler flags in forwarding order.
    pub fn flags(&self) -> impl Iterator<Item = &str> {
        self.remote_flags
            .iter()
            .chain(self.rest_flags.iter())
            .map(String::as_str)
    }
}

/// Classified outcome of one job.
///
/// The wire codes follow the distcc numbering so schedulers that already
/// understand distcc exit codes can consume them unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    /// The compiler exited 0 and the object file is in place.
    Success,
    /// The compiler reported this nonzero exit code.
    CompilerExit(i32),
    /// Pipe/fork/socket setup failed, or waiting on the child failed.
    Failed,
    /// Writing input to the child failed unexpectedly; the child has most
    /// likely died under us.
    CompilerCrashed,
    /// Fork failed, or the compiler was killed by resource exhaustion.
    OutOfMemory,
    /// The message channel delivered a malformed or stalled input stream.
    IoError,
    /// The child could not exec the compiler image.
    CompilerMissing,
    /// The client disconnected or cancelled mid-job.
    ClientKilled,
}

impl JobStatus {
    /// The integer classification code reported to the scheduler.
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::CompilerExit(code) => *code,
            Self::Failed => 100,
            Self::CompilerCrashed => 104,
            Self::OutOfMemory => 105,
            Self::IoError => 107,
            Self::CompilerMissing => 110,
            Self::ClientKilled => 116,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::CompilerExit(code) => write!(f, "compiler exited with code {}", code),
            Self::Failed => write!(f, "job setup or wait failed"),
            Self::CompilerCrashed => write!(f, "compiler crashed"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::IoError => write!(f, "input stream protocol error"),
            Self::CompilerMissing => write!(f, "compiler missing"),
            Self::ClientKilled => write!(f, "client cancelled"),
        }
    }
}

/// Everything a finished job reports back to the caller.
#[derive(Debug, Serialize)]
pub struct JobOutcome {
    /// Classified completion status.
    pub status: JobStatus,
    /// Captured compiler stdout (diagnostic text, lossily decoded).
    pub stdout: String,
    /// Captured compiler stderr (diagnostic text, lossily decoded).
    pub stderr: String,
    /// Total uncompressed input bytes received from the client.
    pub in_uncompressed: u64,
    /// Total compressed input bytes received from the client.
    pub in_compressed: u64,
    /// Path of the produced object file. `Some` only on success; every
    /// other path removes the temporary artifact.
    pub object_path: Option<PathBuf>,
}

impl JobOutcome {
    pub(crate) fn new() -> Self {
        Self {
            status: JobStatus::Failed,
            stdout: String::new(),
            stderr: String::new(),
            in_uncompressed: 0,
            in_compressed: 0,
            object_path: None,
        }
    }
}
