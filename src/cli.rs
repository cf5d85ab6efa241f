//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::job::Language;
use crate::limits::{DEFAULT_MEMORY_BUDGET, MemoryBudget};

/// Compile-job runner for a distributed build worker.
#[derive(Parser, Debug)]
#[command(name = "farcc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile one preprocessed source file.
    Run(RunArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Preprocessed source file to feed to the compiler.
    pub source: PathBuf,

    /// Source language.
    #[arg(short = 'x', long, value_enum, default_value_t = LanguageArg::C)]
    pub lang: LanguageArg,

    /// Memory budget for the compiler (plain MiB, or with M/G suffix).
    #[arg(short, long, default_value_t = DEFAULT_MEMORY_BUDGET)]
    pub budget: MemoryBudget,

    /// Compiler image to exec.
    #[arg(long, env = "FARCC_COMPILER", default_value = "/usr/bin/gcc")]
    pub compiler: PathBuf,

    /// Move the object file here on success instead of printing the
    /// temporary path.
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Directory for temporary object files (default: the system tmpdir).
    #[arg(long, env = "FARCC_TMPDIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Extra compiler flag, repeatable.
    #[arg(long = "flag", value_name = "FLAG", allow_hyphen_values = true)]
    pub flags: Vec<String>,

    /// Let the compiler run with root privileges. Refused by default.
    #[arg(long)]
    pub allow_root: bool,

    /// Bytes per input chunk fed to the job.
    #[arg(long, default_value_t = 64 * 1024)]
    pub chunk_size: usize,

    /// Print the job outcome as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

/// Source language accepted by `run -x`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageArg {
    C,
    Cxx,
}

impl From<LanguageArg> for Language {
    fn from(arg: LanguageArg) -> Self {
        match arg {
            LanguageArg::C => Language::C,
            LanguageArg::Cxx => Language::Cxx,
        }
    }
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "farcc",
            &mut std::io::stdout(),
        );
    }
}
