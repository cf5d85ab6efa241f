//! farcc - compile-job runner for a distributed build worker.
//!
//! The binary wraps the job-execution core in a small CLI: it reads a
//! preprocessed source file, feeds it through a loopback job channel, and
//! reports the classified outcome. The worker daemon embeds the same core
//! behind its network transport.

mod channel;
mod cli;
mod error;
mod exec;
mod job;
mod limits;
mod logging;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::Level;

use channel::LocalSource;
use cli::{Cli, Commands, RunArgs};
use exec::{ExecOptions, run_job};
use job::{CompileJob, JobOutcome};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    init_logging(&cli);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Completions(args) => {
            args.generate();
            Ok(0)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    logging::init(
        logging::LogConfig::new()
            .with_level(level)
            .with_env_overrides(),
    );
}

/// Run one compile job and return its classification code as the process
/// exit code, so callers can treat the binary like the compiler itself.
fn cmd_run(args: &RunArgs) -> Result<i32> {
    let source = std::fs::read(&args.source)
        .with_context(|| format!("reading {}", args.source.display()))?;

    let mut channel = LocalSource::new().context("creating job channel")?;
    for piece in source.chunks(args.chunk_size.max(1)) {
        channel.push_chunk(piece);
    }
    channel.finish();

    let job = CompileJob::new(args.lang.into()).with_rest_flags(args.flags.clone());
    let opts = ExecOptions {
        compiler: args.compiler.clone(),
        tmp_dir: args
            .tmp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir),
        allow_root: args.allow_root,
    };

    let mut outcome = run_job(&job, args.budget, &mut channel, &opts)?;

    if outcome.status.is_success()
        && let (Some(tmp), Some(dest)) = (outcome.object_path.as_ref(), args.out.as_ref())
    {
        move_object(tmp, dest)?;
        outcome.object_path = Some(dest.clone());
    }

    report(&outcome, args.json)?;
    Ok(outcome.status.code())
}

fn move_object(tmp: &Path, dest: &Path) -> Result<()> {
    if std::fs::rename(tmp, dest).is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems; fall back to copy and unlink.
    std::fs::copy(tmp, dest)
        .with_context(|| format!("moving object file to {}", dest.display()))?;
    let _ = std::fs::remove_file(tmp);
    Ok(())
}

fn report(outcome: &JobOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    // Compiler diagnostics pass through on the matching streams.
    print!("{}", outcome.stdout);
    eprint!("{}", outcome.stderr);

    if outcome.status.is_success() {
        if let Some(path) = &outcome.object_path {
            println!("{}", path.display());
        }
    } else {
        eprintln!(
            "{}: {}",
            "farcc".if_supports_color(Stderr, |text| text.red()),
            outcome.status
        );
    }
    Ok(())
}
