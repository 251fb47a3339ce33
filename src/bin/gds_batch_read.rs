//! Batched direct-read demonstration binary.
//!
//! Submits one batch of direct storage-to-GPU reads over the configured
//! geometry (`GDS_BATCH_SIZE` slots of `GDS_BATCH_SLOT_SIZE` bytes) and
//! drains the completions through a `GDS_BATCH_REAP_WINDOW`-entry event
//! buffer.
//!
//! ```sh
//! gds-batch-read /data/input.bin 0
//! ```
//!
//! Exits 0 on full success through driver close; non-zero on any
//! unrecoverable failure. Teardown diagnostics are logged and do not change
//! a success exit code.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gds_batch::compat_mode::resolve_compat_mode;
use gds_batch::posix::PosixSubsystem;
use gds_batch::{CompatMode, Config, Result, RunReport, run_batch_read};

#[derive(Debug, Parser)]
#[command(
    name = "gds-batch-read",
    version,
    about = "Submit a batch of direct storage-to-GPU reads and reap the completions"
)]
struct Args {
    /// Backing file to read from.
    file: PathBuf,

    /// CUDA device ordinal.
    device: usize,

    /// Force the host-staged POSIX backend (no GPU required).
    #[arg(long)]
    compat: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::get();
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid batch geometry");
        return ExitCode::FAILURE;
    }

    let requested = if args.compat {
        CompatMode::On
    } else {
        config.compat_mode
    };

    info!(
        batch_size = config.batch_size,
        slot_size = config.slot_size,
        reap_window = config.reap_window,
        compat_mode = %requested,
        file = %args.file.display(),
        "starting batched read"
    );

    match run(&args, &config, requested) {
        Ok(report) => {
            info!(
                entries_reaped = report.entries_reaped,
                polls = report.polls,
                completed = report.completed,
                failed = report.failed,
                "all completions accounted for"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "batch read failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, config: &Config, requested: CompatMode) -> Result<RunReport> {
    match resolve_compat_mode(requested) {
        CompatMode::On => run_posix(args, config),
        _ => run_gds(args, config, requested),
    }
}

fn run_posix(args: &Args, config: &Config) -> Result<RunReport> {
    info!("using the host-staged POSIX backend");
    let mut subsystem = PosixSubsystem::new();
    run_batch_read(
        &mut subsystem,
        &args.file,
        config.batch_size,
        config.slot_size,
        config.reap_window,
    )
}

#[cfg(feature = "gds")]
fn run_gds(args: &Args, config: &Config, requested: CompatMode) -> Result<RunReport> {
    // The driver closes when the subsystem drops at the end of this scope,
    // after every batch resource has been unwound.
    match gds_batch::cufile::CufileSubsystem::new(args.device) {
        Ok(mut subsystem) => {
            info!(device = args.device, "cuFile driver open");
            run_batch_read(
                &mut subsystem,
                &args.file,
                config.batch_size,
                config.slot_size,
                config.reap_window,
            )
        }
        Err(e) if requested == CompatMode::Auto => {
            warn!(error = %e, "GDS unavailable, falling back to POSIX");
            run_posix(args, config)
        }
        Err(e) => Err(e),
    }
}

#[cfg(not(feature = "gds"))]
fn run_gds(args: &Args, config: &Config, requested: CompatMode) -> Result<RunReport> {
    use gds_batch::{Error, ErrorKind};

    if requested == CompatMode::Auto {
        warn!("built without the gds feature, falling back to POSIX");
        run_posix(args, config)
    } else {
        Err(Error::new(
            ErrorKind::Unsupported,
            "this build does not include the cuFile backend (gds feature disabled)",
        ))
    }
}
