//! # relink
//!
//! Deduplicates identical files on reflink-capable filesystems (btrfs, XFS)
//! by replacing byte-identical copies with copy-on-write clones of one
//! reference file.
//!
//! The run is two passes over the tree: survey every file size into a
//! bounded histogram, pick the size classes with the most reclaimable
//! bytes, then dedup the files of those sizes.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use relink_engine::{dedup, survey, SizeMap};

/// Deduplicate identical files using copy-on-write reflinks.
#[derive(Debug, Parser)]
#[command(name = "relink", version, about)]
struct Cli {
    /// Directory tree to deduplicate
    #[arg(value_name = "DIR", default_value = ".")]
    root: PathBuf,

    /// Maximum unique file sizes tracked during the size survey
    #[arg(long, default_value_t = 1_000_000)]
    max_sizes: usize,

    /// Number of most impactful file sizes to deduplicate
    #[arg(long, default_value_t = 10_000)]
    top: usize,

    /// Report what would be deduplicated without changing any file
    #[arg(long)]
    dry_run: bool,

    /// Log at debug level
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> ExitCode {
    // Dry-run output is meant for piping; a closed pipe should end the
    // process, not panic the writer.
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("RELINK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    info!(
        root = %cli.root.display(),
        max_sizes = cli.max_sizes,
        "surveying file sizes"
    );
    let mut sizes = SizeMap::new(cli.max_sizes);
    let surveyed = survey(&cli.root, &mut sizes).context("size survey failed")?;
    info!(
        files_scanned = surveyed,
        unique_sizes = sizes.len(),
        "survey complete"
    );

    let targets = sizes.top_n(cli.top);
    let Some(first) = targets.first() else {
        info!("no duplicate-size candidates found");
        return Ok(());
    };
    info!(
        count = targets.len(),
        top_size = first.size,
        top_count = first.count,
        top_impact = first.impact(),
        "selected target sizes"
    );

    info!(dry_run = cli.dry_run, "deduplicating");
    let stats = dedup(&cli.root, &targets, cli.dry_run).context("dedup pass failed")?;
    info!(
        bytes_saved = stats.bytes_saved,
        files_deduped = stats.files_deduped,
        already_deduped = stats.already_deduped,
        errors = stats.errors,
        "done"
    );

    Ok(())
}
