//! Builds the indices over a range of `blk*.dat` files.
//!
//! ```text
//! build-db -b ~/.bitcoin/blocks blocks 0 100
//! build-db transactions 0 100 --force
//! build-db spent-outputs 0 100
//! build-db dupes 0 100
//! build-db status
//! build-db drop dupes
//! ```

use std::ops::RangeInclusive;
use std::path::PathBuf;

use anyhow::anyhow;
use blk_scanner::blockdb::build::{FileStatus, IndexKind, IndexReport};
use blk_scanner::blockdb::BlockDb;
use blk_scanner::config::ConfigArgs;
use clap::{Parser, Subcommand, ValueEnum};
use log::warn;

#[derive(Parser, Debug)]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,
    /// Also append the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Block hash -> file position
    Blocks(Range),
    /// Block positions plus txid -> containing block
    Transactions(Range),
    /// Output -> spending input
    SpentOutputs(Range),
    /// Output payload digest -> txids carrying it
    Dupes(Range),
    /// Lists the files each index has covered
    Status,
    /// Removes an index so it can be rebuilt from scratch
    Drop { kind: Kind },
}

#[derive(clap::Args, Debug)]
struct Range {
    start: u16,
    end: u16,
    /// Reindex files already marked as done
    #[arg(short, long)]
    force: bool,
}

impl Range {
    fn files(&self) -> anyhow::Result<RangeInclusive<u16>> {
        if self.start > self.end {
            return Err(anyhow!("empty file range {}..={}", self.start, self.end));
        }
        Ok(self.start..=self.end)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Blocks,
    Transactions,
    SpentOutputs,
    Dupes,
}

impl From<Kind> for IndexKind {
    fn from(value: Kind) -> Self {
        match value {
            Kind::Blocks => IndexKind::Blocks,
            Kind::Transactions => IndexKind::Transactions,
            Kind::SpentOutputs => IndexKind::SpentOutputs,
            Kind::Dupes => IndexKind::DuplicatePayloads,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match &args.log_file {
        Some(path) => blk_scanner::set_up_logging(path)?,
        None => blk_scanner::enable_logging(),
    }
    let config = args.config.load()?;
    let db = BlockDb::open(config)?;

    let report = match &args.command {
        Command::Blocks(r) => Some(db.index_blocks(r.files()?, r.force)?),
        Command::Transactions(r) => Some(db.index_transactions(r.files()?, r.force)?),
        Command::SpentOutputs(r) => Some(db.index_spent_outputs(r.files()?, r.force)?),
        Command::Dupes(r) => Some(db.index_duplicate_payloads(r.files()?, r.force)?),
        Command::Status => {
            for kind in IndexKind::ALL {
                let files = db.indexed_files(kind)?;
                let blocks = files.iter().map(|(_, n)| n).sum::<u64>();
                match (files.first(), files.last()) {
                    (Some(first), Some(last)) => println!(
                        "{kind}: {} files (blk{:05}..blk{:05}), {blocks} blocks",
                        files.len(),
                        first.0,
                        last.0
                    ),
                    _ => println!("{kind}: not built"),
                }
            }
            None
        }
        Command::Drop { kind } => {
            db.drop_index(IndexKind::from(*kind))?;
            None
        }
    };

    let failed = match &report {
        Some(report) => print_report(report),
        None => false,
    };
    db.close()?;
    if failed {
        return Err(anyhow!("some files could not be indexed"));
    }
    Ok(())
}

/// Prints a summary; true if any file failed.
fn print_report(report: &IndexReport) -> bool {
    for (file, e) in report.failures() {
        warn!("blk{file:05}.dat: {e}");
    }
    println!(
        "{}: {} indexed, {} skipped, {} missing, {} failed; {} blocks, {} entries",
        report.kind,
        report.count(|x| matches!(x, FileStatus::Indexed { .. })),
        report.count(|x| matches!(x, FileStatus::Skipped)),
        report.count(|x| matches!(x, FileStatus::Missing)),
        report.count(|x| matches!(x, FileStatus::Failed(_))),
        report.total_blocks(),
        report.total_entries(),
    );
    !report.is_success()
}
