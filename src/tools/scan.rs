//! Scans transactions for embedded data.
//!
//! ```text
//! scan --txid <txid> --txid <txid>
//! scan --hash-file hashes.txt --raw-each --csv
//! scan --chain <txid> --limit 500 --analysis
//! scan --files 100 120 --sources op-return --detectors magic-bytes
//! scan --files 100 120 --tx-list hashes --tx-list op-return
//! ```

use std::path::PathBuf;

use anyhow::anyhow;
use bitcoin::Txid;
use blk_scanner::blockdb::BlockDb;
use blk_scanner::config::ConfigArgs;
use blk_scanner::detect::{self, AesKeys, Detector, MagicBytes, PgpPackets, Plaintext};
use blk_scanner::scanner::data_source::{
    self, InputScriptNonOp, InputScriptPushdata, InputScripts, InputScriptsConcat, OpReturn,
    OutputScripts, OutputScriptsConcat, SatoshiEncoded,
};
use blk_scanner::scanner::hash_source::{self, ContainerRange};
use blk_scanner::scanner::output::{
    Console, DetectorCsv, RawDataAggregate, RawDataEachSource, RawDataOnDetection, TxAnalysis,
    TxList, TxListKind,
};
use blk_scanner::scanner::{DataSource, Scanner};
use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,

    /// Transactions to scan
    #[arg(long)]
    txid: Vec<Txid>,
    /// File of transaction hashes, one per line
    #[arg(long)]
    hash_file: Option<PathBuf>,
    /// Crawl the dust chain through this transaction
    #[arg(long)]
    chain: Option<Txid>,
    /// Chain length limit (0: no limit)
    #[arg(long, default_value_t = 0)]
    limit: usize,
    /// Every transaction in blk files START..=END
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    files: Vec<u16>,

    /// Data sources to extract (default: a standard set)
    #[arg(long, value_enum, value_delimiter = ',')]
    sources: Vec<SourceKind>,
    /// Detectors to run (default: all)
    #[arg(long, value_enum, value_delimiter = ',')]
    detectors: Vec<DetectorKind>,

    #[arg(short, long, default_value = "output")]
    out_dir: PathBuf,
    /// Write each extracted buffer to its own file
    #[arg(long)]
    raw_each: bool,
    /// Append extracted buffers to one file per data source
    #[arg(long)]
    raw_aggregate: bool,
    /// Write buffers that a detector fired on
    #[arg(long)]
    raw_on_detection: bool,
    /// One CSV of findings per detector
    #[arg(long)]
    csv: bool,
    /// tx-analysis.csv presence matrix
    #[arg(long)]
    analysis: bool,
    /// Per-transaction line lists (repeatable)
    #[arg(long, value_enum)]
    tx_list: Vec<ListKind>,
    /// Don't print findings
    #[arg(short, long)]
    quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SourceKind {
    InputScripts,
    InputsConcat,
    InputPushdata,
    InputNonop,
    OutputScripts,
    OutputScriptsSkipMax,
    OutputScriptsByValue,
    OutputsConcat,
    OutputsConcatSkipMax,
    OpReturn,
    Satoshi,
}

impl SourceKind {
    fn build(self) -> Box<dyn DataSource> {
        match self {
            SourceKind::InputScripts => Box::new(InputScripts),
            SourceKind::InputsConcat => Box::new(InputScriptsConcat),
            SourceKind::InputPushdata => Box::new(InputScriptPushdata),
            SourceKind::InputNonop => Box::new(InputScriptNonOp),
            SourceKind::OutputScripts => Box::new(OutputScripts::new(false, false)),
            SourceKind::OutputScriptsSkipMax => Box::new(OutputScripts::new(true, false)),
            SourceKind::OutputScriptsByValue => Box::new(OutputScripts::new(false, true)),
            SourceKind::OutputsConcat => Box::new(OutputScriptsConcat::new(false, false)),
            SourceKind::OutputsConcatSkipMax => Box::new(OutputScriptsConcat::new(true, false)),
            SourceKind::OpReturn => Box::new(OpReturn),
            SourceKind::Satoshi => Box::new(SatoshiEncoded),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ListKind {
    Hashes,
    InputScripts,
    InputNonop,
    OutputNonop,
    OpReturn,
}

impl From<ListKind> for TxListKind {
    fn from(value: ListKind) -> Self {
        match value {
            ListKind::Hashes => TxListKind::Hashes,
            ListKind::InputScripts => TxListKind::InputScripts,
            ListKind::InputNonop => TxListKind::InputLiterals,
            ListKind::OutputNonop => TxListKind::OutputLiterals,
            ListKind::OpReturn => TxListKind::OpReturn,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DetectorKind {
    Plaintext,
    MagicBytes,
    Pgp,
    Aes,
}

impl DetectorKind {
    fn build(self) -> Box<dyn Detector> {
        match self {
            DetectorKind::Plaintext => Box::new(Plaintext::default()),
            DetectorKind::MagicBytes => Box::new(MagicBytes::new()),
            DetectorKind::Pgp => Box::new(PgpPackets),
            DetectorKind::Aes => Box::new(AesKeys::new()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    blk_scanner::enable_logging();
    let args = Args::parse();
    if args.chain.is_none()
        && args.hash_file.is_none()
        && args.files.is_empty()
        && args.txid.is_empty()
    {
        return Err(anyhow!("nothing to scan: give --txid, --hash-file, --chain or --files"));
    }
    let db = BlockDb::open(args.config.load()?)?;
    std::fs::create_dir_all(&args.out_dir)?;

    let sources = if args.sources.is_empty() {
        data_source::default_data_sources()
    } else {
        args.sources.iter().map(|x| x.build()).collect()
    };
    let detectors = if args.detectors.is_empty() {
        detect::default_detectors()
    } else {
        args.detectors.iter().map(|x| x.build()).collect()
    };

    let mut scanner = Scanner::new(&db).data_sources(sources).detectors(detectors);
    let out = &args.out_dir;
    for kind in &args.tx_list {
        scanner = scanner.tx_output(TxList::new(out, TxListKind::from(*kind)));
    }
    if args.raw_each {
        scanner = scanner.data_source_output(RawDataEachSource::new(out));
    }
    if args.raw_aggregate {
        scanner = scanner.data_source_output(RawDataAggregate::new(out));
    }
    if !args.quiet {
        scanner = scanner.detection_output(Console::default());
    }
    if args.csv {
        scanner = scanner.detection_output(DetectorCsv::new(out));
    }
    if args.analysis {
        scanner = scanner.detection_output(TxAnalysis::new(out));
    }
    if args.raw_on_detection {
        scanner = scanner.detection_output(RawDataOnDetection::new(out));
    }

    // outputs are closed even if the run failed part-way
    if let Some(start) = args.chain {
        scanner.run_and_close(hash_source::chain(&db, start, args.limit))?;
    } else if let Some(path) = &args.hash_file {
        let hashes = hash_source::read_hash_file(path).map(|x| hash_source::list(x));
        scanner.run_and_close(hashes)?;
    } else if let [start, end] = args.files[..] {
        scanner.run_and_close(Ok(ContainerRange::new(db.containers(), start..=end)))?;
    } else {
        scanner.run_and_close(Ok(hash_source::list(args.txid.iter().copied())))?;
    }

    db.close()?;
    Ok(())
}
