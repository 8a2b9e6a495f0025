//! Where extracted buffers and detector results end up.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use bitcoin::{Transaction, Txid};
use fxhash::{FxHashMap, FxHashSet};
use log::debug;

use super::{DataSource, DataSourceOutput, DetectionOutput, Extracted, Hit, TxOutput};
use crate::{script, Result};

/// What a [`TxList`] writes after each hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxListKind {
    /// Just the hash.
    Hashes,
    /// Every input script, back to back.
    InputScripts,
    /// The input scripts' literals of at least 20 bytes.
    InputLiterals,
    /// The output scripts' literals of at least 20 bytes.
    OutputLiterals,
    /// The pushes following `OP_RETURN`.
    OpReturn,
}

impl TxListKind {
    pub fn filename(self) -> &'static str {
        match self {
            TxListKind::Hashes => "tx-hashes.txt",
            TxListKind::InputScripts => "tx-input-scripts.txt",
            TxListKind::InputLiterals => "tx-input-nonop.txt",
            TxListKind::OutputLiterals => "tx-output-nonop.txt",
            TxListKind::OpReturn => "tx-opreturn.txt",
        }
    }

    fn data(self, tx: &Transaction) -> Option<Vec<u8>> {
        match self {
            TxListKind::Hashes => None,
            TxListKind::InputScripts => Some(
                tx.input
                    .iter()
                    .flat_map(|x| x.script_sig.as_bytes())
                    .copied()
                    .collect(),
            ),
            TxListKind::InputLiterals => Some(
                tx.input
                    .iter()
                    .filter_map(|x| script::non_op_bytes(&x.script_sig).ok())
                    .flatten()
                    .collect(),
            ),
            TxListKind::OutputLiterals => Some(script::concat_non_op_bytes(&tx.output)),
            TxListKind::OpReturn => Some(
                tx.output
                    .iter()
                    .filter_map(|x| script::op_return_bytes(&x.script_pubkey).ok().flatten())
                    .flatten()
                    .collect(),
            ),
        }
    }
}

/// One line per scanned transaction: `{txid}`, or `{txid} {data}` with the data
/// written as raw bytes. The file exists after close even if nothing was scanned.
pub struct TxList {
    path: PathBuf,
    kind: TxListKind,
    file: Option<BufWriter<File>>,
}

impl TxList {
    pub fn new(out_dir: impl Into<PathBuf>, kind: TxListKind) -> Self {
        Self {
            path: out_dir.into().join(kind.filename()),
            kind,
            file: None,
        }
    }

    fn file(&mut self) -> Result<&mut BufWriter<File>> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                debug!("Creating {}", self.path.display());
                BufWriter::new(File::create(&self.path)?)
            }
        };
        Ok(self.file.insert(file))
    }
}

impl TxOutput for TxList {
    fn name(&self) -> &str {
        self.kind.filename()
    }

    fn write(&mut self, txid: Txid, tx: &Transaction) -> Result<()> {
        let data = self.kind.data(tx);
        let file = self.file()?;
        write!(file, "{txid}")?;
        if let Some(data) = data {
            file.write_all(b" ")?;
            file.write_all(&data)?;
        }
        file.write_all(b"\n")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file()?.flush()?;
        Ok(())
    }
}

/// One file per non-empty buffer: `{txid}-{buffer name}.dat`.
pub struct RawDataEachSource {
    out_dir: PathBuf,
}

impl RawDataEachSource {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

impl DataSourceOutput for RawDataEachSource {
    fn name(&self) -> &str {
        "raw data (each source)"
    }

    fn write(&mut self, txid: Txid, _: &dyn DataSource, extracted: &[Extracted]) -> Result<()> {
        for x in extracted.iter().filter(|x| !x.data.is_empty()) {
            let path = self.out_dir.join(format!("{txid}-{}.dat", x.name));
            std::fs::write(path, &x.data)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Appends every buffer of a source to `{source}-aggregated.dat`. A file is created
/// when its source first produces data.
pub struct RawDataAggregate {
    out_dir: PathBuf,
    files: HashMap<String, BufWriter<File>>,
}

impl RawDataAggregate {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            files: HashMap::new(),
        }
    }
}

impl DataSourceOutput for RawDataAggregate {
    fn name(&self) -> &str {
        "raw data (aggregated)"
    }

    fn write(&mut self, _: Txid, source: &dyn DataSource, extracted: &[Extracted]) -> Result<()> {
        if extracted.iter().all(|x| x.data.is_empty()) {
            return Ok(());
        }
        let file = match self.files.entry(source.name().to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let path = self.out_dir.join(format!("{}-aggregated.dat", e.key()));
                debug!("Creating {}", path.display());
                e.insert(BufWriter::new(File::create(path)?))
            }
        };
        for x in extracted {
            file.write_all(&x.data)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        for file in self.files.values_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Prints each finding to stdout.
#[derive(Default)]
pub struct Console {
    pub prefix: String,
}

impl DetectionOutput for Console {
    fn name(&self) -> &str {
        "console"
    }

    fn write(&mut self, hit: &Hit<'_>) -> Result<()> {
        for d in hit.detection.descriptions() {
            println!(
                "{}{} {}: {}: {}",
                self.prefix,
                hit.txid,
                hit.detector.name(),
                hit.extracted.name,
                d
            );
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// `{detector}.csv` per detector, with columns `tx hash,data source,description`.
/// Files appear with the detector's first finding.
pub struct DetectorCsv {
    out_dir: PathBuf,
    writers: HashMap<String, csv::Writer<File>>,
}

impl DetectorCsv {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            writers: HashMap::new(),
        }
    }
}

impl DetectionOutput for DetectorCsv {
    fn name(&self) -> &str {
        "detector csv"
    }

    fn write(&mut self, hit: &Hit<'_>) -> Result<()> {
        if hit.detection.is_empty() {
            return Ok(());
        }
        let csv = match self.writers.entry(hit.detector.safe_name().to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let mut csv = csv::Writer::from_path(self.out_dir.join(format!("{}.csv", e.key())))?;
                csv.write_record(["tx hash", "data source", "description"])?;
                e.insert(csv)
            }
        };
        let txid = hit.txid.to_string();
        for d in hit.detection.descriptions() {
            csv.write_record([txid.as_str(), hit.extracted.name.as_str(), d])?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        for csv in self.writers.values_mut() {
            csv.flush()?;
        }
        Ok(())
    }
}

/// A presence matrix: one row per transaction, one column per detector, `X` where the
/// detector found something in any of its buffers. Written to `tx-analysis.csv` on
/// close.
pub struct TxAnalysis {
    out_dir: PathBuf,
    columns: Vec<String>,
    rows: Vec<Txid>,
    hits: FxHashMap<Txid, FxHashSet<String>>,
}

impl TxAnalysis {
    pub const FILENAME: &'static str = "tx-analysis.csv";

    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            hits: FxHashMap::default(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.out_dir.join(Self::FILENAME)
    }
}

impl DetectionOutput for TxAnalysis {
    fn name(&self) -> &str {
        "tx analysis"
    }

    fn write(&mut self, hit: &Hit<'_>) -> Result<()> {
        let detector = hit.detector.name();
        if !self.columns.iter().any(|c| c == detector) {
            self.columns.push(detector.to_string());
        }
        let found = self.hits.entry(hit.txid).or_insert_with(|| {
            self.rows.push(hit.txid);
            FxHashSet::default()
        });
        if !hit.detection.is_empty() {
            found.insert(detector.to_string());
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut csv = csv::Writer::from_path(self.path())?;
        let mut header = vec!["tx hash"];
        header.extend(self.columns.iter().map(String::as_str));
        csv.write_record(&header)?;
        for txid in &self.rows {
            let found = &self.hits[txid];
            let mut record = vec![txid.to_string()];
            for column in &self.columns {
                let mark = if found.contains(column) { "X" } else { "" };
                record.push(mark.to_string());
            }
            csv.write_record(&record)?;
        }
        csv.flush()?;
        Ok(())
    }
}

/// Saves the buffer a detector fired on: `{detector}-{txid}-{buffer name}.dat`.
pub struct RawDataOnDetection {
    out_dir: PathBuf,
}

impl RawDataOnDetection {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

impl DetectionOutput for RawDataOnDetection {
    fn name(&self) -> &str {
        "raw data (on detection)"
    }

    fn write(&mut self, hit: &Hit<'_>) -> Result<()> {
        if hit.detection.is_empty() {
            return Ok(());
        }
        let path = self.out_dir.join(format!(
            "{}-{}-{}.dat",
            hit.detector.safe_name(),
            hit.txid,
            hit.extracted.name
        ));
        std::fs::write(path, &hit.extracted.data)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
