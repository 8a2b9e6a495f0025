//! Runs data sources and detectors over a stream of transactions.
//!
//! For every hash: resolve the transaction, hand it to every [`TxOutput`], let each
//! [`DataSource`] cut it into named buffers, hand the buffers to every [`DataSourceOutput`], then run every
//! [`Detector`] over every buffer and hand each result to every [`DetectionOutput`].
//! Only one transaction's buffers are alive at a time.

pub mod data_source;
pub mod hash_source;
pub mod output;

use std::collections::HashMap;

use bitcoin::{Transaction, Txid};
use log::{debug, error, info};

use crate::detect::{Detection, Detector};
use crate::error::Entity;
use crate::{Error, Result};

pub use data_source::{DataSource, Direction, Extracted};

/// Turns a txid into its transaction.
pub trait TxResolver {
    fn resolve(&self, txid: Txid) -> Result<Transaction>;
}

impl TxResolver for HashMap<Txid, Transaction> {
    fn resolve(&self, txid: Txid) -> Result<Transaction> {
        self.get(&txid).cloned().ok_or_else(|| Error::EntityNotFound {
            entity: Entity::Transaction,
            id: txid.to_string(),
            operation: "resolve",
        })
    }
}

/// Sees each resolved transaction whole, before any data source runs.
pub trait TxOutput {
    fn name(&self) -> &str;

    fn write(&mut self, txid: Txid, tx: &Transaction) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

pub trait DataSourceOutput {
    fn name(&self) -> &str;

    /// Called once per source per transaction with its non-empty buffers.
    fn write(&mut self, txid: Txid, source: &dyn DataSource, extracted: &[Extracted]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// One detector run over one buffer.
pub struct Hit<'a> {
    pub txid: Txid,
    pub source: &'a dyn DataSource,
    pub extracted: &'a Extracted,
    pub detector: &'a dyn Detector,
    pub detection: &'a Detection,
}

pub trait DetectionOutput {
    fn name(&self) -> &str;

    /// Called for every detector run, including the ones that found nothing.
    fn write(&mut self, hit: &Hit<'_>) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub transactions: usize,
    pub buffers: usize,
    pub findings: usize,
}

pub struct Scanner<'r, R: ?Sized> {
    resolver: &'r R,
    tx_outputs: Vec<Box<dyn TxOutput>>,
    data_sources: Vec<Box<dyn DataSource>>,
    data_source_outputs: Vec<Box<dyn DataSourceOutput>>,
    detectors: Vec<Box<dyn Detector>>,
    detection_outputs: Vec<Box<dyn DetectionOutput>>,
}

impl<'r, R: TxResolver + ?Sized> Scanner<'r, R> {
    pub fn new(resolver: &'r R) -> Self {
        Self {
            resolver,
            tx_outputs: Vec::new(),
            data_sources: Vec::new(),
            data_source_outputs: Vec::new(),
            detectors: Vec::new(),
            detection_outputs: Vec::new(),
        }
    }

    pub fn tx_output(mut self, output: impl TxOutput + 'static) -> Self {
        self.tx_outputs.push(Box::new(output));
        self
    }

    pub fn data_source(mut self, source: impl DataSource + 'static) -> Self {
        self.data_sources.push(Box::new(source));
        self
    }

    pub fn data_sources(mut self, sources: impl IntoIterator<Item = Box<dyn DataSource>>) -> Self {
        self.data_sources.extend(sources);
        self
    }

    pub fn data_source_output(mut self, output: impl DataSourceOutput + 'static) -> Self {
        self.data_source_outputs.push(Box::new(output));
        self
    }

    pub fn detector(mut self, detector: impl Detector + 'static) -> Self {
        self.detectors.push(Box::new(detector));
        self
    }

    pub fn detectors(mut self, detectors: impl IntoIterator<Item = Box<dyn Detector>>) -> Self {
        self.detectors.extend(detectors);
        self
    }

    pub fn detection_output(mut self, output: impl DetectionOutput + 'static) -> Self {
        self.detection_outputs.push(Box::new(output));
        self
    }

    /// Scans every hash in turn. A transaction that can't be resolved stops the run;
    /// a data source that fails on a transaction is skipped for that transaction.
    pub fn run(&mut self, hashes: impl IntoIterator<Item = Result<Txid>>) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        for txid in hashes {
            let txid = txid?;
            let tx = self.resolver.resolve(txid).inspect_err(|e| {
                error!("Cannot get tx {txid}: {e}");
            })?;
            summary.transactions += 1;
            for output in &mut self.tx_outputs {
                output.write(txid, &tx)?;
            }

            for source in &self.data_sources {
                let mut extracted = match source.extract(&tx) {
                    Ok(x) => x,
                    Err(e) => {
                        debug!("{txid}: no {} data ({e})", source.name());
                        continue;
                    }
                };
                extracted.retain(|x| !x.data.is_empty());
                if extracted.is_empty() {
                    continue;
                }
                summary.buffers += extracted.len();

                for output in &mut self.data_source_outputs {
                    output.write(txid, source.as_ref(), &extracted)?;
                }

                for item in &extracted {
                    for detector in &self.detectors {
                        let detection = detector.detect(&item.data);
                        summary.findings += detection.findings.len();
                        let hit = Hit {
                            txid,
                            source: source.as_ref(),
                            extracted: item,
                            detector: detector.as_ref(),
                            detection: &detection,
                        };
                        for output in &mut self.detection_outputs {
                            output.write(&hit)?;
                        }
                    }
                }
            }
        }
        info!(
            "Scanned {} transactions, {} buffers, {} findings",
            summary.transactions, summary.buffers, summary.findings
        );
        Ok(summary)
    }

    /// Runs over `hashes`, if the hash source could be set up at all, and closes every
    /// output either way. A failed run is reported ahead of any close failure.
    pub fn run_and_close<I>(mut self, hashes: Result<I>) -> Result<ScanSummary>
    where
        I: IntoIterator<Item = Result<Txid>>,
    {
        let result = hashes.and_then(|hashes| self.run(hashes));
        let closed = self.close();
        let summary = result?;
        closed?;
        Ok(summary)
    }

    /// Closes detection outputs, then data-source outputs, then transaction outputs.
    /// Every output is closed even if an earlier one fails; all failures come back
    /// together.
    pub fn close(self) -> Result<()> {
        let mut failures = Vec::new();
        for mut output in self.detection_outputs {
            if let Err(e) = output.close() {
                failures.push((output.name().to_string(), e));
            }
        }
        for mut output in self.data_source_outputs {
            if let Err(e) = output.close() {
                failures.push((output.name().to_string(), e));
            }
        }
        for mut output in self.tx_outputs {
            if let Err(e) = output.close() {
                failures.push((output.name().to_string(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::OutputsClose(failures))
        }
    }
}
