//! Streams of transaction hashes to feed a [`Scanner`](super::Scanner).

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;

use bitcoin::Txid;
use log::{info, warn};

use crate::chain::{crawl_backward, ForwardChain, SpendGraph};
use crate::container::{ContainerDir, ContainerReader};
use crate::{Error, Result};

pub fn list(txids: impl IntoIterator<Item = Txid>) -> impl Iterator<Item = Result<Txid>> {
    txids.into_iter().map(Ok)
}

/// Hashes from a text file, one per line. Blank lines and `#` comments are ignored.
pub fn read_hash_file(path: impl AsRef<Path>) -> Result<Vec<Txid>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut txids = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let txid = Txid::from_str(line).map_err(|_| Error::InvalidHash {
            path: path.into(),
            line: i + 1,
            value: line.into(),
        })?;
        txids.push(txid);
    }
    Ok(txids)
}

/// The backward chain of `start` (collected up front), then the forward chain pulled
/// lazily, with `start` appearing once.
pub fn chain<'g, G: SpendGraph>(
    graph: &'g G,
    start: Txid,
    limit: usize,
) -> Result<impl Iterator<Item = Result<Txid>> + 'g> {
    let backward = crawl_backward(graph, start, limit)?;
    info!("Backward chain of {start}: {} transactions", backward.len());
    Ok(backward
        .into_iter()
        .map(Ok)
        .chain(ForwardChain::new(graph, start, limit).skip(1)))
}

/// Every txid in a range of container files, read one block at a time. Missing files
/// are skipped.
pub struct ContainerRange<'a> {
    containers: &'a ContainerDir,
    files: RangeInclusive<u16>,
    reader: Option<ContainerReader>,
    pending: VecDeque<Txid>,
}

impl<'a> ContainerRange<'a> {
    pub fn new(containers: &'a ContainerDir, files: RangeInclusive<u16>) -> Self {
        Self {
            containers,
            files,
            reader: None,
            pending: VecDeque::new(),
        }
    }

    /// Moves on to the next existing file. `false` once the range is exhausted.
    fn open_next(&mut self) -> Result<bool> {
        for number in self.files.by_ref() {
            if !self.containers.exists(number) {
                warn!("{} does not exist, skipping", self.containers.path(number).display());
                continue;
            }
            self.reader = Some(self.containers.open(number)?);
            return Ok(true);
        }
        Ok(false)
    }
}

impl Iterator for ContainerRange<'_> {
    type Item = Result<Txid>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(txid) = self.pending.pop_front() {
                return Some(Ok(txid));
            }
            match self.reader.as_mut().and_then(|r| r.next()) {
                Some(Ok(record)) => {
                    self.pending
                        .extend(record.block.txdata.iter().map(|x| x.compute_txid()));
                }
                Some(Err(e)) => {
                    self.reader = None;
                    return Some(Err(e));
                }
                None => match self.open_next() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                },
            }
        }
    }
}
