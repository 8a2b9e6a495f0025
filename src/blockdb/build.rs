//! Index builders. Each builder walks an inclusive range of container files, one rayon
//! worker per file, and reports one [`FileOutcome`] per file. A file that fails to
//! parse is reported and skipped; a store failure aborts the whole build.
//!
//! A fully indexed file gets a marker in the `IndexedFiles` bucket so later runs can
//! skip it. Batches already committed for a file that later fails stay in place; the
//! file is simply not marked, and re-running overwrites them with identical entries.

use std::fmt::{Display, Formatter};
use std::ops::RangeInclusive;

use bitcoin::hashes::Hash;
use byteorder::{ByteOrder, LE};
use log::{debug, info, warn};
use rayon::prelude::*;

use super::entry::{BlockIndexEntry, SpentOutputEntry, SpentOutputKey, TxIndexEntry};
use super::{append_duplicate, BlockDb};
use crate::store::Bucket;
use crate::{is_all_zeros, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Blocks,
    Transactions,
    SpentOutputs,
    DuplicatePayloads,
}

impl IndexKind {
    pub const ALL: [IndexKind; 4] = [
        IndexKind::Blocks,
        IndexKind::Transactions,
        IndexKind::SpentOutputs,
        IndexKind::DuplicatePayloads,
    ];

    /// The bucket this index owns.
    pub fn bucket(&self) -> Bucket {
        match self {
            IndexKind::Blocks => Bucket::BlockIndex,
            IndexKind::Transactions => Bucket::TransactionIndex,
            IndexKind::SpentOutputs => Bucket::SpentTxOuts,
            IndexKind::DuplicatePayloads => Bucket::TxOutDupes,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            IndexKind::Blocks => 0,
            IndexKind::Transactions => 1,
            IndexKind::SpentOutputs => 2,
            IndexKind::DuplicatePayloads => 3,
        }
    }

    fn marker_key(&self, file: u16) -> [u8; 3] {
        let mut key = [self.tag(), 0, 0];
        LE::write_u16(&mut key[1..], file);
        key
    }
}

impl Display for IndexKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexKind::Blocks => "blocks",
            IndexKind::Transactions => "transactions",
            IndexKind::SpentOutputs => "spent-outputs",
            IndexKind::DuplicatePayloads => "dupes",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum FileStatus {
    Indexed { blocks: u64, entries: u64 },
    /// Already marked as indexed and `force` was not set.
    Skipped,
    /// No such container file.
    Missing,
    Failed(Error),
}

#[derive(Debug)]
pub struct FileOutcome {
    pub file: u16,
    pub status: FileStatus,
}

#[derive(Debug)]
pub struct IndexReport {
    pub kind: IndexKind,
    pub files: Vec<FileOutcome>,
}

impl IndexReport {
    pub fn failures(&self) -> impl Iterator<Item = (u16, &Error)> {
        self.files.iter().filter_map(|x| match &x.status {
            FileStatus::Failed(e) => Some((x.file, e)),
            _ => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn count(&self, f: impl Fn(&FileStatus) -> bool) -> usize {
        self.files.iter().filter(|x| f(&x.status)).count()
    }

    pub fn total_blocks(&self) -> u64 {
        self.files
            .iter()
            .map(|x| match x.status {
                FileStatus::Indexed { blocks, .. } => blocks,
                _ => 0,
            })
            .sum()
    }

    pub fn total_entries(&self) -> u64 {
        self.files
            .iter()
            .map(|x| match x.status {
                FileStatus::Indexed { entries, .. } => entries,
                _ => 0,
            })
            .sum()
    }
}

struct Counts {
    blocks: u64,
    entries: u64,
}

/// Pending key/value pairs for one bucket, flushed in a single write transaction.
struct Batch {
    bucket: Bucket,
    limit: usize,
    pending: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Batch {
    fn new(bucket: Bucket, limit: usize) -> Self {
        Self {
            bucket,
            limit,
            pending: Vec::with_capacity(limit),
        }
    }

    fn push(&mut self, db: &BlockDb, key: &[u8], value: &[u8]) -> Result<()> {
        self.pending.push((key.into(), value.into()));
        if self.pending.len() >= self.limit {
            self.flush(db)?;
        }
        Ok(())
    }

    fn flush(&mut self, db: &BlockDb) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        db.store.with_write_txn(|txn| {
            let bucket = txn.create_bucket_if_not_exists(self.bucket)?;
            for (k, v) in &self.pending {
                bucket.put(k, v)?;
            }
            Ok(())
        })?;
        debug!("Committed {} entries to {}", self.pending.len(), self.bucket);
        self.pending.clear();
        Ok(())
    }
}

impl BlockDb {
    /// Records where each block of the files in `range` lives.
    pub fn index_blocks(&self, range: RangeInclusive<u16>, force: bool) -> Result<IndexReport> {
        self.run_index(IndexKind::Blocks, range, force)
    }

    /// Like [`index_blocks`](Self::index_blocks), and also records where each
    /// transaction lives.
    pub fn index_transactions(
        &self,
        range: RangeInclusive<u16>,
        force: bool,
    ) -> Result<IndexReport> {
        self.run_index(IndexKind::Transactions, range, force)
    }

    /// Records, for every input, which output it spent.
    pub fn index_spent_outputs(
        &self,
        range: RangeInclusive<u16>,
        force: bool,
    ) -> Result<IndexReport> {
        self.run_index(IndexKind::SpentOutputs, range, force)
    }

    /// Groups transactions by payload digest. Runs one file at a time so every list
    /// is in file order.
    pub fn index_duplicate_payloads(
        &self,
        range: RangeInclusive<u16>,
        force: bool,
    ) -> Result<IndexReport> {
        self.run_index(IndexKind::DuplicatePayloads, range, force)
    }

    /// Deletes an index along with its file markers.
    pub fn drop_index(&self, kind: IndexKind) -> Result<()> {
        self.store.with_write_txn(|txn| {
            txn.delete_bucket(kind.bucket())?;
            if txn.has_bucket(Bucket::IndexedFiles)? {
                let markers = txn.bucket(Bucket::IndexedFiles)?;
                let mut keys = Vec::new();
                markers.for_each(|k, _| {
                    if k.first() == Some(&kind.tag()) {
                        keys.push(k.to_vec());
                    }
                    Ok(())
                })?;
                for k in keys {
                    markers.delete(&k)?;
                }
            }
            Ok(())
        })?;
        info!("Dropped the {kind} index");
        Ok(())
    }

    /// `(file, block count)` of every file marked as indexed for `kind`.
    pub fn indexed_files(&self, kind: IndexKind) -> Result<Vec<(u16, u64)>> {
        self.store.with_read_txn(|txn| {
            let mut files = Vec::new();
            if !txn.has_bucket(Bucket::IndexedFiles)? {
                return Ok(files);
            }
            txn.bucket(Bucket::IndexedFiles)?.for_each(|k, v| {
                if k.len() == 3 && k[0] == kind.tag() && v.len() == 8 {
                    files.push((LE::read_u16(&k[1..]), LE::read_u64(v)));
                }
                Ok(())
            })?;
            Ok(files)
        })
    }

    fn is_marked(&self, kind: IndexKind, file: u16) -> Result<bool> {
        self.store.with_read_txn(|txn| {
            if !txn.has_bucket(Bucket::IndexedFiles)? {
                return Ok(false);
            }
            txn.bucket(Bucket::IndexedFiles)?
                .contains(&kind.marker_key(file))
        })
    }

    fn mark(&self, kind: IndexKind, file: u16, blocks: u64) -> Result<()> {
        let mut value = [0_u8; 8];
        LE::write_u64(&mut value, blocks);
        self.store
            .put(Bucket::IndexedFiles, &kind.marker_key(file), &value)
    }

    fn run_index(
        &self,
        kind: IndexKind,
        range: RangeInclusive<u16>,
        force: bool,
    ) -> Result<IndexReport> {
        let files = range.collect::<Vec<_>>();
        info!(
            "Building the {kind} index over {} file(s) (force: {force})",
            files.len()
        );

        let outcomes = if kind == IndexKind::DuplicatePayloads {
            files
                .iter()
                .map(|&n| self.index_file(kind, n, force))
                .collect::<Result<Vec<_>>>()?
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.workers)
                .thread_name(|i| format!("index-worker-{i}"))
                .build()
                .map_err(|e| Error::Config(format!("worker pool: {e}")))?;
            pool.install(|| {
                files
                    .par_iter()
                    .map(|&n| self.index_file(kind, n, force))
                    .collect::<Result<Vec<_>>>()
            })?
        };

        let report = IndexReport {
            kind,
            files: outcomes,
        };
        info!(
            "Finished the {kind} index: {} indexed, {} skipped, {} missing, {} failed; {} blocks, {} entries",
            report.count(|x| matches!(x, FileStatus::Indexed { .. })),
            report.count(|x| matches!(x, FileStatus::Skipped)),
            report.count(|x| matches!(x, FileStatus::Missing)),
            report.count(|x| matches!(x, FileStatus::Failed(_))),
            report.total_blocks(),
            report.total_entries(),
        );
        Ok(report)
    }

    /// `Err` only for store failures; everything else ends up in the outcome.
    fn index_file(&self, kind: IndexKind, file: u16, force: bool) -> Result<FileOutcome> {
        let status = if !self.containers.exists(file) {
            debug!("{} does not exist", self.containers.path(file).display());
            FileStatus::Missing
        } else if !force && self.is_marked(kind, file)? {
            info!("Skipping {} (already indexed)", self.containers.path(file).display());
            FileStatus::Skipped
        } else {
            info!("Parsing block file {}", self.containers.path(file).display());
            let result = match kind {
                IndexKind::Blocks => self.index_file_blocks(file, false),
                IndexKind::Transactions => self.index_file_blocks(file, true),
                IndexKind::SpentOutputs => self.index_file_spent_outputs(file),
                IndexKind::DuplicatePayloads => self.index_file_duplicates(file),
            };
            match result {
                Ok(counts) => {
                    self.mark(kind, file, counts.blocks)?;
                    // the transaction pass writes every block entry as well
                    if kind == IndexKind::Transactions {
                        self.mark(IndexKind::Blocks, file, counts.blocks)?;
                    }
                    FileStatus::Indexed {
                        blocks: counts.blocks,
                        entries: counts.entries,
                    }
                }
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => {
                    warn!("Indexing {} failed: {e}", self.containers.path(file).display());
                    FileStatus::Failed(e)
                }
            }
        };
        Ok(FileOutcome { file, status })
    }

    /// Blocks worth indexing, in file order.
    fn for_each_block(
        &self,
        file: u16,
        mut f: impl FnMut(&bitcoin::Block, bitcoin::BlockHash, u32) -> Result<()>,
    ) -> Result<u64> {
        let mut blocks = 0;
        for record in self.containers.open(file)? {
            let record = record?;
            let hash = record.block.block_hash();
            if is_all_zeros(hash.as_byte_array()) || self.is_excluded(&hash) {
                warn!("Skipping block {hash} in {}", self.containers.path(file).display());
                continue;
            }
            f(&record.block, hash, record.index_in_file)?;
            blocks += 1;
        }
        Ok(blocks)
    }

    fn index_file_blocks(&self, file: u16, with_txs: bool) -> Result<Counts> {
        let mut block_batch = Batch::new(Bucket::BlockIndex, self.config.block_batch_size);
        let mut tx_batch = Batch::new(Bucket::TransactionIndex, self.config.tx_batch_size);
        let mut entries = 0;

        let blocks = self.for_each_block(file, |block, hash, index_in_file| {
            let entry = BlockIndexEntry {
                file_index: file,
                timestamp: block.header.time as i64,
                index_in_file,
            };
            block_batch.push(self, hash.as_byte_array(), &entry.encode())?;
            entries += 1;
            if with_txs {
                for (i, tx) in block.txdata.iter().enumerate() {
                    let entry = TxIndexEntry {
                        block_hash: hash,
                        index_in_block: i as u64,
                    };
                    tx_batch.push(self, tx.compute_txid().as_byte_array(), &entry.encode())?;
                    entries += 1;
                }
            }
            Ok(())
        })?;
        block_batch.flush(self)?;
        tx_batch.flush(self)?;
        Ok(Counts { blocks, entries })
    }

    fn index_file_spent_outputs(&self, file: u16) -> Result<Counts> {
        let mut batch = Batch::new(Bucket::SpentTxOuts, self.config.spent_output_batch_size);
        let mut entries = 0;
        let blocks = self.for_each_block(file, |block, _, _| {
            for tx in &block.txdata {
                let spending_txid = tx.compute_txid();
                for (i, input) in tx.input.iter().enumerate() {
                    if input.previous_output.is_null() {
                        continue;
                    }
                    let key = SpentOutputKey::from(input.previous_output);
                    let entry = SpentOutputEntry {
                        spending_txid,
                        input_index: i as u32,
                    };
                    batch.push(self, &key.encode(), &entry.encode())?;
                    entries += 1;
                }
            }
            Ok(())
        })?;
        batch.flush(self)?;
        Ok(Counts { blocks, entries })
    }

    /// One write transaction per block.
    fn index_file_duplicates(&self, file: u16) -> Result<Counts> {
        let mut entries = 0;
        let blocks = self.for_each_block(file, |block, _, _| {
            let appended = self.store.with_write_txn(|txn| {
                let bucket = txn.create_bucket_if_not_exists(Bucket::TxOutDupes)?;
                let mut appended = 0;
                for tx in &block.txdata {
                    if append_duplicate(&bucket, tx)? {
                        appended += 1;
                    }
                }
                Ok(appended)
            })?;
            entries += appended;
            Ok(())
        })?;
        Ok(Counts { blocks, entries })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{self, coinbase, data_script, fixture, open_db, outpoint, tx, txin, txout};
    use bitcoin::{BlockHash, ScriptBuf, Txid};

    fn snapshot(db: &BlockDb, bucket: Bucket) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut rows = Vec::new();
        db.store()
            .with_read_txn(|txn| {
                txn.bucket(bucket)?.for_each(|k, v| {
                    rows.push((k.to_vec(), v.to_vec()));
                    Ok(())
                })
            })
            .unwrap();
        rows
    }

    #[test]
    fn index_blocks_is_idempotent() {
        let f = fixture();
        let db = open_db(f.dir.path());

        let first = db.index_blocks(0..=0, false).unwrap();
        assert!(first.is_success());
        assert_eq!(first.total_blocks(), 3);
        let once = snapshot(&db, Bucket::BlockIndex);
        assert_eq!(once.len(), 3);

        let skipped = db.index_blocks(0..=0, false).unwrap();
        assert!(matches!(skipped.files[0].status, FileStatus::Skipped));

        let forced = db.index_blocks(0..=0, true).unwrap();
        assert_eq!(forced.total_blocks(), 3);
        assert_eq!(snapshot(&db, Bucket::BlockIndex), once);
        assert_eq!(db.indexed_files(IndexKind::Blocks).unwrap(), vec![(0, 3)]);
    }

    #[test]
    fn small_batches_and_several_files() {
        let f = fixture();
        let more = testutil::chain_of_blocks(4);
        testutil::write_container(f.dir.path(), 1, &more);
        let mut db = open_db(f.dir.path());
        db.config.block_batch_size = 1;
        db.config.tx_batch_size = 2;

        let report = db.index_transactions(0..=2, false).unwrap();
        assert_eq!(report.files.len(), 3);
        assert!(matches!(report.files[2].status, FileStatus::Missing));
        assert_eq!(report.total_blocks(), 7);
        assert_eq!(snapshot(&db, Bucket::BlockIndex).len(), 7);
        assert_eq!(snapshot(&db, Bucket::TransactionIndex).len(), 9);

        let hash = more[3].block_hash();
        let entry = db.block_index_entry(hash).unwrap();
        assert_eq!((entry.file_index, entry.index_in_file), (1, 3));
    }

    #[test]
    fn transaction_pass_covers_blocks() {
        let f = fixture();
        let db = open_db(f.dir.path());
        db.index_transactions(0..=0, false).unwrap();
        assert_eq!(db.indexed_files(IndexKind::Blocks).unwrap(), vec![(0, 3)]);
        assert_eq!(db.indexed_files(IndexKind::Transactions).unwrap(), vec![(0, 3)]);

        let blocks = db.index_blocks(0..=0, false).unwrap();
        assert!(matches!(blocks.files[0].status, FileStatus::Skipped));
        assert_eq!(snapshot(&db, Bucket::BlockIndex).len(), 3);

        // the reverse does not hold
        let f = fixture();
        let db = open_db(f.dir.path());
        db.index_blocks(0..=0, false).unwrap();
        let txs = db.index_transactions(0..=0, false).unwrap();
        assert!(matches!(txs.files[0].status, FileStatus::Indexed { blocks: 3, .. }));
    }

    #[test]
    fn corrupt_file_does_not_stop_siblings() {
        let f = fixture();
        let mut bytes = testutil::container_bytes(&testutil::chain_of_blocks(2));
        bytes.truncate(bytes.len() - 3);
        std::fs::write(f.dir.path().join("blk00001.dat"), bytes).unwrap();
        let db = open_db(f.dir.path());

        let report = db.index_blocks(0..=1, false).unwrap();
        assert!(!report.is_success());
        let failures = report.failures().collect::<Vec<_>>();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 1);
        assert!(matches!(failures[0].1, Error::ContainerFormat { .. }));
        assert!(matches!(report.files[0].status, FileStatus::Indexed { blocks: 3, .. }));

        // the failed file is not marked, so it is retried
        assert_eq!(db.indexed_files(IndexKind::Blocks).unwrap(), vec![(0, 3)]);
    }

    #[test]
    fn duplicate_payloads_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let payload = [0x42_u8; 64];
        let cb = coinbase(9);
        let x = tx(
            vec![txin(outpoint(cb.compute_txid(), 0), ScriptBuf::new())],
            vec![txout(1, data_script(&payload))],
        );
        let y = tx(
            vec![txin(outpoint(x.compute_txid(), 0), ScriptBuf::new())],
            vec![txout(1, data_script(&payload[..32])), txout(1, data_script(&payload[32..]))],
        );
        let b0 = testutil::block(BlockHash::all_zeros(), 0, vec![cb, x.clone()]);
        let b1 = testutil::block(b0.block_hash(), 1, vec![coinbase(10), y.clone()]);
        testutil::write_container(dir.path(), 0, &[b0]);
        testutil::write_container(dir.path(), 1, &[b1]);
        let db = open_db(dir.path());

        db.index_duplicate_payloads(0..=1, false).unwrap();
        db.index_duplicate_payloads(0..=1, true).unwrap();

        let groups = db.duplicate_groups().unwrap();
        let group = groups
            .iter()
            .find(|g| g.digest == crate::sha256(&payload))
            .unwrap();
        assert_eq!(group.txids, vec![x.compute_txid(), y.compute_txid()]);
        assert_eq!(db.find_duplicates_of(y.compute_txid()).unwrap(), group.txids);
    }

    #[test]
    fn drop_index_clears_markers() {
        let f = fixture();
        let db = open_db(f.dir.path());
        db.index_spent_outputs(0..=0, false).unwrap();
        db.index_blocks(0..=0, false).unwrap();
        assert_eq!(db.indexed_files(IndexKind::SpentOutputs).unwrap().len(), 1);

        db.drop_index(IndexKind::SpentOutputs).unwrap();
        assert!(db.indexed_files(IndexKind::SpentOutputs).unwrap().is_empty());
        assert_eq!(db.indexed_files(IndexKind::Blocks).unwrap().len(), 1);
        let key = SpentOutputKey::new(f.txids[0], 0);
        assert!(matches!(db.get_spent_output(key), Err(Error::IndexNotBuilt { .. })));

        let report = db.index_spent_outputs(0..=0, false).unwrap();
        assert_eq!(report.total_entries(), 2);
        let spender: Txid = db.get_spent_output(key).unwrap().unwrap().spending_txid;
        assert_eq!(spender, f.txids[2]);
    }
}
