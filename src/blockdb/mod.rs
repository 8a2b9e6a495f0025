//! Indices over the local container files, and lookups that fall back to scanning the
//! containers when the indices can't answer.

pub mod build;
pub mod entry;
pub mod tx;

use std::collections::HashSet;

use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, Transaction, Txid};
use log::{debug, info, warn};

use crate::chain::SpendGraph;
use crate::config::Config;
use crate::container::ContainerDir;
use crate::error::Entity;
use crate::explorer::BlockExplorer;
use crate::scanner::TxResolver;
use crate::store::{Bucket, BucketRef, IndexStore};
use crate::{is_all_zeros, script, Error, Result};
use entry::{
    decode_hash_list, encode_hash_list, BlockIndexEntry, SpentOutputEntry, SpentOutputKey,
    TxIndexEntry,
};
pub use tx::IndexedTx;

/// Transactions sharing one payload digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub digest: [u8; 32],
    pub txids: Vec<Txid>,
}

pub struct BlockDb {
    store: IndexStore,
    containers: ContainerDir,
    config: Config,
    excluded: HashSet<BlockHash>,
    explorer: Option<Box<dyn BlockExplorer + Send + Sync>>,
}

impl BlockDb {
    /// Opens (creating if needed) the index store and container directory named by
    /// `config`.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = IndexStore::open_or_create(&config.index_path)?;
        let containers = ContainerDir::new(&config.blocks_dir, config.magic())
            .with_xor_key(config.xor_key()?);
        Self::new(store, containers, config)
    }

    pub fn new(store: IndexStore, containers: ContainerDir, config: Config) -> Result<Self> {
        let excluded = config.excluded_block_hashes()?;
        Ok(Self {
            store,
            containers,
            config,
            excluded,
            explorer: None,
        })
    }

    /// Consulted by [`get_tx`](Self::get_tx) before falling back to a container scan.
    pub fn with_explorer(mut self, explorer: impl BlockExplorer + Send + Sync + 'static) -> Self {
        self.explorer = Some(Box::new(explorer));
        self
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn containers(&self) -> &ContainerDir {
        &self.containers
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn close(self) -> Result<()> {
        self.store.close()
    }

    pub fn is_excluded(&self, hash: &BlockHash) -> bool {
        self.excluded.contains(hash)
    }

    fn check_block_hash(&self, hash: &BlockHash) -> Result<()> {
        if is_all_zeros(hash.as_byte_array()) {
            return Err(Error::NullHash);
        }
        if self.is_excluded(hash) {
            return Err(Error::Excluded(hash.to_string()));
        }
        Ok(())
    }

    /// `Ok(None)` when the index can't answer (bucket or key missing).
    fn lookup<T>(
        &self,
        bucket: Bucket,
        key: &[u8],
        decode: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<Option<T>> {
        match self.store.get(bucket, key) {
            Ok(bytes) => decode(&bytes).map(Some),
            Err(e) if e.is_index_miss() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn block_index_entry(&self, hash: BlockHash) -> Result<BlockIndexEntry> {
        self.check_block_hash(&hash)?;
        if let Some(entry) =
            self.lookup(Bucket::BlockIndex, hash.as_byte_array(), BlockIndexEntry::decode)?
        {
            return Ok(entry);
        }
        self.scan_for_block(hash).map(|(entry, _)| entry)
    }

    pub fn get_block(&self, hash: BlockHash) -> Result<Block> {
        let entry = self.block_index_entry(hash)?;
        let block = self
            .containers
            .load_block(entry.file_index, entry.index_in_file)?;
        if block.block_hash() == hash {
            return Ok(block);
        }
        warn!(
            "Stale index entry for block {hash} ({}:{}), rescanning",
            entry.file_index, entry.index_in_file
        );
        self.scan_for_block(hash).map(|(_, block)| block)
    }

    pub fn tx_index_entry(&self, txid: Txid) -> Result<TxIndexEntry> {
        self.get_tx(txid).map(|x| TxIndexEntry {
            block_hash: x.block_hash,
            index_in_block: x.index_in_block,
        })
    }

    /// Index first, then the explorer (if one was injected), then a linear scan of
    /// the container files. Whatever finds the transaction backfills the index.
    pub fn get_tx(&self, txid: Txid) -> Result<IndexedTx> {
        if is_all_zeros(txid.as_byte_array()) {
            return Err(Error::NullHash);
        }
        if let Some(found) = self.tx_from_index(txid)? {
            return Ok(found);
        }
        if let Some(explorer) = &self.explorer {
            match self.tx_from_explorer(explorer.as_ref(), txid) {
                Ok(Some(found)) => return Ok(found),
                Ok(None) => {}
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => warn!("Explorer lookup of {txid} failed: {e}"),
            }
        }
        self.scan_for_tx(txid)
    }

    fn tx_from_index(&self, txid: Txid) -> Result<Option<IndexedTx>> {
        let Some(entry) =
            self.lookup(Bucket::TransactionIndex, txid.as_byte_array(), TxIndexEntry::decode)?
        else {
            return Ok(None);
        };
        let block = self.get_block(entry.block_hash)?;
        let located = self.tx_in_block(&block, entry.block_hash, txid, Some(entry.index_in_block))?;
        if located.is_none() {
            warn!("Stale index entry for transaction {txid}, rescanning");
        }
        Ok(located)
    }

    fn tx_from_explorer(
        &self,
        explorer: &(dyn BlockExplorer + Send + Sync),
        txid: Txid,
    ) -> Result<Option<IndexedTx>> {
        let block_hash = explorer.block_for_tx(txid)?;
        debug!("Explorer places {txid} in block {block_hash}");
        let block = self.get_block(block_hash)?;
        let Some(found) = self.tx_in_block(&block, block_hash, txid, None)? else {
            return Ok(None);
        };
        self.store.put(
            Bucket::TransactionIndex,
            txid.as_byte_array(),
            &TxIndexEntry {
                block_hash,
                index_in_block: found.index_in_block,
            }
            .encode(),
        )?;
        Ok(Some(found))
    }

    /// Finds `txid` in an already loaded block, checking `hint` first.
    fn tx_in_block(
        &self,
        block: &Block,
        block_hash: BlockHash,
        txid: Txid,
        hint: Option<u64>,
    ) -> Result<Option<IndexedTx>> {
        let position = match hint {
            Some(i) if block.txdata.get(i as usize).map(|x| x.compute_txid()) == Some(txid) => {
                Some(i as usize)
            }
            Some(_) => None,
            None => block.txdata.iter().position(|x| x.compute_txid() == txid),
        };
        let Some(i) = position else {
            return Ok(None);
        };
        Ok(Some(IndexedTx {
            tx: block.txdata[i].clone(),
            txid,
            block_hash,
            index_in_block: i as u64,
            block: self.block_index_entry(block_hash)?,
        }))
    }

    /// Walks every container file from 0 looking for `predicate`, logging progress.
    fn scan_containers<T>(
        &self,
        what: &str,
        mut predicate: impl FnMut(&Block, BlockHash) -> Option<T>,
    ) -> Result<Option<(T, BlockIndexEntry, BlockHash)>> {
        info!("{what} is not indexed, scanning container files from 0");
        for number in self.containers.files() {
            info!("Scanning {}", self.containers.path(number).display());
            for record in self.containers.open(number)? {
                let record = match record {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("{e}");
                        break;
                    }
                };
                let hash = record.block.block_hash();
                if let Some(found) = predicate(&record.block, hash) {
                    let entry = BlockIndexEntry {
                        file_index: number,
                        timestamp: record.block.header.time as i64,
                        index_in_file: record.index_in_file,
                    };
                    return Ok(Some((found, entry, hash)));
                }
            }
        }
        Ok(None)
    }

    fn scan_for_block(&self, hash: BlockHash) -> Result<(BlockIndexEntry, Block)> {
        let found = self.scan_containers(&format!("Block {hash}"), |block, h| {
            (h == hash).then(|| block.clone())
        })?;
        let Some((block, entry, _)) = found else {
            return Err(Error::EntityNotFound {
                entity: Entity::Block,
                id: hash.to_string(),
                operation: "get_block",
            });
        };
        self.store
            .put(Bucket::BlockIndex, hash.as_byte_array(), &entry.encode())?;
        info!("Found block {hash} in {}", self.containers.path(entry.file_index).display());
        Ok((entry, block))
    }

    fn scan_for_tx(&self, txid: Txid) -> Result<IndexedTx> {
        let found = self.scan_containers(&format!("Transaction {txid}"), |block, h| {
            if self.excluded.contains(&h) {
                return None;
            }
            block
                .txdata
                .iter()
                .position(|x| x.compute_txid() == txid)
                .map(|i| (i, block.txdata[i].clone()))
        })?;
        let Some(((index, tx), entry, block_hash)) = found else {
            return Err(Error::EntityNotFound {
                entity: Entity::Transaction,
                id: txid.to_string(),
                operation: "get_tx",
            });
        };
        let tx_entry = TxIndexEntry {
            block_hash,
            index_in_block: index as u64,
        };
        self.store.with_write_txn(|txn| {
            txn.create_bucket_if_not_exists(Bucket::BlockIndex)?
                .put(block_hash.as_byte_array(), &entry.encode())?;
            txn.create_bucket_if_not_exists(Bucket::TransactionIndex)?
                .put(txid.as_byte_array(), &tx_entry.encode())
        })?;
        info!("Found transaction {txid} in block {block_hash}");
        Ok(IndexedTx {
            tx,
            txid,
            block_hash,
            index_in_block: index as u64,
            block: entry,
        })
    }

    /// `Ok(None)` means the spend is unknown to the index, not that the output is
    /// unspent. Fails with [`Error::IndexNotBuilt`] if the index was never built.
    pub fn get_spent_output(&self, key: SpentOutputKey) -> Result<Option<SpentOutputEntry>> {
        match self.store.get(Bucket::SpentTxOuts, &key.encode()) {
            Ok(bytes) => SpentOutputEntry::decode(&bytes).map(Some),
            Err(Error::KeyNotFound { .. }) => Ok(None),
            Err(Error::BucketNotFound(bucket)) => Err(Error::IndexNotBuilt { bucket }),
            Err(e) => Err(e),
        }
    }

    /// Like [`get_spent_output`](Self::get_spent_output), but asks `explorer` about
    /// spends the index doesn't know and records what it learns.
    pub fn resolve_spent_output(
        &self,
        key: SpentOutputKey,
        explorer: &dyn BlockExplorer,
    ) -> Result<Option<SpentOutputEntry>> {
        match self.get_spent_output(key) {
            Ok(Some(entry)) => return Ok(Some(entry)),
            Ok(None) | Err(Error::IndexNotBuilt { .. }) => {}
            Err(e) => return Err(e),
        }
        let Some((spending_txid, input_index)) =
            explorer.spender_of_output(key.txid, key.output_index)?
        else {
            return Ok(None);
        };
        let entry = SpentOutputEntry {
            spending_txid,
            input_index,
        };
        self.store
            .put(Bucket::SpentTxOuts, &key.encode(), &entry.encode())?;
        Ok(Some(entry))
    }

    /// Appends `tx` to the list for its payload digest. Returns `false` when the
    /// transaction has no payload or is already listed.
    pub fn record_duplicate_payload(&self, tx: &Transaction) -> Result<bool> {
        self.store.with_write_txn(|txn| {
            let bucket = txn.create_bucket_if_not_exists(Bucket::TxOutDupes)?;
            append_duplicate(&bucket, tx)
        })
    }

    /// Every indexed transaction (itself included) whose payload digest matches
    /// `txid`'s.
    pub fn find_duplicates_of(&self, txid: Txid) -> Result<Vec<Txid>> {
        let tx = self.get_tx(txid)?;
        let digest = script::payload_digest(&tx.tx);
        match self.store.get(Bucket::TxOutDupes, &digest) {
            Ok(bytes) => decode_hash_list(&bytes),
            Err(Error::KeyNotFound { .. }) => Ok(Vec::new()),
            Err(Error::BucketNotFound(bucket)) => Err(Error::IndexNotBuilt { bucket }),
            Err(e) => Err(e),
        }
    }

    /// Digests shared by at least two transactions, in digest order.
    pub fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>> {
        let mut groups = Vec::new();
        let result = self.store.with_read_txn(|txn| {
            txn.bucket(Bucket::TxOutDupes)?.for_each(|key, value| {
                let txids = decode_hash_list(value)?;
                if txids.len() >= 2 {
                    let digest = key.try_into().map_err(|_| Error::MalformedKey {
                        bucket: Bucket::TxOutDupes,
                        reason: format!("digest of {} bytes", key.len()),
                    })?;
                    groups.push(DuplicateGroup { digest, txids });
                }
                Ok(())
            })
        });
        match result {
            Ok(()) => Ok(groups),
            Err(Error::BucketNotFound(bucket)) => Err(Error::IndexNotBuilt { bucket }),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn append_duplicate(bucket: &BucketRef<'_, '_>, tx: &Transaction) -> Result<bool> {
    let payload = script::concat_non_op_bytes(&tx.output);
    if payload.is_empty() {
        return Ok(false);
    }
    let digest = crate::sha256(&payload);
    let txid = tx.compute_txid();
    let mut list = match bucket.get_opt(&digest)? {
        Some(bytes) => decode_hash_list(&bytes)?,
        None => Vec::new(),
    };
    if list.contains(&txid) {
        return Ok(false);
    }
    list.push(txid);
    bucket.put(&digest, &encode_hash_list(&list))?;
    Ok(true)
}

impl SpendGraph for BlockDb {
    fn transaction(&self, txid: Txid) -> Result<Transaction> {
        self.get_tx(txid).map(|x| x.tx)
    }

    fn spender(&self, output: SpentOutputKey) -> Result<Option<SpentOutputEntry>> {
        self.get_spent_output(output)
    }
}

impl TxResolver for BlockDb {
    fn resolve(&self, txid: Txid) -> Result<Transaction> {
        self.get_tx(txid).map(|x| x.tx)
    }
}
