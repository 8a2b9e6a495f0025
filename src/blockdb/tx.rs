use bitcoin::{BlockHash, Transaction, Txid};

use crate::blockdb::entry::BlockIndexEntry;
use crate::container::blk_filename;
use crate::script;

/// A transaction together with where it was found.
#[derive(Debug, Clone)]
pub struct IndexedTx {
    pub tx: Transaction,
    pub txid: Txid,
    pub block_hash: BlockHash,
    pub index_in_block: u64,
    pub block: BlockIndexEntry,
}

impl IndexedTx {
    pub fn dat_filename(&self) -> String {
        blk_filename(self.block.file_index)
    }

    pub fn is_suspicious(&self) -> bool {
        crate::chain::is_suspicious(&self.tx)
    }

    pub fn max_value_output(&self) -> usize {
        crate::chain::max_value_output(&self.tx)
    }

    pub fn non_op_bytes(&self) -> Vec<u8> {
        script::concat_non_op_bytes(&self.tx.output)
    }

    pub fn block_time(&self) -> String {
        crate::format_block_time(self.block.timestamp)
    }
}
