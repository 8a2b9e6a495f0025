//! Optional remote lookups. Nothing in the core requires one; a `BlockDb` consults an
//! injected explorer only after its own index misses.

use std::collections::HashMap;

use bitcoin::{BlockHash, Txid};

use crate::{Error, Result};

pub trait BlockExplorer {
    /// The block that confirmed `txid`.
    fn block_for_tx(&self, txid: Txid) -> Result<BlockHash>;

    /// The `(spending txid, input index)` of an output, or `None` if it is unspent.
    fn spender_of_output(&self, txid: Txid, output_index: u32) -> Result<Option<(Txid, u32)>>;
}

/// Answers from fixed tables. Handy for offline fixtures.
#[derive(Default, Debug, Clone)]
pub struct StaticExplorer {
    pub blocks: HashMap<Txid, BlockHash>,
    pub spenders: HashMap<(Txid, u32), (Txid, u32)>,
}

impl BlockExplorer for StaticExplorer {
    fn block_for_tx(&self, txid: Txid) -> Result<BlockHash> {
        self.blocks
            .get(&txid)
            .copied()
            .ok_or_else(|| Error::Explorer(format!("unknown transaction {txid}")))
    }

    fn spender_of_output(&self, txid: Txid, output_index: u32) -> Result<Option<(Txid, u32)>> {
        Ok(self.spenders.get(&(txid, output_index)).copied())
    }
}
