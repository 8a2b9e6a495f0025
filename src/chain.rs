//! Follows chains of dust-carrier transactions through the spend graph.
//!
//! Backward: while the current transaction is suspicious and has a single input,
//! step to the transaction that funded it. Forward: step along the highest-value
//! output to whoever spent it.

use bitcoin::{Transaction, Txid};
use log::{debug, warn};

use crate::blockdb::entry::{SpentOutputEntry, SpentOutputKey};
use crate::{Result, DUST};

/// What the crawler needs from an index.
pub trait SpendGraph {
    fn transaction(&self, txid: Txid) -> Result<Transaction>;

    /// Who spent `output`. `None` means "not known", which is not the same as unspent.
    fn spender(&self, output: SpentOutputKey) -> Result<Option<SpentOutputEntry>>;
}

/// At least two outputs, and all but one of them carry exactly the dust amount.
pub fn is_suspicious(tx: &Transaction) -> bool {
    let n = tx.output.len();
    let tiny = tx.output.iter().filter(|x| x.value == DUST).count();
    n >= 2 && tiny == n - 1
}

/// Index of the output with the largest value; the first one wins a tie.
pub fn max_value_output(tx: &Transaction) -> usize {
    let mut max_index = 0;
    let mut max_value = bitcoin::Amount::ZERO;
    for (i, txout) in tx.output.iter().enumerate() {
        if txout.value > max_value {
            max_value = txout.value;
            max_index = i;
        }
    }
    max_index
}

/// Ancestors of `start` in root-to-start order, `start` last. `limit > 0` caps the
/// number of transactions visited.
pub fn crawl_backward(graph: &impl SpendGraph, start: Txid, limit: usize) -> Result<Vec<Txid>> {
    let mut chain = vec![start];
    let mut tx = graph.transaction(start)?;
    loop {
        if limit > 0 && chain.len() >= limit {
            break;
        }
        if !is_suspicious(&tx) || tx.input.len() != 1 {
            break;
        }
        let prev = tx.input[0].previous_output;
        if prev.is_null() {
            break;
        }
        let parent = graph.transaction(prev.txid)?;
        if !is_suspicious(&parent) {
            debug!("{} is not suspicious, backward chain ends", prev.txid);
            break;
        }
        chain.push(prev.txid);
        tx = parent;
    }
    chain.reverse();
    Ok(chain)
}

/// Lazily walks forward from a transaction along its highest-value output.
pub struct ForwardChain<'g, G> {
    graph: &'g G,
    next: Option<Txid>,
    limit: usize,
    emitted: usize,
}

impl<'g, G: SpendGraph> ForwardChain<'g, G> {
    pub fn new(graph: &'g G, start: Txid, limit: usize) -> Self {
        Self {
            graph,
            next: Some(start),
            limit,
            emitted: 0,
        }
    }

    fn step(&self, txid: Txid) -> Result<Option<Txid>> {
        let tx = self.graph.transaction(txid)?;
        if tx.output.is_empty() {
            return Ok(None);
        }
        let key = SpentOutputKey::new(txid, max_value_output(&tx) as u32);
        match self.graph.spender(key) {
            Ok(x) => Ok(x.map(|e| e.spending_txid)),
            Err(e) if e.is_index_miss() => {
                warn!("Forward crawl stops at {txid}: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl<G: SpendGraph> Iterator for ForwardChain<'_, G> {
    type Item = Result<Txid>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.limit > 0 && self.emitted >= self.limit {
            return None;
        }
        let current = self.next.take()?;
        self.emitted += 1;
        match self.step(current) {
            Ok(next) => {
                self.next = next;
                Some(Ok(current))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

pub fn crawl_forward(graph: &impl SpendGraph, start: Txid, limit: usize) -> Result<Vec<Txid>> {
    ForwardChain::new(graph, start, limit).collect()
}

/// Backward chain followed by the forward chain, `start` appearing once.
pub fn crawl_both(graph: &impl SpendGraph, start: Txid, limit: usize) -> Result<Vec<Txid>> {
    let mut chain = crawl_backward(graph, start, limit)?;
    for txid in ForwardChain::new(graph, start, limit).skip(1) {
        chain.push(txid?);
    }
    Ok(chain)
}
