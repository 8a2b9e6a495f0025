//! Fixture builders shared by the unit tests.

use std::path::Path;

use tempfile::TempDir;

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_RETURN};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{
    transaction, Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};

use crate::blockdb::BlockDb;
use crate::config::Config;
use crate::container::{blk_filename, ContainerDir};
use crate::store::IndexStore;

/// Mainnet magic.
pub const MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

pub fn push(data: &[u8]) -> PushBytesBuf {
    PushBytesBuf::try_from(data.to_vec()).unwrap()
}

/// `<data> OP_CHECKSIG`
pub fn data_script(data: &[u8]) -> ScriptBuf {
    Builder::new()
        .push_slice(push(data))
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

pub fn op_return_script(data: &[u8]) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(push(data))
        .into_script()
}

pub fn txout(value: u64, script: ScriptBuf) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: script,
    }
}

pub fn txin(previous_output: OutPoint, script_sig: ScriptBuf) -> TxIn {
    TxIn {
        previous_output,
        script_sig,
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

pub fn tx(input: Vec<TxIn>, output: Vec<TxOut>) -> Transaction {
    Transaction {
        version: transaction::Version::ONE,
        lock_time: LockTime::ZERO,
        input,
        output,
    }
}

/// A coinbase made unique by `tag`.
pub fn coinbase(tag: u32) -> Transaction {
    tx(
        vec![txin(
            OutPoint::null(),
            Builder::new().push_slice(push(&tag.to_le_bytes())).into_script(),
        )],
        vec![txout(50 * 100_000_000, data_script(&[0x02; 33]))],
    )
}

/// Spends `prev` and creates outputs with the given values, each carrying a distinct
/// 20-byte payload.
pub fn spend(prev: &[OutPoint], values: &[u64]) -> Transaction {
    let input = prev
        .iter()
        .map(|&p| txin(p, Builder::new().push_slice(push(&[0x30; 8])).into_script()))
        .collect();
    let output = values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let mut seed = Vec::new();
            for p in prev {
                seed.extend_from_slice(p.txid.as_byte_array());
                seed.extend_from_slice(&p.vout.to_le_bytes());
            }
            seed.extend_from_slice(&(i as u32).to_le_bytes());
            txout(v, data_script(&crate::sha256(&seed)[..20]))
        })
        .collect();
    tx(input, output)
}

pub fn outpoint(txid: Txid, vout: u32) -> OutPoint {
    OutPoint { txid, vout }
}

pub fn block(prev_blockhash: BlockHash, nonce: u32, txdata: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: Header {
            version: Version::ONE,
            prev_blockhash,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_231_006_505 + nonce * 600,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            nonce,
        },
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

/// `n` linked blocks holding only a coinbase each. The coinbases differ from the
/// ones in [`fixture`].
pub fn chain_of_blocks(n: u32) -> Vec<Block> {
    let mut prev = BlockHash::all_zeros();
    (0..n)
        .map(|i| {
            let b = block(prev, i, vec![coinbase(0x1000 + i)]);
            prev = b.block_hash();
            b
        })
        .collect()
}

pub fn container_bytes(blocks: &[Block]) -> Vec<u8> {
    let mut out = Vec::new();
    for b in blocks {
        let data = bitcoin::consensus::serialize(b);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);
    }
    out
}

pub fn write_container(dir: &Path, number: u16, blocks: &[Block]) {
    std::fs::write(dir.join(blk_filename(number)), container_bytes(blocks)).unwrap();
}

pub struct Fixture {
    pub dir: TempDir,
    pub blocks: Vec<Block>,
    /// In block order: `[cb0, cb1, a, cb2, b]`. `a` spends `cb0:0`, `b` spends `a:2`.
    pub txids: Vec<Txid>,
}

/// One container file with 3 blocks and 5 transactions.
pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let cb0 = coinbase(0);
    let cb1 = coinbase(1);
    let a = spend(&[outpoint(cb0.compute_txid(), 0)], &[1, 1, 40_000]);
    let b = spend(&[outpoint(a.compute_txid(), 2)], &[1, 1, 30_000]);
    let cb2 = coinbase(2);

    let b0 = block(BlockHash::all_zeros(), 0, vec![cb0]);
    let b1 = block(b0.block_hash(), 1, vec![cb1, a]);
    let b2 = block(b1.block_hash(), 2, vec![cb2, b]);
    let blocks = vec![b0, b1, b2];
    write_container(dir.path(), 0, &blocks);

    let txids = blocks
        .iter()
        .flat_map(|b| b.txdata.iter().map(|x| x.compute_txid()))
        .collect();
    Fixture { dir, blocks, txids }
}

/// A `BlockDb` over `dir` with an in-memory index.
pub fn open_db(dir: &Path) -> BlockDb {
    let config = Config {
        blocks_dir: dir.into(),
        workers: 2,
        ..Default::default()
    };
    BlockDb::new(
        IndexStore::open_in_memory().unwrap(),
        ContainerDir::new(dir, MAGIC),
        config,
    )
    .unwrap()
}
