//! Fixed-width little-endian encodings of the index values. Hashes are stored in
//! internal byte order.

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};
use byteorder::{ByteOrder, LE};

use crate::store::Bucket;
use crate::{Error, Result};

fn check_len(bucket: Bucket, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(Error::MalformedKey {
            bucket,
            reason: format!("expected {expected} bytes, got {}", bytes.len()),
        });
    }
    Ok(())
}

fn hash32(bytes: &[u8]) -> [u8; 32] {
    let mut h = [0_u8; 32];
    h.copy_from_slice(&bytes[..32]);
    h
}

/// Where a block lives in the container files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub file_index: u16,
    pub timestamp: i64,
    pub index_in_file: u32,
}

impl BlockIndexEntry {
    pub const SIZE: usize = 14;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        LE::write_u16(&mut buf[0..2], self.file_index);
        LE::write_i64(&mut buf[2..10], self.timestamp);
        LE::write_u32(&mut buf[10..14], self.index_in_file);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(Bucket::BlockIndex, bytes, Self::SIZE)?;
        Ok(Self {
            file_index: LE::read_u16(&bytes[0..2]),
            timestamp: LE::read_i64(&bytes[2..10]),
            index_in_file: LE::read_u32(&bytes[10..14]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxIndexEntry {
    pub block_hash: BlockHash,
    pub index_in_block: u64,
}

impl TxIndexEntry {
    pub const SIZE: usize = 40;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        buf[..32].copy_from_slice(self.block_hash.as_byte_array());
        LE::write_u64(&mut buf[32..40], self.index_in_block);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(Bucket::TransactionIndex, bytes, Self::SIZE)?;
        Ok(Self {
            block_hash: BlockHash::from_byte_array(hash32(bytes)),
            index_in_block: LE::read_u64(&bytes[32..40]),
        })
    }
}

/// Identifies a transaction output; key of the spent-output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpentOutputKey {
    pub txid: Txid,
    pub output_index: u32,
}

impl SpentOutputKey {
    pub const SIZE: usize = 36;

    pub fn new(txid: Txid, output_index: u32) -> Self {
        Self { txid, output_index }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        buf[..32].copy_from_slice(self.txid.as_byte_array());
        LE::write_u32(&mut buf[32..36], self.output_index);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(Bucket::SpentTxOuts, bytes, Self::SIZE)?;
        Ok(Self {
            txid: Txid::from_byte_array(hash32(bytes)),
            output_index: LE::read_u32(&bytes[32..36]),
        })
    }
}

impl From<OutPoint> for SpentOutputKey {
    fn from(value: OutPoint) -> Self {
        Self::new(value.txid, value.vout)
    }
}

/// The input that spent an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpentOutputEntry {
    pub spending_txid: Txid,
    pub input_index: u32,
}

impl SpentOutputEntry {
    pub const SIZE: usize = 36;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0_u8; Self::SIZE];
        buf[..32].copy_from_slice(self.spending_txid.as_byte_array());
        LE::write_u32(&mut buf[32..36], self.input_index);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(Bucket::SpentTxOuts, bytes, Self::SIZE)?;
        Ok(Self {
            spending_txid: Txid::from_byte_array(hash32(bytes)),
            input_index: LE::read_u32(&bytes[32..36]),
        })
    }
}

pub fn encode_hash_list(hashes: &[Txid]) -> Vec<u8> {
    hashes
        .iter()
        .flat_map(|h| h.as_byte_array().iter().copied())
        .collect()
}

pub fn decode_hash_list(bytes: &[u8]) -> Result<Vec<Txid>> {
    if bytes.len() % 32 != 0 {
        return Err(Error::MalformedKey {
            bucket: Bucket::TxOutDupes,
            reason: format!("hash list length {} is not a multiple of 32", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(32)
        .map(|c| Txid::from_byte_array(hash32(c)))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn block_entry_layout() {
        let entry = BlockIndexEntry {
            file_index: 0x0102,
            timestamp: -2,
            index_in_file: 7,
        };
        assert_eq!(
            entry.encode(),
            [2, 1, 0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 7, 0, 0, 0]
        );
    }

    #[test]
    fn wrong_length_is_malformed() {
        assert!(matches!(
            BlockIndexEntry::decode(&[0; 13]),
            Err(Error::MalformedKey { bucket: Bucket::BlockIndex, .. })
        ));
        assert!(matches!(
            TxIndexEntry::decode(&[0; 41]),
            Err(Error::MalformedKey { bucket: Bucket::TransactionIndex, .. })
        ));
        assert!(matches!(
            decode_hash_list(&[0; 33]),
            Err(Error::MalformedKey { bucket: Bucket::TxOutDupes, .. })
        ));
        assert!(decode_hash_list(&[]).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn block_entry_round_trip(file_index: u16, timestamp: i64, index_in_file: u32) {
            let entry = BlockIndexEntry { file_index, timestamp, index_in_file };
            prop_assert_eq!(BlockIndexEntry::decode(&entry.encode()).unwrap(), entry);
        }

        #[test]
        fn tx_entry_round_trip(hash: [u8; 32], index_in_block: u64) {
            let entry = TxIndexEntry { block_hash: BlockHash::from_byte_array(hash), index_in_block };
            prop_assert_eq!(TxIndexEntry::decode(&entry.encode()).unwrap(), entry);
        }

        #[test]
        fn spent_output_round_trip(a: [u8; 32], b: [u8; 32], output_index: u32, input_index: u32) {
            let key = SpentOutputKey::new(Txid::from_byte_array(a), output_index);
            let entry = SpentOutputEntry { spending_txid: Txid::from_byte_array(b), input_index };
            prop_assert_eq!(SpentOutputKey::decode(&key.encode()).unwrap(), key);
            prop_assert_eq!(SpentOutputEntry::decode(&entry.encode()).unwrap(), entry);
        }

        #[test]
        fn hash_list_round_trip(hashes in proptest::collection::vec(any::<[u8; 32]>(), 0..8)) {
            let list = hashes.into_iter().map(Txid::from_byte_array).collect::<Vec<_>>();
            prop_assert_eq!(decode_hash_list(&encode_hash_list(&list)).unwrap(), list);
        }
    }
}
