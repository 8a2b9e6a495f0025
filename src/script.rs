//! Script-level byte extraction and the length/CRC-32 ("satoshi") payload framing.

use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::Instruction;
use bitcoin::{Script, Transaction, TxOut};
use byteorder::{ByteOrder, LE};

use crate::{Error, Result};

/// Shorter pushes are signatures, pubkey fragments or small numbers, not payload.
pub const MIN_LITERAL_LEN: usize = 20;

/// Every literal push of the script, concatenated, whatever its size.
pub fn push_data(script: &Script) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    for instruction in script.instructions() {
        if let Instruction::PushBytes(bytes) = instruction? {
            data.extend_from_slice(bytes.as_bytes());
        }
    }
    Ok(data)
}

/// The literal pushes of at least [`MIN_LITERAL_LEN`] bytes, concatenated. Fails if
/// the script does not disassemble.
pub fn non_op_bytes(script: &Script) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    for instruction in script.instructions() {
        match instruction? {
            Instruction::PushBytes(bytes) if bytes.len() >= MIN_LITERAL_LEN => {
                data.extend_from_slice(bytes.as_bytes())
            }
            _ => {}
        }
    }
    Ok(data)
}

/// The data push following `OP_RETURN`, if there is one.
pub fn op_return_bytes(script: &Script) -> Result<Option<Vec<u8>>> {
    let mut instructions = script.instructions();
    while let Some(instruction) = instructions.next() {
        if matches!(instruction?, Instruction::Op(op) if op == OP_RETURN) {
            return match instructions.next() {
                Some(Ok(Instruction::PushBytes(bytes))) => Ok(Some(bytes.as_bytes().to_vec())),
                Some(Err(e)) => Err(e.into()),
                _ => Ok(None),
            };
        }
    }
    Ok(None)
}

/// [`non_op_bytes`] of each output in order, concatenated. Outputs whose script does
/// not disassemble contribute nothing.
pub fn concat_non_op_bytes<'a>(outputs: impl IntoIterator<Item = &'a TxOut>) -> Vec<u8> {
    let mut data = Vec::new();
    for txout in outputs {
        if let Ok(bytes) = non_op_bytes(&txout.script_pubkey) {
            data.extend_from_slice(&bytes);
        }
    }
    data
}

/// Key of the duplicate-payload index.
pub fn payload_digest(tx: &Transaction) -> [u8; 32] {
    crate::sha256(&concat_non_op_bytes(&tx.output))
}

/// Unwraps `[u32 LE length][u32 LE crc32][payload]`, returning the payload.
pub fn decode_satoshi(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 8 {
        return Err(Error::NotEnoughData {
            needed: 8,
            available: data.len(),
        });
    }
    let length = LE::read_u32(&data[0..4]) as usize;
    let expected = LE::read_u32(&data[4..8]);
    let body = &data[8..];
    if body.len() < length {
        return Err(Error::NotEnoughData {
            needed: 8 + length,
            available: data.len(),
        });
    }
    let payload = &body[..length];
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(Error::Checksum { expected, actual });
    }
    Ok(payload)
}

pub fn encode_satoshi(payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0_u8; 8];
    LE::write_u32(&mut data[0..4], payload.len() as u32);
    LE::write_u32(&mut data[4..8], crc32fast::hash(payload));
    data.extend_from_slice(payload);
    data
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{data_script, op_return_script, push, txout};
    use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_3};
    use bitcoin::script::Builder;
    use bitcoin::ScriptBuf;
    use hex_literal::hex;
    use proptest::prelude::*;

    #[test]
    fn short_pushes_are_dropped() {
        let script = Builder::new()
            .push_opcode(OP_PUSHNUM_1)
            .push_slice(push(&[0x11; 33]))
            .push_slice(push(&[0x22; 19]))
            .push_slice(push(&[0x33; 20]))
            .push_opcode(OP_PUSHNUM_3)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script();
        let mut expected = vec![0x11; 33];
        expected.extend_from_slice(&[0x33; 20]);
        assert_eq!(non_op_bytes(&script).unwrap(), expected);
        assert_eq!(push_data(&script).unwrap().len(), 33 + 19 + 20);
    }

    #[test]
    fn truncated_script_fails_to_disassemble() {
        // claims a 32-byte push but carries 2 bytes
        let script = ScriptBuf::from_bytes(hex!("20abcd").to_vec());
        assert!(non_op_bytes(&script).is_err());

        let outputs = [
            txout(1, script),
            txout(1, data_script(&[0x44; 20])),
        ];
        assert_eq!(concat_non_op_bytes(&outputs), vec![0x44; 20]);
    }

    #[test]
    fn op_return_payload() {
        assert_eq!(
            op_return_bytes(&op_return_script(b"hello")).unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(op_return_bytes(&data_script(&[0x01; 20])).unwrap(), None);
        let bare = Builder::new().push_opcode(OP_RETURN).into_script();
        assert_eq!(op_return_bytes(&bare).unwrap(), None);
    }

    #[test]
    fn satoshi_decode_errors() {
        assert!(matches!(
            decode_satoshi(&[1, 2, 3]),
            Err(Error::NotEnoughData { needed: 8, available: 3 })
        ));

        let mut framed = encode_satoshi(b"some document");
        framed.truncate(framed.len() - 1);
        assert!(matches!(decode_satoshi(&framed), Err(Error::NotEnoughData { .. })));

        // trailing bytes past the declared length are ignored
        let mut framed = encode_satoshi(b"abc");
        framed.extend_from_slice(&[0; 7]);
        assert_eq!(decode_satoshi(&framed).unwrap(), b"abc");
    }

    proptest! {
        #[test]
        fn satoshi_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let framed = encode_satoshi(&payload);
            prop_assert_eq!(decode_satoshi(&framed).unwrap(), payload.as_slice());
        }

        #[test]
        fn satoshi_byte_flip_fails_checksum(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            flip in 1_u8..=255,
        ) {
            let mut framed = encode_satoshi(&payload);
            let i = 8 + index.index(payload.len());
            framed[i] ^= flip;
            let is_checksum_error = matches!(decode_satoshi(&framed), Err(Error::Checksum { .. }));
            prop_assert!(is_checksum_error);
        }
    }
}
