//! Named byte buffers pulled out of a transaction.

use bitcoin::{Transaction, TxOut};

use crate::chain::max_value_output;
use crate::script;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// One buffer produced by a [`DataSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub name: String,
    pub direction: Direction,
    /// Input/output index, `None` for buffers built from several of them.
    pub index: Option<usize>,
    pub data: Vec<u8>,
}

impl Extracted {
    fn input(name: String, index: usize, data: Vec<u8>) -> Self {
        Self {
            name,
            direction: Direction::In,
            index: Some(index),
            data,
        }
    }

    fn output(name: String, index: usize, data: Vec<u8>) -> Self {
        Self {
            name,
            direction: Direction::Out,
            index: Some(index),
            data,
        }
    }

    fn whole(name: &str, direction: Direction, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            direction,
            index: None,
            data,
        }
    }
}

pub trait DataSource {
    fn name(&self) -> &str;

    /// An error means "no data of this kind here", not a failure of the scan.
    fn extract(&self, tx: &Transaction) -> Result<Vec<Extracted>>;
}

/// Each input script as-is.
pub struct InputScripts;

impl DataSource for InputScripts {
    fn name(&self) -> &str {
        "txin-script"
    }

    fn extract(&self, tx: &Transaction) -> Result<Vec<Extracted>> {
        Ok(tx
            .input
            .iter()
            .enumerate()
            .map(|(i, x)| Extracted::input(format!("txin-script-{i}"), i, x.script_sig.to_bytes()))
            .collect())
    }
}

/// All input scripts back to back.
pub struct InputScriptsConcat;

impl DataSource for InputScriptsConcat {
    fn name(&self) -> &str {
        "inputs-concatenated"
    }

    fn extract(&self, tx: &Transaction) -> Result<Vec<Extracted>> {
        let data = tx
            .input
            .iter()
            .flat_map(|x| x.script_sig.as_bytes())
            .copied()
            .collect();
        Ok(vec![Extracted::whole(self.name(), Direction::In, data)])
    }
}

/// The literal pushes of each input script. One undecodable script fails the whole
/// source.
pub struct InputScriptPushdata;

impl DataSource for InputScriptPushdata {
    fn name(&self) -> &str {
        "txin-script-pushdata"
    }

    fn extract(&self, tx: &Transaction) -> Result<Vec<Extracted>> {
        tx.input
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let data = script::push_data(&x.script_sig)?;
                Ok(Extracted::input(format!("txin-script-pushdata-{i}"), i, data))
            })
            .collect()
    }
}

/// The non-opcode literal bytes of each input script, the same filter the output
/// sources apply. One undecodable script fails the whole source.
pub struct InputScriptNonOp;

impl DataSource for InputScriptNonOp {
    fn name(&self) -> &str {
        "txin-script-nonop"
    }

    fn extract(&self, tx: &Transaction) -> Result<Vec<Extracted>> {
        tx.input
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let data = script::non_op_bytes(&x.script_sig)?;
                Ok(Extracted::input(format!("txin-script-nonop-{i}"), i, data))
            })
            .collect()
    }
}

/// Outputs in the order the flags ask for, paired with their original index.
fn select_outputs(tx: &Transaction, skip_max_value: bool, order_by_value: bool) -> Vec<(usize, &TxOut)> {
    let mut outputs = tx.output.iter().enumerate().collect::<Vec<_>>();
    if skip_max_value && !outputs.is_empty() {
        let max = max_value_output(tx);
        outputs.retain(|&(i, _)| i != max);
    }
    if order_by_value {
        outputs.sort_by_key(|(_, x)| x.value);
    }
    outputs
}

fn flag_suffix(skip_max_value: bool, order_by_value: bool) -> &'static str {
    match (order_by_value, skip_max_value) {
        (true, true) => "-byvalue-skipmaxvalue",
        (true, false) => "-byvalue",
        (false, true) => "-skipmaxvalue",
        (false, false) => "",
    }
}

/// The non-opcode literal bytes of each output script. Outputs whose script does not
/// disassemble are left out.
#[derive(Debug, Clone)]
pub struct OutputScripts {
    /// Leave out the output carrying the change.
    skip_max_value: bool,
    order_by_value: bool,
    name: String,
}

impl OutputScripts {
    pub fn new(skip_max_value: bool, order_by_value: bool) -> Self {
        Self {
            skip_max_value,
            order_by_value,
            name: format!("txout-script{}", flag_suffix(skip_max_value, order_by_value)),
        }
    }
}

impl DataSource for OutputScripts {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(&self, tx: &Transaction) -> Result<Vec<Extracted>> {
        Ok(select_outputs(tx, self.skip_max_value, self.order_by_value)
            .into_iter()
            .filter_map(|(i, x)| {
                let data = script::non_op_bytes(&x.script_pubkey).ok()?;
                Some(Extracted::output(format!("txout-script-{i}"), i, data))
            })
            .collect())
    }
}

/// [`OutputScripts`] joined into a single buffer.
#[derive(Debug, Clone)]
pub struct OutputScriptsConcat {
    skip_max_value: bool,
    order_by_value: bool,
    name: String,
}

impl OutputScriptsConcat {
    pub fn new(skip_max_value: bool, order_by_value: bool) -> Self {
        Self {
            skip_max_value,
            order_by_value,
            name: format!(
                "outputs-concatenated{}",
                flag_suffix(skip_max_value, order_by_value)
            ),
        }
    }
}

impl DataSource for OutputScriptsConcat {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(&self, tx: &Transaction) -> Result<Vec<Extracted>> {
        let outputs = select_outputs(tx, self.skip_max_value, self.order_by_value);
        let data = script::concat_non_op_bytes(outputs.into_iter().map(|(_, x)| x));
        Ok(vec![Extracted::whole(&self.name, Direction::Out, data)])
    }
}

/// The push following `OP_RETURN`, per output.
pub struct OpReturn;

impl DataSource for OpReturn {
    fn name(&self) -> &str {
        "txout-script-opreturn"
    }

    fn extract(&self, tx: &Transaction) -> Result<Vec<Extracted>> {
        Ok(tx
            .output
            .iter()
            .enumerate()
            .filter_map(|(i, x)| {
                let data = script::op_return_bytes(&x.script_pubkey).ok()??;
                Some(Extracted::output(format!("txout-script-opreturn-{i}"), i, data))
            })
            .collect())
    }
}

/// The length/CRC-32 framed payload carried by the concatenated output literals.
pub struct SatoshiEncoded;

impl DataSource for SatoshiEncoded {
    fn name(&self) -> &str {
        "outputs-satoshi"
    }

    fn extract(&self, tx: &Transaction) -> Result<Vec<Extracted>> {
        let literals = script::concat_non_op_bytes(&tx.output);
        let payload = script::decode_satoshi(&literals)?;
        Ok(vec![Extracted::whole(
            self.name(),
            Direction::Out,
            payload.to_vec(),
        )])
    }
}

/// The extractors the `scan` tool runs when none are picked.
pub fn default_data_sources() -> Vec<Box<dyn DataSource>> {
    vec![
        Box::new(InputScripts),
        Box::new(InputScriptsConcat),
        Box::new(InputScriptNonOp),
        Box::new(OutputScripts::new(false, false)),
        Box::new(OutputScriptsConcat::new(false, false)),
        Box::new(OpReturn),
        Box::new(SatoshiEncoded),
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{data_script, op_return_script, outpoint, push, tx, txin, txout};
    use crate::Error;
    use bitcoin::hashes::Hash;
    use bitcoin::opcodes::all::OP_CHECKSIG;
    use bitcoin::script::Builder;
    use bitcoin::{ScriptBuf, Txid};

    fn sample() -> Transaction {
        let prev = outpoint(Txid::all_zeros(), 0);
        tx(
            vec![
                txin(prev, Builder::new().push_slice(push(b"first")).into_script()),
                txin(prev, Builder::new().push_slice(push(b"second")).into_script()),
            ],
            vec![
                txout(1, data_script(&[0xaa; 20])),
                txout(5000, data_script(&[0xbb; 20])),
                txout(1, op_return_script(b"memo")),
                txout(3, data_script(&[0xcc; 33])),
            ],
        )
    }

    fn names(extracted: &[Extracted]) -> Vec<&str> {
        extracted.iter().map(|x| x.name.as_str()).collect()
    }

    #[test]
    fn input_sources() {
        let tx = sample();
        let scripts = InputScripts.extract(&tx).unwrap();
        assert_eq!(names(&scripts), ["txin-script-0", "txin-script-1"]);
        assert_eq!(scripts[0].data, tx.input[0].script_sig.to_bytes());
        assert_eq!(scripts[1].direction, Direction::In);

        let concat = InputScriptsConcat.extract(&tx).unwrap();
        assert_eq!(concat.len(), 1);
        assert_eq!(concat[0].data.len(), 6 + 7);
        assert_eq!(concat[0].index, None);

        let pushes = InputScriptPushdata.extract(&tx).unwrap();
        assert_eq!(pushes[0].data, b"first");
        assert_eq!(pushes[1].name, "txin-script-pushdata-1");
    }

    #[test]
    fn input_literals_drop_short_pushes() {
        let prev = outpoint(Txid::all_zeros(), 0);
        let spend = tx(
            vec![
                // signature-ish short push, then a compressed pubkey
                txin(
                    prev,
                    Builder::new()
                        .push_slice(push(&[0x30; 9]))
                        .push_slice(push(&[0x02; 33]))
                        .into_script(),
                ),
                txin(prev, Builder::new().push_slice(push(&[0x44; 19])).into_script()),
                txin(prev, Builder::new().push_slice(push(&[0x55; 20])).into_script()),
            ],
            vec![],
        );
        let extracted = InputScriptNonOp.extract(&spend).unwrap();
        assert_eq!(
            names(&extracted),
            ["txin-script-nonop-0", "txin-script-nonop-1", "txin-script-nonop-2"]
        );
        assert_eq!(extracted[0].data, [0x02; 33]);
        assert!(extracted[1].data.is_empty());
        assert_eq!(extracted[2].data, [0x55; 20]);
        assert_eq!(extracted[2].direction, Direction::In);

        let mut broken = spend;
        broken.input[1].script_sig = ScriptBuf::from_bytes(vec![0x4b, 0x01]);
        assert!(InputScriptNonOp.extract(&broken).is_err());
    }

    #[test]
    fn output_scripts_with_flags() {
        let tx = sample();
        let plain = OutputScripts::new(false, false);
        assert_eq!(plain.name(), "txout-script");
        let extracted = plain.extract(&tx).unwrap();
        assert_eq!(
            names(&extracted),
            ["txout-script-0", "txout-script-1", "txout-script-2", "txout-script-3"]
        );
        // "memo" is shorter than a literal
        assert!(extracted[2].data.is_empty());

        let skip = OutputScripts::new(true, false);
        assert_eq!(skip.name(), "txout-script-skipmaxvalue");
        assert_eq!(
            names(&skip.extract(&tx).unwrap()),
            ["txout-script-0", "txout-script-2", "txout-script-3"]
        );

        let by_value = OutputScripts::new(false, true);
        assert_eq!(by_value.name(), "txout-script-byvalue");
        assert_eq!(
            names(&by_value.extract(&tx).unwrap()),
            ["txout-script-0", "txout-script-2", "txout-script-3", "txout-script-1"]
        );

        let concat = OutputScriptsConcat::new(true, true);
        assert_eq!(concat.name(), "outputs-concatenated-byvalue-skipmaxvalue");
        let data = &concat.extract(&tx).unwrap()[0].data;
        let mut expected = vec![0xaa; 20];
        expected.extend_from_slice(&[0xcc; 33]);
        assert_eq!(data, &expected);
    }

    #[test]
    fn undecodable_output_is_left_out() {
        let mut tx = sample();
        // claims a 75-byte push but ends early
        tx.output[0].script_pubkey = ScriptBuf::from_bytes(vec![0x4b, 0x01, 0x02]);
        let extracted = OutputScripts::new(false, false).extract(&tx).unwrap();
        assert_eq!(extracted.len(), 3);
        assert_eq!(extracted[0].index, Some(1));
    }

    #[test]
    fn op_return_outputs() {
        let extracted = OpReturn.extract(&sample()).unwrap();
        assert_eq!(
            extracted,
            vec![Extracted {
                name: "txout-script-opreturn-2".into(),
                direction: Direction::Out,
                index: Some(2),
                data: b"memo".to_vec(),
            }]
        );
    }

    #[test]
    fn satoshi_payload_across_outputs() {
        let payload = b"a document split over several outputs of a transaction".to_vec();
        let framed = script::encode_satoshi(&payload);
        let output = framed
            .chunks(20)
            .map(|chunk| {
                let mut chunk = chunk.to_vec();
                chunk.resize(20, 0);
                txout(1, data_script(&chunk))
            })
            .collect();
        let carrier = tx(vec![], output);
        let extracted = SatoshiEncoded.extract(&carrier).unwrap();
        assert_eq!(extracted[0].name, "outputs-satoshi");
        assert_eq!(extracted[0].data, payload);

        let plain = tx(vec![], vec![txout(1, data_script(&[0x11; 40]))]);
        assert!(matches!(
            SatoshiEncoded.extract(&plain),
            Err(Error::Checksum { .. }) | Err(Error::NotEnoughData { .. })
        ));
        let bare = tx(
            vec![],
            vec![txout(1, Builder::new().push_opcode(OP_CHECKSIG).into_script())],
        );
        assert!(matches!(
            SatoshiEncoded.extract(&bare),
            Err(Error::NotEnoughData { needed: 8, available: 0 })
        ));
    }
}
