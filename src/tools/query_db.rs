//! Looks things up in the indices (falling back to scanning the `blk*.dat` files).

use bitcoin::{BlockHash, Txid};
use blk_scanner::blockdb::entry::SpentOutputKey;
use blk_scanner::blockdb::BlockDb;
use blk_scanner::config::ConfigArgs;
use blk_scanner::{format_block_time, EncodeHex};
use clap::{Parser, Subcommand};
use pretty_hex::PrettyHex;

#[derive(Parser, Debug)]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Where a block is stored
    Block { hash: BlockHash },
    /// Where a transaction is stored, and what its outputs carry
    Tx {
        txid: Txid,
        /// Hex dump of the concatenated output payload
        #[arg(short, long)]
        dump: bool,
    },
    /// Who spent an output
    Spent { txid: Txid, vout: u32 },
    /// Transactions whose outputs carry the same payload as this one
    Dupes { txid: Txid },
    /// Every payload carried by more than one transaction
    DupeGroups,
}

fn main() -> anyhow::Result<()> {
    blk_scanner::enable_logging();
    let args = Args::parse();
    let db = BlockDb::open(args.config.load()?)?;

    match args.command {
        Command::Block { hash } => {
            let entry = db.block_index_entry(hash)?;
            let block = db.get_block(hash)?;
            println!("block:        {hash}");
            println!("file:         blk{:05}.dat", entry.file_index);
            println!("index:        {}", entry.index_in_file);
            println!("time:         {}", format_block_time(entry.timestamp));
            println!("transactions: {}", block.txdata.len());
        }
        Command::Tx { txid, dump } => {
            let tx = db.get_tx(txid)?;
            println!("tx:         {txid}");
            println!("block:      {}", tx.block_hash);
            println!("file:       {}", tx.dat_filename());
            println!("index:      {}", tx.index_in_block);
            println!("time:       {}", tx.block_time());
            println!("suspicious: {}", tx.is_suspicious());
            println!("max output: {}", tx.max_value_output());
            for (i, txout) in tx.tx.output.iter().enumerate() {
                println!("  #{i}: {} {}", txout.value, txout.script_pubkey.as_bytes().hex());
            }
            if dump {
                println!("{:?}", tx.non_op_bytes().hex_dump());
            }
        }
        Command::Spent { txid, vout } => match db.get_spent_output(SpentOutputKey::new(txid, vout))? {
            Some(e) => println!("{txid}:{vout} spent by {}:{}", e.spending_txid, e.input_index),
            None => println!("{txid}:{vout}: no spend known"),
        },
        Command::Dupes { txid } => {
            for x in db.find_duplicates_of(txid)? {
                println!("{x}");
            }
        }
        Command::DupeGroups => {
            for group in db.duplicate_groups()? {
                println!("{} ({} txs)", group.digest.hex(), group.txids.len());
                for x in group.txids {
                    println!("  {x}");
                }
            }
        }
    }

    db.close()?;
    Ok(())
}
