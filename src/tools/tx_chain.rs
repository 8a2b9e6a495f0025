//! Follows a chain of dust-carrier transactions from a starting txid.
//!
//! Needs the transaction and spent-output indices for the forward direction.

use bitcoin::Txid;
use blk_scanner::blockdb::BlockDb;
use blk_scanner::chain::{crawl_backward, crawl_both, ForwardChain};
use blk_scanner::config::ConfigArgs;
use clap::{Parser, ValueEnum};
use log::info;

#[derive(Parser, Debug)]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,
    txid: Txid,
    #[arg(short, long, value_enum, default_value_t = Direction::Both)]
    direction: Direction,
    /// Stop after this many transactions (0: no limit)
    #[arg(short, long, default_value_t = 0)]
    limit: usize,
    /// Also print where each transaction is stored
    #[arg(short = 'v', long)]
    details: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Direction {
    Backward,
    Forward,
    Both,
}

fn main() -> anyhow::Result<()> {
    blk_scanner::enable_logging();
    let args = Args::parse();
    let db = BlockDb::open(args.config.load()?)?;

    let print = |txid: Txid| -> anyhow::Result<()> {
        if args.details {
            let tx = db.get_tx(txid)?;
            println!(
                "{txid} {} {} suspicious={}",
                tx.dat_filename(),
                tx.block_time(),
                tx.is_suspicious()
            );
        } else {
            println!("{txid}");
        }
        Ok(())
    };

    let mut count = 0;
    match args.direction {
        Direction::Backward => {
            for txid in crawl_backward(&db, args.txid, args.limit)? {
                print(txid)?;
                count += 1;
            }
        }
        Direction::Forward => {
            for txid in ForwardChain::new(&db, args.txid, args.limit) {
                print(txid?)?;
                count += 1;
            }
        }
        Direction::Both => {
            for txid in crawl_both(&db, args.txid, args.limit)? {
                print(txid)?;
                count += 1;
            }
        }
    }
    info!("{count} transactions in chain");

    db.close()?;
    Ok(())
}
