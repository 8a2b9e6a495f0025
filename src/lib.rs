//! Index local Bitcoin `blk*.dat` files and scan transactions for embedded data.
//!
//! - [`blockdb::BlockDb`]: block/transaction/spent-output/duplicate-payload indices
//!   with a linear-scan fallback for anything not yet indexed.
//! - [`chain`]: follows chains of dust-carrier transactions through the spend graph.
//! - [`scanner::Scanner`]: data sources × detectors × outputs over a stream of txids.

pub mod blockdb;
pub mod chain;
pub mod config;
pub mod container;
pub mod detect;
pub mod error;
pub mod explorer;
pub mod scanner;
pub mod script;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};

use bitcoin::Amount;
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

/// The smallest non-zero output value: the footprint of a data-carrying output.
pub const DUST: Amount = Amount::from_sat(1);

#[inline]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub trait EncodeHex {
    fn hex(&self) -> String;
}

impl<A: ?Sized> EncodeHex for A
where
    A: AsRef<[u8]>,
{
    fn hex(&self) -> String {
        hex::encode(self)
    }
}

pub fn is_all_zeros(hash: &[u8]) -> bool {
    hash.iter().all(|&x| x == 0)
}

/// Block header time as `YYYY-MM-DD HH:MM:SS UTC`.
pub fn format_block_time(timestamp: i64) -> String {
    match chrono::DateTime::from_timestamp(timestamp, 0) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => timestamp.to_string(),
    }
}

/// Logs to stderr. Level comes from `RUST_LOG` (`info` if unset or unparsable).
pub fn enable_logging() {
    let _ = base_dispatch().chain(io::stderr()).apply();
}

/// Logs to stderr and appends to `file`.
pub fn set_up_logging(file: impl AsRef<Path>) -> anyhow::Result<()> {
    base_dispatch()
        .chain(io::stderr())
        .chain(fern::log_file(file)?)
        .apply()?;
    Ok(())
}

fn base_dispatch() -> fern::Dispatch {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|x| x.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("rusqlite", log::LevelFilter::Warn)
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha256_digest() {
        assert_eq!(
            sha256(b"abc"),
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn all_zeros() {
        assert!(is_all_zeros(&[0; 32]));
        assert!(!is_all_zeros(&hex!("0000000000000000017275d59d5ab479d0df454acad34227abf3d2911e253914")));
    }

    #[test]
    fn block_time() {
        assert_eq!(format_block_time(1_231_006_505), "2009-01-03 18:15:05 UTC");
    }
}
