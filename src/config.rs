//! Runtime configuration, loadable from a JSON file. Every field has a default so a
//! partial file (or none at all) works.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use bitcoin::{BlockHash, Network};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A block whose contents trip up indexing; excluded unless overridden.
pub const KNOWN_BAD_BLOCK: &str =
    "0000000000000000017275d59d5ab479d0df454acad34227abf3d2911e253914";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Directory holding `blk*.dat` files.
    pub blocks_dir: PathBuf,
    /// Index store file.
    pub index_path: PathBuf,
    pub network: Network,
    /// Optional `xor.dat` (Bitcoin Core >= 28 obfuscates block files with it).
    pub xor_key_file: Option<PathBuf>,
    /// Concurrent container files during index builds.
    pub workers: usize,
    pub block_batch_size: usize,
    pub tx_batch_size: usize,
    pub spent_output_batch_size: usize,
    /// Block hashes (display hex) that are never indexed or looked up.
    pub excluded_blocks: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blocks_dir: PathBuf::from("blocks"),
            index_path: PathBuf::from("blockchain.db"),
            network: Network::Bitcoin,
            xor_key_file: None,
            workers: 5,
            block_batch_size: 10,
            tx_batch_size: 5000,
            spent_output_batch_size: 5000,
            excluded_blocks: vec![KNOWN_BAD_BLOCK.into()],
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: Config = serde_json::from_reader(File::open(path)?)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.block_batch_size == 0 || self.tx_batch_size == 0 || self.spent_output_batch_size == 0
        {
            return Err(Error::Config("batch sizes must be at least 1".into()));
        }
        self.excluded_block_hashes()?;
        Ok(())
    }

    pub fn magic(&self) -> [u8; 4] {
        self.network.magic().to_bytes()
    }

    pub fn excluded_block_hashes(&self) -> Result<HashSet<BlockHash>> {
        self.excluded_blocks
            .iter()
            .map(|x| {
                x.parse::<BlockHash>()
                    .map_err(|e| Error::Config(format!("excluded block {x}: {e}")))
            })
            .collect()
    }

    pub fn xor_key(&self) -> Result<Option<[u8; 8]>> {
        let Some(path) = &self.xor_key_file else {
            return Ok(None);
        };
        let bytes = std::fs::read(path)?;
        let key: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Config(format!("{}: expected 8 bytes", path.display())))?;
        // an all-zero key means "not obfuscated"
        Ok((key != [0; 8]).then_some(key))
    }
}

/// Flags shared by the command-line tools. Anything given here overrides the file.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// JSON config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Directory holding blk*.dat files
    #[arg(short, long)]
    pub blocks_dir: Option<PathBuf>,
    /// Index store file
    #[arg(short, long)]
    pub index: Option<PathBuf>,
    #[arg(long)]
    pub network: Option<Network>,
    #[arg(short, long)]
    pub workers: Option<usize>,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<Config> {
        let mut config = Config::load_or_default(self.config.as_deref())?;
        if let Some(x) = &self.blocks_dir {
            config.blocks_dir = x.clone();
        }
        if let Some(x) = &self.index {
            config.index_path = x.clone();
        }
        if let Some(x) = self.network {
            config.network = x;
        }
        if let Some(x) = self.workers {
            config.workers = x;
        }
        config.validate()?;
        Ok(config)
    }
}
