use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use crate::store::Bucket;

pub type Result<T> = std::result::Result<T, Error>;

/// What kind of entity a lookup was after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Block,
    Transaction,
    SpentOutput,
    DuplicatePayload,
}

impl Entity {
    /// The `build-db` subcommand that populates the index for this entity.
    pub fn build_command(&self) -> &'static str {
        match self {
            Entity::Block => "build-db blocks",
            Entity::Transaction => "build-db transactions",
            Entity::SpentOutput => "build-db spent-outputs",
            Entity::DuplicatePayload => "build-db dupes",
        }
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Entity::Block => "block",
            Entity::Transaction => "transaction",
            Entity::SpentOutput => "spent output",
            Entity::DuplicatePayload => "duplicate payload",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("corrupt container record #{record} in {}: {reason}", path.display())]
    ContainerFormat {
        path: PathBuf,
        record: u32,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bucket {0} does not exist")]
    BucketNotFound(Bucket),

    #[error("key {} not found in bucket {bucket}", hex::encode(key))]
    KeyNotFound { bucket: Bucket, key: Vec<u8> },

    #[error("the {bucket} index has not been built yet; run `{}` on your .dat files first", bucket.build_command())]
    IndexNotBuilt { bucket: Bucket },

    #[error("can't find {entity} {id} ({operation}); try running `{}` on the .dat file that contains it", entity.build_command())]
    EntityNotFound {
        entity: Entity,
        id: String,
        operation: &'static str,
    },

    #[error("crc32 mismatch: expected {expected:08x}, computed {actual:08x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("not enough data: need {needed} bytes, have {available}")]
    NotEnoughData { needed: usize, available: usize },

    #[error("malformed value in bucket {bucket}: {reason}")]
    MalformedKey { bucket: Bucket, reason: String },

    #[error("refusing to look up the all-zero hash")]
    NullHash,

    #[error("block {0} is on the exclusion list")]
    Excluded(String),

    #[error("script: {0}")]
    Script(#[from] bitcoin::script::Error),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("{}:{line}: not a transaction hash: {value:?}", path.display())]
    InvalidHash {
        path: PathBuf,
        line: usize,
        value: String,
    },

    #[error("block explorer: {0}")]
    Explorer(String),

    #[error("{} output(s) failed to close: {}", .0.len(), format_close_failures(.0))]
    OutputsClose(Vec<(String, Error)>),

    #[error("write attempted inside a read-only transaction")]
    ReadOnlyTransaction,

    #[error("invalid config: {0}")]
    Config(String),
}

fn format_close_failures(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(name, e)| format!("{name}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Errors that mean "the index can't answer this", as opposed to real failures.
    pub fn is_index_miss(&self) -> bool {
        matches!(
            self,
            Error::BucketNotFound(_) | Error::KeyNotFound { .. } | Error::IndexNotBuilt { .. }
        )
    }

    /// Failures of the index store itself. These abort a whole build.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::Store(_) | Error::MalformedKey { .. })
    }
}
