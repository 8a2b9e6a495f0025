//! Persistent key/value index storage.
//!
//! Each logical index lives in its own bucket (a `WITHOUT ROWID` SQLite table holding
//! byte keys and byte values). Every read or write happens inside a transaction scope
//! that is committed only when the closure returns `Ok`; any other exit, including a
//! panic, rolls it back.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    BlockIndex,
    TransactionIndex,
    SpentTxOuts,
    TxOutDupes,
    /// Per-file "already indexed" markers used by incremental builds.
    IndexedFiles,
}

impl Bucket {
    pub const ALL: [Bucket; 5] = [
        Bucket::BlockIndex,
        Bucket::TransactionIndex,
        Bucket::SpentTxOuts,
        Bucket::TxOutDupes,
        Bucket::IndexedFiles,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Bucket::BlockIndex => "BlockIndex",
            Bucket::TransactionIndex => "TransactionIndex",
            Bucket::SpentTxOuts => "SpentTxOuts",
            Bucket::TxOutDupes => "TxOutDupes",
            Bucket::IndexedFiles => "IndexedFiles",
        }
    }

    pub fn build_command(&self) -> &'static str {
        match self {
            Bucket::BlockIndex => "build-db blocks",
            Bucket::TransactionIndex => "build-db transactions",
            Bucket::SpentTxOuts => "build-db spent-outputs",
            Bucket::TxOutDupes => "build-db dupes",
            Bucket::IndexedFiles => "build-db <index>",
        }
    }
}

impl Display for Bucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub struct IndexStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl IndexStore {
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!("Opened index store {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.into()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// A panic inside a transaction closure poisons the mutex, but the transaction
    /// itself has already been rolled back by then, so the connection is still usable.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_transaction<T>(
        &self,
        read_only: bool,
        f: impl FnOnce(&Txn<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        let behavior = if read_only {
            TransactionBehavior::Deferred
        } else {
            TransactionBehavior::Immediate
        };
        let txn = Txn {
            tx: conn.transaction_with_behavior(behavior)?,
            read_only,
        };
        let value = f(&txn)?;
        if !read_only {
            txn.tx.commit()?;
        }
        Ok(value)
    }

    pub fn with_read_txn<T>(&self, f: impl FnOnce(&Txn<'_>) -> Result<T>) -> Result<T> {
        self.with_transaction(true, f)
    }

    pub fn with_write_txn<T>(&self, f: impl FnOnce(&Txn<'_>) -> Result<T>) -> Result<T> {
        self.with_transaction(false, f)
    }

    /// Looks up a single key in its own read transaction.
    pub fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Vec<u8>> {
        self.with_read_txn(|txn| txn.bucket(bucket)?.get(key))
    }

    /// Writes a single key in its own write transaction, creating the bucket if needed.
    pub fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_write_txn(|txn| txn.create_bucket_if_not_exists(bucket)?.put(key, value))
    }

    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, e)| e)?;
        Ok(())
    }
}

pub struct Txn<'c> {
    tx: Transaction<'c>,
    read_only: bool,
}

impl<'c> Txn<'c> {
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn has_bucket(&self, bucket: Bucket) -> Result<bool> {
        let found = self
            .tx
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![bucket.name()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Opens an existing bucket, failing with [`Error::BucketNotFound`] if it was never
    /// created.
    pub fn bucket(&self, bucket: Bucket) -> Result<BucketRef<'_, 'c>> {
        if !self.has_bucket(bucket)? {
            return Err(Error::BucketNotFound(bucket));
        }
        Ok(BucketRef { txn: self, bucket })
    }

    pub fn create_bucket_if_not_exists(&self, bucket: Bucket) -> Result<BucketRef<'_, 'c>> {
        self.check_writable()?;
        self.tx.execute_batch(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}"
(
    key   BLOB NOT NULL PRIMARY KEY,
    value BLOB NOT NULL
) WITHOUT ROWID"#,
            bucket.name()
        ))?;
        Ok(BucketRef { txn: self, bucket })
    }

    pub fn delete_bucket(&self, bucket: Bucket) -> Result<()> {
        self.check_writable()?;
        self.tx
            .execute_batch(&format!(r#"DROP TABLE IF EXISTS "{}""#, bucket.name()))?;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyTransaction);
        }
        Ok(())
    }
}

/// A bucket opened inside a transaction.
pub struct BucketRef<'t, 'c> {
    txn: &'t Txn<'c>,
    bucket: Bucket,
}

impl BucketRef<'_, '_> {
    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    pub fn get_opt(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut stmt = self.txn.tx.prepare_cached(&format!(
            r#"SELECT value FROM "{}" WHERE key = ?1"#,
            self.bucket.name()
        ))?;
        Ok(stmt
            .query_row(params![key], |r| r.get::<_, Vec<u8>>(0))
            .optional()?)
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get_opt(key)?.ok_or_else(|| Error::KeyNotFound {
            bucket: self.bucket,
            key: key.into(),
        })
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get_opt(key)?.is_some())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.txn.check_writable()?;
        let mut stmt = self.txn.tx.prepare_cached(&format!(
            r#"INSERT OR REPLACE INTO "{}" (key, value) VALUES (?1, ?2)"#,
            self.bucket.name()
        ))?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.txn.check_writable()?;
        let mut stmt = self.txn.tx.prepare_cached(&format!(
            r#"DELETE FROM "{}" WHERE key = ?1"#,
            self.bucket.name()
        ))?;
        stmt.execute(params![key])?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        let count = self.txn.tx.query_row(
            &format!(r#"SELECT count(*) FROM "{}""#, self.bucket.name()),
            params![],
            |r| r.get::<_, i64>(0),
        )?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Visits every entry in key order.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let mut stmt = self.txn.tx.prepare(&format!(
            r#"SELECT key, value FROM "{}" ORDER BY key"#,
            self.bucket.name()
        ))?;
        let mut rows = stmt.query(params![])?;
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            f(&key, &value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn missing_bucket_and_missing_key_are_distinct() {
        let store = IndexStore::open_in_memory().unwrap();
        let err = store.get(Bucket::BlockIndex, b"k").unwrap_err();
        assert!(matches!(err, Error::BucketNotFound(Bucket::BlockIndex)));

        store.put(Bucket::BlockIndex, b"a", b"1").unwrap();
        let err = store.get(Bucket::BlockIndex, b"k").unwrap_err();
        assert!(matches!(err, Error::KeyNotFound { bucket: Bucket::BlockIndex, .. }));
        assert_eq!(store.get(Bucket::BlockIndex, b"a").unwrap(), b"1");
    }

    #[test]
    fn failed_write_transaction_is_rolled_back() {
        let store = IndexStore::open_in_memory().unwrap();
        store.put(Bucket::SpentTxOuts, b"keep", b"v").unwrap();

        let result: Result<()> = store.with_write_txn(|txn| {
            let bucket = txn.create_bucket_if_not_exists(Bucket::SpentTxOuts)?;
            bucket.put(b"a", b"1")?;
            bucket.put(b"b", b"2")?;
            Err(Error::NullHash)
        });
        assert!(result.is_err());

        store
            .with_read_txn(|txn| {
                let bucket = txn.bucket(Bucket::SpentTxOuts)?;
                assert_eq!(bucket.len()?, 1);
                assert!(!bucket.contains(b"a")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn panicking_write_transaction_is_rolled_back() {
        let store = IndexStore::open_in_memory().unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = store.with_write_txn(|txn| {
                txn.create_bucket_if_not_exists(Bucket::TxOutDupes)?
                    .put(b"a", b"1")?;
                panic!("boom");
            });
        }));
        assert!(result.is_err());

        let err = store.get(Bucket::TxOutDupes, b"a").unwrap_err();
        assert!(matches!(err, Error::BucketNotFound(_)));
    }

    #[test]
    fn read_transaction_rejects_writes() {
        let store = IndexStore::open_in_memory().unwrap();
        let err = store
            .with_read_txn(|txn| txn.create_bucket_if_not_exists(Bucket::BlockIndex).map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnlyTransaction));
    }

    #[test]
    fn for_each_visits_in_key_order() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .with_write_txn(|txn| {
                let bucket = txn.create_bucket_if_not_exists(Bucket::TxOutDupes)?;
                bucket.put(b"c", b"3")?;
                bucket.put(b"a", b"1")?;
                bucket.put(b"b", b"2")?;
                Ok(())
            })
            .unwrap();

        let mut seen = Vec::new();
        store
            .with_read_txn(|txn| {
                txn.bucket(Bucket::TxOutDupes)?.for_each(|k, v| {
                    seen.push((k.to_vec(), v.to_vec()));
                    Ok(())
                })
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");

        let store = IndexStore::open_or_create(&path).unwrap();
        store.put(Bucket::TransactionIndex, b"tx", b"row").unwrap();
        store.close().unwrap();

        let store = IndexStore::open_or_create(&path).unwrap();
        assert_eq!(store.get(Bucket::TransactionIndex, b"tx").unwrap(), b"row");

        store
            .with_write_txn(|txn| txn.delete_bucket(Bucket::TransactionIndex))
            .unwrap();
        assert!(matches!(
            store.get(Bucket::TransactionIndex, b"tx"),
            Err(Error::BucketNotFound(_))
        ));
    }
}
