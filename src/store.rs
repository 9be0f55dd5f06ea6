//! Embedded ordered key-value store backing one project database.
//!
//! A thin byte→byte layer over a single SQLite file
//! (`<db_root>/<name>.ldb/kv.sqlite`): point get/put/delete, ordered prefix
//! scans, and an atomic [`WriteBatch`] that either applies completely or not
//! at all. WAL journaling lets worker threads hold read-only connections
//! ([`StoreReader`]) while the main thread writes.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};

use crate::error::{Result, SymdbError};

const DB_FILE_NAME: &str = "kv.sqlite";

/// How [`Store::open`] treats a missing or pre-existing database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail unless the database already exists.
    Open,
    /// Open the database, creating it when absent.
    CreateIfMissing,
    /// Create the database, failing when it already exists.
    ErrorIfExists,
}

/// One buffered operation of a [`WriteBatch`].
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An atomic multi-operation write. Operations are buffered in memory and
/// applied in one transaction by [`Store::write`]; dropping the batch
/// without writing discards everything.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Read-only handle usable off the owning thread. Workers consult the skip
/// cache through this; all mutation stays on the [`Store`].
pub struct StoreReader {
    conn: Connection,
    dir: PathBuf,
}

impl StoreReader {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        get_impl(&self.conn, &self.dir, key)
    }
}

/// The writing handle, exclusively owned by the project on the main thread.
pub struct Store {
    conn: Connection,
    dir: PathBuf,
}

impl Store {
    /// Opens the database directory according to `mode`.
    pub fn open(dir: &Path, mode: OpenMode) -> Result<Self> {
        let db_file = dir.join(DB_FILE_NAME);

        match mode {
            OpenMode::Open => {
                if !db_file.exists() {
                    return Err(SymdbError::kvs(dir, "database does not exist"));
                }
            }
            OpenMode::CreateIfMissing => {
                fs::create_dir_all(dir)?;
            }
            OpenMode::ErrorIfExists => {
                if db_file.exists() {
                    return Err(SymdbError::kvs(dir, "database already exists"));
                }
                fs::create_dir_all(dir)?;
            }
        }

        let conn = Connection::open(&db_file).map_err(|e| SymdbError::kvs(dir, e))?;
        init_connection(&conn, dir)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL) WITHOUT ROWID",
            [],
        )
        .map_err(|e| SymdbError::kvs(dir, e))?;

        Ok(Self {
            conn,
            dir: dir.to_path_buf(),
        })
    }

    /// Removes a database directory and everything in it.
    pub fn destroy(dir: &Path) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// The database directory this store lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Opens an additional read-only connection for use on worker threads.
    pub fn reader(&self) -> Result<StoreReader> {
        let db_file = self.dir.join(DB_FILE_NAME);
        let conn = Connection::open_with_flags(
            &db_file,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SymdbError::kvs(&self.dir, e))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| SymdbError::kvs(&self.dir, e))?;
        Ok(StoreReader {
            conn,
            dir: self.dir.clone(),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        get_impl(&self.conn, &self.dir, key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, value],
            )
            .map_err(|e| SymdbError::kvs(&self.dir, e))?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", [key])
            .map_err(|e| SymdbError::kvs(&self.dir, e))?;
        Ok(())
    }

    /// Applies every operation of `batch` in one transaction.
    pub fn write(&mut self, batch: WriteBatch) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| SymdbError::kvs(&self.dir, e))?;
        {
            let mut put = tx
                .prepare_cached(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .map_err(|e| SymdbError::kvs(&self.dir, e))?;
            let mut del = tx
                .prepare_cached("DELETE FROM kv WHERE key = ?1")
                .map_err(|e| SymdbError::kvs(&self.dir, e))?;

            for op in &batch.ops {
                match op {
                    BatchOp::Put(key, value) => {
                        put.execute(rusqlite::params![key, value])
                            .map_err(|e| SymdbError::kvs(&self.dir, e))?;
                    }
                    BatchOp::Delete(key) => {
                        del.execute([key]).map_err(|e| SymdbError::kvs(&self.dir, e))?;
                    }
                }
            }
        }
        tx.commit().map_err(|e| SymdbError::kvs(&self.dir, e))
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut upper = prefix.to_vec();
        // The smallest byte string greater than every key with this prefix.
        while let Some(last) = upper.last_mut() {
            if *last < u8::MAX {
                *last += 1;
                break;
            }
            upper.pop();
        }

        let mut stmt = if upper.is_empty() {
            self.conn
                .prepare_cached("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")
        } else {
            self.conn
                .prepare_cached("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")
        }
        .map_err(|e| SymdbError::kvs(&self.dir, e))?;

        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(Vec<u8>, Vec<u8>)> {
            Ok((row.get(0)?, row.get(1)?))
        };

        let rows = if upper.is_empty() {
            stmt.query_map([prefix], map_row)
        } else {
            stmt.query_map(rusqlite::params![prefix, upper], map_row)
        }
        .map_err(|e| SymdbError::kvs(&self.dir, e))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| SymdbError::kvs(&self.dir, e))?);
        }
        Ok(out)
    }
}

fn init_connection(conn: &Connection, dir: &Path) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| SymdbError::kvs(dir, e))?;
    // Durability is optional for the index; a crash loses at most the last
    // few commits and the next sync re-parses the affected files.
    conn.pragma_update(None, "synchronous", "OFF")
        .map_err(|e| SymdbError::kvs(dir, e))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|e| SymdbError::kvs(dir, e))?;
    Ok(())
}

fn get_impl(conn: &Connection, dir: &Path, key: &[u8]) -> Result<Option<Vec<u8>>> {
    use rusqlite::OptionalExtension;
    conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
    .map_err(|e| SymdbError::kvs(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("p.ldb");
        (tmp, dir)
    }

    #[test]
    fn open_modes() {
        let (_tmp, dir) = scratch();

        assert!(Store::open(&dir, OpenMode::Open).is_err());
        let store = Store::open(&dir, OpenMode::ErrorIfExists).unwrap();
        drop(store);
        assert!(Store::open(&dir, OpenMode::ErrorIfExists).is_err());
        Store::open(&dir, OpenMode::Open).unwrap();
        Store::open(&dir, OpenMode::CreateIfMissing).unwrap();
    }

    #[test]
    fn point_operations() {
        let (_tmp, dir) = scratch();
        let store = Store::open(&dir, OpenMode::CreateIfMissing).unwrap();

        assert_eq!(store.get(b"k").unwrap(), None);
        store.put(b"k", b"v1").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v1".to_vec()));
        store.put(b"k", b"v2").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn batch_applies_atomically() {
        let (_tmp, dir) = scratch();
        let mut store = Store::open(&dir, OpenMode::CreateIfMissing).unwrap();
        store.put(b"a", b"old").unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"new".to_vec());
        batch.put(b"b".to_vec(), b"1".to_vec());
        batch.delete(b"missing".to_vec());
        store.write(batch).unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"new".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn dropped_batch_writes_nothing() {
        let (_tmp, dir) = scratch();
        let store = Store::open(&dir, OpenMode::CreateIfMissing).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"x".to_vec(), b"1".to_vec());
        drop(batch);

        assert_eq!(store.get(b"x").unwrap(), None);
    }

    #[test]
    fn prefix_scan_is_ordered() {
        let (_tmp, dir) = scratch();
        let store = Store::open(&dir, OpenMode::CreateIfMissing).unwrap();
        store.put(b"file:info:b.cpp", b"2").unwrap();
        store.put(b"file:info:a.cpp", b"1").unwrap();
        store.put(b"symdef:x", b"3").unwrap();

        let rows = store.scan_prefix(b"file:info:").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"file:info:a.cpp".to_vec(), b"file:info:b.cpp".to_vec()]);
    }

    #[test]
    fn reader_sees_committed_writes() {
        let (_tmp, dir) = scratch();
        let store = Store::open(&dir, OpenMode::CreateIfMissing).unwrap();
        store.put(b"k", b"v").unwrap();

        let reader = store.reader().unwrap();
        assert_eq!(reader.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(reader.get(b"absent").unwrap(), None);
    }

    #[test]
    fn destroy_removes_directory() {
        let (_tmp, dir) = scratch();
        let store = Store::open(&dir, OpenMode::CreateIfMissing).unwrap();
        drop(store);
        Store::destroy(&dir).unwrap();
        assert!(!dir.exists());
    }
}
