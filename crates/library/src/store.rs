use std::fs;
use std::path::Path;
use std::sync::Arc;

use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError,
};
use serde::{Deserialize, Serialize};

/// Separator for composite keys, chosen to sort before any printable byte.
pub const KEY_SEP: char = '\x1f';

pub const TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks");
pub const ALBUMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("albums");
pub const ARTISTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("artists");
pub const COVERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("covers");
pub const PATHS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("paths");
pub const USER_DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("user_data");
pub const PLAYLISTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("playlists");
pub const SHARES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("shares");
pub const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Ordered key/value store with atomic per-key operations and prefix
/// iteration. No secondary indexes; referential integrity is restored by
/// the consistency sweeper instead.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };
        let store = Self { db: Arc::new(db) };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            for table in ALL_TABLES {
                let _ = write_txn.open_table(*table)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(table) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value = match table.get(key)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(value)
    }

    pub fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            let bytes = encode_value(value)?;
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = match write_txn.open_table(table) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(false),
                Err(err) => return Err(err.into()),
            };
            let removed = table.remove(key)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// All entries of a table, in key order. Corrupt values are skipped and
    /// reported so one bad record cannot wedge a whole sweep.
    pub fn list<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(table) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut items = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            push_decoded(&mut items, entry.0.value(), entry.1.value());
        }
        Ok(items)
    }

    pub fn list_prefix<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(table) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut items = Vec::new();
        let mut end = prefix.to_string();
        end.push('\u{10ffff}');
        for entry in table.range(prefix..end.as_str())? {
            let entry = entry?;
            push_decoded(&mut items, entry.0.value(), entry.1.value());
        }
        Ok(items)
    }

    /// Keys whose stored value failed to decode, for orphan handling.
    pub fn list_corrupt_keys<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> Result<Vec<String>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(table) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut keys = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            if decode_value::<T>(entry.1.value()).is_err() {
                keys.push(entry.0.value().to_string());
            }
        }
        Ok(keys)
    }

    pub fn count(&self, table: TableDefinition<&str, &[u8]>) -> Result<usize, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(table) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        Ok(table.len()? as usize)
    }

    pub fn clear(&self, table: TableDefinition<&str, &[u8]>) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        match write_txn.delete_table(table) {
            Ok(_) => {}
            Err(TableError::TableDoesNotExist(_)) => {}
            Err(err) => return Err(err.into()),
        }
        {
            let _ = write_txn.open_table(table)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

const ALL_TABLES: &[TableDefinition<&str, &[u8]>] = &[
    TRACKS_TABLE,
    ALBUMS_TABLE,
    ARTISTS_TABLE,
    COVERS_TABLE,
    PATHS_TABLE,
    USER_DATA_TABLE,
    PLAYLISTS_TABLE,
    SHARES_TABLE,
    META_TABLE,
];

pub fn composite_key(parts: &[&str]) -> String {
    let mut out = String::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            out.push(KEY_SEP);
        }
        out.push_str(part);
    }
    out
}

pub fn split_key(key: &str) -> Vec<&str> {
    key.split(KEY_SEP).collect()
}

pub fn prefix_key(prefix: &str) -> String {
    let mut out = String::from(prefix);
    out.push(KEY_SEP);
    out
}

fn push_decoded<T: for<'de> Deserialize<'de>>(
    items: &mut Vec<(String, T)>,
    key: &str,
    bytes: &[u8],
) {
    match decode_value(bytes) {
        Ok(value) => items.push((key.to_string(), value)),
        Err(err) => {
            tracing::warn!("Skipping corrupt record at {:?}: {}", key, err);
        }
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "io error: {}", err),
            StoreError::Redb(err) => write!(f, "db error: {}", err),
            StoreError::Bincode(err) => write!(f, "bincode error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        StoreError::Redb(err)
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TableError> for StoreError {
    fn from(err: TableError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TransactionError> for StoreError {
    fn from(err: TransactionError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<CommitError> for StoreError {
    fn from(err: CommitError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        StoreError::Bincode(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("test.redb")).expect("open store");
        (dir, store)
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let (_dir, store) = open_temp();
        store.put(META_TABLE, "k", &42u32).unwrap();
        assert_eq!(store.get::<u32>(META_TABLE, "k").unwrap(), Some(42));
        assert!(store.delete(META_TABLE, "k").unwrap());
        assert_eq!(store.get::<u32>(META_TABLE, "k").unwrap(), None);
        assert!(!store.delete(META_TABLE, "k").unwrap());
    }

    #[test]
    fn prefix_scan_is_bounded() {
        let (_dir, store) = open_temp();
        let user_key = composite_key(&["u1", "track", "t1"]);
        let other_key = composite_key(&["u10", "track", "t2"]);
        store.put(USER_DATA_TABLE, &user_key, &1u8).unwrap();
        store.put(USER_DATA_TABLE, &other_key, &2u8).unwrap();

        let items: Vec<(String, u8)> = store
            .list_prefix(USER_DATA_TABLE, &prefix_key("u1"))
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].1, 1);
    }

    #[test]
    fn composite_keys_split_back() {
        let key = composite_key(&["user", "album", "abc"]);
        assert_eq!(split_key(&key), vec!["user", "album", "abc"]);
    }
}
