// Copyright 2024 The DaggerML Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Embedded key-value environment.
//!
//! Wraps a redb database with one named sub-table per object kind plus a
//! `deleted` table and a distinguished meta table for keys like `/init`.
//! All access happens inside a single read or write transaction object;
//! write transactions commit explicitly and roll back when dropped.
//!
//! The environment self-sizes: on open the cache budget is estimated from
//! the on-disk file size times 1.5, floored at 128 MiB and capped at
//! 128 GiB, and persisted in the sibling `config` JSON. redb grows the
//! data file itself, so unlike an mmap store there is no grow-and-retry
//! loop; hitting the ceiling is fatal.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use redb::ReadableTable;
use redb::TableDefinition;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::object_id::ObjectKind;

/// File name of the store inside a repository directory.
pub const DATA_FILE: &str = "data.redb";
/// File name of the sizing config next to the store.
pub const CONFIG_FILE: &str = "config";

const MIN_MAP_SIZE: u64 = 128 << 20;
const MAX_MAP_SIZE: u64 = 128 << 30;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("db/");
const DELETED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("db/deleted");

fn kind_table(kind: ObjectKind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    TableDefinition::new(match kind {
        ObjectKind::Index => "db/index",
        ObjectKind::Head => "db/head",
        ObjectKind::Commit => "db/commit",
        ObjectKind::Tree => "db/tree",
        ObjectKind::Dag => "db/dag",
        ObjectKind::FnDag => "db/fndag",
        ObjectKind::Node => "db/node",
        ObjectKind::Datum => "db/datum",
    })
}

/// A sub-table within the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Kind(ObjectKind),
    Deleted,
    Meta,
}

impl Table {
    fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Self::Kind(kind) => kind_table(kind),
            Self::Deleted => DELETED_TABLE,
            Self::Meta => META_TABLE,
        }
    }
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("store not found: {0}")]
    NotFound(PathBuf),
    #[error("store exists: {0}")]
    Exists(PathBuf),
    #[error("write issued on a read-only transaction")]
    ReadOnly,
    #[error(transparent)]
    Database(#[from] redb::DatabaseError),
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    #[error(transparent)]
    Table(#[from] redb::TableError),
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid store config")]
    Config(#[source] serde_json::Error),
}

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Serialize, Deserialize)]
struct StoreConfig {
    map_size: u64,
}

pub(crate) fn estimate_map_size(file_len: u64) -> u64 {
    (file_len + file_len / 2).clamp(MIN_MAP_SIZE, MAX_MAP_SIZE)
}

/// One repository's storage environment.
#[derive(Debug)]
pub struct Storage {
    db: redb::Database,
    path: PathBuf,
}

impl Storage {
    /// Creates a fresh environment, failing if one already exists. All
    /// sub-tables are created up front so read transactions can open them.
    pub fn create(path: &Path) -> KvResult<Self> {
        let file = path.join(DATA_FILE);
        if file.exists() {
            return Err(KvError::Exists(file));
        }
        fs::create_dir_all(path)?;
        let map_size = MIN_MAP_SIZE;
        write_config(path, map_size)?;
        let db = redb::Builder::new()
            .set_cache_size(map_size as usize)
            .create(&file)?;
        let storage = Self {
            db,
            path: path.to_owned(),
        };
        let tx = storage.db.begin_write()?;
        for kind in ObjectKind::ALL {
            tx.open_table(kind_table(kind))?;
        }
        tx.open_table(DELETED_TABLE)?;
        tx.open_table(META_TABLE)?;
        tx.commit()?;
        Ok(storage)
    }

    /// Opens an existing environment, re-estimating the size budget from
    /// the on-disk file and persisting the estimate when it grew.
    pub fn open(path: &Path) -> KvResult<Self> {
        let file = path.join(DATA_FILE);
        if !file.exists() {
            return Err(KvError::NotFound(file));
        }
        let configured = read_config(path)?.unwrap_or(MIN_MAP_SIZE);
        let estimated = estimate_map_size(fs::metadata(&file)?.len());
        let map_size = configured.max(estimated);
        if map_size > configured {
            write_config(path, map_size)?;
        }
        let db = redb::Builder::new()
            .set_cache_size(map_size as usize)
            .open(&file)?;
        Ok(Self {
            db,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin(&self, write: bool) -> KvResult<Transaction> {
        let inner = if write {
            TxInner::Write(self.db.begin_write()?)
        } else {
            TxInner::Read(self.db.begin_read()?)
        };
        Ok(Transaction { inner })
    }

    /// Copies the committed environment into another directory. Callers
    /// must not hold a write transaction.
    pub fn copy_to(&self, dest: &Path) -> KvResult<()> {
        let dest_file = dest.join(DATA_FILE);
        if dest_file.exists() {
            return Err(KvError::Exists(dest_file));
        }
        fs::create_dir_all(dest)?;
        fs::copy(self.path.join(DATA_FILE), dest_file)?;
        if self.path.join(CONFIG_FILE).exists() {
            fs::copy(self.path.join(CONFIG_FILE), dest.join(CONFIG_FILE))?;
        }
        Ok(())
    }
}

fn read_config(path: &Path) -> KvResult<Option<u64>> {
    let file = path.join(CONFIG_FILE);
    if !file.exists() {
        return Ok(None);
    }
    let config: StoreConfig =
        serde_json::from_str(&fs::read_to_string(file)?).map_err(KvError::Config)?;
    Ok(Some(config.map_size))
}

fn write_config(path: &Path, map_size: u64) -> KvResult<()> {
    fs::create_dir_all(path)?;
    let config = StoreConfig { map_size };
    fs::write(
        path.join(CONFIG_FILE),
        serde_json::to_string(&config).map_err(KvError::Config)?,
    )?;
    Ok(())
}

enum TxInner {
    Read(redb::ReadTransaction),
    Write(redb::WriteTransaction),
}

/// A single read or write transaction over the environment. Nested
/// operations borrow the one open transaction; there is no implicit
/// per-call transaction.
pub struct Transaction {
    inner: TxInner,
}

impl Transaction {
    pub fn is_write(&self) -> bool {
        matches!(self.inner, TxInner::Write(_))
    }

    pub fn get(&self, table: Table, key: &str) -> KvResult<Option<Vec<u8>>> {
        match &self.inner {
            TxInner::Read(tx) => {
                let table = match tx.open_table(table.definition()) {
                    Ok(table) => table,
                    Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                    Err(err) => return Err(err.into()),
                };
                Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
            }
            TxInner::Write(tx) => {
                let table = tx.open_table(table.definition())?;
                Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
            }
        }
    }

    pub fn put(&mut self, table: Table, key: &str, value: &[u8]) -> KvResult<()> {
        let TxInner::Write(tx) = &self.inner else {
            return Err(KvError::ReadOnly);
        };
        let mut table = tx.open_table(table.definition())?;
        table.insert(key, value)?;
        Ok(())
    }

    pub fn delete(&mut self, table: Table, key: &str) -> KvResult<()> {
        let TxInner::Write(tx) = &self.inner else {
            return Err(KvError::ReadOnly);
        };
        let mut table = tx.open_table(table.definition())?;
        table.remove(key)?;
        Ok(())
    }

    /// All keys of a sub-table, in lexicographic order.
    pub fn keys(&self, table: Table) -> KvResult<Vec<String>> {
        match &self.inner {
            TxInner::Read(tx) => match tx.open_table(table.definition()) {
                Ok(table) => collect_keys(&table),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(vec![]),
                Err(err) => Err(err.into()),
            },
            TxInner::Write(tx) => {
                let table = tx.open_table(table.definition())?;
                collect_keys(&table)
            }
        }
    }

    /// Commits a write transaction; a no-op for reads.
    pub fn commit(self) -> KvResult<()> {
        match self.inner {
            TxInner::Read(_) => Ok(()),
            TxInner::Write(tx) => Ok(tx.commit()?),
        }
    }
}

fn collect_keys(table: &impl ReadableTable<&'static str, &'static [u8]>) -> KvResult<Vec<String>> {
    let mut keys = vec![];
    for item in table.iter()? {
        let (key, _) = item?;
        keys.push(key.value().to_owned());
    }
    Ok(keys)
}
