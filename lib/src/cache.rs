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

//! The sibling cache environment.
//!
//! A separate store mapping cache keys (fndag ids) to dag dumps. The
//! engine only hands its path and the key to adapters; adapters consult
//! and populate it to share results across repositories and runs.

use std::fs;
use std::path::Path;

use redb::ReadableTable as _;
use redb::TableDefinition;

use crate::kv;
use crate::kv::DATA_FILE;
use crate::kv::KvResult;

const CACHE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("cache");

/// Cache store handle, opened on demand with the same sizing discipline
/// as the repository environment.
pub struct CacheDb {
    db: redb::Database,
}

impl CacheDb {
    /// Opens (or creates) the cache environment in `dir`.
    pub fn open(dir: &Path) -> KvResult<Self> {
        fs::create_dir_all(dir)?;
        let file = dir.join(DATA_FILE);
        let size = file
            .metadata()
            .map(|meta| kv::estimate_map_size(meta.len()))
            .unwrap_or_else(|_| kv::estimate_map_size(0));
        let db = redb::Builder::new()
            .set_cache_size(size as usize)
            .create(&file)?;
        let tx = db.begin_write()?;
        tx.open_table(CACHE_TABLE)?;
        tx.commit()?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> KvResult<Option<String>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(CACHE_TABLE)?;
        Ok(table.get(key)?.map(|guard| guard.value().to_owned()))
    }

    pub fn put(&self, key: &str, dump: &str) -> KvResult<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(CACHE_TABLE)?;
            table.insert(key, dump)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> KvResult<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(CACHE_TABLE)?;
            table.remove(key)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Cache keys in lexicographic order.
    pub fn list(&self) -> KvResult<Vec<String>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(CACHE_TABLE)?;
        let mut keys = vec![];
        for item in table.iter()? {
            let (key, _) = item?;
            keys.push(key.value().to_owned());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let cache = CacheDb::open(&temp.path().join("cache")).unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
        cache.put("k", "[dump]").unwrap();
        assert_eq!(cache.get("k").unwrap(), Some("[dump]".to_owned()));
        assert_eq!(cache.list().unwrap(), vec!["k".to_owned()]);
        cache.delete("k").unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn test_cache_reopen_persists() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("cache");
        CacheDb::open(&dir).unwrap().put("k", "v").unwrap();
        assert_eq!(CacheDb::open(&dir).unwrap().get("k").unwrap(), Some("v".to_owned()));
    }
}
