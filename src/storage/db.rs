// Database manager: owns one `Kv` instance per named database plus a system
// database used for catalog-like bookkeeping (database names, creation
// time). Creating or dropping a database takes the manager's exclusive lock;
// operating on an already-open database only takes a read lock, so
// concurrent traffic against different databases never serializes against
// each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPool;
use crate::storage::heap::HeapFile;
use crate::storage::kv::Kv;
use crate::storage::page::DEFAULT_PAGE_SIZE;
use crate::storage::wal::{Wal, WalOpenOptions};

const SYSTEM_DB: &str = "system";

struct Database {
    kv: Arc<Kv>,
}

pub struct DatabaseManagerConfig {
    pub root: PathBuf,
    pub buffer_pool_capacity: usize,
    pub page_size: usize,
    pub encryption_passphrase: Option<String>,
}

impl Default for DatabaseManagerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            buffer_pool_capacity: 1024,
            page_size: DEFAULT_PAGE_SIZE,
            encryption_passphrase: None,
        }
    }
}

pub struct DatabaseManager {
    config: DatabaseManagerConfig,
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl DatabaseManager {
    pub fn open(config: DatabaseManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)?;
        let manager = Self {
            config,
            databases: RwLock::new(HashMap::new()),
        };
        manager.open_database(SYSTEM_DB)?;
        Ok(manager)
    }

    fn db_dir(&self, name: &str) -> PathBuf {
        self.config.root.join(name)
    }

    fn open_database(&self, name: &str) -> Result<Arc<Kv>> {
        if let Some(db) = self.databases.read().get(name) {
            return Ok(db.kv.clone());
        }

        let mut databases = self.databases.write();
        if let Some(db) = databases.get(name) {
            return Ok(db.kv.clone());
        }

        let dir = self.db_dir(name);
        std::fs::create_dir_all(&dir)?;
        let heap = Arc::new(HeapFile::open(dir.join("heap.db"), self.config.page_size)?);
        let wal_opts = WalOpenOptions {
            encryption_passphrase: self.config.encryption_passphrase.clone(),
            ..WalOpenOptions::default()
        };
        let wal = Arc::new(Wal::open(dir.join("wal"), wal_opts)?);
        let buffer = Arc::new(BufferPool::new(heap.clone(), wal.clone(), self.config.buffer_pool_capacity));
        let kv = Arc::new(Kv::open(heap, buffer, wal)?);

        databases.insert(name.to_string(), Arc::new(Database { kv: kv.clone() }));
        Ok(kv)
    }

    /// Create a new, empty database. Errors if one already exists by that
    /// name.
    pub fn create_database(&self, name: &str) -> Result<()> {
        if name == SYSTEM_DB {
            return Err(DbError::InvalidArgument("database name \"system\" is reserved".into()));
        }
        if self.databases.read().contains_key(name) || self.db_dir(name).exists() {
            return Err(DbError::InvalidArgument(format!("database {name} already exists")));
        }
        self.open_database(name)?;
        Ok(())
    }

    pub fn drop_database(&self, name: &str) -> Result<()> {
        if name == SYSTEM_DB {
            return Err(DbError::InvalidArgument("cannot drop the system database".into()));
        }
        let mut databases = self.databases.write();
        databases.remove(name);
        let dir = self.db_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn database(&self, name: &str) -> Result<Arc<Kv>> {
        if let Some(db) = self.databases.read().get(name) {
            return Ok(db.kv.clone());
        }
        if self.db_dir(name).exists() {
            return self.open_database(name);
        }
        Err(DbError::NotFound(format!("database {name}")))
    }

    pub fn system(&self) -> Arc<Kv> {
        self.databases
            .read()
            .get(SYSTEM_DB)
            .expect("system database opened at startup")
            .kv
            .clone()
    }

    pub fn list_databases(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }
}

pub fn root_for(base: impl AsRef<Path>) -> PathBuf {
    base.as_ref().to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> DatabaseManager {
        DatabaseManager::open(DatabaseManagerConfig {
            root: dir.to_path_buf(),
            buffer_pool_capacity: 16,
            ..DatabaseManagerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn system_database_opens_automatically() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        manager.system().put(b"k", b"v").unwrap();
        assert_eq!(manager.system().get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn create_and_use_new_database() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        manager.create_database("tenant_a").unwrap();
        let db = manager.database("tenant_a").unwrap();
        db.put(b"x", b"1").unwrap();
        assert_eq!(db.get(b"x").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn cannot_create_duplicate_database() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        manager.create_database("tenant_a").unwrap();
        assert!(manager.create_database("tenant_a").is_err());
    }

    #[test]
    fn drop_removes_database_from_disk() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        manager.create_database("tenant_a").unwrap();
        manager.drop_database("tenant_a").unwrap();
        assert!(manager.database("tenant_a").is_err());
    }

    #[test]
    fn cannot_drop_system_database() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(manager.drop_database(SYSTEM_DB).is_err());
    }
}
