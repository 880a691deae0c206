//! Persistent object catalog backed by redb.
//!
//! Every catalog access runs inside one write transaction obtained through
//! [`Catalog::transact`]. The handle remembers the catalog generation it
//! prepared its tables against; FORMAT bumps the stored generation, and the
//! next transaction notices the mismatch, re-creates the tables and asks the
//! caller to retry.

use crate::tables;
use redb::{Database, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Catalog schema version written to the metadata table
pub const SCHEMA_VERSION: u32 = 1;

const CATALOG_KEY: &str = "catalog";

/// Error type for catalog operations
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] osdemu_common::Error),
    #[error("unsupported catalog schema version {found} (expected {expected})")]
    Schema { found: u32, expected: u32 },
}

impl From<redb::TransactionError> for CatalogError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Persistent catalog facts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogInfo {
    pub schema_version: u32,
    pub generation: u64,
}

impl Default for CatalogInfo {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            generation: 1,
        }
    }
}

/// Outcome of one transaction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exec<T> {
    /// The closure ran and the transaction committed
    Done(T),
    /// Access paths were re-initialised; run the closure again
    Retry,
}

/// Object catalog handle
pub struct Catalog {
    db: Database,
    path: PathBuf,
    generation: u64,
}

impl Catalog {
    /// Open (or create) the catalog database at the given path.
    pub fn open(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        let info = {
            create_tables(&write_txn)?;
            let mut meta = write_txn.open_table(tables::META)?;
            let stored = meta
                .get(CATALOG_KEY)?
                .map(|v| bincode::deserialize::<CatalogInfo>(v.value()))
                .transpose()?;
            match stored {
                Some(info) => info,
                None => {
                    let info = CatalogInfo::default();
                    meta.insert(CATALOG_KEY, bincode::serialize(&info)?.as_slice())?;
                    info
                }
            }
        };
        if info.schema_version != SCHEMA_VERSION {
            return Err(CatalogError::Schema {
                found: info.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        write_txn.commit()?;

        info!(
            "Opened catalog {} (generation {})",
            path.display(),
            info.generation
        );
        Ok(Self {
            db,
            path: path.to_path_buf(),
            generation: info.generation,
        })
    }

    /// Path of the catalog file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generation the handle's access paths were prepared against
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Read the stored catalog facts
    pub fn info(&self) -> CatalogResult<CatalogInfo> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(tables::META)?;
        let info = match meta.get(CATALOG_KEY)? {
            Some(v) => bincode::deserialize(v.value())?,
            None => CatalogInfo::default(),
        };
        Ok(info)
    }

    /// Run `f` inside one write transaction.
    ///
    /// Commits when `f` succeeds and aborts when it fails. When the stored
    /// generation differs from the prepared one, the tables are re-created,
    /// the handle adopts the new generation and `Exec::Retry` is returned
    /// without running `f`.
    pub fn transact<T, E, F>(&mut self, f: F) -> Result<Exec<T>, E>
    where
        F: FnOnce(&Txn) -> Result<T, E>,
        E: From<CatalogError>,
    {
        let txn = Txn {
            wtxn: self.db.begin_write().map_err(CatalogError::from)?,
        };

        let info = txn.info()?;
        if info.generation != self.generation {
            warn!(
                "Catalog generation changed ({} -> {}), re-initialising",
                self.generation, info.generation
            );
            create_tables(&txn.wtxn)?;
            txn.wtxn.commit().map_err(CatalogError::from)?;
            self.generation = info.generation;
            return Ok(Exec::Retry);
        }

        match f(&txn) {
            Ok(value) => {
                txn.wtxn.commit().map_err(CatalogError::from)?;
                Ok(Exec::Done(value))
            }
            Err(e) => {
                if let Err(abort_err) = txn.wtxn.abort() {
                    error!("Failed to abort catalog transaction: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    /// Run `f` in a transaction, repeating on `Exec::Retry`
    pub fn run<T, E, F>(&mut self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&Txn) -> Result<T, E>,
        E: From<CatalogError>,
    {
        loop {
            match self.transact(&mut f)? {
                Exec::Done(value) => return Ok(value),
                Exec::Retry => debug!("Retrying catalog transaction"),
            }
        }
    }
}

fn create_tables(write_txn: &WriteTransaction) -> CatalogResult<()> {
    let _t = write_txn.open_table(tables::OBJECTS)?;
    let _t = write_txn.open_table(tables::MEMBERS)?;
    let _t = write_txn.open_table(tables::MEMBER_OF)?;
    let _t = write_txn.open_table(tables::ATTRIBUTES)?;
    let _t = write_txn.open_table(tables::META)?;
    Ok(())
}

/// One open catalog transaction
pub struct Txn {
    pub(crate) wtxn: WriteTransaction,
}

impl Txn {
    fn info(&self) -> CatalogResult<CatalogInfo> {
        let meta = self.wtxn.open_table(tables::META)?;
        let info = match meta.get(CATALOG_KEY)? {
            Some(v) => bincode::deserialize(v.value())?,
            None => CatalogInfo::default(),
        };
        Ok(info)
    }

    fn put_info(&self, info: &CatalogInfo) -> CatalogResult<()> {
        let bytes = bincode::serialize(info)?;
        let mut meta = self.wtxn.open_table(tables::META)?;
        meta.insert(CATALOG_KEY, bytes.as_slice())?;
        Ok(())
    }

    /// Stored catalog facts as seen by this transaction
    pub fn catalog_info(&self) -> CatalogResult<CatalogInfo> {
        self.info()
    }

    /// Drop every object, membership and attribute row and bump the
    /// catalog generation. Returns the new generation.
    pub fn wipe(&self) -> CatalogResult<u64> {
        self.wtxn.delete_table(tables::OBJECTS)?;
        self.wtxn.delete_table(tables::MEMBERS)?;
        self.wtxn.delete_table(tables::MEMBER_OF)?;
        self.wtxn.delete_table(tables::ATTRIBUTES)?;
        create_tables(&self.wtxn)?;

        let mut info = self.info()?;
        info.generation += 1;
        self.put_info(&info)?;
        info!("Catalog wiped, generation now {}", info.generation);
        Ok(info.generation)
    }
}
