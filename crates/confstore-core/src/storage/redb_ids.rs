//! # redb-backed Unique Ids
//!
//! Durable name <-> id bindings. Each category has a forward and a reverse
//! table plus a sequence counter; a new binding is written in one write
//! transaction, and redb serializes writers, so concurrent callers asking
//! for the same name always get the same id.
//!
//! Bindings are never removed: encoded beans depend on them.

use crate::ids::{IdCategory, UniqueIdStore};
use crate::ConfstoreError;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const SCHEMA_NAMES: TableDefinition<&str, u64> = TableDefinition::new("schema_names");
const SCHEMA_IDS: TableDefinition<u64, &str> = TableDefinition::new("schema_ids");
const PROPERTY_NAMES: TableDefinition<&str, u64> = TableDefinition::new("property_names");
const PROPERTY_IDS: TableDefinition<u64, &str> = TableDefinition::new("property_ids");
const INSTANCE_NAMES: TableDefinition<&str, u64> = TableDefinition::new("instance_names");
const INSTANCE_IDS: TableDefinition<u64, &str> = TableDefinition::new("instance_ids");

/// Last id handed out per category, keyed by category name.
const ID_SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("id_sequences");

type NameTable = TableDefinition<'static, &'static str, u64>;
type IdTable = TableDefinition<'static, u64, &'static str>;

const fn tables(category: IdCategory) -> (NameTable, IdTable) {
    match category {
        IdCategory::Schema => (SCHEMA_NAMES, SCHEMA_IDS),
        IdCategory::Property => (PROPERTY_NAMES, PROPERTY_IDS),
        IdCategory::Instance => (INSTANCE_NAMES, INSTANCE_IDS),
    }
}

pub struct RedbUniqueIds {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbUniqueIds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbUniqueIds").finish_non_exhaustive()
    }
}

impl RedbUniqueIds {
    /// Open or create an id database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfstoreError> {
        let db =
            Database::create(path.as_ref()).map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        Self::with_database(Arc::new(db))
    }

    /// Use a database shared with other stores.
    pub fn with_database(db: Arc<Database>) -> Result<Self, ConfstoreError> {
        // Initialize tables if they don't exist
        {
            let write_txn = db
                .begin_write()
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            for category in IdCategory::ALL {
                let (names, ids) = tables(category);
                let _ = write_txn
                    .open_table(names)
                    .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                let _ = write_txn
                    .open_table(ids)
                    .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            }
            let _ = write_txn
                .open_table(ID_SEQUENCES)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            write_txn
                .commit()
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        }
        Ok(Self { db })
    }

    /// Number of bindings in a category.
    pub fn count(&self, category: IdCategory) -> Result<u64, ConfstoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(tables(category).0)
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        table
            .len()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))
    }
}

impl UniqueIdStore for RedbUniqueIds {
    fn get_or_create_id(&self, category: IdCategory, name: &str) -> Result<u64, ConfstoreError> {
        if let Some(id) = self.find_id(category, name)? {
            return Ok(id);
        }

        let (names_def, ids_def) = tables(category);
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        let (id, created) = {
            let mut names = write_txn
                .open_table(names_def)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            // another writer may have won the race since the read above
            let existing = names
                .get(name)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?
                .map(|v| v.value());
            match existing {
                Some(id) => (id, false),
                None => {
                    let mut ids = write_txn
                        .open_table(ids_def)
                        .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                    let mut sequences = write_txn
                        .open_table(ID_SEQUENCES)
                        .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                    let last = sequences
                        .get(category.as_str())
                        .map_err(|e| ConfstoreError::Storage(e.to_string()))?
                        .map(|v| v.value())
                        .unwrap_or(0);
                    let id = last.checked_add(1).ok_or_else(|| {
                        ConfstoreError::Storage(format!("{} id space exhausted", category))
                    })?;
                    sequences
                        .insert(category.as_str(), id)
                        .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                    names
                        .insert(name, id)
                        .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                    ids.insert(id, name)
                        .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                    (id, true)
                }
            }
        };
        write_txn
            .commit()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        if created {
            tracing::trace!(%category, name, id, "persisted unique id");
        }
        Ok(id)
    }

    fn find_id(&self, category: IdCategory, name: &str) -> Result<Option<u64>, ConfstoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(tables(category).0)
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        Ok(table
            .get(name)
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?
            .map(|v| v.value()))
    }

    fn get_name(&self, category: IdCategory, id: u64) -> Result<String, ConfstoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(tables(category).1)
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        table
            .get(id)
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?
            .map(|v| v.value().to_string())
            .ok_or(ConfstoreError::UnknownId { category, id })
    }
}

// =============================================================================
// TESTS
// =============================================================================
