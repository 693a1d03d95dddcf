//! # redb-backed Bean Storage
//!
//! A disk-backed `BeanManager` on the redb embedded database.
//!
//! ## Layout
//!
//! - `beans`: `(schema id, instance id)` -> flags byte + codec payload
//! - `references`: `(source, target)` link rows, four ids per key
//! - `referrers`: the same links keyed target first, for delete checks
//! - `metadata`: storage format version
//!
//! Listings and queries return beans in key order: by schema, then by the
//! order instance ids were first seen.
//!
//! ## Writes
//!
//! Unique ids are created before a write transaction opens, since creating
//! an id is a write transaction of its own. `set` and `merge` read the stored
//! bytes first and re-check them inside the write transaction; if another
//! writer got there in between, the batch fails with `ModificationConflict`.

use crate::codec::BeanCodec;
use crate::ids::{CachedUniqueIds, IdCategory, UniqueIdStore};
use crate::manager::BeanManager;
use crate::primitives::{STORAGE_FORMAT_VERSION, STORED_DEFAULT_FLAG};
use crate::query::{BeanQuery, QueryResult, QuerySpec};
use crate::schema::{Schema, SchemaRegistry};
use crate::storage::RedbUniqueIds;
use crate::validation::{merge_into, prepare_batch};
use crate::{Bean, BeanId, ConfstoreError};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

type Key = (u64, u64);
type Link = (u64, u64, u64, u64);

/// Table for beans: (schema id, instance id) -> framed payload
const BEANS: TableDefinition<Key, &[u8]> = TableDefinition::new("beans");

/// Outgoing links: (source schema, source instance, target schema, target instance)
const REFERENCES: TableDefinition<Link, ()> = TableDefinition::new("references");

/// Incoming links: (target schema, target instance, source schema, source instance)
const REFERRERS: TableDefinition<Link, ()> = TableDefinition::new("referrers");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

/// A bean ready to be written: ids created, payload encoded.
struct Prepared {
    id: BeanId,
    key: Key,
    payload: Vec<u8>,
    default: bool,
    targets: Vec<(BeanId, Key)>,
}

impl Prepared {
    fn framed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 1);
        out.push(if self.default { STORED_DEFAULT_FLAG } else { 0 });
        out.extend_from_slice(&self.payload);
        out
    }
}

fn unframe(bytes: &[u8]) -> Result<(bool, &[u8]), ConfstoreError> {
    let (flags, payload) = bytes
        .split_first()
        .ok_or_else(|| ConfstoreError::Serialization("empty stored bean".to_string()))?;
    Ok((flags & STORED_DEFAULT_FLAG != 0, payload))
}

pub struct RedbBeanManager {
    db: Arc<Database>,
    schemas: Arc<SchemaRegistry>,
    codec: BeanCodec,
}

impl std::fmt::Debug for RedbBeanManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBeanManager")
            .field("schemas", &self.schemas.len())
            .finish_non_exhaustive()
    }
}

impl RedbBeanManager {
    /// Open or create a bean database at the given path.
    ///
    /// Unique ids live in the same file, behind an in-process cache.
    pub fn open(path: impl AsRef<Path>, schemas: Arc<SchemaRegistry>) -> Result<Self, ConfstoreError> {
        let db = Arc::new(
            Database::create(path.as_ref()).map_err(|e| ConfstoreError::Storage(e.to_string()))?,
        );
        let ids = RedbUniqueIds::with_database(Arc::clone(&db))?;
        Self::with_ids(db, schemas, Arc::new(CachedUniqueIds::new(ids)))
    }

    /// Use an existing database and id store.
    pub fn with_ids(
        db: Arc<Database>,
        schemas: Arc<SchemaRegistry>,
        ids: Arc<dyn UniqueIdStore>,
    ) -> Result<Self, ConfstoreError> {
        // Initialize tables if they don't exist
        {
            let write_txn = db
                .begin_write()
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(BEANS)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(REFERENCES)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            let _ = write_txn
                .open_table(REFERRERS)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            {
                let mut meta = write_txn
                    .open_table(METADATA)
                    .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                let version = meta
                    .get("format_version")
                    .map_err(|e| ConfstoreError::Storage(e.to_string()))?
                    .map(|v| v.value());
                match version {
                    None => {
                        meta.insert("format_version", STORAGE_FORMAT_VERSION)
                            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                    }
                    Some(v) if v == STORAGE_FORMAT_VERSION => {}
                    Some(v) => {
                        return Err(ConfstoreError::Storage(format!(
                            "unsupported storage format version {} (expected {})",
                            v, STORAGE_FORMAT_VERSION
                        )));
                    }
                }
            }
            write_txn
                .commit()
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        }
        Ok(Self {
            db,
            schemas,
            codec: BeanCodec::new(ids),
        })
    }

    #[must_use]
    pub fn ids(&self) -> &Arc<dyn UniqueIdStore> {
        self.codec.ids()
    }

    /// Create ids and encode outside of any transaction.
    fn prepare(&self, bean: &Bean) -> Result<Prepared, ConfstoreError> {
        let key = self.codec.encode_key(bean.id())?;
        let payload = self.codec.encode(bean)?;
        let mut seen = BTreeSet::new();
        let mut targets = Vec::new();
        for target in bean.all_references() {
            let target_key = self.codec.encode_key(target)?;
            if seen.insert(target_key) {
                targets.push((target.detached(), target_key));
            }
        }
        Ok(Prepared {
            id: bean.id().detached(),
            key,
            payload,
            default: bean.is_default(),
            targets,
        })
    }

    fn decode_stored(&self, key: Key, bytes: &[u8]) -> Result<Bean, ConfstoreError> {
        let id = self.codec.decode_key(key)?;
        let schema = self.schemas.get(id.schema_name())?;
        let (default, payload) = unframe(bytes)?;
        let mut bean = self.codec.decode(&id, &schema, payload)?;
        bean.set_default(default);
        Ok(bean)
    }

    fn read_raw(&self, key: Key) -> Result<Option<Vec<u8>>, ConfstoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(BEANS)
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        Ok(table
            .get(key)
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?
            .map(|v| v.value().to_vec()))
    }

    /// Every stored row of a schema in key order.
    fn scan(&self, schema_name: &str) -> Result<Vec<(Key, Vec<u8>)>, ConfstoreError> {
        let Some(schema_id) = self.codec.ids().find_id(IdCategory::Schema, schema_name)? else {
            return Ok(Vec::new());
        };
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(BEANS)
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        let mut rows = Vec::new();
        for entry in table
            .range((schema_id, 0u64)..=(schema_id, u64::MAX))
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?
        {
            let (key, value) = entry.map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            rows.push((key.value(), value.value().to_vec()));
        }
        Ok(rows)
    }

    /// Read phase of set/merge: stored bytes of each target, which must exist.
    fn snapshot(&self, id: &BeanId) -> Result<(Key, Vec<u8>), ConfstoreError> {
        let key = self
            .codec
            .find_key(id)?
            .ok_or_else(|| ConfstoreError::BeanNotFound(id.detached()))?;
        let bytes = self
            .read_raw(key)?
            .ok_or_else(|| ConfstoreError::BeanNotFound(id.detached()))?;
        Ok((key, bytes))
    }

    /// Write phase of set/merge.
    fn replace(&self, planned: Vec<(Prepared, Vec<u8>)>) -> Result<(), ConfstoreError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        {
            let mut beans = write_txn
                .open_table(BEANS)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            let mut references = write_txn
                .open_table(REFERENCES)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            let mut referrers = write_txn
                .open_table(REFERRERS)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;

            for (prepared, expected) in &planned {
                let current = beans
                    .get(prepared.key)
                    .map_err(|e| ConfstoreError::Storage(e.to_string()))?
                    .map(|v| v.value().to_vec());
                match current {
                    None => return Err(ConfstoreError::BeanNotFound(prepared.id.clone())),
                    Some(bytes) if bytes != *expected => {
                        return Err(ConfstoreError::ModificationConflict(prepared.id.clone()));
                    }
                    Some(_) => {}
                }
            }
            let batch: BTreeSet<Key> = planned.iter().map(|(p, _)| p.key).collect();
            let prepared: Vec<&Prepared> = planned.iter().map(|(p, _)| p).collect();
            check_targets(&beans, &prepared, &batch)?;

            for prepared in prepared {
                beans
                    .insert(prepared.key, prepared.framed().as_slice())
                    .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                unlink(&mut references, &mut referrers, prepared.key)?;
                link(&mut references, &mut referrers, prepared)?;
                tracing::debug!(bean = %prepared.id, "stored");
            }
        }
        write_txn
            .commit()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        Ok(())
    }
}

// =============================================================================
// LINK MAINTENANCE
// =============================================================================

fn check_targets(
    beans: &Table<'_, Key, &'static [u8]>,
    prepared: &[&Prepared],
    batch: &BTreeSet<Key>,
) -> Result<(), ConfstoreError> {
    for bean in prepared {
        for (target, key) in &bean.targets {
            if batch.contains(key) {
                continue;
            }
            let stored = beans
                .get(*key)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?
                .is_some();
            if !stored {
                return Err(ConfstoreError::MissingReference {
                    id: bean.id.clone(),
                    missing: target.clone(),
                });
            }
        }
    }
    Ok(())
}

fn link(
    references: &mut Table<'_, Link, ()>,
    referrers: &mut Table<'_, Link, ()>,
    bean: &Prepared,
) -> Result<(), ConfstoreError> {
    let (s0, s1) = bean.key;
    for (_, (t0, t1)) in &bean.targets {
        references
            .insert((s0, s1, *t0, *t1), ())
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        referrers
            .insert((*t0, *t1, s0, s1), ())
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
    }
    Ok(())
}

fn unlink(
    references: &mut Table<'_, Link, ()>,
    referrers: &mut Table<'_, Link, ()>,
    source: Key,
) -> Result<(), ConfstoreError> {
    let (s0, s1) = source;
    let mut targets = Vec::new();
    for entry in references
        .range((s0, s1, 0u64, 0u64)..=(s0, s1, u64::MAX, u64::MAX))
        .map_err(|e| ConfstoreError::Storage(e.to_string()))?
    {
        let (key, _) = entry.map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        let (_, _, t0, t1) = key.value();
        targets.push((t0, t1));
    }
    for (t0, t1) in targets {
        references
            .remove((s0, s1, t0, t1))
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        referrers
            .remove((t0, t1, s0, s1))
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
    }
    Ok(())
}

fn sources_of(referrers: &Table<'_, Link, ()>, target: Key) -> Result<Vec<Key>, ConfstoreError> {
    let (t0, t1) = target;
    let mut sources = Vec::new();
    for entry in referrers
        .range((t0, t1, 0u64, 0u64)..=(t0, t1, u64::MAX, u64::MAX))
        .map_err(|e| ConfstoreError::Storage(e.to_string()))?
    {
        let (key, _) = entry.map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        let (_, _, s0, s1) = key.value();
        sources.push((s0, s1));
    }
    Ok(sources)
}

// =============================================================================
// BEAN MANAGER
// =============================================================================

impl BeanManager for RedbBeanManager {
    fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    fn create_all(&self, mut beans: Vec<Bean>) -> Result<(), ConfstoreError> {
        prepare_batch(&self.schemas, &mut beans)?;
        let prepared = beans
            .iter()
            .map(|bean| self.prepare(bean))
            .collect::<Result<Vec<_>, _>>()?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(BEANS)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            let mut references = write_txn
                .open_table(REFERENCES)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            let mut referrers = write_txn
                .open_table(REFERRERS)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;

            let mut pending = Vec::with_capacity(prepared.len());
            for bean in &prepared {
                let exists = table
                    .get(bean.key)
                    .map_err(|e| ConfstoreError::Storage(e.to_string()))?
                    .is_some();
                if exists {
                    if bean.default {
                        tracing::debug!(bean = %bean.id, "default bean already stored, skipping");
                        continue;
                    }
                    return Err(ConfstoreError::BeanAlreadyExists(bean.id.clone()));
                }
                pending.push(bean);
            }
            let batch: BTreeSet<Key> = pending.iter().map(|b| b.key).collect();
            check_targets(&table, &pending, &batch)?;

            for bean in pending {
                table
                    .insert(bean.key, bean.framed().as_slice())
                    .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                link(&mut references, &mut referrers, bean)?;
                tracing::debug!(bean = %bean.id, "created");
            }
        }
        write_txn
            .commit()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        Ok(())
    }

    fn set_all(&self, mut beans: Vec<Bean>) -> Result<(), ConfstoreError> {
        prepare_batch(&self.schemas, &mut beans)?;
        let mut planned = Vec::with_capacity(beans.len());
        for mut bean in beans {
            let (_, stored) = self.snapshot(bean.id())?;
            bean.set_default(unframe(&stored)?.0);
            planned.push((self.prepare(&bean)?, stored));
        }
        self.replace(planned)
    }

    fn merge_all(&self, mut patches: Vec<Bean>) -> Result<(), ConfstoreError> {
        prepare_batch(&self.schemas, &mut patches)?;
        let mut planned = Vec::with_capacity(patches.len());
        for patch in &patches {
            let (key, stored) = self.snapshot(patch.id())?;
            let mut merged = self.decode_stored(key, &stored)?;
            merge_into(&mut merged, patch);
            planned.push((self.prepare(&merged)?, stored));
        }
        self.replace(planned)
    }

    fn delete_all(
        &self,
        schema_name: &str,
        instance_ids: &[String],
    ) -> Result<Vec<Bean>, ConfstoreError> {
        self.schemas.get(schema_name)?;
        let mut doomed: Vec<(BeanId, Key)> = Vec::with_capacity(instance_ids.len());
        for instance_id in instance_ids {
            let id = BeanId::new(schema_name, instance_id.as_str());
            let key = self
                .codec
                .find_key(&id)?
                .ok_or_else(|| ConfstoreError::BeanNotFound(id.clone()))?;
            if doomed.iter().all(|(_, k)| *k != key) {
                doomed.push((id, key));
            }
        }
        let doomed_keys: BTreeSet<Key> = doomed.iter().map(|(_, k)| *k).collect();

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        let mut removed = Vec::with_capacity(doomed.len());
        {
            let mut table = write_txn
                .open_table(BEANS)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            let mut references = write_txn
                .open_table(REFERENCES)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
            let mut referrers = write_txn
                .open_table(REFERRERS)
                .map_err(|e| ConfstoreError::Storage(e.to_string()))?;

            for (id, key) in &doomed {
                let bytes = table
                    .get(*key)
                    .map_err(|e| ConfstoreError::Storage(e.to_string()))?
                    .map(|v| v.value().to_vec())
                    .ok_or_else(|| ConfstoreError::BeanNotFound(id.clone()))?;
                if unframe(&bytes)?.0 {
                    return Err(ConfstoreError::InvalidData(format!(
                        "default bean {} cannot be deleted",
                        id
                    )));
                }
                let referenced_by = sources_of(&referrers, *key)?
                    .into_iter()
                    .filter(|source| !doomed_keys.contains(source))
                    .map(|source| self.codec.decode_key(source))
                    .collect::<Result<Vec<_>, _>>()?;
                if !referenced_by.is_empty() {
                    return Err(ConfstoreError::ReferentialIntegrity {
                        id: id.clone(),
                        referenced_by,
                    });
                }
                removed.push(self.decode_stored(*key, &bytes)?);
            }

            for (id, key) in &doomed {
                table
                    .remove(*key)
                    .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
                unlink(&mut references, &mut referrers, *key)?;
                tracing::debug!(bean = %id, "deleted");
            }
        }
        write_txn
            .commit()
            .map_err(|e| ConfstoreError::Storage(e.to_string()))?;
        Ok(removed)
    }

    fn get_lazy(&self, id: &BeanId) -> Result<Option<Bean>, ConfstoreError> {
        self.schemas.get(id.schema_name())?;
        let Some(key) = self.codec.find_key(id)? else {
            return Ok(None);
        };
        self.read_raw(key)?
            .map(|bytes| self.decode_stored(key, &bytes))
            .transpose()
    }

    fn list(&self, schema_name: &str) -> Result<Vec<Bean>, ConfstoreError> {
        self.schemas.get(schema_name)?;
        self.scan(schema_name)?
            .into_iter()
            .map(|(key, bytes)| self.decode_stored(key, &bytes))
            .collect()
    }

    fn new_query(&self, schema: Arc<Schema>) -> BeanQuery<'_> {
        BeanQuery::new(self, schema)
    }

    fn retrieve(&self, query: &QuerySpec) -> Result<QueryResult, ConfstoreError> {
        let rows = self.scan(&query.schema().name)?;
        query.paginate(
            rows.into_iter()
                .map(|(key, bytes)| self.decode_stored(key, &bytes)),
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::restriction::greater_than;
    use crate::schema::PropertyDescriptor;
    use crate::types::ValueType;
    use tempfile::tempdir;

    fn registry() -> Arc<SchemaRegistry> {
        let schemas = SchemaRegistry::new();
        schemas
            .register(
                Schema::new("Node")
                    .with_property(PropertyDescriptor::id("id"))
                    .with_property(PropertyDescriptor::scalar("port", ValueType::Integer).indexed())
                    .with_property(PropertyDescriptor::reference_list("next", "Node")),
            )
            .expect("register");
        Arc::new(schemas)
    }

    fn node(id: &str) -> Bean {
        Bean::new(BeanId::new("Node", id))
    }

    #[test]
    fn beans_survive_reopen() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("beans.redb");
        {
            let manager = RedbBeanManager::open(&path, registry()).expect("open");
            manager
                .create_all(vec![
                    node("a").with_property("port", 80),
                    node("b").with_reference("next", BeanId::new("Node", "a")),
                ])
                .expect("create");
        }
        let manager = RedbBeanManager::open(&path, registry()).expect("reopen");
        let b = manager.get_lazy(&BeanId::new("Node", "b")).expect("get").expect("present");
        assert_eq!(b.first_reference("next"), Some(&BeanId::new("Node", "a")));
        assert_eq!(manager.list("Node").expect("list").len(), 2);
    }

    #[test]
    fn referrers_block_delete_until_unlinked() {
        let dir = tempdir().expect("Failed to create temp dir");
        let manager = RedbBeanManager::open(dir.path().join("beans.redb"), registry()).expect("open");
        manager.create(node("a")).expect("create a");
        manager
            .create(node("b").with_reference("next", BeanId::new("Node", "a")))
            .expect("create b");

        let err = manager.delete(&BeanId::new("Node", "a")).err();
        assert!(matches!(
            err,
            Some(ConfstoreError::ReferentialIntegrity { ref referenced_by, .. })
                if referenced_by == &vec![BeanId::new("Node", "b")]
        ));

        manager.set(node("b")).expect("drop reference");
        let removed = manager.delete(&BeanId::new("Node", "a")).expect("delete");
        assert_eq!(removed.id(), &BeanId::new("Node", "a"));
        assert!(manager.get_lazy(&BeanId::new("Node", "a")).expect("get").is_none());
    }

    #[test]
    fn failed_batch_writes_nothing() {
        let dir = tempdir().expect("Failed to create temp dir");
        let manager = RedbBeanManager::open(dir.path().join("beans.redb"), registry()).expect("open");
        let result = manager.create_all(vec![
            node("a"),
            node("b").with_reference("next", BeanId::new("Node", "ghost")),
        ]);
        assert!(matches!(result, Err(ConfstoreError::MissingReference { .. })));
        assert!(manager.list("Node").expect("list").is_empty());
    }

    #[test]
    fn merge_keeps_untouched_fields() {
        let dir = tempdir().expect("Failed to create temp dir");
        let manager = RedbBeanManager::open(dir.path().join("beans.redb"), registry()).expect("open");
        manager.create(node("a")).expect("create a");
        manager
            .create(node("b").with_property("port", 1).with_reference("next", BeanId::new("Node", "a")))
            .expect("create b");
        manager.merge(node("b").with_property("port", 2)).expect("merge");
        let b = manager.get_lazy(&BeanId::new("Node", "b")).expect("get").expect("present");
        assert_eq!(b.single_value("port"), Some("2"));
        assert_eq!(b.references("next").map(<[BeanId]>::len), Some(1));
    }

    #[test]
    fn query_pages_through_matches() {
        let dir = tempdir().expect("Failed to create temp dir");
        let manager = RedbBeanManager::open(dir.path().join("beans.redb"), registry()).expect("open");
        manager
            .create_all((0..5).map(|i| node(&format!("n{}", i)).with_property("port", i)).collect())
            .expect("create");
        let schema = manager.schemas().get("Node").expect("schema");
        let page = manager
            .new_query(schema)
            .add(greater_than("port", 0))
            .set_first_result(1)
            .set_max_results(2)
            .retrieve()
            .expect("query");
        let ids: Vec<&str> = page.beans().iter().map(Bean::instance_id).collect();
        assert_eq!(ids, vec!["n2", "n3"]);
        assert_eq!(page.next_first_result().offset(), 3);
    }
}
