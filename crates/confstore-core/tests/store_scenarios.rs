//! # Store Scenario Tests (S0-S4)
//!
//! Every scenario runs against both backends: in-memory and redb.
//!
//! ## Tiers
//! - S0: Batch Writes
//! - S1: Referential Integrity
//! - S2: Singletons and Defaults
//! - S3: Queries
//! - S4: Notifications

use confstore_core::restriction::{between, contains, equal, greater_than, in_list, less_than, not, or};
use confstore_core::{
    Bean, BeanId, ConfigStore, ConfstoreError, PropertyDescriptor, Schema, ValueType,
};
use std::collections::BTreeSet;
use tempfile::TempDir;

/// Run `scenario` once per backend. The temp dir lives until the run ends.
fn each_backend(scenario: impl Fn(&ConfigStore)) {
    scenario(&ConfigStore::in_memory());

    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = ConfigStore::open_redb(dir.path().join("store.redb")).expect("open redb");
    scenario(&store);
}

fn parent() -> Schema {
    Schema::new("Parent")
        .with_property(PropertyDescriptor::id("id"))
        .with_property(PropertyDescriptor::scalar("label", ValueType::String).indexed())
}

fn grandfather() -> Schema {
    Schema::new("Grandfather")
        .with_property(PropertyDescriptor::id("id"))
        .with_property(PropertyDescriptor::scalar("prop1", ValueType::String).indexed())
        .with_property(PropertyDescriptor::scalar("prop3", ValueType::Integer).indexed())
        .with_property(PropertyDescriptor::reference_list("prop7", "Parent").indexed())
        .with_property(PropertyDescriptor::scalar("prop12", ValueType::Double).indexed())
        .with_property(PropertyDescriptor::scalar("created", ValueType::Long).immutable())
}

fn register_family(store: &ConfigStore) {
    store
        .register_schemas(vec![grandfather(), parent()])
        .expect("register schemas");
}

/// g1..g5 with prop7 pointing at p{i}..p5.
fn populate_family(store: &ConfigStore) {
    register_family(store);
    let parents: Vec<Bean> = (1..=5)
        .map(|i| Bean::new(BeanId::new("Parent", format!("p{}", i))))
        .collect();
    store.create_all(parents).expect("create parents");

    let prop12 = ["1.0", "333.333", "3.0", "4.0", "5.0"];
    let grandfathers: Vec<Bean> = (1..=5)
        .map(|i| {
            let mut bean = Bean::new(BeanId::new("Grandfather", format!("g{}", i)))
                .with_property("prop1", if i == 1 { "test" } else { "value" })
                .with_property("prop3", i)
                .with_property("prop12", prop12[i - 1]);
            for p in i..=5 {
                bean.add_reference("prop7", BeanId::new("Parent", format!("p{}", p)));
            }
            bean
        })
        .collect();
    store.create_all(grandfathers).expect("create grandfathers");
}

fn instance_ids(beans: &[Bean]) -> BTreeSet<String> {
    beans.iter().map(|b| b.instance_id().to_string()).collect()
}

fn set_of(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// TIER S0: BATCH WRITES
// =============================================================================

mod s0_batch_writes {
    use super::*;

    /// S0.1: A created bean reads back with its values and references.
    #[test]
    fn created_bean_reads_back() {
        each_backend(|store| {
            populate_family(store);
            let g2 = store
                .get(&BeanId::new("Grandfather", "g2"))
                .expect("get")
                .expect("present");
            assert_eq!(g2.single_value("prop12"), Some("333.333"));
            assert_eq!(g2.references("prop7").map(<[BeanId]>::len), Some(4));
            assert!(store.get(&BeanId::new("Grandfather", "g9")).expect("get").is_none());
        });
    }

    /// S0.2: Creating an existing bean fails and changes nothing.
    #[test]
    fn duplicate_create_rejected() {
        each_backend(|store| {
            populate_family(store);
            let result = store.create_all(vec![
                Bean::new(BeanId::new("Parent", "p6")),
                Bean::new(BeanId::new("Parent", "p1")),
            ]);
            assert!(matches!(result, Err(ConfstoreError::BeanAlreadyExists(_))));
            assert!(store.get(&BeanId::new("Parent", "p6")).expect("get").is_none());
        });
    }

    /// S0.3: Immutable properties cannot be given a value by any write.
    #[test]
    fn immutable_property_rejected() {
        each_backend(|store| {
            populate_family(store);
            let with_created =
                |id: &str| Bean::new(BeanId::new("Grandfather", id)).with_property("created", 1);

            assert!(matches!(
                store.create(with_created("g6")),
                Err(ConfstoreError::ImmutableProperty { .. })
            ));
            assert!(matches!(
                store.set(with_created("g1").with_property("prop1", "test")),
                Err(ConfstoreError::ImmutableProperty { .. })
            ));
            assert!(matches!(
                store.merge(with_created("g2")),
                Err(ConfstoreError::ImmutableProperty { .. })
            ));

            assert!(store.get(&BeanId::new("Grandfather", "g6")).expect("get").is_none());
            for id in ["g1", "g2"] {
                let stored = store
                    .get(&BeanId::new("Grandfather", id))
                    .expect("get")
                    .expect("present");
                assert!(stored.values("created").is_none());
            }
        });
    }

    /// S0.4: Set replaces every field, merge only the given ones.
    #[test]
    fn set_replaces_merge_patches() {
        each_backend(|store| {
            populate_family(store);
            let id = BeanId::new("Grandfather", "g3");

            store
                .merge(Bean::new(id.clone()).with_property("prop1", "patched"))
                .expect("merge");
            let merged = store.get(&id).expect("get").expect("present");
            assert_eq!(merged.single_value("prop1"), Some("patched"));
            assert_eq!(merged.single_value("prop12"), Some("3"));

            let mut patch = Bean::new(id.clone());
            patch.set_property("prop12", Vec::new());
            store.merge(patch).expect("merge removal");
            let merged = store.get(&id).expect("get").expect("present");
            assert_eq!(merged.values("prop12"), None);

            store
                .set(Bean::new(id.clone()).with_property("prop3", 30))
                .expect("set");
            let replaced = store.get(&id).expect("get").expect("present");
            assert_eq!(replaced.single_value("prop3"), Some("30"));
            assert_eq!(replaced.values("prop1"), None);
            assert_eq!(replaced.references("prop7"), None);
        });
    }

    /// S0.5: Set and merge need an existing bean.
    #[test]
    fn update_of_missing_bean_rejected() {
        each_backend(|store| {
            register_family(store);
            let ghost = Bean::new(BeanId::new("Parent", "ghost"));
            assert!(matches!(store.set(ghost.clone()), Err(ConfstoreError::BeanNotFound(_))));
            assert!(matches!(store.merge(ghost), Err(ConfstoreError::BeanNotFound(_))));
        });
    }

    /// S0.6: Values must parse as the declared type.
    #[test]
    fn wrong_type_rejected() {
        each_backend(|store| {
            register_family(store);
            let bean = Bean::new(BeanId::new("Grandfather", "g1")).with_property("prop3", "three");
            assert!(matches!(
                store.create(bean),
                Err(ConfstoreError::WrongPropertyType { .. })
            ));
        });
    }
}

// =============================================================================
// TIER S1: REFERENTIAL INTEGRITY
// =============================================================================

mod s1_referential_integrity {
    use super::*;

    /// S1.1: References must point at existing beans or beans in the batch.
    #[test]
    fn dangling_reference_rejected() {
        each_backend(|store| {
            register_family(store);
            let bean = Bean::new(BeanId::new("Grandfather", "g1"))
                .with_reference("prop7", BeanId::new("Parent", "nobody"));
            assert!(matches!(
                store.create(bean),
                Err(ConfstoreError::MissingReference { .. })
            ));

            store
                .create_all(vec![
                    Bean::new(BeanId::new("Grandfather", "g1"))
                        .with_reference("prop7", BeanId::new("Parent", "p1")),
                    Bean::new(BeanId::new("Parent", "p1")),
                ])
                .expect("same-batch reference");
        });
    }

    /// S1.2: A referenced bean cannot be deleted.
    #[test]
    fn referenced_bean_not_deleted() {
        each_backend(|store| {
            populate_family(store);
            let err = store.delete(&BeanId::new("Parent", "p5")).err();
            assert!(matches!(
                err,
                Some(ConfstoreError::ReferentialIntegrity { ref id, ref referenced_by })
                    if id == &BeanId::new("Parent", "p5") && referenced_by.len() == 5
            ));
            assert!(store.get(&BeanId::new("Parent", "p5")).expect("get").is_some());
        });
    }

    /// S1.3: Deleting referrer and target together is allowed.
    #[test]
    fn delete_with_referrers_in_batch() {
        each_backend(|store| {
            register_family(store);
            store
                .create_all(vec![
                    Bean::new(BeanId::new("Parent", "a")),
                    Bean::new(BeanId::new("Parent", "b")),
                    Bean::new(BeanId::new("Grandfather", "g"))
                        .with_reference("prop7", BeanId::new("Parent", "a")),
                ])
                .expect("create");
            store.delete(&BeanId::new("Grandfather", "g")).expect("delete referrer");
            let removed = store
                .delete_all("Parent", &["a".to_string(), "b".to_string()])
                .expect("delete parents");
            assert_eq!(instance_ids(&removed), set_of(&["a", "b"]));
            assert!(store.list("Parent").expect("list").is_empty());
        });
    }

    /// S1.4: Deleting a missing bean fails.
    #[test]
    fn delete_missing_rejected() {
        each_backend(|store| {
            register_family(store);
            assert!(matches!(
                store.delete(&BeanId::new("Parent", "none")),
                Err(ConfstoreError::BeanNotFound(_))
            ));
        });
    }

    /// S1.5: Listing attaches non-singleton references one level deep.
    #[test]
    fn list_attaches_references() {
        each_backend(|store| {
            populate_family(store);
            let beans = store.list("Grandfather").expect("list");
            assert_eq!(beans.len(), 5);
            for bean in &beans {
                for target in bean.references("prop7").unwrap_or_default() {
                    let loaded = target.bean().expect("reference attached");
                    assert_eq!(loaded.id(), target);
                }
            }
        });
    }
}

// =============================================================================
// TIER S2: SINGLETONS AND DEFAULTS
// =============================================================================

mod s2_singletons {
    use super::*;
    use confstore_core::StaticDefaults;
    use std::sync::Arc;

    fn limits() -> Schema {
        Schema::singleton("Limits")
            .with_property(
                PropertyDescriptor::scalar("max_connections", ValueType::Integer).with_defaults([64]),
            )
            .with_property(PropertyDescriptor::reference("policy", "Policy"))
    }

    fn policy() -> Schema {
        Schema::singleton("Policy")
            .with_property(PropertyDescriptor::scalar("mode", ValueType::String))
            .with_property(PropertyDescriptor::reference("limits", "Limits"))
    }

    /// S2.1: An unstored singleton resolves to its schema defaults.
    #[test]
    fn missing_singleton_uses_defaults() {
        each_backend(|store| {
            store.register_schemas(vec![limits(), policy()]).expect("register");
            let bean = store.singleton("Limits").expect("singleton");
            assert!(bean.is_default());
            assert_eq!(bean.single_value("max_connections"), Some("64"));
            assert!(store.get(&BeanId::singleton("Limits")).expect("get").is_none());
        });
    }

    /// S2.5: A provider's instance is the read-time fallback and is never stored.
    #[test]
    fn provider_default_used_without_provisioning() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let stores = [
            ConfigStore::in_memory(),
            ConfigStore::open_redb(dir.path().join("store.redb")).expect("open"),
        ];
        for store in stores {
            let provider = StaticDefaults::new().with(
                Bean::new(BeanId::singleton("Limits")).with_property("max_connections", 8),
            );
            let store = store.with_defaults(Arc::new(provider));
            store.register_schemas(vec![limits(), policy()]).expect("register");

            let first = store.singleton("Limits").expect("singleton");
            assert!(first.is_default());
            assert_eq!(first.single_value("max_connections"), Some("8"));
            assert!(store.get(&BeanId::singleton("Limits")).expect("get").is_none());

            let second = store.singleton("Limits").expect("singleton again");
            assert_eq!(first, second);
            assert_eq!(
                first.first_reference("policy"),
                second.first_reference("policy")
            );
        }
    }

    /// S2.2: Mutually referencing singletons resolve without looping.
    #[test]
    fn singleton_cycle_terminates() {
        each_backend(|store| {
            store.register_schemas(vec![limits(), policy()]).expect("register");
            store.create_singleton("Policy").expect("create policy");
            store.create_singleton("Limits").expect("create limits");
            store
                .merge(Bean::new(BeanId::singleton("Policy")).with_property("mode", "strict"))
                .expect("merge");

            let limits = store.singleton("Limits").expect("limits");
            let policy_ref = limits.first_reference("policy").expect("auto-filled reference");
            let policy = policy_ref.bean().expect("policy resolved");
            assert_eq!(policy.single_value("mode"), Some("strict"));

            let back = policy.first_reference("limits").expect("back reference");
            assert_eq!(back, &BeanId::singleton("Limits"));
            assert!(back.bean().is_none(), "cycle is not followed");
        });
    }

    /// S2.3: Creating a singleton twice is a no-op.
    #[test]
    fn create_singleton_idempotent() {
        each_backend(|store| {
            store.register_schemas(vec![limits(), policy()]).expect("register");
            assert!(store.create_singleton("Limits").expect("first"));
            assert!(!store.create_singleton("Limits").expect("second"));
        });
    }

    /// S2.4: Provisioned defaults are stored once and cannot be deleted.
    #[test]
    fn provisioned_defaults_are_protected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let stores = [
            ConfigStore::in_memory(),
            ConfigStore::open_redb(dir.path().join("store.redb")).expect("open"),
        ];
        for store in stores {
            let provider = StaticDefaults::new().with(
                Bean::new(BeanId::singleton("Limits")).with_property("max_connections", 8),
            );
            let store = store.with_defaults(Arc::new(provider));
            store.register_schemas(vec![limits(), policy()]).expect("register");

            assert_eq!(store.provision_defaults().expect("provision"), 1);
            assert_eq!(store.provision_defaults().expect("again"), 0);

            let stored = store.get(&BeanId::singleton("Limits")).expect("get").expect("stored");
            assert!(stored.is_default());
            assert_eq!(stored.single_value("max_connections"), Some("8"));
            assert!(matches!(
                store.delete(&BeanId::singleton("Limits")),
                Err(ConfstoreError::InvalidData(_))
            ));
        }
    }
}

// =============================================================================
// TIER S3: QUERIES
// =============================================================================

mod s3_queries {
    use super::*;

    fn run(store: &ConfigStore, restrictions: Vec<confstore_core::Restriction>) -> BTreeSet<String> {
        let mut query = store.query("Grandfather").expect("query");
        for restriction in restrictions {
            query = query.add(restriction);
        }
        instance_ids(query.retrieve().expect("retrieve").beans())
    }

    /// S3.1: Numeric comparisons use the declared type.
    #[test]
    fn numeric_comparisons() {
        each_backend(|store| {
            populate_family(store);
            assert_eq!(run(store, vec![greater_than("prop12", 4.0)]), set_of(&["g2", "g5"]));
            assert_eq!(run(store, vec![less_than("prop12", 2.0)]), set_of(&["g1"]));
            assert_eq!(run(store, vec![equal("prop12", 333.333)]), set_of(&["g2"]));
            assert_eq!(
                run(store, vec![between("prop3", 2, 4)]),
                set_of(&["g2", "g3", "g4"])
            );
        });
    }

    /// S3.2: Restrictions added to one query are combined with AND.
    #[test]
    fn restrictions_conjoin() {
        each_backend(|store| {
            populate_family(store);
            assert_eq!(
                run(store, vec![less_than("prop12", 1000), contains("prop1", "tes")]),
                set_of(&["g1"])
            );
        });
    }

    /// S3.0: Equality, negated equality and substring on the family data.
    #[test]
    fn family_restrictions() {
        each_backend(|store| {
            populate_family(store);
            assert_eq!(run(store, vec![equal("prop1", "test")]), set_of(&["g1"]));
            assert_eq!(run(store, vec![not(equal("prop1", "value"))]), set_of(&["g1"]));
            assert_eq!(
                run(store, vec![contains("prop1", "val")]),
                set_of(&["g2", "g3", "g4", "g5"])
            );
        });
    }

    /// S3.3: Negation and disjunction.
    #[test]
    fn negation_and_disjunction() {
        each_backend(|store| {
            populate_family(store);
            assert_eq!(run(store, vec![not(contains("prop1", "val"))]), set_of(&["g1"]));
            assert_eq!(
                run(store, vec![or([equal("prop3", 1), equal("prop3", 5)])]),
                set_of(&["g1", "g5"])
            );
            assert_eq!(
                run(store, vec![not(in_list("prop3", [1, 2, 3]))]),
                set_of(&["g4", "g5"])
            );
        });
    }

    /// S3.4: Reference lists match on target instance ids.
    #[test]
    fn reference_restrictions() {
        each_backend(|store| {
            populate_family(store);
            assert_eq!(run(store, vec![equal("prop7", "p1")]), set_of(&["g1"]));
            assert_eq!(run(store, vec![contains("prop7", "p5")]).len(), 5);
        });
    }

    /// S3.5: Paging one result at a time visits every match once.
    #[test]
    fn pagination_visits_each_match() {
        each_backend(|store| {
            populate_family(store);
            let mut seen = BTreeSet::new();
            let mut cursor = confstore_core::Cursor::START;
            for _ in 0..5 {
                let page = store
                    .query("Grandfather")
                    .expect("query")
                    .add(contains("prop7", "p5"))
                    .set_first_result(cursor)
                    .set_max_results(1)
                    .retrieve()
                    .expect("retrieve");
                assert_eq!(page.len(), 1);
                seen.extend(instance_ids(page.beans()));
                cursor = page.next_first_result();
            }
            assert_eq!(seen.len(), 5);

            let tail = store
                .query("Grandfather")
                .expect("query")
                .set_first_result(cursor)
                .retrieve()
                .expect("retrieve");
            assert!(tail.is_empty());
        });
    }

    /// S3.6: Restrictions on unknown or non-indexed properties are refused.
    #[test]
    fn invalid_restrictions_refused() {
        each_backend(|store| {
            populate_family(store);
            let unknown = store.query("Grandfather").expect("query").add(equal("nope", 1)).retrieve();
            assert!(matches!(unknown, Err(ConfstoreError::PropertyNotInSchema { .. })));

            let unindexed = store
                .query("Grandfather")
                .expect("query")
                .add(equal("created", 1))
                .retrieve();
            assert!(matches!(unindexed, Err(ConfstoreError::UnsupportedRestriction(_))));
        });
    }
}

// =============================================================================
// TIER S4: NOTIFICATIONS
// =============================================================================

mod s4_notifications {
    use super::*;
    use confstore_core::{Change, ChangeKind, Observer, ObserverError};
    use std::sync::{Arc, Mutex, PoisonError};

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<(ChangeKind, String)>>,
    }

    impl Observer for Journal {
        fn observes(&self, schema_name: &str) -> bool {
            schema_name == "Parent"
        }

        fn notify(&self, changes: &[Change]) -> Result<(), ObserverError> {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            for change in changes {
                let id = change.bean().map(|b| b.instance_id().to_string()).unwrap_or_default();
                entries.push((change.kind(), id));
            }
            Ok(())
        }
    }

    /// S4.1: Observers see committed writes of the schemas they watch.
    #[test]
    fn observers_see_committed_writes() {
        each_backend(|store| {
            register_family(store);
            let journal = Arc::new(Journal::default());
            store.register_observer(journal.clone());

            store.create(Bean::new(BeanId::new("Parent", "a"))).expect("create");
            store
                .merge(Bean::new(BeanId::new("Parent", "a")).with_property("label", "x"))
                .expect("merge");
            store.create(Bean::new(BeanId::new("Grandfather", "g"))).expect("create g");
            let _ = store.create(Bean::new(BeanId::new("Parent", "a")));
            store.delete(&BeanId::new("Parent", "a")).expect("delete");

            let entries = journal.entries.lock().unwrap_or_else(PoisonError::into_inner).clone();
            assert_eq!(
                entries,
                vec![
                    (ChangeKind::Created, "a".to_string()),
                    (ChangeKind::Updated, "a".to_string()),
                    (ChangeKind::Deleted, "a".to_string()),
                ]
            );
        });
    }
}
