//! # confstore-core
//!
//! Schema-driven configuration store.
//!
//! Configuration is a set of *beans*: instances of a declared *schema*,
//! each holding typed property values and references to other beans.
//! Beans are created, replaced, merged and deleted in atomic batches,
//! fetched lazily or with references resolved, and found with
//! restriction queries.
//!
//! ## Layout
//!
//! - `types`, `schema`: the data model and its validation rules
//! - `ids`, `codec`: compact binary form of beans over unique ids
//! - `manager`: the backend contract, with `memory` and `storage` (redb)
//! - `restriction`, `query`: predicates and paginated queries
//! - `resolver`: singleton defaults, eager and deferred reference loading
//! - `notify`: change observers
//! - `context`: the `ConfigStore` entry point tying it together
//!
//! ## Constraints
//!
//! - Every write batch is validated completely before anything is stored
//! - Ordered maps everywhere, so listings are deterministic
//! - No async, no network

// =============================================================================
// MODULES
// =============================================================================

pub mod codec;
pub mod context;
pub mod ids;
pub mod manager;
pub mod memory;
pub mod notify;
pub mod primitives;
pub mod query;
pub mod resolver;
pub mod restriction;
pub mod schema;
pub mod storage;
pub mod types;
pub mod validation;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{Bean, BeanId, ConfstoreError, ScalarValue, ValueType};

// =============================================================================
// RE-EXPORTS: Schemas
// =============================================================================

pub use schema::{
    CollectionKind, FieldModifiers, PropertyDescriptor, PropertyKind, Schema, SchemaRegistry,
    SchemaRule,
};

// =============================================================================
// RE-EXPORTS: Storage
// =============================================================================

pub use codec::BeanCodec;
pub use context::ConfigStore;
pub use ids::{CachedUniqueIds, IdCategory, InMemoryUniqueIds, UniqueIdStore};
pub use manager::BeanManager;
pub use memory::MemoryBeanManager;
pub use storage::{RedbBeanManager, RedbUniqueIds};

// =============================================================================
// RE-EXPORTS: Queries and Resolution
// =============================================================================

pub use notify::{Change, ChangeKind, NotificationManager, Observer, ObserverError};
pub use query::{BeanQuery, Cursor, QueryResult, QuerySpec};
pub use resolver::{DefaultInstanceProvider, LazyRef, Resolver, StaticDefaults};
pub use restriction::{
    Predicate, PropertyRestriction, Restriction, RestrictionEvaluator, RestrictionVisitor,
};
