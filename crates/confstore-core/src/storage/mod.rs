//! # Persistent Storage
//!
//! redb-backed implementations of the id registry and the bean manager.
//! Both can share one database file.

mod redb_beans;
mod redb_ids;

pub use redb_beans::RedbBeanManager;
pub use redb_ids::RedbUniqueIds;
