//! # Change Notifications
//!
//! Observers are told about committed changes. Delivery is best effort:
//! an observer that fails or panics is logged and skipped, and never
//! affects the write that produced the change or the other observers.

use crate::Bean;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

/// Error type observers may return.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One committed change: the state before and after.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    before: Option<Bean>,
    after: Option<Bean>,
}

impl Change {
    #[must_use]
    pub fn created(after: Bean) -> Self {
        Self {
            before: None,
            after: Some(after),
        }
    }

    #[must_use]
    pub fn updated(before: Bean, after: Bean) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
        }
    }

    #[must_use]
    pub fn deleted(before: Bean) -> Self {
        Self {
            before: Some(before),
            after: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match (&self.before, &self.after) {
            (None, _) => ChangeKind::Created,
            (Some(_), Some(_)) => ChangeKind::Updated,
            (Some(_), None) => ChangeKind::Deleted,
        }
    }

    #[must_use]
    pub fn before(&self) -> Option<&Bean> {
        self.before.as_ref()
    }

    #[must_use]
    pub fn after(&self) -> Option<&Bean> {
        self.after.as_ref()
    }

    /// The bean this change is about.
    #[must_use]
    pub fn bean(&self) -> Option<&Bean> {
        self.after.as_ref().or(self.before.as_ref())
    }

    #[must_use]
    pub fn schema_name(&self) -> &str {
        self.bean().map(Bean::schema_name).unwrap_or_default()
    }
}

pub trait Observer: Send + Sync {
    /// Whether this observer wants changes of `schema_name`.
    fn observes(&self, _schema_name: &str) -> bool {
        true
    }

    fn notify(&self, changes: &[Change]) -> Result<(), ObserverError>;
}

#[derive(Default)]
pub struct NotificationManager {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl std::fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationManager")
            .field("observers", &self.len())
            .finish()
    }
}

impl NotificationManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Remove an observer by identity. Returns whether it was registered.
    pub fn unregister(&self, observer: &Arc<dyn Observer>) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver changes to every interested observer.
    ///
    /// Returns the number of observers that accepted their changes.
    pub fn fire(&self, changes: &[Change]) -> usize {
        if changes.is_empty() {
            return 0;
        }
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut delivered = 0;
        for observer in observers {
            let relevant: Vec<Change> = changes
                .iter()
                .filter(|c| observer.observes(c.schema_name()))
                .cloned()
                .collect();
            if relevant.is_empty() {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| observer.notify(&relevant))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => tracing::warn!(error = %e, "observer failed, ignoring"),
                Err(_) => tracing::warn!("observer panicked, ignoring"),
            }
        }
        delivered
    }
}

// =============================================================================
// TESTS
// =============================================================================
