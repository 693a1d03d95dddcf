//! # Bean Queries
//!
//! A query is a schema, a conjunction of restrictions and a page window.
//! Results come back in a stable order per backend, and each result carries
//! the cursor for the next page: `next = first + returned`. Iterating from
//! cursor 0 until an empty page visits every match exactly once, as long as
//! the matched set does not change in between.

use crate::manager::BeanManager;
use crate::primitives::DEFAULT_MAX_RESULTS;
use crate::restriction::{Restriction, RestrictionEvaluator};
use crate::schema::Schema;
use crate::{Bean, ConfstoreError};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// CURSOR
// =============================================================================

/// Position in a query's result sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(usize);

impl Cursor {
    pub const START: Self = Self(0);

    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

impl From<usize> for Cursor {
    fn from(offset: usize) -> Self {
        Self(offset)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = ConfstoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse()
            .map(Self)
            .map_err(|_| ConfstoreError::InvalidData(format!("invalid cursor '{}'", s)))
    }
}

// =============================================================================
// QUERY SPEC
// =============================================================================

/// Backend-facing description of a query.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    schema: Arc<Schema>,
    restrictions: Vec<Restriction>,
    first_result: Cursor,
    max_results: usize,
}

impl QuerySpec {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            restrictions: Vec::new(),
            first_result: Cursor::START,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[must_use]
    pub fn restrictions(&self) -> &[Restriction] {
        &self.restrictions
    }

    #[must_use]
    pub fn first_result(&self) -> Cursor {
        self.first_result
    }

    #[must_use]
    pub fn max_results(&self) -> usize {
        self.max_results
    }

    /// All restrictions as one conjunction.
    #[must_use]
    pub fn restriction(&self) -> Restriction {
        Restriction::And(self.restrictions.clone())
    }

    /// Check every restriction against the schema.
    pub fn check(&self) -> Result<(), ConfstoreError> {
        for restriction in &self.restrictions {
            restriction.check(&self.schema)?;
        }
        Ok(())
    }

    /// Whether a bean satisfies every restriction.
    pub fn matches(&self, bean: &Bean) -> Result<bool, ConfstoreError> {
        for restriction in &self.restrictions {
            if !RestrictionEvaluator::evaluate(bean, &self.schema, restriction)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Filter ordered candidates and cut out the requested page.
    ///
    /// Candidates must arrive in the backend's stable order.
    pub fn paginate<I>(&self, candidates: I) -> Result<QueryResult, ConfstoreError>
    where
        I: IntoIterator<Item = Result<Bean, ConfstoreError>>,
    {
        let first = self.first_result.offset();
        let mut matched = 0usize;
        let mut beans = Vec::new();
        for candidate in candidates {
            if beans.len() >= self.max_results {
                break;
            }
            let bean = candidate?;
            if !self.matches(&bean)? {
                continue;
            }
            if matched >= first {
                beans.push(bean);
            }
            matched += 1;
        }
        let next = Cursor(first.saturating_add(beans.len()));
        tracing::debug!(
            schema = %self.schema.name,
            first,
            returned = beans.len(),
            "query page"
        );
        Ok(QueryResult { beans, next })
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Fluent query bound to a manager.
pub struct BeanQuery<'a> {
    manager: &'a dyn BeanManager,
    spec: QuerySpec,
}

impl fmt::Debug for BeanQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanQuery")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl<'a> BeanQuery<'a> {
    pub fn new(manager: &'a dyn BeanManager, schema: Arc<Schema>) -> Self {
        Self {
            manager,
            spec: QuerySpec::new(schema),
        }
    }

    /// Add a restriction; restrictions are combined with AND.
    #[must_use]
    pub fn add(mut self, restriction: Restriction) -> Self {
        self.spec.restrictions.push(restriction);
        self
    }

    #[must_use]
    pub fn set_first_result(mut self, first: impl Into<Cursor>) -> Self {
        self.spec.first_result = first.into();
        self
    }

    #[must_use]
    pub fn set_max_results(mut self, max: usize) -> Self {
        self.spec.max_results = max;
        self
    }

    #[must_use]
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn retrieve(&self) -> Result<QueryResult, ConfstoreError> {
        self.spec.check()?;
        self.manager.retrieve(&self.spec)
    }
}

// =============================================================================
// RESULT
// =============================================================================

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    beans: Vec<Bean>,
    next: Cursor,
}

impl QueryResult {
    #[must_use]
    pub fn beans(&self) -> &[Bean] {
        &self.beans
    }

    #[must_use]
    pub fn into_beans(self) -> Vec<Bean> {
        self.beans
    }

    /// Cursor of the page after this one.
    #[must_use]
    pub fn next_first_result(&self) -> Cursor {
        self.next
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.beans.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.beans.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
