//! Query types and the find pipeline.
//!
//! Planning partitions a query across the join graph and executes it,
//! hydration rewrites cross-partition filters into literals, the merger
//! attaches child rows by re-evaluating the original predicates, and
//! [`unflatten`] produces the nested output objects.

mod hydrate;
mod merge;
mod plan;
pub(crate) mod mutate;
mod unflatten;

pub use plan::execute_find;
pub use unflatten::unflatten;

use serde_json::Value as JsonValue;

use crate::filter::Filter;
use crate::graph::{FieldId, NodeId};

/// Fixed page size applied when a query names neither a limit nor the
/// unlimited sentinel.
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// One requested output: a single field, or a relation's default field set.
#[derive(Debug, Clone, Copy)]
pub enum Selection {
    Field(FieldId),
    Relation(NodeId),
}

impl From<FieldId> for Selection {
    fn from(field: FieldId) -> Self {
        Selection::Field(field)
    }
}

impl From<NodeId> for Selection {
    fn from(node: NodeId) -> Self {
        Selection::Relation(node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    /// Normalizes loose caller input: `"d"`, `"desc"`, `"descending"` (any
    /// case) sort descending, anything else ascending.
    pub fn normalize(raw: &str) -> SortDirection {
        match raw.to_ascii_lowercase().as_str() {
            "d" | "desc" | "descending" => SortDirection::Descending,
            _ => SortDirection::Ascending,
        }
    }
}

impl From<&str> for SortDirection {
    fn from(raw: &str) -> Self {
        SortDirection::normalize(raw)
    }
}

impl From<i64> for SortDirection {
    fn from(raw: i64) -> Self {
        if raw <= 0 {
            SortDirection::Descending
        } else {
            SortDirection::Ascending
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sort {
    pub field: FieldId,
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(field: FieldId) -> Sort {
        Sort {
            field,
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(field: FieldId) -> Sort {
        Sort {
            field,
            direction: SortDirection::Descending,
        }
    }
}

/// Row limit: the default page size, an explicit value, or the distinct
/// "no limit" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Limit {
    #[default]
    Default,
    Unlimited,
    Exact(u64),
}

impl Limit {
    pub(crate) fn resolve(self) -> Option<u64> {
        match self {
            Limit::Default => Some(DEFAULT_PAGE_SIZE),
            Limit::Unlimited => None,
            Limit::Exact(n) => Some(n),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pagination {
    pub offset: u64,
    pub limit: Limit,
}

impl Pagination {
    pub fn new(offset: u64, limit: Limit) -> Pagination {
        Pagination { offset, limit }
    }

    pub fn unlimited() -> Pagination {
        Pagination {
            offset: 0,
            limit: Limit::Unlimited,
        }
    }
}

/// A structured find query against a graph root.
#[derive(Clone, Default)]
pub struct FindQuery {
    /// Count mode: return the number of matching root rows instead of rows.
    pub count: bool,
    /// Requested outputs; empty means the root's default fields.
    pub selections: Vec<Selection>,
    pub filter: Option<Filter>,
    pub sorts: Vec<Sort>,
    pub pagination: Pagination,
    /// Opaque auth context handed to per-node authorization predicates.
    pub auth: Option<JsonValue>,
}

impl FindQuery {
    pub fn new() -> FindQuery {
        FindQuery::default()
    }

    pub fn select(mut self, selections: impl IntoIterator<Item = Selection>) -> Self {
        self.selections.extend(selections);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn paginate(mut self, offset: u64, limit: Limit) -> Self {
        self.pagination = Pagination { offset, limit };
        self
    }

    pub fn auth(mut self, auth: JsonValue) -> Self {
        self.auth = Some(auth);
        self
    }
}

/// Outcome of a find: a scalar count or nested result objects.
#[derive(Debug)]
pub enum FindResult {
    Count(u64),
    Rows(Vec<JsonValue>),
}
