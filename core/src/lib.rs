//! Core of the trellis relational query planner.
//!
//! Callers declare tables, typed columns and relations in a
//! [`SchemaRegistry`], then issue structured queries through a
//! [`Database`]. The planner walks the per-query join graph, decides which
//! relations share one SQL statement and which need their own correlated
//! round trip, rewrites cross-partition filters into literals, and stitches
//! the partial result sets back into nested objects.
//!
//! SQL emission lives behind the [`SqlExecutor`] trait; this crate never
//! renders SQL text itself.

pub mod database;
pub mod error;
pub mod executor;
pub mod filter;
pub mod graph;
pub mod query;
pub mod row;
pub mod schema;
pub mod value;

// Re-export key types and traits
pub use database::{Database, FindAllWithCount, UpdateSpec};
pub use error::{Result, TrellisError};
pub use executor::{
    DeleteStatement, InsertStatement, JoinClause, SelectStatement, SqlExecutor, UpdateStatement,
    with_transaction,
};
pub use filter::{ExistsFilter, Filter, FilterGroup, FilterOp, Grouping, OpFilter, Operand};
pub use graph::{FieldId, JoinEnds, JoinThrough, NodeId, QueryGraph};
pub use query::{
    DEFAULT_PAGE_SIZE, FindQuery, FindResult, Limit, Pagination, Selection, Sort, SortDirection,
    execute_find, unflatten,
};
pub use row::FlatRow;
pub use schema::{
    DeclEntry, Exclusion, FieldDecl, FieldKind, Mapper, RelationDecl, RelationKind, SchemaBuilder,
    SchemaRegistry, TableBuilder, TableDecl,
};
pub use value::Value;
