//! Boundary between the planner and SQL-emitting adapters.
//!
//! The planner never renders SQL text itself. It hands an adapter one
//! statement per partition — table, joins, predicate, sorts, pagination, all
//! still expressed against the query graph — and gets back flat rows or
//! counts. Adapters bind [`Value`]s as parameters and pass `Raw` operands
//! through verbatim.

use crate::error::Result;
use crate::filter::Filter;
use crate::graph::{FieldId, NodeId, QueryGraph};
use crate::query::Sort;
use crate::row::FlatRow;
use crate::value::Value;

/// One LEFT JOIN of a partition statement, with its ON predicate.
#[derive(Debug, Clone)]
pub struct JoinClause {
    pub node: NodeId,
    pub on: Filter,
}

/// One partition's SELECT: scope of a single SQL round trip.
pub struct SelectStatement<'g> {
    pub graph: &'g QueryGraph,
    /// The partition base; the statement's FROM table.
    pub node: NodeId,
    /// Fields to select, aliased by their logical dot paths. An empty list
    /// still selects a synthetic placeholder column, never an empty list.
    pub columns: Vec<FieldId>,
    pub joins: Vec<JoinClause>,
    pub filter: Option<Filter>,
    pub sorts: Vec<Sort>,
    pub offset: u64,
    pub limit: Option<u64>,
}

pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

pub struct UpdateStatement<'g> {
    pub graph: &'g QueryGraph,
    /// The root node; its table is the statement target.
    pub node: NodeId,
    pub assignments: Vec<(String, Value)>,
    pub filter: Filter,
}

pub struct DeleteStatement<'g> {
    pub graph: &'g QueryGraph,
    pub node: NodeId,
    pub filter: Filter,
}

/// Storage capability the planner executes against.
///
/// `begin`/`commit`/`rollback` may nest; adapters only issue the outermost
/// transaction against the database.
#[allow(async_fn_in_trait)]
pub trait SqlExecutor {
    /// Runs one partition statement, returning flat dot-path-keyed rows.
    async fn fetch(&self, statement: &SelectStatement<'_>) -> Result<Vec<FlatRow>>;

    /// Runs one partition statement in count mode (`COUNT(*)`), ignoring
    /// selection and pagination.
    async fn count(&self, statement: &SelectStatement<'_>) -> Result<u64>;

    /// Multi-row insert; returns the new row ids in input order.
    async fn insert(&self, statement: &InsertStatement) -> Result<Vec<i64>>;

    /// Returns the number of affected rows.
    async fn update(&self, statement: &UpdateStatement<'_>) -> Result<u64>;

    /// Returns the number of affected rows.
    async fn delete(&self, statement: &DeleteStatement<'_>) -> Result<u64>;

    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

/// Runs `work` inside a transaction-scoped unit of work: commits on success,
/// rolls back on error. Nested calls compose — only the outermost unit
/// touches the database transaction.
pub async fn with_transaction<E, T, F>(executor: &E, work: F) -> Result<T>
where
    E: SqlExecutor,
    F: AsyncFnOnce() -> Result<T>,
{
    executor.begin().await?;
    match work().await {
        Ok(value) => {
            executor.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let _ = executor.rollback().await;
            Err(err)
        }
    }
}
