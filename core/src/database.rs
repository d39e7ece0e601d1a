//! Entry points binding a schema registry to a SQL executor.

use std::sync::Arc;

use futures_util::future::try_join;
use serde_json::Value as JsonValue;

use crate::error::{Result, TrellisError};
use crate::executor::{InsertStatement, SqlExecutor, with_transaction};
use crate::filter::Filter;
use crate::graph::{FieldId, NodeId, QueryGraph};
use crate::query::mutate::{execute_remove, execute_update};
use crate::query::{FindQuery, FindResult, Pagination, execute_find};
use crate::schema::SchemaRegistry;
use crate::value::Value;

/// An update's shape: the fields to write and the rows to match.
pub struct UpdateSpec {
    pub fields: Vec<FieldId>,
    pub filter: Filter,
}

pub struct FindAllWithCount {
    pub rows: Vec<JsonValue>,
    pub count: u64,
}

/// A schema registry bound to an executor; all queries and mutations go
/// through here. Each call builds a fresh query graph for its root table.
pub struct Database<E> {
    registry: Arc<SchemaRegistry>,
    executor: E,
}

impl<E: SqlExecutor> Database<E> {
    pub fn new(registry: Arc<SchemaRegistry>, executor: E) -> Database<E> {
        Database { registry, executor }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// A fresh query graph rooted at `table`, for callers that drive
    /// [`execute_find`] directly.
    pub fn graph(&self, table: &str) -> Result<QueryGraph> {
        QueryGraph::new(self.registry.clone(), table)
    }

    /// Runs `work` inside a transaction; nested mutation calls join it.
    pub async fn transaction<T, F>(&self, work: F) -> Result<T>
    where
        F: AsyncFnOnce(&Database<E>) -> Result<T>,
    {
        with_transaction(&self.executor, async || work(self).await).await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn find_all<F>(&self, table: &str, build: F) -> Result<Vec<JsonValue>>
    where
        F: FnOnce(&mut QueryGraph, NodeId) -> Result<FindQuery>,
    {
        let mut graph = self.graph(table)?;
        let root = graph.root();
        let mut query = build(&mut graph, root)?;
        query.count = false;
        match execute_find(&graph, root, &query, &self.executor).await? {
            FindResult::Rows(rows) => Ok(rows),
            FindResult::Count(_) => Err(TrellisError::Plan(
                "find_all unexpectedly produced a count".to_string(),
            )),
        }
    }

    /// Like [`find_all`](Self::find_all), but expects at least one row and
    /// returns the first; zero matches surface as [`TrellisError::NotFound`].
    pub async fn find_one<F>(&self, table: &str, build: F) -> Result<JsonValue>
    where
        F: FnOnce(&mut QueryGraph, NodeId) -> Result<FindQuery>,
    {
        self.find_all(table, build)
            .await?
            .into_iter()
            .next()
            .ok_or(TrellisError::NotFound)
    }

    /// Number of distinct root rows matching the query's filter.
    pub async fn find_count<F>(&self, table: &str, build: F) -> Result<u64>
    where
        F: FnOnce(&mut QueryGraph, NodeId) -> Result<FindQuery>,
    {
        let mut graph = self.graph(table)?;
        let root = graph.root();
        let mut query = build(&mut graph, root)?;
        query.count = true;
        match execute_find(&graph, root, &query, &self.executor).await? {
            FindResult::Count(count) => Ok(count),
            FindResult::Rows(_) => Err(TrellisError::Plan(
                "find_count unexpectedly produced rows".to_string(),
            )),
        }
    }

    /// One page of rows plus the unpaginated match count, fetched
    /// concurrently.
    pub async fn find_all_with_count<F>(&self, table: &str, build: F) -> Result<FindAllWithCount>
    where
        F: FnOnce(&mut QueryGraph, NodeId) -> Result<FindQuery>,
    {
        let mut graph = self.graph(table)?;
        let root = graph.root();
        let mut query = build(&mut graph, root)?;
        query.count = false;

        let mut count_query = query.clone();
        count_query.count = true;

        let rows_future = execute_find(&graph, root, &query, &self.executor);
        let count_future = execute_find(&graph, root, &count_query, &self.executor);
        let (rows, count) = try_join(rows_future, count_future).await?;

        match (rows, count) {
            (FindResult::Rows(rows), FindResult::Count(count)) => {
                Ok(FindAllWithCount { rows, count })
            }
            _ => Err(TrellisError::Plan(
                "mismatched find/count results".to_string(),
            )),
        }
    }

    /// Fetches one row by primary key with default fields;
    /// [`TrellisError::NotFound`] when absent.
    pub async fn find_by_id(&self, table: &str, id: impl Into<Value>) -> Result<JsonValue> {
        let id = id.into();
        self.find_one(table, |graph, root| {
            let primary_key = require_primary_key(graph, root)?;
            Ok(FindQuery::new().filter(primary_key.eq(id)))
        })
        .await
    }

    /// Fetches rows matching the given primary keys, unpaginated.
    pub async fn find_by_ids(&self, table: &str, ids: Vec<Value>) -> Result<Vec<JsonValue>> {
        self.find_all(table, |graph, root| {
            let primary_key = require_primary_key(graph, root)?;
            let mut query = FindQuery::new().filter(primary_key.in_list(ids));
            query.pagination = Pagination::unlimited();
            Ok(query)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Inserts one row per model, extracting the named fields through their
    /// mappers. Returns the new row ids in input order.
    pub async fn insert(
        &self,
        table: &str,
        fields: &[&str],
        models: &[JsonValue],
    ) -> Result<Vec<i64>> {
        if models.is_empty() {
            return Ok(Vec::new());
        }
        let graph = self.graph(table)?;
        let root = graph.root();
        let fields = fields
            .iter()
            .map(|path| graph.field(root, path))
            .collect::<Result<Vec<_>>>()?;
        let columns = fields
            .iter()
            .map(|field| graph.field_column(*field).to_string())
            .collect();
        let rows = models
            .iter()
            .map(|model| {
                fields
                    .iter()
                    .map(|field| Value::from_json(&graph.map_field(*field, model)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let statement = InsertStatement {
            table: graph.table(root).to_string(),
            columns,
            rows,
        };
        with_transaction(&self.executor, async || {
            self.executor.insert(&statement).await
        })
        .await
    }

    pub async fn insert_one(
        &self,
        table: &str,
        fields: &[&str],
        model: &JsonValue,
    ) -> Result<i64> {
        let ids = self.insert(table, fields, std::slice::from_ref(model)).await?;
        ids.into_iter().next().ok_or(TrellisError::NotFound)
    }

    /// Updates rows matching the spec's filter with values extracted from
    /// `model`. Filters reaching into joined nodes are resolved to literal
    /// row keys first; lookup and write share one transaction.
    pub async fn update<F>(
        &self,
        table: &str,
        build: F,
        model: &JsonValue,
        auth: Option<&JsonValue>,
    ) -> Result<u64>
    where
        F: FnOnce(&mut QueryGraph, NodeId) -> Result<UpdateSpec>,
    {
        let mut graph = self.graph(table)?;
        let root = graph.root();
        let spec = build(&mut graph, root)?;

        let assignments = spec
            .fields
            .iter()
            .map(|field| {
                let value = Value::from_json(&graph.map_field(*field, model))?;
                Ok((graph.field_column(*field).to_string(), value))
            })
            .collect::<Result<Vec<_>>>()?;

        let filter = apply_auth(&graph, root, spec.filter, auth)?;
        with_transaction(&self.executor, async || {
            execute_update(&graph, root, assignments, filter, &self.executor).await
        })
        .await
    }

    /// Removes rows matching the built filter; joined filters are resolved
    /// like [`update`](Self::update).
    pub async fn remove<F>(&self, table: &str, build: F, auth: Option<&JsonValue>) -> Result<u64>
    where
        F: FnOnce(&mut QueryGraph, NodeId) -> Result<Filter>,
    {
        let mut graph = self.graph(table)?;
        let root = graph.root();
        let filter = build(&mut graph, root)?;
        let filter = apply_auth(&graph, root, filter, auth)?;
        with_transaction(&self.executor, async || {
            execute_remove(&graph, root, filter, &self.executor).await
        })
        .await
    }

    /// Removes the given models by primary key.
    pub async fn remove_models(
        &self,
        table: &str,
        models: &[JsonValue],
        auth: Option<&JsonValue>,
    ) -> Result<u64> {
        self.remove(
            table,
            |graph, root| {
                let primary_key = require_primary_key(graph, root)?;
                let ids = models
                    .iter()
                    .map(|model| Value::from_json(&graph.map_field(primary_key, model)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(primary_key.in_list(ids))
            },
            auth,
        )
        .await
    }

    /// Removes exactly one model; zero affected rows surface as
    /// [`TrellisError::NotFound`].
    pub async fn remove_model(
        &self,
        table: &str,
        model: &JsonValue,
        auth: Option<&JsonValue>,
    ) -> Result<()> {
        let removed = self
            .remove_models(table, std::slice::from_ref(model), auth)
            .await?;
        if removed == 0 {
            return Err(TrellisError::NotFound);
        }
        Ok(())
    }
}

fn require_primary_key(graph: &QueryGraph, root: NodeId) -> Result<FieldId> {
    graph.primary_key(root).ok_or_else(|| {
        TrellisError::Schema(format!("no primary key declared on {}", graph.table(root)))
    })
}

fn apply_auth(
    graph: &QueryGraph,
    root: NodeId,
    filter: Filter,
    auth: Option<&JsonValue>,
) -> Result<Filter> {
    let Some(auth) = auth else {
        return Ok(filter);
    };
    match graph.auth_filter(root, auth)? {
        Some(auth_filter) => Ok(filter.and(auth_filter)),
        None => Ok(filter),
    }
}
