//! Write-path planning: updates and removes whose filters reach across
//! partitions are first resolved to literal row identities via the planner.

use tracing::warn;

use crate::error::{Result, TrellisError};
use crate::executor::{DeleteStatement, SqlExecutor, UpdateStatement};
use crate::filter::{self, Filter, Operand};
use crate::graph::{NodeId, QueryGraph};
use crate::query::{FindQuery, FindResult, Pagination, Selection};
use crate::value::Value;

use super::plan::{execute_find, filter_bases};

pub(crate) async fn execute_update<E: SqlExecutor>(
    graph: &QueryGraph,
    root: NodeId,
    assignments: Vec<(String, Value)>,
    filter: Filter,
    executor: &E,
) -> Result<u64> {
    let Some(filter) = resolve_write_filter(graph, root, filter, executor).await? else {
        return Ok(0);
    };
    executor
        .update(&UpdateStatement {
            graph,
            node: root,
            assignments,
            filter,
        })
        .await
}

pub(crate) async fn execute_remove<E: SqlExecutor>(
    graph: &QueryGraph,
    root: NodeId,
    filter: Filter,
    executor: &E,
) -> Result<u64> {
    let Some(filter) = resolve_write_filter(graph, root, filter, executor).await? else {
        return Ok(0);
    };
    executor
        .delete(&DeleteStatement {
            graph,
            node: root,
            filter,
        })
        .await
}

/// A filter touching only root-node fields is usable as-is. One that reaches
/// into joined nodes cannot key a write directly, so the matching rows are
/// materialized first (primary keys when declared, every column otherwise)
/// and the write is keyed on that literal set. Returns `None` when nothing
/// matches.
async fn resolve_write_filter<E: SqlExecutor>(
    graph: &QueryGraph,
    root: NodeId,
    filter: Filter,
    executor: &E,
) -> Result<Option<Filter>> {
    let joined = filter
        .fields()
        .iter()
        .any(|field| graph.field_node(*field) != root);
    if !joined {
        return Ok(Some(filter));
    }

    // The lookup SELECT can LEFT JOIN same-partition relations, but a bare
    // predicate on a to-many partition cannot select affected root rows;
    // that intent is an existence test.
    let root_base = graph.base(root);
    for base in filter_bases(graph, &filter)? {
        if base != root_base {
            return Err(TrellisError::Plan(
                "write filters must resolve within the root partition; filter to-many relations with an existence test"
                    .to_string(),
            ));
        }
    }

    match graph.primary_key(root) {
        Some(primary_key) => {
            let rows = lookup_rows(graph, root, vec![Selection::Field(primary_key)], filter, executor)
                .await?;
            if rows.is_empty() {
                return Ok(None);
            }
            let ids = rows
                .iter()
                .map(|row| Value::from_json(&graph.map_field(primary_key, row)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(filter::in_list(primary_key, ids)))
        }
        None => {
            warn!(
                table = graph.table(root),
                "write with joined filter on a table with no primary key; falling back to whole-row identity matching"
            );
            let fields = graph.node_fields(root).to_vec();
            let selections = fields.iter().copied().map(Selection::Field).collect();
            let rows = lookup_rows(graph, root, selections, filter, executor).await?;
            if rows.is_empty() {
                return Ok(None);
            }

            let row_filters = rows
                .iter()
                .map(|row| {
                    let mut equalities = Vec::with_capacity(fields.len());
                    for &field in &fields {
                        let value = Value::from_json(&graph.map_field(field, row))?;
                        equalities.push(field.eq(Operand::Value(value)));
                    }
                    Ok(filter::and(equalities))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(filter::or(row_filters)))
        }
    }
}

async fn lookup_rows<E: SqlExecutor>(
    graph: &QueryGraph,
    root: NodeId,
    selections: Vec<Selection>,
    filter: Filter,
    executor: &E,
) -> Result<Vec<serde_json::Value>> {
    let query = FindQuery {
        count: false,
        selections,
        filter: Some(filter),
        sorts: Vec::new(),
        pagination: Pagination::unlimited(),
        auth: None,
    };
    match execute_find(graph, root, &query, executor).await? {
        FindResult::Rows(rows) => Ok(rows),
        FindResult::Count(_) => Err(TrellisError::Plan(
            "row lookup unexpectedly returned a count".to_string(),
        )),
    }
}
