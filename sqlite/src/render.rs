//! Literal SQL rendering for partition statements.

use std::fmt::Write;

use trellis_core::filter::{ExistsFilter, FilterGroup, OpFilter};
use trellis_core::{
    DeleteStatement, FieldId, Filter, FilterOp, Grouping, InsertStatement, NodeId, Operand,
    QueryGraph, Result, SelectStatement, SortDirection, TrellisError, UpdateStatement, Value,
};

pub(crate) struct Rendered {
    pub sql: String,
    pub params: Vec<Value>,
}

pub(crate) fn render_select(statement: &SelectStatement<'_>, count: bool) -> Result<Rendered> {
    let graph = statement.graph;
    let mut sql = String::with_capacity(256);
    let mut params = Vec::new();

    sql.push_str("SELECT ");
    if count {
        sql.push_str("COUNT(*) AS \"__count\"");
    } else if statement.columns.is_empty() {
        // a statement must never have an empty SELECT list
        sql.push_str("1 AS \"__\"");
    } else {
        for (index, field) in statement.columns.iter().enumerate() {
            if index > 0 {
                sql.push_str(", ");
            }
            write_qualified_field(graph, *field, &mut sql);
            sql.push_str(" AS \"");
            sql.push_str(&graph.column_alias(*field));
            sql.push('"');
        }
    }

    sql.push_str(" FROM ");
    write_table(graph, statement.node, &mut sql);

    for join in &statement.joins {
        sql.push_str(" LEFT JOIN ");
        write_table(graph, join.node, &mut sql);
        sql.push_str(" ON ");
        render_filter(graph, &join.on, &mut sql, &mut params)?;
    }

    if let Some(filter) = &statement.filter {
        sql.push_str(" WHERE ");
        render_filter(graph, filter, &mut sql, &mut params)?;
    }

    if !count {
        if !statement.sorts.is_empty() {
            sql.push_str(" ORDER BY ");
            for (index, sort) in statement.sorts.iter().enumerate() {
                if index > 0 {
                    sql.push_str(", ");
                }
                write_qualified_field(graph, sort.field, &mut sql);
                sql.push_str(match sort.direction {
                    SortDirection::Ascending => " ASC",
                    SortDirection::Descending => " DESC",
                });
            }
        }

        match statement.limit {
            Some(limit) => {
                let _ = write!(sql, " LIMIT {limit}");
                if statement.offset > 0 {
                    let _ = write!(sql, " OFFSET {}", statement.offset);
                }
            }
            // OFFSET is only valid after a LIMIT; -1 means unbounded
            None if statement.offset > 0 => {
                let _ = write!(sql, " LIMIT -1 OFFSET {}", statement.offset);
            }
            None => {}
        }
    }

    Ok(Rendered { sql, params })
}

pub(crate) fn render_insert(statement: &InsertStatement) -> Result<Rendered> {
    if statement.columns.is_empty() || statement.rows.is_empty() {
        return Err(TrellisError::Plan(
            "insert statement with no columns or rows".to_string(),
        ));
    }

    let mut sql = String::with_capacity(128);
    let mut params = Vec::new();

    sql.push_str("INSERT INTO \"");
    sql.push_str(&statement.table);
    sql.push_str("\" (");
    for (index, column) in statement.columns.iter().enumerate() {
        if index > 0 {
            sql.push_str(", ");
        }
        sql.push('"');
        sql.push_str(column);
        sql.push('"');
    }
    sql.push_str(") VALUES ");

    for (row_index, row) in statement.rows.iter().enumerate() {
        if row.len() != statement.columns.len() {
            return Err(TrellisError::Plan(format!(
                "insert row {} has {} values for {} columns",
                row_index,
                row.len(),
                statement.columns.len()
            )));
        }
        if row_index > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (index, value) in row.iter().enumerate() {
            if index > 0 {
                sql.push_str(", ");
            }
            sql.push('?');
            params.push(value.clone());
        }
        sql.push(')');
    }

    Ok(Rendered { sql, params })
}

pub(crate) fn render_update(statement: &UpdateStatement<'_>) -> Result<Rendered> {
    let graph = statement.graph;
    let mut sql = String::with_capacity(128);
    let mut params = Vec::new();

    sql.push_str("UPDATE ");
    write_table(graph, statement.node, &mut sql);
    sql.push_str(" SET ");
    for (index, (column, value)) in statement.assignments.iter().enumerate() {
        if index > 0 {
            sql.push_str(", ");
        }
        sql.push('"');
        sql.push_str(column);
        sql.push_str("\" = ?");
        params.push(value.clone());
    }
    sql.push_str(" WHERE ");
    render_filter(graph, &statement.filter, &mut sql, &mut params)?;

    Ok(Rendered { sql, params })
}

pub(crate) fn render_delete(statement: &DeleteStatement<'_>) -> Result<Rendered> {
    let graph = statement.graph;
    let mut sql = String::with_capacity(128);
    let mut params = Vec::new();

    sql.push_str("DELETE FROM ");
    write_table(graph, statement.node, &mut sql);
    sql.push_str(" WHERE ");
    render_filter(graph, &statement.filter, &mut sql, &mut params)?;

    Ok(Rendered { sql, params })
}

// ---------------------------------------------------------------------------
// Fragments
// ---------------------------------------------------------------------------

/// Writes `"table" AS "alias"` (alias omitted when identical).
fn write_table(graph: &QueryGraph, node: NodeId, sql: &mut String) {
    let table = graph.table(node);
    let alias = graph.alias(node);
    sql.push('"');
    sql.push_str(table);
    sql.push('"');
    if table != alias {
        sql.push_str(" AS \"");
        sql.push_str(alias);
        sql.push('"');
    }
}

fn write_qualified_field(graph: &QueryGraph, field: FieldId, sql: &mut String) {
    sql.push('"');
    sql.push_str(graph.alias(graph.field_node(field)));
    sql.push_str("\".\"");
    sql.push_str(graph.field_column(field));
    sql.push('"');
}

fn render_filter(
    graph: &QueryGraph,
    filter: &Filter,
    sql: &mut String,
    params: &mut Vec<Value>,
) -> Result<()> {
    match filter {
        Filter::Op(op) => render_op(graph, op, sql, params),
        Filter::Group(group) => render_group(graph, group, sql, params),
        Filter::Exists(exists) => render_exists(graph, exists, sql, params),
    }
}

fn render_group(
    graph: &QueryGraph,
    group: &FilterGroup,
    sql: &mut String,
    params: &mut Vec<Value>,
) -> Result<()> {
    if group.children.is_empty() {
        sql.push_str(match group.grouping {
            Grouping::And => "1 = 1",
            Grouping::Or => "1 = 0",
        });
        return Ok(());
    }

    let separator = match group.grouping {
        Grouping::And => " AND ",
        Grouping::Or => " OR ",
    };
    sql.push('(');
    for (index, child) in group.children.iter().enumerate() {
        if index > 0 {
            sql.push_str(separator);
        }
        render_filter(graph, child, sql, params)?;
    }
    sql.push(')');
    Ok(())
}

fn render_op(
    graph: &QueryGraph,
    op: &OpFilter,
    sql: &mut String,
    params: &mut Vec<Value>,
) -> Result<()> {
    match op.op {
        FilterOp::In | FilterOp::NotIn => {
            // empty operand lists degenerate to constants, never invalid SQL
            if op.operands.is_empty() {
                sql.push_str(if op.op == FilterOp::In { "1 = 0" } else { "1 = 1" });
                return Ok(());
            }
            render_operand(graph, &op.left, sql, params)?;
            sql.push_str(if op.op == FilterOp::In {
                " IN ("
            } else {
                " NOT IN ("
            });
            for (index, operand) in op.operands.iter().enumerate() {
                if index > 0 {
                    sql.push_str(", ");
                }
                render_operand(graph, operand, sql, params)?;
            }
            sql.push(')');
            Ok(())
        }
        FilterOp::Between | FilterOp::NotBetween => {
            let (Some(lo), Some(hi)) = (op.operands.first(), op.operands.get(1)) else {
                return Err(TrellisError::Plan(
                    "range filter is missing its bounds".to_string(),
                ));
            };
            render_operand(graph, &op.left, sql, params)?;
            sql.push_str(if op.op == FilterOp::Between {
                " BETWEEN "
            } else {
                " NOT BETWEEN "
            });
            render_operand(graph, lo, sql, params)?;
            sql.push_str(" AND ");
            render_operand(graph, hi, sql, params)?;
            Ok(())
        }
        FilterOp::IsNull | FilterOp::IsNotNull => {
            render_operand(graph, &op.left, sql, params)?;
            sql.push_str(if op.op == FilterOp::IsNull {
                " IS NULL"
            } else {
                " IS NOT NULL"
            });
            Ok(())
        }
        binary => {
            let Some(right) = op.operands.first() else {
                return Err(TrellisError::Plan(format!(
                    "{binary:?} filter is missing its operand"
                )));
            };
            render_operand(graph, &op.left, sql, params)?;
            sql.push_str(match binary {
                FilterOp::Eq => " = ",
                FilterOp::Neq => " <> ",
                FilterOp::Gt => " > ",
                FilterOp::Gte => " >= ",
                FilterOp::Lt => " < ",
                FilterOp::Lte => " <= ",
                FilterOp::Like => " LIKE ",
                FilterOp::NotLike => " NOT LIKE ",
                other => {
                    return Err(TrellisError::Plan(format!(
                        "unexpected operator {other:?}"
                    )));
                }
            });
            render_operand(graph, right, sql, params)?;
            Ok(())
        }
    }
}

fn render_operand(
    graph: &QueryGraph,
    operand: &Operand,
    sql: &mut String,
    params: &mut Vec<Value>,
) -> Result<()> {
    match operand {
        Operand::Field(field) => {
            write_qualified_field(graph, *field, sql);
        }
        Operand::Value(value) => {
            sql.push('?');
            params.push(value.clone());
        }
        // opaque pre-escaped passthrough
        Operand::Raw(text) => sql.push_str(text),
    }
    Ok(())
}

/// A correlated existence subquery against the relation's own table and
/// junction hops; the outer statement's aliases stay in scope.
fn render_exists(
    graph: &QueryGraph,
    exists: &ExistsFilter,
    sql: &mut String,
    params: &mut Vec<Value>,
) -> Result<()> {
    let on = graph.join_on(exists.node).ok_or_else(|| {
        TrellisError::Plan("existence filter against a node with no join predicate".to_string())
    })?;

    if exists.negated {
        sql.push_str("NOT ");
    }
    sql.push_str("EXISTS (SELECT 1 FROM ");
    write_table(graph, exists.node, sql);
    for through in graph.join_through(exists.node) {
        sql.push_str(" LEFT JOIN ");
        write_table(graph, through.node, sql);
        sql.push_str(" ON ");
        render_filter(graph, &through.on, sql, params)?;
    }
    sql.push_str(" WHERE ");
    render_filter(graph, on, sql, params)?;
    if let Some(sub) = &exists.filter {
        sql.push_str(" AND ");
        render_filter(graph, sub, sql, params)?;
    }
    sql.push(')');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trellis_core::schema::SchemaRegistry;
    use trellis_core::{JoinClause, Sort, filter};

    fn registry() -> Arc<SchemaRegistry> {
        SchemaRegistry::builder()
            .table("states", |t| {
                t.integer("id").primary();
                t.integer("country_id");
                t.text("name");
                t.has_one("country", "countries")
                    .on(|j| Ok(j.source("country_id")?.eq(j.target("id")?)));
                t.has_many("cities", "cities")
                    .on(|j| Ok(j.target("state_id")?.eq(j.source("id")?)));
            })
            .table("countries", |t| {
                t.integer("id").primary();
                t.text("name");
            })
            .table("cities", |t| {
                t.integer("id").primary();
                t.integer("state_id");
                t.text("name");
            })
            .build()
            .unwrap()
    }

    #[test]
    fn renders_select_with_join_where_order_and_pagination() {
        let mut graph = QueryGraph::new(registry(), "states").unwrap();
        let root = graph.root();
        let country = graph.join(root, "country").unwrap();

        let statement = SelectStatement {
            graph: &graph,
            node: root,
            columns: vec![
                graph.field(root, "id").unwrap(),
                graph.field(country, "name").unwrap(),
            ],
            joins: vec![JoinClause {
                node: country,
                on: graph.join_on(country).unwrap().clone(),
            }],
            filter: Some(graph.field(root, "name").unwrap().like("%a%")),
            sorts: vec![Sort::desc(graph.field(root, "id").unwrap())],
            offset: 10,
            limit: Some(5),
        };

        let rendered = render_select(&statement, false).unwrap();
        assert_eq!(
            rendered.sql,
            "SELECT \"root\".\"id\" AS \"id\", \"country\".\"name\" AS \"country.name\" \
             FROM \"states\" AS \"root\" \
             LEFT JOIN \"countries\" AS \"country\" ON \"root\".\"country_id\" = \"country\".\"id\" \
             WHERE \"root\".\"name\" LIKE ? \
             ORDER BY \"root\".\"id\" DESC LIMIT 5 OFFSET 10"
        );
        assert_eq!(rendered.params, vec![Value::from("%a%")]);
    }

    #[test]
    fn empty_selection_gets_a_placeholder_column() {
        let graph = QueryGraph::new(registry(), "states").unwrap();
        let statement = SelectStatement {
            graph: &graph,
            node: graph.root(),
            columns: vec![],
            joins: vec![],
            filter: None,
            sorts: vec![],
            offset: 0,
            limit: None,
        };
        let rendered = render_select(&statement, false).unwrap();
        assert_eq!(rendered.sql, "SELECT 1 AS \"__\" FROM \"states\" AS \"root\"");
    }

    #[test]
    fn count_mode_ignores_selection_and_pagination() {
        let graph = QueryGraph::new(registry(), "states").unwrap();
        let root = graph.root();
        let statement = SelectStatement {
            graph: &graph,
            node: root,
            columns: vec![graph.field(root, "id").unwrap()],
            joins: vec![],
            filter: None,
            sorts: vec![],
            offset: 5,
            limit: Some(10),
        };
        let rendered = render_select(&statement, true).unwrap();
        assert_eq!(
            rendered.sql,
            "SELECT COUNT(*) AS \"__count\" FROM \"states\" AS \"root\""
        );
    }

    #[test]
    fn empty_membership_lists_become_constants() {
        let graph = QueryGraph::new(registry(), "states").unwrap();
        let root = graph.root();
        let id = graph.field(root, "id").unwrap();

        let mut sql = String::new();
        let mut params = Vec::new();
        render_filter(
            &graph,
            &id.in_list(Vec::<i64>::new()),
            &mut sql,
            &mut params,
        )
        .unwrap();
        assert_eq!(sql, "1 = 0");

        sql.clear();
        render_filter(
            &graph,
            &id.not_in_list(Vec::<i64>::new()),
            &mut sql,
            &mut params,
        )
        .unwrap();
        assert_eq!(sql, "1 = 1");
        assert!(params.is_empty());
    }

    #[test]
    fn renders_exists_subquery() {
        let mut graph = QueryGraph::new(registry(), "states").unwrap();
        let root = graph.root();
        let cities = graph.join(root, "cities").unwrap();
        let name = graph.field(cities, "name").unwrap();

        let mut sql = String::new();
        let mut params = Vec::new();
        render_filter(
            &graph,
            &filter::exists_where(cities, name.like("%a%")),
            &mut sql,
            &mut params,
        )
        .unwrap();

        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM \"cities\" \
             WHERE \"cities\".\"state_id\" = \"root\".\"id\" \
             AND \"cities\".\"name\" LIKE ?)"
        );
        assert_eq!(params, vec![Value::from("%a%")]);
    }

    #[test]
    fn renders_update_and_delete_with_aliases() {
        let graph = QueryGraph::new(registry(), "states").unwrap();
        let root = graph.root();
        let id = graph.field(root, "id").unwrap();

        let update = UpdateStatement {
            graph: &graph,
            node: root,
            assignments: vec![("name".to_string(), Value::from("Kansas"))],
            filter: id.in_list([1, 2]),
        };
        let rendered = render_update(&update).unwrap();
        assert_eq!(
            rendered.sql,
            "UPDATE \"states\" AS \"root\" SET \"name\" = ? WHERE \"root\".\"id\" IN (?, ?)"
        );
        assert_eq!(
            rendered.params,
            vec![Value::from("Kansas"), Value::Integer(1), Value::Integer(2)]
        );

        let delete = DeleteStatement {
            graph: &graph,
            node: root,
            filter: id.eq(7),
        };
        let rendered = render_delete(&delete).unwrap();
        assert_eq!(
            rendered.sql,
            "DELETE FROM \"states\" AS \"root\" WHERE \"root\".\"id\" = ?"
        );
    }

    #[test]
    fn renders_multi_row_insert() {
        let statement = InsertStatement {
            table: "states".to_string(),
            columns: vec!["name".to_string(), "country_id".to_string()],
            rows: vec![
                vec![Value::from("Kansas"), Value::Integer(1)],
                vec![Value::from("Ohio"), Value::Integer(1)],
            ],
        };
        let rendered = render_insert(&statement).unwrap();
        assert_eq!(
            rendered.sql,
            "INSERT INTO \"states\" (\"name\", \"country_id\") VALUES (?, ?), (?, ?)"
        );
        assert_eq!(rendered.params.len(), 4);
    }
}
