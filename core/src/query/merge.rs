//! Attaches child partition rows to their parent rows.
//!
//! Attachment re-evaluates the original, un-hydrated join predicate against
//! each (parent row, child row) pair rather than trusting the hydrated SQL
//! filter, so the merge stays exact even where hydration took a documented
//! shortcut. Operator semantics follow SQL: NULL fails every comparison,
//! LIKE wildcards match case-insensitively, BETWEEN is inclusive.

use std::cmp::Ordering;

use regex::Regex;

use crate::error::{Result, TrellisError};
use crate::filter::{Filter, FilterOp, Grouping, Operand};
use crate::graph::{FieldId, NodeId, QueryGraph};
use crate::row::FlatRow;
use crate::value::Value;

/// One executed child partition waiting to be merged.
pub(crate) struct JoinResultContainer {
    pub rows: Vec<FlatRow>,
    pub node: NodeId,
    /// The original (un-hydrated) join predicate.
    pub on: Filter,
}

/// Attaches each container's matching rows at the child node's logical path
/// on every base row, preserving input order. Lists may be empty.
pub(crate) fn merge_result_sets(
    graph: &QueryGraph,
    base_rows: &mut [FlatRow],
    containers: Vec<JoinResultContainer>,
) -> Result<()> {
    for container in containers {
        let path = graph.node_path(container.node).join(".");
        for base in base_rows.iter_mut() {
            let mut matches = Vec::new();
            for row in &container.rows {
                if test_filter(graph, &container.on, container.node, base, row)? {
                    matches.push(row.rooted_at(&path));
                }
            }
            base.children.push((path.clone(), matches));
        }
    }
    Ok(())
}

/// Evaluates a filter against a literal (base row, join row) pair, resolving
/// each field from whichever row's partition owns it.
pub(crate) fn test_filter(
    graph: &QueryGraph,
    filter: &Filter,
    join_node: NodeId,
    base: &FlatRow,
    join: &FlatRow,
) -> Result<bool> {
    match filter {
        Filter::Group(group) => match group.grouping {
            Grouping::And => {
                for child in &group.children {
                    if !test_filter(graph, child, join_node, base, join)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Grouping::Or => {
                for child in &group.children {
                    if test_filter(graph, child, join_node, base, join)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        },
        Filter::Op(op) => {
            let left = resolve_operand(graph, &op.left, join_node, base, join)?;
            let operands = op
                .operands
                .iter()
                .map(|operand| resolve_operand(graph, operand, join_node, base, join))
                .collect::<Result<Vec<_>>>()?;
            evaluate(op.op, &left, &operands)
        }
        Filter::Exists(_) => Err(TrellisError::UnsupportedHydration(
            "existence filter cannot be evaluated against a row pair".to_string(),
        )),
    }
}

fn resolve_operand(
    graph: &QueryGraph,
    operand: &Operand,
    join_node: NodeId,
    base: &FlatRow,
    join: &FlatRow,
) -> Result<Value> {
    match operand {
        Operand::Field(field) => Ok(field_value(graph, *field, join_node, base, join)),
        Operand::Value(value) => Ok(value.clone()),
        Operand::Raw(_) => Err(TrellisError::UnsupportedHydration(
            "opaque SQL expression cannot be evaluated against a row pair".to_string(),
        )),
    }
}

fn field_value(
    graph: &QueryGraph,
    field: FieldId,
    join_node: NodeId,
    base: &FlatRow,
    join: &FlatRow,
) -> Value {
    let alias = graph.column_alias(field);
    if graph.field_base(field) == join_node {
        join.value(&alias)
    } else {
        base.value(&alias)
    }
}

fn evaluate(op: FilterOp, left: &Value, operands: &[Value]) -> Result<bool> {
    let first = operands.first();
    Ok(match op {
        FilterOp::Eq => first.is_some_and(|v| left.sql_eq(v)),
        FilterOp::Neq => first.is_some_and(|v| {
            !left.is_null() && !v.is_null() && !left.sql_eq(v)
        }),
        FilterOp::Gt => cmp_is(left, first, &[Ordering::Greater]),
        FilterOp::Gte => cmp_is(left, first, &[Ordering::Greater, Ordering::Equal]),
        FilterOp::Lt => cmp_is(left, first, &[Ordering::Less]),
        FilterOp::Lte => cmp_is(left, first, &[Ordering::Less, Ordering::Equal]),
        FilterOp::Like => like_eval(left, first)?.unwrap_or(false),
        FilterOp::NotLike => like_eval(left, first)?.map(|m| !m).unwrap_or(false),
        FilterOp::Between => {
            cmp_is(left, operands.first(), &[Ordering::Greater, Ordering::Equal])
                && cmp_is(left, operands.get(1), &[Ordering::Less, Ordering::Equal])
        }
        FilterOp::NotBetween => {
            cmp_is(left, operands.first(), &[Ordering::Less])
                || cmp_is(left, operands.get(1), &[Ordering::Greater])
        }
        FilterOp::In => operands.iter().any(|v| left.sql_eq(v)),
        FilterOp::NotIn => {
            !left.is_null()
                && !operands.iter().any(Value::is_null)
                && !operands.iter().any(|v| left.sql_eq(v))
        }
        FilterOp::IsNull => left.is_null(),
        FilterOp::IsNotNull => !left.is_null(),
    })
}

fn cmp_is(left: &Value, right: Option<&Value>, accepted: &[Ordering]) -> bool {
    right
        .and_then(|r| left.sql_cmp(r))
        .is_some_and(|ordering| accepted.contains(&ordering))
}

/// `None` when either side is NULL or non-text, mirroring SQL's LIKE.
fn like_eval(left: &Value, pattern: Option<&Value>) -> Result<Option<bool>> {
    let (Value::Text(value), Some(Value::Text(pattern))) = (left, pattern) else {
        return Ok(None);
    };
    Ok(Some(like_matches(value, pattern)?))
}

/// Translates `%`/`_` wildcards into an anchored, case-insensitive regex,
/// the same match SQLite's LIKE performs on ASCII text.
pub(crate) fn like_matches(value: &str, pattern: &str) -> Result<bool> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => {
                let mut buf = [0u8; 4];
                source.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }
    source.push('$');

    let regex = Regex::new(&source)
        .map_err(|err| TrellisError::Mapping(format!("invalid LIKE pattern {pattern:?}: {err}")))?;
    Ok(regex.is_match(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::QueryGraph;
    use crate::schema::SchemaRegistry;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn registry() -> Arc<SchemaRegistry> {
        SchemaRegistry::builder()
            .table("states", |t| {
                t.integer("id").primary();
                t.text("name");
                t.has_many("cities", "cities")
                    .on(|j| Ok(j.target("state_id")?.eq(j.source("id")?)));
            })
            .table("cities", |t| {
                t.integer("id").primary();
                t.integer("state_id");
                t.text("name");
            })
            .build()
            .unwrap()
    }

    fn row(pairs: &[(&str, Value)]) -> FlatRow {
        FlatRow::from_values(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn like_wildcards() {
        assert!(like_matches("Kansas", "%a%").unwrap());
        assert!(like_matches("Kansas", "K_ns%").unwrap());
        assert!(like_matches("Kansas", "kansas").unwrap());
        assert!(!like_matches("Kansas", "K_nsas_").unwrap());
        assert!(!like_matches("Kansas", "Kansa").unwrap());
    }

    #[test]
    fn operator_semantics() {
        let one = Value::Integer(1);
        let two = Value::Integer(2);
        let null = Value::Null;

        assert!(evaluate(FilterOp::Eq, &one, &[one.clone()]).unwrap());
        assert!(!evaluate(FilterOp::Eq, &null, &[null.clone()]).unwrap());
        assert!(evaluate(FilterOp::Neq, &one, &[two.clone()]).unwrap());
        assert!(!evaluate(FilterOp::Neq, &null, &[two.clone()]).unwrap());

        assert!(evaluate(FilterOp::Between, &one, &[one.clone(), two.clone()]).unwrap());
        assert!(evaluate(FilterOp::Between, &two, &[one.clone(), two.clone()]).unwrap());
        assert!(!evaluate(FilterOp::NotBetween, &one, &[one.clone(), two.clone()]).unwrap());
        assert!(
            evaluate(FilterOp::NotBetween, &Value::Integer(3), &[one.clone(), two.clone()])
                .unwrap()
        );

        assert!(evaluate(FilterOp::In, &one, &[two.clone(), one.clone()]).unwrap());
        assert!(evaluate(FilterOp::NotIn, &one, &[two.clone()]).unwrap());
        assert!(!evaluate(FilterOp::NotIn, &one, &[two.clone(), null.clone()]).unwrap());
        assert!(evaluate(FilterOp::IsNull, &null, &[]).unwrap());
    }

    #[test]
    fn merge_attaches_matching_children_in_order() {
        let mut graph = QueryGraph::new(registry(), "states").unwrap();
        let root = graph.root();
        let cities = graph.join(root, "cities").unwrap();
        let on = graph.join_on(cities).unwrap().clone();

        let mut states = vec![
            row(&[("id", Value::Integer(1)), ("name", Value::from("Kansas"))]),
            row(&[("id", Value::Integer(2)), ("name", Value::from("Ohio"))]),
        ];
        let city_rows = vec![
            row(&[
                ("cities.id", Value::Integer(10)),
                ("cities.state_id", Value::Integer(1)),
                ("cities.name", Value::from("Topeka")),
            ]),
            row(&[
                ("cities.id", Value::Integer(11)),
                ("cities.state_id", Value::Integer(2)),
                ("cities.name", Value::from("Akron")),
            ]),
            row(&[
                ("cities.id", Value::Integer(12)),
                ("cities.state_id", Value::Integer(1)),
                ("cities.name", Value::from("Wichita")),
            ]),
        ];

        merge_result_sets(
            &graph,
            &mut states,
            vec![JoinResultContainer {
                rows: city_rows,
                node: cities,
                on,
            }],
        )
        .unwrap();

        let (path, kansas_cities) = &states[0].children[0];
        assert_eq!(path, "cities");
        assert_eq!(kansas_cities.len(), 2);
        assert_eq!(kansas_cities[0].value("id"), Value::Integer(10));
        assert_eq!(kansas_cities[1].value("id"), Value::Integer(12));

        let (_, ohio_cities) = &states[1].children[0];
        assert_eq!(ohio_cities.len(), 1);
        assert_eq!(ohio_cities[0].value("name"), Value::from("Akron"));
    }

    #[test]
    fn unmatched_parents_get_empty_lists() {
        let mut graph = QueryGraph::new(registry(), "states").unwrap();
        let root = graph.root();
        let cities = graph.join(root, "cities").unwrap();
        let on = graph.join_on(cities).unwrap().clone();

        let mut states = vec![row(&[("id", Value::Integer(7))])];
        merge_result_sets(
            &graph,
            &mut states,
            vec![JoinResultContainer {
                rows: Vec::new(),
                node: cities,
                on,
            }],
        )
        .unwrap();

        assert_eq!(states[0].children[0].1.len(), 0);
    }
}
