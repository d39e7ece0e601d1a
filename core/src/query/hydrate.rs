//! Cross-partition filter rewriting.
//!
//! The storage engine cannot express `WHERE child.x = parent.y` across two
//! separately executed statements. Before a child partition runs, every leaf
//! field owned by the already-executed partition is replaced by the literal
//! set of that column's fetched values, leaving a filter expressible against
//! the child partition alone.

use smallvec::smallvec;

use crate::error::{Result, TrellisError};
use crate::filter::{Filter, FilterGroup, FilterOp, Grouping, OpFilter, Operand};
use crate::graph::{NodeId, QueryGraph};
use crate::row::FlatRow;
use crate::value::Value;

/// Outcome of hydrating a filter: a rewritten filter, or a statically known
/// constant that lets the caller skip work entirely.
#[derive(Debug)]
pub(crate) enum Hydrated {
    Filter(Filter),
    /// Every row passes; the branch imposes no constraint.
    Pass,
    /// No row can pass; the branch (and any AND around it) is dead.
    Fail,
}

pub(crate) fn hydrate_filter(
    graph: &QueryGraph,
    filter: &Filter,
    source: NodeId,
    rows: &[FlatRow],
) -> Result<Hydrated> {
    let needs_hydration = filter
        .fields()
        .iter()
        .any(|field| graph.field_base(*field) == source);
    if !needs_hydration {
        return Ok(Hydrated::Filter(filter.clone()));
    }

    match filter {
        Filter::Group(group) => hydrate_group(graph, group, source, rows),
        Filter::Op(op) => hydrate_op(graph, op, source, rows),
        Filter::Exists(_) => Err(TrellisError::UnsupportedHydration(
            "existence filter crosses a partition boundary".to_string(),
        )),
    }
}

fn hydrate_group(
    graph: &QueryGraph,
    group: &FilterGroup,
    source: NodeId,
    rows: &[FlatRow],
) -> Result<Hydrated> {
    let mut children = Vec::with_capacity(group.children.len());
    for child in &group.children {
        match hydrate_filter(graph, child, source, rows)? {
            // constant children either decide the whole group or drop out
            Hydrated::Pass => match group.grouping {
                Grouping::Or => return Ok(Hydrated::Pass),
                Grouping::And => {}
            },
            Hydrated::Fail => match group.grouping {
                Grouping::And => return Ok(Hydrated::Fail),
                Grouping::Or => {}
            },
            Hydrated::Filter(filter) => children.push(filter),
        }
    }

    if children.is_empty() {
        return Ok(match group.grouping {
            Grouping::And => Hydrated::Pass,
            Grouping::Or => Hydrated::Fail,
        });
    }
    Ok(Hydrated::Filter(Filter::Group(FilterGroup {
        grouping: group.grouping,
        children,
    })))
}

/// One side of a leaf after hydration: still an operand, or the literal
/// value set drawn from the source rows.
enum Side {
    Operand(Operand),
    Values(Vec<Value>),
}

fn hydrate_side(graph: &QueryGraph, operand: &Operand, source: NodeId, rows: &[FlatRow]) -> Side {
    if let Operand::Field(field) = operand {
        if graph.field_base(*field) == source {
            let alias = graph.column_alias(*field);
            return Side::Values(rows.iter().map(|row| row.value(&alias)).collect());
        }
    }
    Side::Operand(operand.clone())
}

fn hydrate_op(
    graph: &QueryGraph,
    op: &OpFilter,
    source: NodeId,
    rows: &[FlatRow],
) -> Result<Hydrated> {
    let left = hydrate_side(graph, &op.left, source, rows);

    match op.op {
        FilterOp::Eq | FilterOp::Neq => {
            let right = hydrate_side(graph, single_operand(op)?, source, rows);
            Ok(Hydrated::Filter(hydrate_equality(
                op.op == FilterOp::Eq,
                left,
                right,
            )))
        }
        FilterOp::Gt
        | FilterOp::Gte
        | FilterOp::Lt
        | FilterOp::Lte
        | FilterOp::Like
        | FilterOp::NotLike => {
            let right = hydrate_side(graph, single_operand(op)?, source, rows);
            Ok(Hydrated::Filter(hydrate_comparison(op.op, left, right)))
        }
        FilterOp::Between | FilterOp::NotBetween | FilterOp::In | FilterOp::NotIn => {
            Err(TrellisError::UnsupportedHydration(format!(
                "{:?} cannot be rewritten across a partition boundary",
                op.op
            )))
        }
        FilterOp::IsNull => match left {
            Side::Values(values) => Ok(constant(values.iter().any(Value::is_null))),
            Side::Operand(_) => Ok(Hydrated::Filter(Filter::Op(op.clone()))),
        },
        FilterOp::IsNotNull => match left {
            Side::Values(values) => Ok(constant(values.iter().any(|v| !v.is_null()))),
            Side::Operand(_) => Ok(Hydrated::Filter(Filter::Op(op.clone()))),
        },
    }
}

fn constant(pass: bool) -> Hydrated {
    if pass { Hydrated::Pass } else { Hydrated::Fail }
}

fn single_operand(op: &OpFilter) -> Result<&Operand> {
    op.operands.first().ok_or_else(|| {
        TrellisError::Plan(format!("{:?} filter is missing its operand", op.op))
    })
}

/// EQ/NEQ: with one side still a field this collapses to IN / NOT IN over the
/// hydrated value set. With both sides hydrated (a same-base comparison) no
/// IN can express the pairwise match, so it expands to OR over the Cartesian
/// product of the distinct value pairs. The NOT IN / pairwise NEQ forms do
/// not preserve per-pair semantics; the merge step re-evaluates the original
/// predicate, which keeps attachment exact.
fn hydrate_equality(positive: bool, left: Side, right: Side) -> Filter {
    let (set_op, pair_op) = if positive {
        (FilterOp::In, FilterOp::Eq)
    } else {
        (FilterOp::NotIn, FilterOp::Neq)
    };

    if let Side::Operand(Operand::Field(field)) = left {
        return Filter::Op(OpFilter {
            op: set_op,
            left: Operand::Field(field),
            operands: side_items(right).into(),
        });
    }
    if let Side::Operand(Operand::Field(field)) = right {
        return Filter::Op(OpFilter {
            op: set_op,
            left: Operand::Field(field),
            operands: side_items(left).into(),
        });
    }

    cross_product(pair_op, left, right)
}

/// Ordering and pattern comparisons always expand to OR over the Cartesian
/// product of distinct pairs, putting whichever side is still a field on the
/// left of the emitted leaf and reversing the operator when the sides swap.
fn hydrate_comparison(op: FilterOp, left: Side, right: Side) -> Filter {
    cross_product(op, left, right)
}

fn cross_product(op: FilterOp, left: Side, right: Side) -> Filter {
    let lefts = side_items(left);
    let rights = side_items(right);

    let mut children = Vec::with_capacity(lefts.len() * rights.len());
    for l in &lefts {
        for r in &rights {
            children.push(comparison_pair(op, l.clone(), r.clone()));
        }
    }
    Filter::Group(FilterGroup {
        grouping: Grouping::Or,
        children,
    })
}

fn comparison_pair(op: FilterOp, left: Operand, right: Operand) -> Filter {
    if let Operand::Field(field) = right {
        let reversed = match op {
            FilterOp::Gt => FilterOp::Lte,
            FilterOp::Gte => FilterOp::Lt,
            FilterOp::Lt => FilterOp::Gte,
            FilterOp::Lte => FilterOp::Gt,
            other => other,
        };
        return Filter::Op(OpFilter {
            op: reversed,
            left: Operand::Field(field),
            operands: smallvec![left],
        });
    }
    Filter::Op(OpFilter {
        op,
        left,
        operands: smallvec![right],
    })
}

/// Flattens a side into operands, deduplicating hydrated values to bound the
/// cross-product size.
fn side_items(side: Side) -> Vec<Operand> {
    match side {
        Side::Operand(operand) => vec![operand],
        Side::Values(values) => distinct(values).into_iter().map(Operand::Value).collect(),
    }
}

fn distinct(values: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}
