//! Predicate AST for queries and join conditions.
//!
//! Filters are persistent values: combinators consume or clone their inputs
//! and return new filters, so any filter handed to the correlator stays valid
//! no matter what later combinator calls do elsewhere.

use smallvec::SmallVec;

use crate::graph::{FieldId, NodeId};
use crate::value::Value;

/// Leaf comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    NotLike,
    Between,
    NotBetween,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

/// Boolean grouping of child filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    And,
    Or,
}

/// One side of a leaf comparison: a graph field, a literal value, or an
/// opaque pre-escaped SQL expression passed through to the adapter verbatim.
#[derive(Debug, Clone)]
pub enum Operand {
    Field(FieldId),
    Value(Value),
    Raw(String),
}

impl Operand {
    pub fn raw(expr: impl Into<String>) -> Operand {
        Operand::Raw(expr.into())
    }

    pub fn as_field(&self) -> Option<FieldId> {
        match self {
            Operand::Field(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<FieldId> for Operand {
    fn from(field: FieldId) -> Self {
        Operand::Field(field)
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Value(value)
    }
}

macro_rules! operand_from_value {
    ($($ty:ty),+) => {
        $(impl From<$ty> for Operand {
            fn from(value: $ty) -> Self {
                Operand::Value(value.into())
            }
        })+
    };
}

operand_from_value!(i32, i64, f64, bool, &str, String);

/// A leaf operation over one field (or hydrated value) and its operands.
#[derive(Debug, Clone)]
pub struct OpFilter {
    pub op: FilterOp,
    pub left: Operand,
    pub operands: SmallVec<[Operand; 2]>,
}

/// AND/OR combination of child filters.
#[derive(Debug, Clone)]
pub struct FilterGroup {
    pub grouping: Grouping,
    pub children: Vec<Filter>,
}

/// Existence test against a to-many relation, with an optional sub-filter
/// evaluated inside the correlated subquery.
#[derive(Debug, Clone)]
pub struct ExistsFilter {
    pub negated: bool,
    pub node: NodeId,
    pub filter: Option<Box<Filter>>,
}

#[derive(Debug, Clone)]
pub enum Filter {
    Op(OpFilter),
    Group(FilterGroup),
    Exists(ExistsFilter),
}

impl Filter {
    /// The set of fields this filter transitively touches. May contain
    /// duplicates; consumers treat membership idempotently.
    pub fn fields(&self) -> Vec<FieldId> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut Vec<FieldId>) {
        match self {
            Filter::Op(op) => {
                if let Operand::Field(f) = &op.left {
                    out.push(*f);
                }
                for operand in &op.operands {
                    if let Operand::Field(f) = operand {
                        out.push(*f);
                    }
                }
            }
            Filter::Group(group) => {
                for child in &group.children {
                    child.collect_fields(out);
                }
            }
            Filter::Exists(exists) => {
                if let Some(filter) = &exists.filter {
                    filter.collect_fields(out);
                }
            }
        }
    }

    /// Combines with another filter under AND, flattening same-grouping
    /// groups instead of re-nesting.
    pub fn and(self, other: Filter) -> Filter {
        combine(Grouping::And, self, other)
    }

    /// Combines with another filter under OR, flattening same-grouping
    /// groups instead of re-nesting.
    pub fn or(self, other: Filter) -> Filter {
        combine(Grouping::Or, self, other)
    }
}

fn combine(grouping: Grouping, left: Filter, right: Filter) -> Filter {
    let mut children = Vec::new();
    flatten_into(grouping, left, &mut children);
    flatten_into(grouping, right, &mut children);
    Filter::Group(FilterGroup { grouping, children })
}

fn flatten_into(grouping: Grouping, filter: Filter, out: &mut Vec<Filter>) {
    match filter {
        Filter::Group(group) if group.grouping == grouping => out.extend(group.children),
        other => out.push(other),
    }
}

fn leaf(op: FilterOp, left: impl Into<Operand>, operands: SmallVec<[Operand; 2]>) -> Filter {
    Filter::Op(OpFilter {
        op,
        left: left.into(),
        operands,
    })
}

macro_rules! binary_filter {
    ($($(#[$doc:meta])* $name:ident => $op:ident),+ $(,)?) => {
        $($(#[$doc])*
        pub fn $name(field: FieldId, value: impl Into<Operand>) -> Filter {
            leaf(FilterOp::$op, field, smallvec::smallvec![value.into()])
        })+
    };
}

binary_filter! {
    /// `field = value`
    eq => Eq,
    /// `field <> value`
    neq => Neq,
    /// `field > value`
    gt => Gt,
    /// `field >= value`
    gte => Gte,
    /// `field < value`
    lt => Lt,
    /// `field <= value`
    lte => Lte,
    /// `field LIKE pattern` (`%`/`_` wildcards)
    like => Like,
    /// `field NOT LIKE pattern`
    not_like => NotLike,
}

/// `field BETWEEN lo AND hi` (inclusive on both ends)
pub fn between(field: FieldId, lo: impl Into<Operand>, hi: impl Into<Operand>) -> Filter {
    leaf(
        FilterOp::Between,
        field,
        smallvec::smallvec![lo.into(), hi.into()],
    )
}

/// `field NOT BETWEEN lo AND hi`
pub fn not_between(field: FieldId, lo: impl Into<Operand>, hi: impl Into<Operand>) -> Filter {
    leaf(
        FilterOp::NotBetween,
        field,
        smallvec::smallvec![lo.into(), hi.into()],
    )
}

/// `field IN (values...)`. An empty list matches no row; the adapter emits a
/// constant-false fragment rather than invalid SQL.
pub fn in_list<I>(field: FieldId, values: I) -> Filter
where
    I: IntoIterator,
    I::Item: Into<Operand>,
{
    leaf(
        FilterOp::In,
        field,
        values.into_iter().map(Into::into).collect(),
    )
}

/// `field NOT IN (values...)`. An empty list matches every row.
pub fn not_in_list<I>(field: FieldId, values: I) -> Filter
where
    I: IntoIterator,
    I::Item: Into<Operand>,
{
    leaf(
        FilterOp::NotIn,
        field,
        values.into_iter().map(Into::into).collect(),
    )
}

/// `field IS NULL`
pub fn is_null(field: FieldId) -> Filter {
    leaf(FilterOp::IsNull, field, SmallVec::new())
}

/// `field IS NOT NULL`
pub fn is_not_null(field: FieldId) -> Filter {
    leaf(FilterOp::IsNotNull, field, SmallVec::new())
}

/// `EXISTS (...)` over a to-many relation node.
pub fn exists(node: NodeId) -> Filter {
    Filter::Exists(ExistsFilter {
        negated: false,
        node,
        filter: None,
    })
}

/// `EXISTS (...)` with an extra predicate inside the subquery.
pub fn exists_where(node: NodeId, filter: Filter) -> Filter {
    Filter::Exists(ExistsFilter {
        negated: false,
        node,
        filter: Some(Box::new(filter)),
    })
}

/// `NOT EXISTS (...)` over a to-many relation node.
pub fn not_exists(node: NodeId) -> Filter {
    Filter::Exists(ExistsFilter {
        negated: true,
        node,
        filter: None,
    })
}

/// `NOT EXISTS (...)` with an extra predicate inside the subquery.
pub fn not_exists_where(node: NodeId, filter: Filter) -> Filter {
    Filter::Exists(ExistsFilter {
        negated: true,
        node,
        filter: Some(Box::new(filter)),
    })
}

/// ANDs a non-empty list of filters together, flattening nested ANDs.
pub fn and(filters: impl IntoIterator<Item = Filter>) -> Filter {
    group(Grouping::And, filters)
}

/// ORs a non-empty list of filters together, flattening nested ORs.
pub fn or(filters: impl IntoIterator<Item = Filter>) -> Filter {
    group(Grouping::Or, filters)
}

fn group(grouping: Grouping, filters: impl IntoIterator<Item = Filter>) -> Filter {
    let mut children = Vec::new();
    for filter in filters {
        flatten_into(grouping, filter, &mut children);
    }
    Filter::Group(FilterGroup { grouping, children })
}

// Combinator methods on field handles, so join predicate builders read the
// same way queries do: `j.target("country_id")?.eq(j.source("id")?)`.
impl FieldId {
    pub fn eq(self, value: impl Into<Operand>) -> Filter {
        eq(self, value)
    }
    pub fn neq(self, value: impl Into<Operand>) -> Filter {
        neq(self, value)
    }
    pub fn gt(self, value: impl Into<Operand>) -> Filter {
        gt(self, value)
    }
    pub fn gte(self, value: impl Into<Operand>) -> Filter {
        gte(self, value)
    }
    pub fn lt(self, value: impl Into<Operand>) -> Filter {
        lt(self, value)
    }
    pub fn lte(self, value: impl Into<Operand>) -> Filter {
        lte(self, value)
    }
    pub fn like(self, pattern: impl Into<Operand>) -> Filter {
        like(self, pattern)
    }
    pub fn not_like(self, pattern: impl Into<Operand>) -> Filter {
        not_like(self, pattern)
    }
    pub fn between(self, lo: impl Into<Operand>, hi: impl Into<Operand>) -> Filter {
        between(self, lo, hi)
    }
    pub fn not_between(self, lo: impl Into<Operand>, hi: impl Into<Operand>) -> Filter {
        not_between(self, lo, hi)
    }
    pub fn in_list<I>(self, values: I) -> Filter
    where
        I: IntoIterator,
        I::Item: Into<Operand>,
    {
        in_list(self, values)
    }
    pub fn not_in_list<I>(self, values: I) -> Filter
    where
        I: IntoIterator,
        I::Item: Into<Operand>,
    {
        not_in_list(self, values)
    }
    pub fn is_null(self) -> Filter {
        is_null(self)
    }
    pub fn is_not_null(self) -> Filter {
        is_not_null(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FieldId;

    fn f(i: usize) -> FieldId {
        FieldId(i)
    }

    #[test]
    fn and_flattens_same_grouping() {
        let combined = f(0).eq(1).and(f(1).eq(2)).and(f(2).eq(3));
        match combined {
            Filter::Group(group) => {
                assert_eq!(group.grouping, Grouping::And);
                assert_eq!(group.children.len(), 3);
                assert!(
                    group
                        .children
                        .iter()
                        .all(|c| matches!(c, Filter::Op(op) if op.op == FilterOp::Eq))
                );
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn or_does_not_flatten_into_and() {
        let combined = f(0).eq(1).or(f(1).eq(2)).and(f(2).eq(3));
        match combined {
            Filter::Group(group) => {
                assert_eq!(group.grouping, Grouping::And);
                assert_eq!(group.children.len(), 2);
                assert!(matches!(&group.children[0], Filter::Group(inner) if inner.grouping == Grouping::Or));
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn fields_is_transitive_union() {
        let filter = f(0).eq(f(1)).and(or([f(2).is_null(), f(3).in_list([1, 2])]));
        let mut fields = filter.fields();
        fields.sort();
        assert_eq!(fields, vec![f(0), f(1), f(2), f(3)]);
    }

    #[test]
    fn combinators_leave_originals_valid() {
        let base = f(0).eq(1);
        let combined = base.clone().and(f(1).eq(2));
        // the original leaf is unchanged by the combination
        assert!(matches!(base, Filter::Op(_)));
        assert!(matches!(combined, Filter::Group(_)));
    }

    #[test]
    fn empty_in_list_is_representable() {
        let filter = f(0).in_list(Vec::<i64>::new());
        match filter {
            Filter::Op(op) => {
                assert_eq!(op.op, FilterOp::In);
                assert!(op.operands.is_empty());
            }
            other => panic!("expected op, got {other:?}"),
        }
    }
}
