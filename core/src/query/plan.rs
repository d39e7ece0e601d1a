//! Query partitioning and depth-first execution.
//!
//! A find query is split into partitions — one SQL round trip each — by the
//! `base` of every node it touches. Same-base nodes ride along as LEFT JOINs;
//! to-many nodes become child partitions whose filters are hydrated from the
//! parent's fetched rows. A parent partition with zero rows skips all of its
//! descendants: no correlation values exist, and no round trip is issued.

use std::collections::HashMap;
use std::pin::Pin;

use futures_util::future::try_join_all;
use tracing::debug;

use crate::error::{Result, TrellisError};
use crate::executor::{JoinClause, SelectStatement, SqlExecutor};
use crate::filter::{Filter, Grouping};
use crate::graph::{FieldId, NodeId, QueryGraph};
use crate::row::FlatRow;

use super::hydrate::{Hydrated, hydrate_filter};
use super::merge::{JoinResultContainer, merge_result_sets};
use super::unflatten::unflatten;
use super::{FindQuery, FindResult, Selection};

/// One SQL statement's worth of work.
struct Partition {
    /// The base node; the statement's FROM table.
    node: NodeId,
    fields: Vec<FieldId>,
    /// Same-base nodes joined into this statement (to-one and through).
    join_nodes: Vec<NodeId>,
    /// Filter fragment whose fields all resolve to this base.
    filter: Option<Filter>,
    /// Fragments that also reference the parent partition; hydrated against
    /// the parent's rows right before this partition executes.
    correlated: Vec<Filter>,
    children: Vec<usize>,
}

struct ExecutionPlan {
    partitions: Vec<Partition>,
    root: usize,
}

/// Executes a find query from a root node: partitions the graph, runs the
/// partition tree depth-first, and reassembles nested result objects (or a
/// scalar count in count mode).
pub async fn execute_find<E: SqlExecutor>(
    graph: &QueryGraph,
    root: NodeId,
    query: &FindQuery,
    executor: &E,
) -> Result<FindResult> {
    if !graph.is_root(root) {
        return Err(TrellisError::Plan(format!(
            "cannot execute a find query from non-root node {}",
            graph.alias(root)
        )));
    }

    let plan = build_plan(graph, root, query)?;
    debug!(
        root = graph.table(root),
        partitions = plan.partitions.len(),
        count = query.count,
        "planned find query"
    );

    if query.count {
        let partition = &plan.partitions[plan.root];
        let statement = partition_statement(graph, partition, partition.filter.clone(), None);
        let count = executor.count(&statement).await?;
        return Ok(FindResult::Count(count));
    }

    let root_filter = plan.partitions[plan.root].filter.clone();
    let rows = execute_partition(graph, &plan, plan.root, root_filter, Some(query), executor).await?;
    let nested = rows
        .into_iter()
        .map(|row| unflatten(row.into_json()))
        .collect();
    Ok(FindResult::Rows(nested))
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

struct QueryData<'g, 'q> {
    graph: &'g QueryGraph,
    query: &'q FindQuery,
    root: NodeId,
    related: Vec<NodeId>,
    fields_map: HashMap<NodeId, Vec<FieldId>>,
    fragment_map: HashMap<NodeId, Filter>,
    correlated_map: HashMap<NodeId, Vec<Filter>>,
}

impl<'g, 'q> QueryData<'g, 'q> {
    fn collect(graph: &'g QueryGraph, root: NodeId, query: &'q FindQuery) -> Result<Self> {
        let mut data = QueryData {
            graph,
            query,
            root,
            related: Vec::new(),
            fields_map: HashMap::new(),
            fragment_map: HashMap::new(),
            correlated_map: HashMap::new(),
        };

        data.add_related(root)?;

        if let Some(filter) = &query.filter {
            data.add_filter(filter.clone())?;
        }

        if !query.count {
            if query.selections.is_empty() {
                for field in graph.default_fields(root).to_vec() {
                    data.add_field(field)?;
                }
            } else {
                for selection in &query.selections {
                    match selection {
                        Selection::Field(field) => data.add_field(*field)?,
                        Selection::Relation(node) => {
                            for field in graph.default_fields(*node).to_vec() {
                                data.add_field(field)?;
                            }
                        }
                    }
                }
            }

            for sort in &query.sorts {
                if graph.field_base(sort.field) != graph.base(root) {
                    return Err(TrellisError::Plan(
                        "sort fields must belong to the root partition".to_string(),
                    ));
                }
                data.add_related(graph.field_node(sort.field))?;
            }
        }

        Ok(data)
    }

    /// Marks a node (and its whole ancestor chain) as touched by the query,
    /// pulling in its authorization filter and, for to-many nodes, the
    /// correlation fields both sides of its ON predicate need.
    fn add_related(&mut self, node: NodeId) -> Result<()> {
        if self.related.contains(&node) {
            return Ok(());
        }
        let graph = self.graph;
        if let Some(parent) = graph.parent(node) {
            self.add_related(parent)?;
        }
        self.related.push(node);

        if let Some(auth) = &self.query.auth {
            if let Some(filter) = graph.auth_filter(node, auth)? {
                self.add_filter(filter)?;
            }
        }

        if !self.query.count {
            if let Some(many) = graph.many_join(node) {
                let required: Vec<FieldId> = many
                    .required_base_fields
                    .iter()
                    .chain(&many.required_join_fields)
                    .copied()
                    .collect();
                for field in required {
                    self.add_field(field)?;
                }
            }
        }
        Ok(())
    }

    fn add_field(&mut self, field: FieldId) -> Result<()> {
        let graph = self.graph;
        let base = graph.field_base(field);
        let fields = self.fields_map.entry(base).or_default();
        if fields.contains(&field) {
            return Ok(());
        }
        fields.push(field);
        self.add_related(graph.field_node(field))
    }

    /// Splits a filter into top-level conjuncts and assigns each to the
    /// partition that can express it.
    fn add_filter(&mut self, filter: Filter) -> Result<()> {
        match filter {
            Filter::Group(group) if group.grouping == Grouping::And => {
                for child in group.children {
                    self.add_conjunct(child)?;
                }
                Ok(())
            }
            other => self.add_conjunct(other),
        }
    }

    fn add_conjunct(&mut self, filter: Filter) -> Result<()> {
        let graph = self.graph;
        let mut bases = Vec::new();
        let mut touched = Vec::new();
        conjunct_bases(graph, &filter, &mut bases, &mut touched)?;
        for node in touched {
            self.add_related(node)?;
        }

        let target = match bases.len() {
            // no field references: constant-ish, keep it on the root
            0 => graph.base(self.root),
            1 => bases[0],
            _ => {
                // spans partitions: only a direct parent/child pair can be
                // correlated by hydration once the parent has executed
                let deepest = *bases
                    .iter()
                    .max_by_key(|base| graph.depth(**base))
                    .expect("non-empty base set");
                let parent_base = graph.parent(deepest).map(|p| graph.base(p));
                for base in &bases {
                    if *base != deepest && Some(*base) != parent_base {
                        return Err(TrellisError::UnsupportedHydration(
                            "filter spans partitions with no direct parent/child correlation"
                                .to_string(),
                        ));
                    }
                }
                self.correlated_map.entry(deepest).or_default().push(filter);
                return Ok(());
            }
        };

        let combined = match self.fragment_map.remove(&target) {
            Some(existing) => existing.and(filter),
            None => filter,
        };
        self.fragment_map.insert(target, combined);
        Ok(())
    }
}

/// The distinct partition bases a filter resolves to.
pub(crate) fn filter_bases(graph: &QueryGraph, filter: &Filter) -> Result<Vec<NodeId>> {
    let mut bases = Vec::new();
    let mut touched = Vec::new();
    conjunct_bases(graph, filter, &mut bases, &mut touched)?;
    Ok(bases)
}

/// Collects the distinct partition bases a filter touches and the nodes it
/// makes reachable. Existence tests count for the partition of the node that
/// declared them; their sub-filters evaluate inside the subquery and touch
/// nothing outside it.
fn conjunct_bases(
    graph: &QueryGraph,
    filter: &Filter,
    bases: &mut Vec<NodeId>,
    touched: &mut Vec<NodeId>,
) -> Result<()> {
    match filter {
        Filter::Op(_) => {
            for field in filter.fields() {
                let base = graph.field_base(field);
                if !bases.contains(&base) {
                    bases.push(base);
                }
                touched.push(graph.field_node(field));
            }
        }
        Filter::Group(group) => {
            for child in &group.children {
                conjunct_bases(graph, child, bases, touched)?;
            }
        }
        Filter::Exists(exists) => {
            let parent = graph.parent(exists.node).ok_or_else(|| {
                TrellisError::Plan("existence filter issued against a root node".to_string())
            })?;
            let base = graph.base(parent);
            if !bases.contains(&base) {
                bases.push(base);
            }
            touched.push(parent);
        }
    }
    Ok(())
}

fn build_plan(graph: &QueryGraph, root: NodeId, query: &FindQuery) -> Result<ExecutionPlan> {
    let QueryData {
        related,
        mut fields_map,
        mut fragment_map,
        mut correlated_map,
        ..
    } = QueryData::collect(graph, root, query)?;

    let root_base = graph.base(root);

    // Count mode never descends into child partitions: cardinality is the
    // number of distinct root rows, which to-many branches cannot change.
    if query.count {
        return Ok(ExecutionPlan {
            partitions: vec![Partition {
                node: root_base,
                fields: Vec::new(),
                join_nodes: same_base_join_nodes(graph, &related, root_base),
                filter: fragment_map.remove(&root_base),
                correlated: Vec::new(),
                children: Vec::new(),
            }],
            root: 0,
        });
    }

    let mut bases: Vec<NodeId> = Vec::new();
    for node in &related {
        let base = graph.base(*node);
        if !bases.contains(&base) {
            bases.push(base);
        }
    }

    let mut index_of = HashMap::new();
    let mut partitions = Vec::with_capacity(bases.len());
    for (index, base) in bases.iter().enumerate() {
        index_of.insert(*base, index);
        partitions.push(Partition {
            node: *base,
            fields: fields_map.remove(base).unwrap_or_default(),
            join_nodes: same_base_join_nodes(graph, &related, *base),
            filter: fragment_map.remove(base),
            correlated: correlated_map.remove(base).unwrap_or_default(),
            children: Vec::new(),
        });
    }

    for (index, base) in bases.iter().enumerate() {
        if let Some(parent) = graph.parent(*base) {
            let parent_base = graph.base(parent);
            if let Some(&parent_index) = index_of.get(&parent_base) {
                partitions[parent_index].children.push(index);
            }
        }
    }

    let root_index = *index_of
        .get(&root_base)
        .ok_or_else(|| TrellisError::Plan("root partition missing from plan".to_string()))?;
    Ok(ExecutionPlan {
        partitions,
        root: root_index,
    })
}

fn same_base_join_nodes(graph: &QueryGraph, related: &[NodeId], base: NodeId) -> Vec<NodeId> {
    related
        .iter()
        .filter(|node| graph.base(**node) == base && graph.has_join(**node))
        .copied()
        .collect()
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn partition_statement<'g>(
    graph: &'g QueryGraph,
    partition: &Partition,
    filter: Option<Filter>,
    query: Option<&FindQuery>,
) -> SelectStatement<'g> {
    let mut joins = Vec::new();
    for &join_node in &partition.join_nodes {
        for through in graph.join_through(join_node) {
            joins.push(JoinClause {
                node: through.node,
                on: through.on.clone(),
            });
        }
        // the partition base's own ON predicate became the hydrated WHERE;
        // only sibling nodes join on theirs
        if join_node != partition.node {
            if let Some(on) = graph.join_on(join_node) {
                joins.push(JoinClause {
                    node: join_node,
                    on: on.clone(),
                });
            }
        }
    }

    let (sorts, offset, limit) = match query {
        Some(query) => (
            query.sorts.clone(),
            query.pagination.offset,
            query.pagination.limit.resolve(),
        ),
        None => (Vec::new(), 0, None),
    };

    SelectStatement {
        graph,
        node: partition.node,
        columns: partition.fields.clone(),
        joins,
        filter,
        sorts,
        offset,
        limit,
    }
}

fn execute_partition<'a, E: SqlExecutor>(
    graph: &'a QueryGraph,
    plan: &'a ExecutionPlan,
    index: usize,
    where_filter: Option<Filter>,
    query: Option<&'a FindQuery>,
    executor: &'a E,
) -> Pin<Box<dyn Future<Output = Result<Vec<FlatRow>>> + 'a>> {
    Box::pin(async move {
        let partition = &plan.partitions[index];
        let statement = partition_statement(graph, partition, where_filter, query);
        let mut rows = executor.fetch(&statement).await?;
        debug!(
            table = graph.table(partition.node),
            rows = rows.len(),
            "fetched partition"
        );

        if rows.is_empty() || partition.children.is_empty() {
            return Ok(rows);
        }

        let parent_rows = &rows;
        let containers = try_join_all(partition.children.iter().map(|&child_index| async move {
            let child = &plan.partitions[child_index];
            debug_assert_ne!(
                graph.base(child.node),
                partition.node,
                "child partition sharing its parent's base"
            );
            let on = graph.join_on(child.node).cloned().ok_or_else(|| {
                TrellisError::Plan(format!(
                    "partition {} has no join predicate",
                    graph.alias(child.node)
                ))
            })?;

            let mut combined: Option<Filter> = None;
            let mut dead = false;
            match hydrate_filter(graph, &on, partition.node, parent_rows)? {
                Hydrated::Filter(filter) => combined = Some(filter),
                Hydrated::Pass => {}
                Hydrated::Fail => dead = true,
            }
            if !dead {
                for fragment in &child.correlated {
                    match hydrate_filter(graph, fragment, partition.node, parent_rows)? {
                        Hydrated::Filter(filter) => {
                            combined = Some(match combined {
                                Some(existing) => existing.and(filter),
                                None => filter,
                            });
                        }
                        Hydrated::Pass => {}
                        Hydrated::Fail => {
                            dead = true;
                            break;
                        }
                    }
                }
            }

            if dead {
                // no child row can correlate; skip the round trip entirely
                return Ok(JoinResultContainer {
                    rows: Vec::new(),
                    node: child.node,
                    on,
                });
            }

            if let Some(filter) = child.filter.clone() {
                combined = Some(match combined {
                    Some(existing) => existing.and(filter),
                    None => filter,
                });
            }

            let child_rows =
                execute_partition(graph, plan, child_index, combined, None, executor).await?;
            Ok(JoinResultContainer {
                rows: child_rows,
                node: child.node,
                on,
            })
        }))
        .await?;

        merge_result_sets(graph, &mut rows, containers)?;
        Ok(rows)
    })
}
