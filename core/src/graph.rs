//! Per-query join graph: one node per (declared relation, access path).
//!
//! A [`QueryGraph`] is built fresh for every top-level query from the shared
//! [`SchemaRegistry`]. The root node is scaffolded eagerly; relation nodes are
//! built lazily the first time a query traversal reaches them and cached per
//! access path. Nodes are immutable once built.
//!
//! Partition assignment happens here: a to-one or through join keeps its
//! parent's `base` (same SQL statement, LEFT JOIN), a to-many join becomes its
//! own `base` (a new SQL statement) because joining it in line would duplicate
//! every ancestor row per matched child.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::{Result, TrellisError};
use crate::filter::Filter;
use crate::schema::{
    DeclEntry, Exclusion, FieldKind, JoinAuthBuilder, Mapper, RelationKind, SchemaRegistry,
    TableAuthBuilder, TableDecl,
};

/// Re-entries of one declared relation allowed along a single ancestor chain
/// before default-field expansion stops following it.
const SELF_JOIN_LIMIT: usize = 3;

/// Handle to a node of a [`QueryGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

/// Handle to a field of a [`QueryGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(pub(crate) usize);

/// An anonymous junction hop of a join, with its ON predicate.
#[derive(Debug, Clone)]
pub struct JoinThrough {
    pub node: NodeId,
    pub on: Filter,
}

#[derive(Debug, Clone)]
pub(crate) struct ManyJoin {
    /// ON-predicate fields owned by the parent's partition; always fetched so
    /// the correlator has their literal values.
    pub required_base_fields: Vec<FieldId>,
    /// ON-predicate fields owned by the new partition; same requirement.
    pub required_join_fields: Vec<FieldId>,
}

#[derive(Debug, Clone)]
pub(crate) struct JoinData {
    pub on: Filter,
    pub through: Vec<JoinThrough>,
    pub many: Option<ManyJoin>,
}

pub(crate) enum BoundAuth {
    Table(TableAuthBuilder),
    Join {
        builder: JoinAuthBuilder,
        source: NodeId,
        through: Vec<NodeId>,
    },
}

pub(crate) struct Node {
    pub table: String,
    pub alias: String,
    pub path: Vec<String>,
    pub depth: usize,
    pub parent: Option<NodeId>,
    pub base: NodeId,
    pub root: NodeId,
    pub anonymous: bool,
    pub decl: Arc<TableDecl>,
    pub primary_key: Option<FieldId>,
    pub fields: Vec<FieldId>,
    pub fields_by_path: HashMap<String, FieldId>,
    pub default_fields: Vec<FieldId>,
    pub join: Option<JoinData>,
    pub auth: Option<BoundAuth>,
    pub children: HashMap<String, NodeId>,
}

pub(crate) struct FieldData {
    pub node: NodeId,
    /// Full logical path from the query root, e.g. `["states", "id"]`.
    pub path: Vec<String>,
    pub column: String,
    pub exclusion: Exclusion,
    pub kind: FieldKind,
    pub mapper: Option<Mapper>,
}

enum BaseAssign {
    /// Same partition as the parent (to-one and one-side through joins).
    Inherit,
    /// The node opens its own partition (to-many joins).
    NewPartition,
    /// Forced base (through hops of a to-many join travel with the child
    /// partition).
    Explicit(NodeId),
}

/// The two ends of a join handed to ON-predicate and auth builders.
pub struct JoinEnds<'g> {
    pub(crate) graph: &'g QueryGraph,
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub through_nodes: Vec<NodeId>,
}

impl JoinEnds<'_> {
    /// A field of the node that declared the relation.
    pub fn source(&self, path: &str) -> Result<FieldId> {
        self.graph.field(self.source_node, path)
    }

    /// A field of the joined node.
    pub fn target(&self, path: &str) -> Result<FieldId> {
        self.graph.field(self.target_node, path)
    }

    /// A field of the `index`-th through hop built so far.
    pub fn through(&self, index: usize, path: &str) -> Result<FieldId> {
        let node = self.through_nodes.get(index).copied().ok_or_else(|| {
            TrellisError::Schema(format!("join has no through table at index {index}"))
        })?;
        self.graph.field(node, path)
    }
}

pub struct QueryGraph {
    registry: Arc<SchemaRegistry>,
    nodes: Vec<Node>,
    fields: Vec<FieldData>,
}

impl QueryGraph {
    /// Builds a fresh graph rooted at `table`, scaffolding the root node and
    /// its auto-included relations.
    pub fn new(registry: Arc<SchemaRegistry>, table: &str) -> Result<QueryGraph> {
        let decl = registry.table(table)?.clone();
        let mut graph = QueryGraph {
            registry,
            nodes: Vec::new(),
            fields: Vec::new(),
        };
        graph.scaffold_node(decl, "root".to_string(), Vec::new(), None, BaseAssign::Inherit, true)?;
        Ok(graph)
    }

    /// The query root. Valid for every graph; roots are always node 0.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Resolves (building and caching on first access) the node of a declared
    /// relation reached from `parent`.
    pub fn join(&mut self, parent: NodeId, relation: &str) -> Result<NodeId> {
        if let Some(&child) = self.nodes[parent.0].children.get(relation) {
            return Ok(child);
        }

        let parent_decl = self.nodes[parent.0].decl.clone();
        let rel = parent_decl
            .relation(relation)
            .ok_or_else(|| {
                TrellisError::Schema(format!(
                    "unknown relation `{relation}` on {}",
                    parent_decl.table
                ))
            })?
            .clone();

        let registry = self.registry.clone();
        let target_decl = registry.table(&rel.target)?.clone();

        let mut path = self.nodes[parent.0].path.clone();
        path.push(relation.to_string());
        let alias = path.join("$");

        let many = rel.kind == RelationKind::Many;
        let expand_joins =
            rel.include_joins && self.self_reference_count(parent, &rel.target) <= SELF_JOIN_LIMIT;

        let base = if many {
            BaseAssign::NewPartition
        } else {
            BaseAssign::Inherit
        };
        let child = self.scaffold_node(target_decl, alias, path.clone(), Some(parent), base, expand_joins)?;

        // Junction hops; for a to-many join they belong to the child's
        // partition, otherwise to the parent's.
        let mut through_nodes: Vec<NodeId> = Vec::new();
        let mut through_joins: Vec<JoinThrough> = Vec::new();
        for (index, through) in rel.through.iter().enumerate() {
            let through_decl = registry.table(&through.target)?.clone();
            let mut through_path = path.clone();
            through_path.push(format!("__through_{index}"));
            let through_alias = through_path.join("$");
            let base = if many {
                BaseAssign::Explicit(child)
            } else {
                BaseAssign::Inherit
            };
            let node =
                self.scaffold_node(through_decl, through_alias, through_path, Some(parent), base, false)?;
            self.nodes[node.0].anonymous = true;

            let ends = JoinEnds {
                graph: self,
                source_node: if many { child } else { parent },
                target_node: node,
                through_nodes: through_nodes.clone(),
            };
            let on = (through.on)(&ends)?;
            through_nodes.push(node);
            through_joins.push(JoinThrough { node, on });
        }

        let on_builder = rel.on.as_ref().ok_or_else(|| {
            TrellisError::Schema(format!("relation `{relation}` has no ON predicate"))
        })?;
        let ends = JoinEnds {
            graph: self,
            source_node: parent,
            target_node: child,
            through_nodes: through_nodes.clone(),
        };
        let on = on_builder(&ends)?;

        let many_join = if many {
            let parent_base = self.nodes[parent.0].base;
            let mut required_base_fields = Vec::new();
            let mut required_join_fields = Vec::new();
            for field in on.fields() {
                let owner_base = self.nodes[self.fields[field.0].node.0].base;
                if owner_base == parent_base {
                    if !required_base_fields.contains(&field) {
                        required_base_fields.push(field);
                    }
                } else if owner_base == child && !required_join_fields.contains(&field) {
                    required_join_fields.push(field);
                }
            }
            Some(ManyJoin {
                required_base_fields,
                required_join_fields,
            })
        } else {
            None
        };

        self.nodes[child.0].join = Some(JoinData {
            on,
            through: through_joins,
            many: many_join,
        });

        // Relation-level auth wins over the target table's own auth.
        if let Some(auth) = &rel.auth {
            self.nodes[child.0].auth = Some(BoundAuth::Join {
                builder: auth.clone(),
                source: parent,
                through: through_nodes,
            });
        }

        if let Some(paths) = &rel.default_fields {
            let resolved = paths
                .iter()
                .map(|p| self.field(child, p))
                .collect::<Result<Vec<_>>>()?;
            self.nodes[child.0].default_fields = resolved;
        }

        self.nodes[parent.0].children.insert(relation.to_string(), child);
        Ok(child)
    }

    /// Looks up a field by logical path relative to `node` (dots traverse
    /// composites, e.g. `"location.lat"`).
    pub fn field(&self, node: NodeId, path: &str) -> Result<FieldId> {
        self.nodes[node.0]
            .fields_by_path
            .get(path)
            .copied()
            .ok_or_else(|| {
                TrellisError::Schema(format!(
                    "unknown field `{path}` on {}",
                    self.nodes[node.0].table
                ))
            })
    }

    fn scaffold_node(
        &mut self,
        decl: Arc<TableDecl>,
        alias: String,
        path: Vec<String>,
        parent: Option<NodeId>,
        base: BaseAssign,
        expand_joins: bool,
    ) -> Result<NodeId> {
        let id = NodeId(self.nodes.len());
        let (depth, root) = match parent {
            Some(p) => (self.nodes[p.0].depth + 1, self.nodes[p.0].root),
            None => (0, id),
        };
        let base = match base {
            BaseAssign::NewPartition => id,
            BaseAssign::Explicit(node) => node,
            BaseAssign::Inherit => parent.map(|p| self.nodes[p.0].base).unwrap_or(id),
        };
        let auth = decl.auth.clone().map(BoundAuth::Table);

        self.nodes.push(Node {
            table: decl.table.clone(),
            alias,
            path,
            depth,
            parent,
            base,
            root,
            anonymous: false,
            decl: decl.clone(),
            primary_key: None,
            fields: Vec::new(),
            fields_by_path: HashMap::new(),
            default_fields: Vec::new(),
            join: None,
            auth,
            children: HashMap::new(),
        });

        self.scaffold_fields(id, &decl.entries, &mut Vec::new())?;

        if expand_joins {
            for (name, entry) in decl.entries.iter() {
                let DeclEntry::Relation(rel) = entry else {
                    continue;
                };
                if rel.exclusion != Exclusion::Include || self.is_joined_to(id, &rel.target) {
                    continue;
                }
                let child = self.join(id, name)?;
                let child_defaults = self.nodes[child.0].default_fields.clone();
                self.nodes[id.0].default_fields.extend(child_defaults);
            }
        }

        Ok(id)
    }

    fn scaffold_fields(
        &mut self,
        node: NodeId,
        entries: &[(String, DeclEntry)],
        prefix: &mut Vec<String>,
    ) -> Result<()> {
        for (name, entry) in entries {
            match entry {
                DeclEntry::Field(decl) => {
                    let id = FieldId(self.fields.len());
                    let mut full_path = self.nodes[node.0].path.clone();
                    full_path.extend(prefix.iter().cloned());
                    full_path.push(name.clone());

                    let mut relative = prefix.join(".");
                    if !relative.is_empty() {
                        relative.push('.');
                    }
                    relative.push_str(name);

                    self.fields.push(FieldData {
                        node,
                        path: full_path,
                        column: decl.column.clone(),
                        exclusion: decl.exclusion,
                        kind: decl.kind,
                        mapper: decl.mapper.clone(),
                    });

                    let data = &mut self.nodes[node.0];
                    data.fields.push(id);
                    data.fields_by_path.insert(relative, id);
                    if decl.primary {
                        if data.primary_key.is_some() {
                            return Err(TrellisError::Schema(format!(
                                "two primary keys declared on {}",
                                data.table
                            )));
                        }
                        data.primary_key = Some(id);
                    }
                    if decl.exclusion == Exclusion::Include {
                        data.default_fields.push(id);
                    }
                }
                DeclEntry::Composite(composite) => {
                    prefix.push(name.clone());
                    self.scaffold_fields(node, &composite.entries, prefix)?;
                    prefix.pop();
                }
                DeclEntry::Relation(_) => {}
            }
        }
        Ok(())
    }

    /// True when `node` or any ancestor was built from `table`; used to stop
    /// two mutually auto-including relations from expanding forever.
    fn is_joined_to(&self, node: NodeId, table: &str) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if self.nodes[id.0].table == table {
                return true;
            }
            current = self.nodes[id.0].parent;
        }
        false
    }

    fn self_reference_count(&self, node: NodeId, table: &str) -> usize {
        let mut count = 0;
        let mut current = Some(node);
        while let Some(id) = current {
            if self.nodes[id.0].table == table {
                count += 1;
            }
            current = self.nodes[id.0].parent;
        }
        count
    }

    // ------------------------------------------------------------------
    // Metadata accessors (used by the planner and SQL adapters)
    // ------------------------------------------------------------------

    pub fn table(&self, node: NodeId) -> &str {
        &self.nodes[node.0].table
    }

    pub fn alias(&self, node: NodeId) -> &str {
        &self.nodes[node.0].alias
    }

    pub fn node_path(&self, node: NodeId) -> &[String] {
        &self.nodes[node.0].path
    }

    pub fn depth(&self, node: NodeId) -> usize {
        self.nodes[node.0].depth
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    pub fn base(&self, node: NodeId) -> NodeId {
        self.nodes[node.0].base
    }

    pub fn root_of(&self, node: NodeId) -> NodeId {
        self.nodes[node.0].root
    }

    pub fn is_root(&self, node: NodeId) -> bool {
        self.nodes[node.0].root == node && self.nodes[node.0].parent.is_none()
    }

    pub fn is_anonymous(&self, node: NodeId) -> bool {
        self.nodes[node.0].anonymous
    }

    pub fn primary_key(&self, node: NodeId) -> Option<FieldId> {
        self.nodes[node.0].primary_key
    }

    pub fn node_fields(&self, node: NodeId) -> &[FieldId] {
        &self.nodes[node.0].fields
    }

    pub fn default_fields(&self, node: NodeId) -> &[FieldId] {
        &self.nodes[node.0].default_fields
    }

    pub fn has_join(&self, node: NodeId) -> bool {
        self.nodes[node.0].join.is_some()
    }

    /// True when the node heads its own partition as a to-many join target.
    pub fn is_many(&self, node: NodeId) -> bool {
        self.nodes[node.0]
            .join
            .as_ref()
            .is_some_and(|join| join.many.is_some())
    }

    pub fn join_on(&self, node: NodeId) -> Option<&Filter> {
        self.nodes[node.0].join.as_ref().map(|join| &join.on)
    }

    pub fn join_through(&self, node: NodeId) -> &[JoinThrough] {
        self.nodes[node.0]
            .join
            .as_ref()
            .map(|join| join.through.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn many_join(&self, node: NodeId) -> Option<&ManyJoin> {
        self.nodes[node.0]
            .join
            .as_ref()
            .and_then(|join| join.many.as_ref())
    }

    pub fn field_node(&self, field: FieldId) -> NodeId {
        self.fields[field.0].node
    }

    /// The base partition owning this field's node.
    pub fn field_base(&self, field: FieldId) -> NodeId {
        self.base(self.fields[field.0].node)
    }

    pub fn field_column(&self, field: FieldId) -> &str {
        &self.fields[field.0].column
    }

    pub fn field_kind(&self, field: FieldId) -> FieldKind {
        self.fields[field.0].kind
    }

    pub fn field_exclusion(&self, field: FieldId) -> Exclusion {
        self.fields[field.0].exclusion
    }

    /// The output column alias: the field's full logical dot path.
    pub fn column_alias(&self, field: FieldId) -> String {
        self.fields[field.0].path.join(".")
    }

    /// Extracts this field's column value from a nested model object.
    pub fn map_field(&self, field: FieldId, model: &JsonValue) -> JsonValue {
        let data = &self.fields[field.0];
        if let Some(mapper) = &data.mapper {
            match mapper {
                Mapper::Custom(custom) => {
                    if let Some(value) = custom(model) {
                        return value;
                    }
                }
                Mapper::Path(path) => {
                    if let Some(value) = json_at_path(model, path) {
                        return value.clone();
                    }
                }
            }
        }
        json_at_path(model, &data.path)
            .cloned()
            .unwrap_or(JsonValue::Null)
    }

    /// Evaluates the node's row-level authorization against an auth context.
    pub fn auth_filter(&self, node: NodeId, auth: &JsonValue) -> Result<Option<Filter>> {
        match &self.nodes[node.0].auth {
            None => Ok(None),
            Some(BoundAuth::Table(builder)) => builder(auth, self, node),
            Some(BoundAuth::Join {
                builder,
                source,
                through,
            }) => {
                let ends = JoinEnds {
                    graph: self,
                    source_node: *source,
                    target_node: node,
                    through_nodes: through.clone(),
                };
                builder(auth, &ends)
            }
        }
    }
}

fn json_at_path<'a>(model: &'a JsonValue, path: &[String]) -> Option<&'a JsonValue> {
    let mut current = model;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}
