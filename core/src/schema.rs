//! Schema declarations and the registry the planner reads them from.
//!
//! Declarations are a closed set of tagged variants (fields, composites,
//! relations) consumed by the join-graph builder. A [`SchemaRegistry`] is
//! constructed once at startup, is read-only afterwards, and is passed into
//! every query explicitly — there is no process-wide lookup state.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::{Result, TrellisError};
use crate::filter::Filter;
use crate::graph::{JoinEnds, NodeId, QueryGraph};

/// Storage type of a declared column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Boolean,
    Integer,
    Real,
    Text,
    Blob,
    Date,
}

/// Whether a field participates in the default selection.
///
/// `Isolate` is reserved: declared but treated as `Exclude` for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    Include,
    Exclude,
    Isolate,
}

/// Extracts a column value from a plain nested model object.
#[derive(Clone)]
pub enum Mapper {
    /// Traverse the model by an explicit dotted path.
    Path(Vec<String>),
    /// Custom extraction; `None` falls back to the field's own path.
    Custom(Arc<dyn Fn(&JsonValue) -> Option<JsonValue> + Send + Sync>),
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mapper::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Mapper::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

/// Builds the ON predicate of a join from the nodes at its two ends.
pub type OnBuilder = Arc<dyn Fn(&JoinEnds<'_>) -> Result<Filter> + Send + Sync>;

/// Builds a row-level authorization filter for a relation node.
pub type JoinAuthBuilder =
    Arc<dyn Fn(&JsonValue, &JoinEnds<'_>) -> Result<Option<Filter>> + Send + Sync>;

/// Builds a row-level authorization filter for a table's own node.
pub type TableAuthBuilder =
    Arc<dyn Fn(&JsonValue, &QueryGraph, NodeId) -> Result<Option<Filter>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub column: String,
    pub kind: FieldKind,
    pub exclusion: Exclusion,
    pub primary: bool,
    pub mapper: Option<Mapper>,
}

#[derive(Debug, Clone)]
pub struct CompositeDecl {
    pub entries: Vec<(String, DeclEntry)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    One,
    Many,
}

/// An intermediate junction hop of a relation.
#[derive(Clone)]
pub struct ThroughDecl {
    pub target: String,
    pub on: OnBuilder,
}

impl std::fmt::Debug for ThroughDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThroughDecl")
            .field("target", &self.target)
            .finish()
    }
}

#[derive(Clone)]
pub struct RelationDecl {
    pub target: String,
    pub kind: RelationKind,
    pub exclusion: Exclusion,
    /// Whether the built node expands its own auto-included relations.
    pub include_joins: bool,
    pub through: Vec<ThroughDecl>,
    pub on: Option<OnBuilder>,
    /// Logical paths selected by default instead of the target's own set.
    pub default_fields: Option<Vec<String>>,
    pub auth: Option<JoinAuthBuilder>,
}

impl std::fmt::Debug for RelationDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationDecl")
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("exclusion", &self.exclusion)
            .field("include_joins", &self.include_joins)
            .field("through", &self.through)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum DeclEntry {
    Field(FieldDecl),
    Composite(CompositeDecl),
    Relation(RelationDecl),
}

pub struct TableDecl {
    pub table: String,
    pub entries: Vec<(String, DeclEntry)>,
    pub auth: Option<TableAuthBuilder>,
}

impl std::fmt::Debug for TableDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDecl")
            .field("table", &self.table)
            .field("entries", &self.entries)
            .finish()
    }
}

impl TableDecl {
    pub fn relation(&self, name: &str) -> Option<&RelationDecl> {
        self.entries.iter().find_map(|(key, entry)| match entry {
            DeclEntry::Relation(rel) if key == name => Some(rel),
            _ => None,
        })
    }
}

/// Read-only store of table declarations, shared across queries.
#[derive(Debug)]
pub struct SchemaRegistry {
    tables: HashMap<String, Arc<TableDecl>>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder { tables: Vec::new() }
    }

    pub fn table(&self, name: &str) -> Result<&Arc<TableDecl>> {
        self.tables
            .get(name)
            .ok_or_else(|| TrellisError::Schema(format!("unknown table: {name}")))
    }
}

pub struct SchemaBuilder {
    tables: Vec<TableDecl>,
}

impl SchemaBuilder {
    /// Declares a table. Entry order is preserved; it drives default-field
    /// ordering and nested output shape.
    pub fn table(mut self, name: &str, build: impl FnOnce(&mut TableBuilder)) -> Self {
        let mut builder = TableBuilder {
            entries: Vec::new(),
            auth: None,
        };
        build(&mut builder);
        self.tables.push(TableDecl {
            table: name.to_string(),
            entries: builder.entries,
            auth: builder.auth,
        });
        self
    }

    pub fn build(self) -> Result<Arc<SchemaRegistry>> {
        let mut tables = HashMap::new();
        for decl in self.tables {
            validate_entries(&decl.table, &decl.entries, false)?;
            if tables.contains_key(&decl.table) {
                return Err(TrellisError::Schema(format!(
                    "table declared twice: {}",
                    decl.table
                )));
            }
            tables.insert(decl.table.clone(), Arc::new(decl));
        }
        Ok(Arc::new(SchemaRegistry { tables }))
    }
}

fn validate_entries(table: &str, entries: &[(String, DeclEntry)], composite: bool) -> Result<()> {
    let mut seen = HashMap::new();
    for (name, entry) in entries {
        if seen.insert(name.clone(), ()).is_some() {
            return Err(TrellisError::Schema(format!(
                "duplicate declaration `{name}` on {table}"
            )));
        }
        match entry {
            DeclEntry::Field(_) => {}
            DeclEntry::Composite(inner) => validate_entries(table, &inner.entries, true)?,
            DeclEntry::Relation(rel) => {
                if composite {
                    return Err(TrellisError::Schema(format!(
                        "relation `{name}` declared inside a composite on {table}"
                    )));
                }
                if rel.on.is_none() {
                    return Err(TrellisError::Schema(format!(
                        "relation `{name}` on {table} has no ON predicate"
                    )));
                }
            }
        }
    }
    Ok(())
}

pub struct TableBuilder {
    entries: Vec<(String, DeclEntry)>,
    auth: Option<TableAuthBuilder>,
}

macro_rules! field_decl_method {
    ($($name:ident => $kind:ident),+ $(,)?) => {
        $(pub fn $name(&mut self, name: &str) -> FieldDeclBuilder<'_> {
            self.push_field(name, FieldKind::$kind)
        })+
    };
}

impl TableBuilder {
    field_decl_method! {
        boolean => Boolean,
        integer => Integer,
        real => Real,
        text => Text,
        blob => Blob,
        date => Date,
    }

    fn push_field(&mut self, name: &str, kind: FieldKind) -> FieldDeclBuilder<'_> {
        self.entries.push((
            name.to_string(),
            DeclEntry::Field(FieldDecl {
                column: name.to_string(),
                kind,
                exclusion: Exclusion::Include,
                primary: false,
                mapper: None,
            }),
        ));
        let index = self.entries.len() - 1;
        FieldDeclBuilder {
            entries: &mut self.entries,
            index,
        }
    }

    /// Declares a nested group of fields, stored flat on this table but
    /// positioned under `name` in the output object.
    pub fn composite(&mut self, name: &str, build: impl FnOnce(&mut TableBuilder)) {
        let mut inner = TableBuilder {
            entries: Vec::new(),
            auth: None,
        };
        build(&mut inner);
        self.entries.push((
            name.to_string(),
            DeclEntry::Composite(CompositeDecl {
                entries: inner.entries,
            }),
        ));
    }

    /// Declares a to-one relation (shares the declaring node's SQL partition).
    pub fn has_one(&mut self, name: &str, target: &str) -> RelationBuilder<'_> {
        self.push_relation(name, target, RelationKind::One)
    }

    /// Declares a to-many relation (always starts a new SQL partition).
    pub fn has_many(&mut self, name: &str, target: &str) -> RelationBuilder<'_> {
        self.push_relation(name, target, RelationKind::Many)
    }

    fn push_relation(
        &mut self,
        name: &str,
        target: &str,
        kind: RelationKind,
    ) -> RelationBuilder<'_> {
        self.entries.push((
            name.to_string(),
            DeclEntry::Relation(RelationDecl {
                target: target.to_string(),
                kind,
                exclusion: Exclusion::Exclude,
                include_joins: false,
                through: Vec::new(),
                on: None,
                default_fields: None,
                auth: None,
            }),
        ));
        let index = self.entries.len() - 1;
        RelationBuilder {
            entries: &mut self.entries,
            index,
        }
    }

    /// Row-level authorization for this table: the returned filter is ANDed
    /// into every partition that selects from it.
    pub fn auth<F>(&mut self, builder: F)
    where
        F: Fn(&JsonValue, &QueryGraph, NodeId) -> Result<Option<Filter>> + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(builder));
    }
}

pub struct FieldDeclBuilder<'a> {
    entries: &'a mut Vec<(String, DeclEntry)>,
    index: usize,
}

impl FieldDeclBuilder<'_> {
    fn decl(&mut self) -> &mut FieldDecl {
        match &mut self.entries[self.index].1 {
            DeclEntry::Field(decl) => decl,
            _ => unreachable!("field builder points at a field entry"),
        }
    }

    /// Overrides the physical column name (defaults to the logical name).
    pub fn column(mut self, column: &str) -> Self {
        self.decl().column = column.to_string();
        self
    }

    /// Marks this field as the primary key.
    pub fn primary(mut self) -> Self {
        self.decl().primary = true;
        self
    }

    /// Excludes this field from the default selection.
    pub fn exclude(mut self) -> Self {
        self.decl().exclusion = Exclusion::Exclude;
        self
    }

    /// Maps this column from a different path of the model object on writes,
    /// e.g. a `continent_id` column fed from `continent.id`.
    pub fn mapped_from(mut self, path: &str) -> Self {
        self.decl().mapper = Some(Mapper::Path(
            path.split('.').map(str::to_string).collect(),
        ));
        self
    }

    /// Custom write-time extraction; returning `None` falls back to the
    /// field's own logical path.
    pub fn map_with<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&JsonValue) -> Option<JsonValue> + Send + Sync + 'static,
    {
        self.decl().mapper = Some(Mapper::Custom(Arc::new(mapper)));
        self
    }
}

pub struct RelationBuilder<'a> {
    entries: &'a mut Vec<(String, DeclEntry)>,
    index: usize,
}

impl RelationBuilder<'_> {
    fn decl(&mut self) -> &mut RelationDecl {
        match &mut self.entries[self.index].1 {
            DeclEntry::Relation(decl) => decl,
            _ => unreachable!("relation builder points at a relation entry"),
        }
    }

    /// Auto-selects this relation's default fields whenever the declaring
    /// node is selected with no explicit field list.
    pub fn include(mut self) -> Self {
        self.decl().exclusion = Exclusion::Include;
        self
    }

    /// Lets the built node expand its own auto-included relations (bounded
    /// for self-referential chains).
    pub fn include_joins(mut self) -> Self {
        self.decl().include_joins = true;
        self
    }

    /// The join predicate between the two ends of this relation.
    pub fn on<F>(mut self, builder: F) -> Self
    where
        F: Fn(&JoinEnds<'_>) -> Result<Filter> + Send + Sync + 'static,
    {
        self.decl().on = Some(Arc::new(builder));
        self
    }

    /// Adds an intermediate junction table; `on` joins it to the previous
    /// hop. Through tables stay anonymous in the output.
    pub fn through<F>(mut self, target: &str, on: F) -> Self
    where
        F: Fn(&JoinEnds<'_>) -> Result<Filter> + Send + Sync + 'static,
    {
        let through = ThroughDecl {
            target: target.to_string(),
            on: Arc::new(on),
        };
        self.decl().through.push(through);
        self
    }

    /// Restricts the relation's default selection to these logical paths of
    /// the target.
    pub fn fields(mut self, paths: &[&str]) -> Self {
        self.decl().default_fields = Some(paths.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Row-level authorization evaluated at this relation's node.
    pub fn auth<F>(mut self, builder: F) -> Self
    where
        F: Fn(&JsonValue, &JoinEnds<'_>) -> Result<Option<Filter>> + Send + Sync + 'static,
    {
        self.decl().auth = Some(Arc::new(builder));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_indexes_tables() {
        let registry = SchemaRegistry::builder()
            .table("countries", |t| {
                t.integer("id").primary();
                t.text("name");
            })
            .build()
            .unwrap();

        let decl = registry.table("countries").unwrap();
        assert_eq!(decl.entries.len(), 2);
        assert!(registry.table("cities").is_err());
    }

    #[test]
    fn relation_requires_on_predicate() {
        let result = SchemaRegistry::builder()
            .table("countries", |t| {
                t.integer("id").primary();
                t.has_many("states", "states");
            })
            .build();
        assert!(matches!(result, Err(TrellisError::Schema(_))));
    }

    #[test]
    fn composites_cannot_declare_relations() {
        let result = SchemaRegistry::builder()
            .table("places", |t| {
                t.composite("geo", |c| {
                    c.real("lat");
                    c.has_one("oops", "other").on(|_| unreachable!());
                });
            })
            .build();
        assert!(matches!(result, Err(TrellisError::Schema(_))));
    }
}
