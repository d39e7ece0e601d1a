//! # Trellis
//!
//! A relational query planner for Rust. Declare tables, typed columns and
//! relations once; issue structured queries (field selection, filters,
//! sorts, pagination) and get nested result objects back in as few SQL
//! round trips as the relation graph allows.
//!
//! To-one and through joins share their declaring node's statement as LEFT
//! JOINs. To-many joins would duplicate ancestor rows, so each one becomes a
//! separate statement whose filter is rewritten ("hydrated") against the
//! parent's fetched rows, then stitched back into the parent objects.
//!
//! ## Quick start
//!
//! ```no_run
//! use trellis::prelude::*;
//! use trellis::sqlite::SqliteExecutor;
//!
//! # async fn demo() -> trellis::Result<()> {
//! let registry = SchemaRegistry::builder()
//!     .table("countries", |t| {
//!         t.integer("id").primary();
//!         t.text("name");
//!         t.has_many("states", "states")
//!             .on(|j| Ok(j.target("country_id")?.eq(j.source("id")?)));
//!     })
//!     .table("states", |t| {
//!         t.integer("id").primary();
//!         t.integer("country_id").exclude();
//!         t.text("name");
//!     })
//!     .build()?;
//!
//! let db = Database::new(registry, SqliteExecutor::open_in_memory()?);
//! let _countries = db
//!     .find_all("countries", |graph, root| {
//!         let states = graph.join(root, "states")?;
//!         Ok(FindQuery::new()
//!             .select([Selection::Relation(root), Selection::Relation(states)])
//!             .filter(graph.field(root, "name")?.like("%land%")))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub use trellis_core::*;

#[cfg(feature = "sqlite")]
pub use trellis_sqlite as sqlite;

pub mod prelude {
    pub use trellis_core::{
        Database, FindQuery, Limit, Pagination, QueryGraph, Result, SchemaRegistry, Selection,
        Sort, SortDirection, TrellisError, Value, filter,
    };

    #[cfg(feature = "sqlite")]
    pub use trellis_sqlite::SqliteExecutor;
}
