//! rusqlite-backed executor.

use std::cell::Cell;
use std::collections::HashMap;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, params_from_iter};
use tracing::debug;

use trellis_core::{
    DeleteStatement, FlatRow, InsertStatement, Result, SelectStatement, SqlExecutor, TrellisError,
    UpdateStatement, Value,
};

use crate::render::{Rendered, render_delete, render_insert, render_select, render_update};

/// A [`SqlExecutor`] over one rusqlite connection.
///
/// Transactions nest by depth counting: only the outermost `begin`/`commit`
/// pair reaches the database, so composed mutations share one unit of work.
pub struct SqliteExecutor {
    connection: Connection,
    transaction_depth: Cell<u32>,
}

impl SqliteExecutor {
    pub fn new(connection: Connection) -> SqliteExecutor {
        SqliteExecutor {
            connection,
            transaction_depth: Cell::new(0),
        }
    }

    pub fn open_in_memory() -> Result<SqliteExecutor> {
        let connection = Connection::open_in_memory().map_err(execution_error)?;
        Ok(SqliteExecutor::new(connection))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Runs a raw SQL batch; intended for schema setup and test seeding.
    pub fn batch(&self, sql: &str) -> Result<()> {
        self.connection.execute_batch(sql).map_err(execution_error)
    }

    fn run(&self, rendered: &Rendered) -> Result<usize> {
        debug!(sql = %rendered.sql, "executing");
        self.connection
            .execute(
                &rendered.sql,
                params_from_iter(rendered.params.iter().map(bind_value)),
            )
            .map_err(execution_error)
    }
}

impl SqlExecutor for SqliteExecutor {
    async fn fetch(&self, statement: &SelectStatement<'_>) -> Result<Vec<FlatRow>> {
        let rendered = render_select(statement, false)?;
        debug!(sql = %rendered.sql, "fetching");

        let mut prepared = self
            .connection
            .prepare(&rendered.sql)
            .map_err(execution_error)?;
        let column_names: Vec<String> = prepared
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut rows = prepared
            .query(params_from_iter(rendered.params.iter().map(bind_value)))
            .map_err(execution_error)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(execution_error)? {
            let mut values = HashMap::with_capacity(column_names.len());
            for (index, name) in column_names.iter().enumerate() {
                let value = row.get_ref(index).map_err(execution_error)?;
                values.insert(name.clone(), read_value(value));
            }
            out.push(FlatRow::from_values(values));
        }
        Ok(out)
    }

    async fn count(&self, statement: &SelectStatement<'_>) -> Result<u64> {
        let rendered = render_select(statement, true)?;
        debug!(sql = %rendered.sql, "counting");
        let count: i64 = self
            .connection
            .query_row(
                &rendered.sql,
                params_from_iter(rendered.params.iter().map(bind_value)),
                |row| row.get(0),
            )
            .map_err(execution_error)?;
        Ok(count.max(0) as u64)
    }

    async fn insert(&self, statement: &InsertStatement) -> Result<Vec<i64>> {
        let rendered = render_insert(statement)?;
        let inserted = self.run(&rendered)? as i64;
        if inserted <= 0 {
            return Ok(Vec::new());
        }
        // rowids of a multi-row insert are consecutive up to the last one
        let last = self.connection.last_insert_rowid();
        Ok((last - inserted + 1..=last).collect())
    }

    async fn update(&self, statement: &UpdateStatement<'_>) -> Result<u64> {
        let rendered = render_update(statement)?;
        Ok(self.run(&rendered)? as u64)
    }

    async fn delete(&self, statement: &DeleteStatement<'_>) -> Result<u64> {
        let rendered = render_delete(statement)?;
        Ok(self.run(&rendered)? as u64)
    }

    async fn begin(&self) -> Result<()> {
        if self.transaction_depth.get() == 0 {
            self.connection
                .execute_batch("BEGIN")
                .map_err(transaction_error)?;
        }
        self.transaction_depth.set(self.transaction_depth.get() + 1);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let depth = self.transaction_depth.get();
        if depth == 0 {
            return Err(TrellisError::Transaction(
                "commit without an open transaction".to_string(),
            ));
        }
        self.transaction_depth.set(depth - 1);
        if depth == 1 {
            self.connection
                .execute_batch("COMMIT")
                .map_err(transaction_error)?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if self.transaction_depth.get() == 0 {
            return Ok(());
        }
        // abort the whole unit of work, however deep the failure happened
        self.transaction_depth.set(0);
        self.connection
            .execute_batch("ROLLBACK")
            .map_err(transaction_error)
    }
}

fn bind_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Integer(i) => rusqlite::types::Value::Integer(*i),
        Value::Real(f) => rusqlite::types::Value::Real(*f),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
        Value::Null => rusqlite::types::Value::Null,
    }
}

fn read_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(text) => Value::Text(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::Blob(blob.to_vec()),
    }
}

fn execution_error(error: rusqlite::Error) -> TrellisError {
    TrellisError::Execution(error.to_string())
}

fn transaction_error(error: rusqlite::Error) -> TrellisError {
    TrellisError::Transaction(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trellis_core::schema::SchemaRegistry;

    fn registry() -> Arc<SchemaRegistry> {
        SchemaRegistry::builder()
            .table("cities", |t| {
                t.integer("id").primary();
                t.text("name");
            })
            .build()
            .unwrap()
    }

    fn executor() -> SqliteExecutor {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        executor
            .batch(
                "CREATE TABLE cities (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO cities (name) VALUES ('Amsterdam'), ('Berlin');",
            )
            .unwrap();
        executor
    }

    #[tokio::test]
    async fn fetch_decodes_aliased_columns() {
        let executor = executor();
        let graph = trellis_core::QueryGraph::new(registry(), "cities").unwrap();
        let root = graph.root();

        let statement = SelectStatement {
            graph: &graph,
            node: root,
            columns: vec![graph.field(root, "id").unwrap(), graph.field(root, "name").unwrap()],
            joins: vec![],
            filter: Some(graph.field(root, "name").unwrap().like("%erlin")),
            sorts: vec![],
            offset: 0,
            limit: None,
        };
        let rows = executor.fetch(&statement).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("name"), Value::from("Berlin"));
    }

    #[tokio::test]
    async fn insert_returns_consecutive_rowids() {
        let executor = executor();
        let statement = InsertStatement {
            table: "cities".to_string(),
            columns: vec!["name".to_string()],
            rows: vec![vec![Value::from("Cork")], vec![Value::from("Dublin")]],
        };
        let ids = executor.insert(&statement).await.unwrap();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn nested_transactions_commit_once() {
        let executor = executor();
        executor.begin().await.unwrap();
        executor.begin().await.unwrap();
        executor
            .batch("INSERT INTO cities (name) VALUES ('Essen')")
            .unwrap();
        executor.commit().await.unwrap();
        // still inside the outer transaction
        assert_eq!(executor.transaction_depth.get(), 1);
        executor.commit().await.unwrap();

        let count: i64 = executor
            .connection()
            .query_row("SELECT COUNT(*) FROM cities", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn rollback_discards_the_whole_unit() {
        let executor = executor();
        executor.begin().await.unwrap();
        executor
            .batch("INSERT INTO cities (name) VALUES ('Ghost Town')")
            .unwrap();
        executor.rollback().await.unwrap();

        let count: i64 = executor
            .connection()
            .query_row("SELECT COUNT(*) FROM cities", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
