#![allow(dead_code)]

//! Shared fixtures: a geography schema, seeded in-memory storage, and a
//! statement-counting executor wrapper for round-trip assertions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use trellis::prelude::*;
use trellis::sqlite::SqliteExecutor;
use trellis::{
    DeleteStatement, FlatRow, InsertStatement, SelectStatement, SqlExecutor, UpdateStatement,
};

/// Counts the SQL round trips (fetches and counts) issued through it.
pub struct CountingExecutor<E> {
    inner: E,
    statements: AtomicUsize,
}

impl<E> CountingExecutor<E> {
    pub fn new(inner: E) -> CountingExecutor<E> {
        CountingExecutor {
            inner,
            statements: AtomicUsize::new(0),
        }
    }

    pub fn statements(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.statements.store(0, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: SqlExecutor> SqlExecutor for CountingExecutor<E> {
    async fn fetch(&self, statement: &SelectStatement<'_>) -> trellis::Result<Vec<FlatRow>> {
        self.statements.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(statement).await
    }

    async fn count(&self, statement: &SelectStatement<'_>) -> trellis::Result<u64> {
        self.statements.fetch_add(1, Ordering::SeqCst);
        self.inner.count(statement).await
    }

    async fn insert(&self, statement: &InsertStatement) -> trellis::Result<Vec<i64>> {
        self.inner.insert(statement).await
    }

    async fn update(&self, statement: &UpdateStatement<'_>) -> trellis::Result<u64> {
        self.inner.update(statement).await
    }

    async fn delete(&self, statement: &DeleteStatement<'_>) -> trellis::Result<u64> {
        self.inner.delete(statement).await
    }

    async fn begin(&self) -> trellis::Result<()> {
        self.inner.begin().await
    }

    async fn commit(&self) -> trellis::Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> trellis::Result<()> {
        self.inner.rollback().await
    }
}

pub type GeoDatabase = Database<CountingExecutor<SqliteExecutor>>;

pub fn geo_registry() -> Arc<SchemaRegistry> {
    SchemaRegistry::builder()
        .table("continents", |t| {
            t.integer("id").primary();
            t.text("name");
            t.has_many("countries", "countries")
                .on(|j| Ok(j.target("continentId")?.eq(j.source("id")?)));
        })
        .table("countries", |t| {
            t.integer("id").primary();
            t.text("name");
            t.integer("continentId")
                .column("continent_id")
                .exclude()
                .mapped_from("continent.id");
            t.has_one("continent", "continents")
                .include()
                .on(|j| Ok(j.source("continentId")?.eq(j.target("id")?)));
            t.has_many("states", "states")
                .on(|j| Ok(j.target("countryId")?.eq(j.source("id")?)));
            t.has_many("languages", "languages")
                .through("countries_languages", |j| {
                    Ok(j.target("languageId")?.eq(j.source("id")?))
                })
                .on(|j| Ok(j.source("id")?.eq(j.through(0, "countryId")?)));
            t.auth(|auth, graph, node| {
                let Some(continent) = auth.get("continentId") else {
                    return Ok(None);
                };
                let value = trellis::Value::from_json(continent)?;
                Ok(Some(graph.field(node, "continentId")?.eq(value)))
            });
        })
        .table("states", |t| {
            t.integer("id").primary();
            t.text("name");
            t.integer("countryId").column("country_id").exclude();
            t.has_one("country", "countries")
                .on(|j| Ok(j.source("countryId")?.eq(j.target("id")?)));
            t.has_many("cities", "cities")
                .on(|j| Ok(j.target("stateId")?.eq(j.source("id")?)));
        })
        .table("cities", |t| {
            t.integer("id").primary();
            t.text("name");
            t.integer("stateId").column("state_id").exclude();
            t.has_one("state", "states")
                .on(|j| Ok(j.source("stateId")?.eq(j.target("id")?)));
        })
        .table("languages", |t| {
            t.integer("id").primary();
            t.text("name");
        })
        .table("countries_languages", |t| {
            t.integer("countryId").column("country_id");
            t.integer("languageId").column("language_id");
            t.has_one("language", "languages")
                .on(|j| Ok(j.source("languageId")?.eq(j.target("id")?)));
        })
        .build()
        .unwrap()
}

const SCHEMA_SQL: &str = "
    CREATE TABLE continents (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE countries (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        continent_id INTEGER REFERENCES continents (id)
    );
    CREATE TABLE states (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        country_id INTEGER REFERENCES countries (id)
    );
    CREATE TABLE cities (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        state_id INTEGER REFERENCES states (id)
    );
    CREATE TABLE languages (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE countries_languages (country_id INTEGER, language_id INTEGER);
";

const SEED_SQL: &str = "
    INSERT INTO continents (id, name) VALUES (1, 'Europe'), (2, 'Americas');
    INSERT INTO countries (id, name, continent_id) VALUES
        (1, 'Germany', 1),
        (2, 'France', 1),
        (3, 'Canada', 2);
    INSERT INTO states (id, name, country_id) VALUES
        (1, 'Bavaria', 1),
        (2, 'Berlin', 1),
        (3, 'Alsace', 2),
        (4, 'Brittany', 2),
        (5, 'Ontario', 3);
    INSERT INTO cities (id, name, state_id) VALUES
        (1, 'Munich', 1),
        (2, 'Augsburg', 1),
        (3, 'Spandau', 2),
        (4, 'Strasbourg', 3),
        (5, 'Colmar', 3),
        (6, 'Rennes', 4),
        (7, 'Toronto', 5),
        (8, 'Ottawa', 5);
    INSERT INTO languages (id, name) VALUES
        (1, 'German'),
        (2, 'French'),
        (3, 'English');
    INSERT INTO countries_languages (country_id, language_id) VALUES
        (1, 1),
        (2, 2),
        (3, 2),
        (3, 3);
";

pub fn geo_db() -> GeoDatabase {
    let executor = SqliteExecutor::open_in_memory().unwrap();
    executor.batch(SCHEMA_SQL).unwrap();
    executor.batch(SEED_SQL).unwrap();
    Database::new(geo_registry(), CountingExecutor::new(executor))
}

pub fn statements(db: &GeoDatabase) -> usize {
    db.executor().statements()
}

pub fn reset_statements(db: &GeoDatabase) {
    db.executor().reset()
}
