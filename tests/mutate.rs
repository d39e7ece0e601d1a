//! Mutation-path integration tests: inserts, cross-partition updates and
//! removes, and transaction composition.

mod common;

use common::geo_db;
use serde_json::json;
use trellis::UpdateSpec;
use trellis::prelude::*;

#[tokio::test]
async fn insert_then_fetch_round_trips_default_fields() {
    let db = geo_db();

    let id = db
        .insert_one(
            "countries",
            &["name", "continentId"],
            &json!({ "name": "Spain", "continent": { "id": 1 } }),
        )
        .await
        .unwrap();

    let spain = db.find_by_id("countries", id).await.unwrap();
    assert_eq!(spain["id"], json!(id));
    assert_eq!(spain["name"], "Spain");
    // the mapper pulled continent_id out of the nested model object
    assert_eq!(spain["continent"], json!({ "id": 1, "name": "Europe" }));
}

#[tokio::test]
async fn multi_row_insert_returns_ids_in_order() {
    let db = geo_db();

    let ids = db
        .insert(
            "languages",
            &["name"],
            &[json!({ "name": "Dutch" }), json!({ "name": "Basque" })],
        )
        .await
        .unwrap();
    assert_eq!(ids, vec![4, 5]);

    let empty = db.insert("languages", &["name"], &[]).await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn simple_update_writes_through_field_mappers() {
    let db = geo_db();

    let affected = db
        .update(
            "countries",
            |graph, root| {
                Ok(UpdateSpec {
                    fields: vec![graph.field(root, "name")?],
                    filter: graph.field(root, "id")?.eq(2),
                })
            },
            &json!({ "name": "République française" }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let france = db.find_by_id("countries", 2).await.unwrap();
    assert_eq!(france["name"], "République française");
}

#[tokio::test]
async fn joined_update_resolves_primary_keys_first() {
    let db = geo_db();

    // the filter reaches into the states relation, so the planner
    // materializes matching country ids before the write
    let affected = db
        .update(
            "countries",
            |graph, root| {
                let states = graph.join(root, "states")?;
                let name = graph.field(states, "name")?;
                Ok(UpdateSpec {
                    fields: vec![graph.field(root, "name")?],
                    filter: trellis::filter::exists_where(states, name.like("Bav%")),
                })
            },
            &json!({ "name": "Deutschland" }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let germany = db.find_by_id("countries", 1).await.unwrap();
    assert_eq!(germany["name"], "Deutschland");
}

#[tokio::test]
async fn joined_update_matching_nothing_writes_nothing() {
    let db = geo_db();

    let affected = db
        .update(
            "countries",
            |graph, root| {
                let states = graph.join(root, "states")?;
                let name = graph.field(states, "name")?;
                Ok(UpdateSpec {
                    fields: vec![graph.field(root, "name")?],
                    filter: trellis::filter::exists_where(states, name.eq("Narnia")),
                })
            },
            &json!({ "name": "Nowhere" }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(affected, 0);
}

#[tokio::test]
async fn bare_to_many_write_filters_are_rejected() {
    let db = geo_db();

    let result = db
        .update(
            "countries",
            |graph, root| {
                let states = graph.join(root, "states")?;
                Ok(UpdateSpec {
                    fields: vec![graph.field(root, "name")?],
                    filter: graph.field(states, "name")?.like("Bav%"),
                })
            },
            &json!({ "name": "Deutschland" }),
            None,
        )
        .await;
    assert!(matches!(result, Err(TrellisError::Plan(_))));
}

#[tokio::test]
async fn joined_remove_without_primary_key_falls_back_to_row_identity() {
    let db = geo_db();

    // countries_languages declares no primary key; the remove degrades to
    // whole-row matching but still only deletes the intended row
    let removed = db
        .remove(
            "countries_languages",
            |graph, root| {
                let language = graph.join(root, "language")?;
                Ok(graph.field(language, "name")?.eq("English"))
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let remaining: i64 = db
        .executor()
        .inner()
        .connection()
        .query_row("SELECT COUNT(*) FROM countries_languages", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(remaining, 3);
}

#[tokio::test]
async fn remove_models_deletes_by_primary_key() {
    let db = geo_db();

    let removed = db
        .remove_models("cities", &[json!({ "id": 7 }), json!({ "id": 8 })], None)
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let result = db
        .remove_model("cities", &json!({ "id": 7 }), None)
        .await;
    assert!(matches!(result, Err(TrellisError::NotFound)));
}

#[tokio::test]
async fn auth_filters_gate_mutations() {
    let db = geo_db();

    // Canada is outside continent 1; the auth filter protects it
    let removed = db
        .remove(
            "countries",
            |graph, root| Ok(graph.field(root, "id")?.eq(3)),
            Some(&json!({ "continentId": 1 })),
        )
        .await
        .unwrap();
    assert_eq!(removed, 0);

    let canada = db.find_by_id("countries", 3).await.unwrap();
    assert_eq!(canada["name"], "Canada");
}

#[tokio::test]
async fn transactions_compose_and_roll_back() {
    let db = geo_db();

    let result: Result<()> = db
        .transaction(async |db| {
            db.insert_one("languages", &["name"], &json!({ "name": "Frisian" }))
                .await?;
            Err(TrellisError::Plan("abort".to_string()))
        })
        .await;
    assert!(result.is_err());

    let count = db
        .find_count("languages", |_, _| Ok(FindQuery::new()))
        .await
        .unwrap();
    assert_eq!(count, 3, "rolled-back insert must not persist");

    db.transaction(async |db| {
        db.insert_one("languages", &["name"], &json!({ "name": "Frisian" }))
            .await?;
        db.insert_one("languages", &["name"], &json!({ "name": "Breton" }))
            .await?;
        Ok(())
    })
    .await
    .unwrap();

    let count = db
        .find_count("languages", |_, _| Ok(FindQuery::new()))
        .await
        .unwrap();
    assert_eq!(count, 5);
}
