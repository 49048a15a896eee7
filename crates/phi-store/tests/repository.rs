use std::str::FromStr;
use std::time::Duration;

use serde_json::{Map, Value, json};
use sokana_contracts::fields::PhiPatch;
use sokana_phi_store::{PhiPool, PhiRepository};
use sqlx::postgres::PgConnectOptions;
use uuid::Uuid;

fn test_db_url() -> Option<String> {
    std::env::var("SOKANA_TEST_DB_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

async fn repository_in_fresh_schema(db_url: &str) -> PhiRepository {
    let schema = format!("sokana_phi_test_{}", ulid::Ulid::new()).to_lowercase();

    let admin = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(db_url)
        .await
        .expect("DB connect should succeed");
    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&admin)
        .await
        .expect("create schema should succeed");
    admin.close().await;

    let options = PgConnectOptions::from_str(db_url)
        .expect("test DB url should parse")
        .options([("search_path", schema.as_str())]);
    let pool = PhiPool::new(options);
    pool.migrate().await.expect("migrations should apply");
    pool.migrate().await.expect("migrations should be idempotent");

    PhiRepository::new(pool, Duration::from_secs(5))
}

fn patch(value: Value) -> PhiPatch {
    let map: Map<String, Value> = value.as_object().cloned().expect("object");
    PhiPatch::from_map(&map).expect("valid phi patch")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_client_reads_as_empty() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping PHI repository test; set SOKANA_TEST_DB_URL to enable");
        return;
    };
    let repo = repository_in_fresh_schema(&db_url).await;

    let phi = repo
        .get_phi_by_client_id(Uuid::new_v4())
        .await
        .expect("read should succeed");
    assert!(phi.is_empty());

    repo.pool().close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_rows_only_return_populated_columns() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping PHI repository test; set SOKANA_TEST_DB_URL to enable");
        return;
    };
    let repo = repository_in_fresh_schema(&db_url).await;
    let client_id = Uuid::new_v4();

    let written = repo
        .update_phi(client_id, &patch(json!({"due_date": "2026-03-14"})))
        .await
        .expect("write should succeed");
    assert_eq!(Value::Object(written), json!({"due_date": "2026-03-14"}));

    let phi = repo
        .get_phi_by_client_id(client_id)
        .await
        .expect("read should succeed");
    assert_eq!(Value::Object(phi), json!({"due_date": "2026-03-14"}));

    repo.pool().close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_span_partitions_and_null_clears() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping PHI repository test; set SOKANA_TEST_DB_URL to enable");
        return;
    };
    let repo = repository_in_fresh_schema(&db_url).await;
    let client_id = Uuid::new_v4();

    repo.update_phi(
        client_id,
        &patch(json!({
            "allergies": "penicillin",
            "insurance": "Medicaid",
            "first_name": "Ada",
            "number_of_babies": 2,
            "had_previous_pregnancies": false,
        })),
    )
    .await
    .expect("first write should succeed");

    let written = repo
        .update_phi(client_id, &patch(json!({"allergies": null, "last_name": "Lovelace"})))
        .await
        .expect("second write should succeed");
    assert_eq!(Value::Object(written), json!({"last_name": "Lovelace"}));

    let phi = repo
        .get_phi_by_client_id(client_id)
        .await
        .expect("read should succeed");
    assert_eq!(
        Value::Object(phi),
        json!({
            "insurance": "Medicaid",
            "first_name": "Ada",
            "last_name": "Lovelace",
            "number_of_babies": 2,
            "had_previous_pregnancies": false,
        })
    );

    repo.pool().close().await;
}
