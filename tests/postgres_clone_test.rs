// ABOUTME: Integration tests cloning tables between two PostgreSQL databases
// ABOUTME: Require TEST_SOURCE_URL and TEST_TARGET_URL; run with --ignored

use std::env;
use table_cloner::endpoint::postgres::connect;
use table_cloner::error::clone_error_kind;
use table_cloner::object::PartialOptions;
use table_cloner::{open_endpoint, CloneError, Cloner, ObjectDescriptor};

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let target = env::var("TEST_TARGET_URL").ok()?;
    Some((source, target))
}

/// Create a unique test table name to avoid conflicts
fn test_table_name(suffix: &str) -> String {
    format!("clone_test_{}", suffix)
}

async fn setup_source_table(source_url: &str, table_name: &str, rows: i64) -> anyhow::Result<()> {
    let (client, _driver) = connect(source_url).await?;
    client
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS "public"."{table}";
            CREATE TABLE "public"."{table}" (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                amount NUMERIC(12, 2),
                tags JSONB,
                created_at TIMESTAMPTZ DEFAULT now()
            );
            INSERT INTO "public"."{table}" (name, amount, tags)
            SELECT 'row-' || g, g * 1.25, jsonb_build_object('n', g)
            FROM generate_series(1, {rows}) AS g;
            "#,
            table = table_name,
            rows = rows
        ))
        .await?;
    Ok(())
}

async fn drop_table(url: &str, table_name: &str) {
    if let Ok((client, _driver)) = connect(url).await {
        let _ = client
            .batch_execute(&format!(
                r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#,
                table_name
            ))
            .await;
    }
}

async fn row_count(url: &str, table_name: &str) -> i64 {
    let (client, _driver) = connect(url).await.expect("Failed to connect");
    client
        .query_one(&format!(r#"SELECT count(*) FROM "public"."{}""#, table_name), &[])
        .await
        .expect("Failed to count rows")
        .get(0)
}

/// Test: a missing target table is created from source DDL and filled
#[tokio::test]
#[ignore]
async fn test_clone_creates_target_table() {
    let (source_url, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let table = test_table_name("create");
    let target_table = test_table_name("create_copy");

    setup_source_table(&source_url, &table, 250)
        .await
        .expect("Failed to set up source table");
    drop_table(&target_url, &target_table).await;

    let target_obj = ObjectDescriptor::parse_qualified(&format!("public.{}", target_table))
        .with_options(&PartialOptions {
            create_if_not_exists: Some(true),
            ..Default::default()
        });
    let mut cloner = Cloner::new(
        open_endpoint(&source_url).unwrap(),
        ObjectDescriptor::parse_qualified(&format!("public.{}", table)),
        open_endpoint(&target_url).unwrap(),
        target_obj,
    )
    .unwrap();

    let stats = cloner.clone().await.expect("Clone failed");
    cloner.close().await.unwrap();

    assert_eq!(stats.rows, 250);
    assert_eq!(stats.batches, 3);
    assert_eq!(row_count(&target_url, &target_table).await, 250);

    drop_table(&source_url, &table).await;
    drop_table(&target_url, &target_table).await;
}

/// Test: truncate empties the target before copying
#[tokio::test]
#[ignore]
async fn test_clone_truncates_existing_target() {
    let (source_url, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let table = test_table_name("truncate");
    let target_table = test_table_name("truncate_copy");

    setup_source_table(&source_url, &table, 40).await.unwrap();
    setup_source_table(&target_url, &target_table, 7).await.unwrap();

    let target_obj = ObjectDescriptor::parse_qualified(&target_table).with_options(&PartialOptions {
        truncate: Some(true),
        ..Default::default()
    });
    let mut cloner = Cloner::new(
        open_endpoint(&source_url).unwrap(),
        ObjectDescriptor::parse_qualified(&table),
        open_endpoint(&target_url).unwrap(),
        target_obj,
    )
    .unwrap();

    cloner.clone().await.expect("Clone failed");
    cloner.close().await.unwrap();

    assert_eq!(row_count(&target_url, &target_table).await, 40);

    drop_table(&source_url, &table).await;
    drop_table(&target_url, &target_table).await;
}

/// Test: without create_if_not_exists a missing target aborts the clone
#[tokio::test]
#[ignore]
async fn test_clone_fails_for_missing_target() {
    let (source_url, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let table = test_table_name("missing");
    let target_table = test_table_name("missing_copy");

    setup_source_table(&source_url, &table, 3).await.unwrap();
    drop_table(&target_url, &target_table).await;

    let mut cloner = Cloner::new(
        open_endpoint(&source_url).unwrap(),
        ObjectDescriptor::parse_qualified(&table),
        open_endpoint(&target_url).unwrap(),
        ObjectDescriptor::parse_qualified(&target_table),
    )
    .unwrap();

    let err = cloner.clone().await.unwrap_err();
    cloner.close().await.unwrap();

    assert!(matches!(
        clone_error_kind(&err),
        Some(CloneError::TargetObjectMissing { .. })
    ));

    drop_table(&source_url, &table).await;
}
