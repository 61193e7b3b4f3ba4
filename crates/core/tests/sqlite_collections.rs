use std::path::Path;
use std::sync::{Arc, Mutex};

use blobshift_core::{
    CollectionSource, Connections, InMemoryDestination, MigrationConfig, MigrationEngine,
    SqliteCollectionSource,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

async fn seed(path: &Path) {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();

    for sql in [
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, avatar BLOB)",
        "INSERT INTO users (id, name, avatar) VALUES (1, 'ada', x'0102'), (2, 'grace', NULL)",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL)",
        "INSERT INTO orders (id, total) VALUES (10, 9.5)",
        "CREATE TABLE empty_table (id INTEGER)",
    ] {
        sqlx::query(sql).execute(&pool).await.unwrap();
    }
    pool.close().await;
}

#[tokio::test]
async fn tables_export_as_ndjson_documents() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("app.sqlite");
    seed(&db).await;

    let source = SqliteCollectionSource::new(&db);
    source.connect().await.unwrap();
    assert_eq!(
        source.list_collections().await.unwrap(),
        vec!["empty_table", "orders", "users"]
    );

    let seen = Mutex::new(Vec::new());
    let cb = |done: u64, total: u64| seen.lock().unwrap().push((done, total));
    let unit = source.export_collection("users", &cb).await.unwrap();
    assert_eq!(unit.name, "users.ndjson");

    let text = String::from_utf8(unit.bytes.clone()).unwrap();
    let docs: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["id"], 1);
    assert_eq!(docs[0]["name"], "ada");
    assert_eq!(docs[0]["avatar"], "0102");
    assert!(docs[1]["avatar"].is_null());

    let err = source.export_collection("missing", &cb).await.unwrap_err();
    assert!(err.to_string().contains("collection not found"));

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen.last().copied(), Some((unit.size(), unit.size())));
    source.close().await.unwrap();
}

#[tokio::test]
async fn connect_fails_for_missing_database() {
    let temp = TempDir::new().unwrap();
    let source = SqliteCollectionSource::new(temp.path().join("missing.sqlite"));
    let err = source.connect().await.unwrap_err();
    assert!(err.to_string().contains("sqlite open failed"));
}

#[tokio::test]
async fn whole_database_migrates_as_one_batch() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("app.sqlite");
    seed(&db).await;

    let dest = Arc::new(InMemoryDestination::new());
    let conns = Connections::new(dest.clone())
        .with_collections(Arc::new(SqliteCollectionSource::new(&db)));
    let engine = MigrationEngine::new(MigrationConfig::default(), conns).unwrap();
    engine.initialize().await.unwrap();

    let result = engine.migrate_collection(None).await;
    assert!(result.success, "{result:?}");

    let snapshot = engine.progress();
    assert_eq!(snapshot.total_files, 3);
    assert_eq!(snapshot.completed_files, 3);
    assert_eq!(snapshot.failed_files, 0);
    assert_eq!(snapshot.percentage, 100.0);

    let uploads = dest.uploads();
    assert_eq!(
        uploads[0].names,
        vec!["empty_table.ndjson", "orders.ndjson", "users.ndjson"]
    );
    engine.close().await.unwrap();
}
