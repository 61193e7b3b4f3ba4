use std::path::PathBuf;
use std::sync::Mutex;

use futures::TryStreamExt;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{debug, error};

use super::{BoxFuture, ByteProgress, CollectionSource, Unit};
use crate::{Error, Result};

/// Document-store view of an SQLite database: every user table is a
/// collection, exported as one JSON object per row (NDJSON).
#[derive(Debug)]
pub struct SqliteCollectionSource {
    path: PathBuf,
    pool: Mutex<Option<SqlitePool>>,
}

impl SqliteCollectionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Mutex::new(None),
        }
    }

    fn pool(&self) -> Result<SqlitePool> {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::Connection {
                message: format!("sqlite source not connected: {}", self.path.display()),
            })
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `json_object(...)` over every column; blobs are hex-encoded since JSON
/// cannot carry them.
fn document_expr(columns: &[String]) -> String {
    let fields: Vec<String> = columns
        .iter()
        .map(|c| {
            let col = quote_ident(c);
            format!(
                "{}, CASE typeof({col}) WHEN 'blob' THEN hex({col}) ELSE {col} END",
                quote_literal(c)
            )
        })
        .collect();
    format!("json_object({})", fields.join(", "))
}

impl CollectionSource for SqliteCollectionSource {
    fn provider(&self) -> &str {
        "sqlite"
    }

    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            debug!(
                event = "sqlite.open",
                db_path = %self.path.display(),
                read_only = true,
                "sqlite.open"
            );
            let options = SqliteConnectOptions::new()
                .filename(&self.path)
                .create_if_missing(false)
                .read_only(true);

            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .map_err(|e| {
                    error!(
                        event = "io.sqlite.connect_failed",
                        db_path = %self.path.display(),
                        error = %e,
                        "io.sqlite.connect_failed"
                    );
                    Error::Connection {
                        message: format!("sqlite open failed: {}: {e}", self.path.display()),
                    }
                })?;

            *self.pool.lock().unwrap_or_else(|e| e.into_inner()) = Some(pool);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(pool) = pool {
                pool.close().await;
            }
            Ok(())
        })
    }

    fn list_collections(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let pool = self.pool()?;
            let names = sqlx::query_scalar::<_, String>(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .fetch_all(&pool)
            .await?;
            Ok(names)
        })
    }

    fn export_collection<'a>(
        &'a self,
        name: &'a str,
        progress: ByteProgress<'a>,
    ) -> BoxFuture<'a, Unit> {
        Box::pin(async move {
            let pool = self.pool()?;
            let columns = sqlx::query_scalar::<_, String>(
                "SELECT name FROM pragma_table_info(?1) ORDER BY cid",
            )
            .bind(name)
            .fetch_all(&pool)
            .await?;
            if columns.is_empty() {
                return Err(Error::NotFound {
                    message: format!("collection not found: {name}"),
                });
            }

            let doc = document_expr(&columns);
            let table = quote_ident(name);
            let total_sql = format!(
                "SELECT COALESCE(SUM(LENGTH(CAST(doc AS BLOB)) + 1), 0) \
                 FROM (SELECT {doc} AS doc FROM {table})"
            );
            let total = sqlx::query_scalar::<_, i64>(&total_sql)
                .fetch_one(&pool)
                .await?
                .max(0) as u64;

            let rows_sql = format!("SELECT {doc} FROM {table}");
            let mut rows = sqlx::query_scalar::<_, String>(&rows_sql).fetch(&pool);
            let mut bytes = Vec::with_capacity(total as usize);
            while let Some(row) = rows.try_next().await? {
                bytes.extend_from_slice(row.as_bytes());
                bytes.push(b'\n');
                progress(bytes.len() as u64, total.max(bytes.len() as u64));
            }
            if bytes.is_empty() {
                progress(0, 0);
            }

            debug!(
                event = "sqlite.collection_exported",
                collection = name,
                bytes = bytes.len(),
                "sqlite.collection_exported"
            );
            Ok(Unit::new(format!("{name}.ndjson"), bytes))
        })
    }
}
