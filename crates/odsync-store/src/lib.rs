//! Destination and sync-state persistence.
//!
//! Two seams live here: [`DestinationStore`] owns the mirrored tables and their rows, and
//! [`SyncStateStore`] owns the change trackers and collection metadata. [`PgStore`] backs
//! both with PostgreSQL; [`MemoryStore`] keeps everything in process for dry runs and tests.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use odsync_core::{ChangeTracker, CollectionMeta, ColumnType};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "odsync-store";

pub const MAX_POOL_CONNECTIONS: u32 = 5;

/// Columns every mirrored table carries regardless of the source shape.
pub const SYSTEM_COLUMNS: [(&str, ColumnType); 3] = [
    ("id", ColumnType::Numeric),
    ("hash", ColumnType::Text),
    ("created_at", ColumnType::Timestamp),
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("write to {table} rejected: {reason}")]
    Rejected { table: String, reason: String },
}

/// One row bound for insertion. `cells` is positionally aligned with the column list passed
/// alongside it; `None` is SQL NULL and every other value is text cast to the column type.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    pub hash: String,
    pub cells: Vec<Option<String>>,
}

#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Creates the table with its system columns and hash index if it does not exist.
    async fn ensure_table(&self, table: &str) -> Result<(), StoreError>;

    async fn existing_columns(&self, table: &str)
        -> Result<BTreeMap<String, ColumnType>, StoreError>;

    /// Adds missing columns. Existing columns are never altered or dropped.
    async fn add_columns(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
    ) -> Result<(), StoreError>;

    /// Inserts one batch in a single statement, skipping rows whose hash already exists.
    /// Returns the number of rows actually written.
    async fn insert_batch(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
        rows: &[PreparedRow],
    ) -> Result<u64, StoreError>;

    async fn truncate(&self, table: &str) -> Result<(), StoreError>;

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn load_tracker(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Option<ChangeTracker>, StoreError>;

    async fn save_tracker(&self, tracker: &ChangeTracker) -> Result<(), StoreError>;

    async fn upsert_collection_meta(&self, meta: &CollectionMeta) -> Result<(), StoreError>;

    async fn list_collection_meta(&self) -> Result<Vec<CollectionMeta>, StoreError>;
}

/// Double-quotes an identifier for interpolation into DDL/DML.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Name of the unique hash index for `table`, kept within the 63-byte identifier limit so it
/// never truncates onto the table's own name.
pub fn hash_index_name(table: &str) -> String {
    let name = format!("{table}_hash_uidx");
    if name.len() <= 63 {
        return name;
    }
    let digest = hex::encode(Sha256::digest(table.as_bytes()));
    format!("hash_uidx_{}", &digest[..16])
}

fn cast_suffix(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "",
        ColumnType::Boolean => "::boolean",
        ColumnType::Numeric => "::numeric",
        ColumnType::Timestamp => "::timestamptz",
        ColumnType::Structured => "::jsonb",
    }
}

/// PostgreSQL's limit on bind parameters in one statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Largest row count whose insert statement stays within [`MAX_BIND_PARAMS`]. Each row binds
/// its hash plus one value per column.
pub fn max_rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / (column_count + 1)).max(1)
}

/// Builds the multi-row `INSERT ... ON CONFLICT (hash) DO NOTHING` statement for a batch.
pub fn build_insert_sql(table: &str, columns: &[(String, ColumnType)], row_count: usize) -> String {
    let mut column_list = vec!["hash".to_string()];
    column_list.extend(columns.iter().map(|(name, _)| quote_ident(name)));

    let width = columns.len() + 1;
    let tuples = (0..row_count)
        .map(|row| {
            let base = row * width;
            let mut params = vec![format!("${}", base + 1)];
            params.extend(
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, (_, ty))| format!("${}{}", base + i + 2, cast_suffix(*ty))),
            );
            format!("({})", params.join(", "))
        })
        .collect::<Vec<_>>();

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT (hash) DO NOTHING",
        quote_ident(table),
        column_list.join(", "),
        tuples.join(", ")
    )
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Connects to `database` on the server addressed by `database_url`, creating the
    /// database first when it does not exist yet.
    pub async fn connect_database(database_url: &str, database: &str) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(database_url)?;
        ensure_database_exists(&options, database).await?;
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect_with(options.database(database))
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

async fn ensure_database_exists(options: &PgConnectOptions, database: &str) -> Result<(), StoreError> {
    let mut conn = options.clone().database("postgres").connect().await?;
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(database)
            .fetch_one(&mut conn)
            .await?;
    if !exists {
        info!(database, "creating destination database");
        sqlx::query(&format!("CREATE DATABASE {}", quote_ident(database)))
            .execute(&mut conn)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl DestinationStore for PgStore {
    async fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        let quoted = quote_ident(table);
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {quoted} (
                id BIGSERIAL PRIMARY KEY,
                hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        // Tables created before hashing existed lack the column.
        sqlx::query(&format!("ALTER TABLE {quoted} ADD COLUMN IF NOT EXISTS hash TEXT"))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {quoted} (hash)",
            quote_ident(&hash_index_name(table))
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn existing_columns(
        &self,
        table: &str,
    ) -> Result<BTreeMap<String, ColumnType>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name, data_type
              FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = $1
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            out.insert(name, ColumnType::from_catalog(&data_type));
        }
        Ok(out)
    }

    async fn add_columns(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
    ) -> Result<(), StoreError> {
        if columns.is_empty() {
            return Ok(());
        }
        let clauses = columns
            .iter()
            .map(|(name, ty)| format!("ADD COLUMN IF NOT EXISTS {} {}", quote_ident(name), ty.sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!("ALTER TABLE {} {clauses}", quote_ident(table)))
            .execute(&self.pool)
            .await?;
        debug!(table, added = columns.len(), "columns added");
        Ok(())
    }

    async fn insert_batch(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
        rows: &[PreparedRow],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = build_insert_sql(table, columns, rows.len());
        let mut query = sqlx::query(&sql);
        for row in rows {
            if row.cells.len() != columns.len() {
                return Err(StoreError::Rejected {
                    table: table.to_string(),
                    reason: format!(
                        "row has {} cells for {} columns",
                        row.cells.len(),
                        columns.len()
                    ),
                });
            }
            query = query.bind(row.hash.clone());
            for cell in &row.cells {
                query = query.bind(cell.clone());
            }
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn truncate(&self, table: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("TRUNCATE TABLE {}", quote_ident(table)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl SyncStateStore for PgStore {
    async fn load_tracker(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Option<ChangeTracker>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, database_name, table_name, last_processed_key, last_processed_at,
                   last_checked_at, total_remote_count, processed_count, primary_key_column,
                   timestamp_column, is_active, created_at, updated_at
              FROM sync_change_tracker
             WHERE database_name = $1 AND table_name = $2
            "#,
        )
        .bind(database)
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ChangeTracker {
            id: row.try_get("id")?,
            database_name: row.try_get("database_name")?,
            table_name: row.try_get("table_name")?,
            last_processed_key: row.try_get("last_processed_key")?,
            last_processed_at: row.try_get("last_processed_at")?,
            last_checked_at: row.try_get("last_checked_at")?,
            total_remote_count: row.try_get("total_remote_count")?,
            processed_count: row.try_get("processed_count")?,
            primary_key_column: row.try_get("primary_key_column")?,
            timestamp_column: row.try_get("timestamp_column")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_tracker(&self, tracker: &ChangeTracker) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_change_tracker (
                id, database_name, table_name, last_processed_key, last_processed_at,
                last_checked_at, total_remote_count, processed_count, primary_key_column,
                timestamp_column, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (database_name, table_name) DO UPDATE SET
                last_processed_key = EXCLUDED.last_processed_key,
                last_processed_at = EXCLUDED.last_processed_at,
                last_checked_at = EXCLUDED.last_checked_at,
                total_remote_count = EXCLUDED.total_remote_count,
                processed_count = EXCLUDED.processed_count,
                primary_key_column = EXCLUDED.primary_key_column,
                timestamp_column = EXCLUDED.timestamp_column,
                is_active = EXCLUDED.is_active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tracker.id)
        .bind(&tracker.database_name)
        .bind(&tracker.table_name)
        .bind(&tracker.last_processed_key)
        .bind(tracker.last_processed_at)
        .bind(tracker.last_checked_at)
        .bind(tracker.total_remote_count)
        .bind(tracker.processed_count)
        .bind(&tracker.primary_key_column)
        .bind(&tracker.timestamp_column)
        .bind(tracker.is_active)
        .bind(tracker.created_at)
        .bind(tracker.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_collection_meta(&self, meta: &CollectionMeta) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO datas_collections (base_url, collection_name, table_name, last_check_time, records_count)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (base_url, collection_name) DO UPDATE SET
                table_name = EXCLUDED.table_name,
                last_check_time = EXCLUDED.last_check_time,
                records_count = EXCLUDED.records_count,
                updated_at = NOW()
            "#,
        )
        .bind(&meta.base_url)
        .bind(&meta.collection_name)
        .bind(&meta.table_name)
        .bind(meta.last_check_time)
        .bind(meta.records_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_collection_meta(&self) -> Result<Vec<CollectionMeta>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT base_url, collection_name, table_name, last_check_time, records_count
              FROM datas_collections
             ORDER BY base_url, collection_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CollectionMeta {
                base_url: row.try_get("base_url")?,
                collection_name: row.try_get("collection_name")?,
                table_name: row.try_get("table_name")?,
                last_check_time: row.try_get("last_check_time")?,
                records_count: row.try_get("records_count")?,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: BTreeMap<String, ColumnType>,
    rows: Vec<BTreeMap<String, Option<String>>>,
    hashes: HashSet<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    trackers: BTreeMap<(String, String), ChangeTracker>,
    metas: BTreeMap<(String, String), CollectionMeta>,
    next_id: i64,
    insert_calls: usize,
    fail_inserts_from: Option<usize>,
}

/// In-process store with the same hash-uniqueness and additive-column rules as [`PgStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `insert_batch` call from the `n`-th (zero-based) onwards fail.
    pub async fn fail_inserts_from(&self, n: usize) {
        self.state.lock().await.fail_inserts_from = Some(n);
    }

    pub async fn clear_insert_failure(&self) {
        self.state.lock().await.fail_inserts_from = None;
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.state.lock().await.tables.keys().cloned().collect()
    }

    pub async fn rows(&self, table: &str) -> Vec<BTreeMap<String, Option<String>>> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Drops rows without touching trackers, simulating out-of-band destination loss.
    pub async fn delete_rows(&self, table: &str) {
        if let Some(t) = self.state.lock().await.tables.get_mut(table) {
            t.rows.clear();
            t.hashes.clear();
        }
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.tables.entry(table.to_string()).or_insert_with(|| MemoryTable {
            columns: SYSTEM_COLUMNS
                .iter()
                .map(|(name, ty)| (name.to_string(), *ty))
                .collect(),
            ..MemoryTable::default()
        });
        Ok(())
    }

    async fn existing_columns(
        &self,
        table: &str,
    ) -> Result<BTreeMap<String, ColumnType>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn add_columns(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        for (name, ty) in columns {
            t.columns.entry(name.clone()).or_insert(*ty);
        }
        Ok(())
    }

    async fn insert_batch(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
        rows: &[PreparedRow],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let call = state.insert_calls;
        state.insert_calls += 1;
        if state.fail_inserts_from.is_some_and(|from| call >= from) {
            return Err(StoreError::Rejected {
                table: table.to_string(),
                reason: "injected insert failure".to_string(),
            });
        }

        let mut next_id = state.next_id;
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        if let Some((missing, _)) = columns.iter().find(|(name, _)| !t.columns.contains_key(name)) {
            return Err(StoreError::Rejected {
                table: table.to_string(),
                reason: format!("column {missing} does not exist"),
            });
        }

        let mut inserted = 0;
        for row in rows {
            if !t.hashes.insert(row.hash.clone()) {
                continue;
            }
            next_id += 1;
            let mut stored = BTreeMap::new();
            stored.insert("id".to_string(), Some(next_id.to_string()));
            stored.insert("hash".to_string(), Some(row.hash.clone()));
            for ((name, _), cell) in columns.iter().zip(&row.cells) {
                stored.insert(name.clone(), cell.clone());
            }
            t.rows.push(stored);
            inserted += 1;
        }
        state.next_id = next_id;
        Ok(inserted)
    }

    async fn truncate(&self, table: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let t = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        t.rows.clear();
        t.hashes.clear();
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.len() as i64)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }
}

#[async_trait]
impl SyncStateStore for MemoryStore {
    async fn load_tracker(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Option<ChangeTracker>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .trackers
            .get(&(database.to_string(), table.to_string()))
            .cloned())
    }

    async fn save_tracker(&self, tracker: &ChangeTracker) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.trackers.insert(
            (tracker.database_name.clone(), tracker.table_name.clone()),
            tracker.clone(),
        );
        Ok(())
    }

    async fn upsert_collection_meta(&self, meta: &CollectionMeta) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.metas.insert(
            (meta.base_url.clone(), meta.collection_name.clone()),
            meta.clone(),
        );
        Ok(())
    }

    async fn list_collection_meta(&self) -> Result<Vec<CollectionMeta>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.metas.values().cloned().collect())
    }
}
