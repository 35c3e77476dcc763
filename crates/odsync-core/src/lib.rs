//! Core domain model for odsync: records, column types, sync strategies and tracker state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "odsync-core";

/// A loosely-typed remote record, keyed by the source's own field names.
pub type Record = serde_json::Map<String, JsonValue>;

/// Destination column types.
///
/// Variant order is the conflict-resolution precedence: when sampled values disagree the
/// greater variant wins, so `Structured > Timestamp > Numeric > Text > Boolean`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Text,
    Numeric,
    Timestamp,
    Structured,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Text => "TEXT",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::Structured => "JSONB",
        }
    }

    /// Maps an `information_schema.columns.data_type` value back to a column type.
    /// Anything unrecognised is treated as text.
    pub fn from_catalog(data_type: &str) -> Self {
        match data_type.trim().to_ascii_lowercase().as_str() {
            "boolean" => ColumnType::Boolean,
            "numeric" | "integer" | "bigint" | "smallint" | "double precision" | "real" => {
                ColumnType::Numeric
            }
            "timestamp with time zone" | "timestamp without time zone" | "date" => {
                ColumnType::Timestamp
            }
            "jsonb" | "json" => ColumnType::Structured,
            _ => ColumnType::Text,
        }
    }

    pub fn widen(self, other: ColumnType) -> ColumnType {
        self.max(other)
    }

    /// Whether a value detected as `detected` can be stored in a column of this type.
    pub fn accepts(self, detected: ColumnType) -> bool {
        match self {
            ColumnType::Text | ColumnType::Structured => true,
            ColumnType::Numeric => detected == ColumnType::Numeric,
            ColumnType::Timestamp => detected == ColumnType::Timestamp,
            ColumnType::Boolean => detected == ColumnType::Boolean,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    Full,
    Incremental,
    Skip,
}

impl SyncStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStrategy::Full => "full",
            SyncStrategy::Incremental => "incremental",
            SyncStrategy::Skip => "skip",
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row ready for insertion: the expanded record plus its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRow {
    pub hash: String,
    pub fields: Record,
}

/// Persisted per-(database, table) cursor that makes passes resumable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeTracker {
    pub id: Uuid,
    pub database_name: String,
    pub table_name: String,
    pub last_processed_key: Option<String>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub total_remote_count: i64,
    pub processed_count: i64,
    pub primary_key_column: String,
    pub timestamp_column: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangeTracker {
    pub fn new(
        database_name: impl Into<String>,
        table_name: impl Into<String>,
        primary_key_column: impl Into<String>,
        timestamp_column: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            database_name: database_name.into(),
            table_name: table_name.into(),
            last_processed_key: None,
            last_processed_at: None,
            last_checked_at: None,
            total_remote_count: 0,
            processed_count: 0,
            primary_key_column: primary_key_column.into(),
            timestamp_column,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once at least one full or incremental pass has been recorded.
    pub fn has_synced(&self) -> bool {
        self.last_processed_at.is_some()
    }

    pub fn record_skip(&mut self, now: DateTime<Utc>) {
        self.last_checked_at = Some(now);
        self.updated_at = now;
    }

    pub fn record_full(
        &mut self,
        remote_total: i64,
        inserted: i64,
        last_key: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.total_remote_count = remote_total;
        self.processed_count = inserted;
        self.last_processed_key = last_key;
        self.last_processed_at = Some(now);
        self.last_checked_at = Some(now);
        self.updated_at = now;
    }

    pub fn record_incremental(
        &mut self,
        remote_total: i64,
        inserted: i64,
        max_key: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.total_remote_count = remote_total;
        self.processed_count += inserted;
        self.last_processed_key = max_key_text(self.last_processed_key.take(), max_key);
        self.last_processed_at = Some(now);
        self.last_checked_at = Some(now);
        self.updated_at = now;
    }
}

/// Last-write-wins reporting row for monitoring collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub base_url: String,
    pub collection_name: String,
    pub table_name: String,
    pub last_check_time: DateTime<Utc>,
    pub records_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub database: String,
    pub collection: String,
    pub table: String,
    pub strategy: Option<SyncStrategy>,
    pub records_fetched: usize,
    pub rows_expanded: usize,
    pub rows_inserted: u64,
    pub rows_skipped: u64,
    pub columns_added: Vec<String>,
    pub last_processed_key: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl SyncResult {
    pub fn new(database: &str, collection: &str, table: &str) -> Self {
        Self {
            database: database.to_string(),
            collection: collection.to_string(),
            table: table.to_string(),
            strategy: None,
            records_fetched: 0,
            rows_expanded: 0,
            rows_inserted: 0,
            rows_skipped: 0,
            columns_added: Vec::new(),
            last_processed_key: None,
            duration_ms: 0,
            error: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub source: String,
    pub base_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovery_error: Option<String>,
    pub results: Vec<SyncResult>,
}

impl PassSummary {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_failure()).count()
    }

    pub fn inserted(&self) -> u64 {
        self.results.iter().map(|r| r.rows_inserted).sum()
    }
}

/// Renders a key value as cursor text. Objects, arrays and nulls have no key form.
pub fn key_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parses cursor text as an integer key; only integer keys are ordered for filtering.
pub fn integer_key(text: &str) -> Option<i64> {
    text.trim().parse::<i64>().ok()
}

/// Keeps the larger of two cursor values. Integer keys compare numerically, anything else
/// compares as text.
pub fn max_key_text(current: Option<String>, candidate: Option<String>) -> Option<String> {
    match (current, candidate) {
        (None, c) => c,
        (c, None) => c,
        (Some(a), Some(b)) => {
            let b_wins = match (integer_key(&a), integer_key(&b)) {
                (Some(x), Some(y)) => y > x,
                _ => b > a,
            };
            Some(if b_wins { b } else { a })
        }
    }
}
