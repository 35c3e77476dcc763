//! Record reshaping, identifier normalization, type inference and content hashing.

use std::collections::BTreeMap;

use odsync_core::{ColumnType, OutputRow, Record};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::debug;

pub const CRATE_NAME: &str = "odsync-normalize";

/// Field names under which a record may carry its detail lines.
pub const DETAIL_ALIASES: &[&str] = &["RecordSet", "Recordset", "recordset"];

pub const DEFAULT_SAMPLE_ROWS: usize = 200;

/// PostgreSQL truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Columns every destination table owns; source fields with these names get a `src_` prefix.
pub const SYSTEM_COLUMNS: &[&str] = &["id", "hash", "created_at"];

const KEY_CANDIDATES: &[&str] = &["id", "ref_key", "key", "code", "number"];

static ISO_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[0-9]{4}-[0-9]{2}-[0-9]{2}(?:[T ][0-9]{2}:[0-9]{2}:[0-9]{2}(?:\.[0-9]+)?(?:Z|[+-][0-9]{2}:?[0-9]{2})?)?$",
    )
    .expect("timestamp pattern is valid")
});

static NUMERIC_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?(?:[0-9]+\.[0-9]+|[0-9]+)$").expect("numeric pattern is valid"));

/// Splits records carrying detail lines into one row per line.
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    aliases: Vec<String>,
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new(DETAIL_ALIASES.iter().map(|s| s.to_string()).collect())
    }
}

impl RecordNormalizer {
    pub fn new(aliases: Vec<String>) -> Self {
        Self { aliases }
    }

    /// Expands one record. Parent fields are copied into every detail row and the detail
    /// row's own fields win on collision. Records without detail lines yield themselves
    /// with every alias key removed.
    pub fn expand(&self, record: &JsonValue) -> Vec<Record> {
        let mut parent = match record {
            JsonValue::Object(map) => map.clone(),
            other => {
                let mut wrapped = Record::new();
                wrapped.insert("value".to_string(), other.clone());
                return vec![wrapped];
            }
        };

        let mut details = None;
        for alias in &self.aliases {
            if let Some(value) = parent.remove(alias) {
                if details.is_none() {
                    if let JsonValue::Array(items) = value {
                        if !items.is_empty() {
                            details = Some(items);
                        }
                    }
                }
            }
        }

        let Some(items) = details else {
            return vec![parent];
        };

        items
            .into_iter()
            .map(|item| {
                let mut row = parent.clone();
                match item {
                    JsonValue::Object(fields) => {
                        for (k, v) in fields {
                            row.insert(k, v);
                        }
                    }
                    other => {
                        row.insert("value".to_string(), other);
                    }
                }
                row
            })
            .collect()
    }

    pub fn expand_all(&self, records: &[JsonValue]) -> Vec<Record> {
        records.iter().flat_map(|r| self.expand(r)).collect()
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || ('\u{0400}'..='\u{04FF}').contains(&c)
}

/// Folds a source name into a storage-safe identifier: ASCII alphanumerics and Cyrillic
/// are kept, every other run of characters becomes one `_`, edges are trimmed and the
/// result is lowercased. Overlong names keep a prefix plus a short digest of the full name.
pub fn normalize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.chars() {
        if is_identifier_char(c) {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }

    if out.len() <= MAX_IDENTIFIER_BYTES {
        return out;
    }

    let digest = sha256_hex(out.as_bytes());
    let mut cut = 0;
    for (idx, c) in out.char_indices() {
        if idx + c.len_utf8() > MAX_IDENTIFIER_BYTES - 9 {
            break;
        }
        cut = idx + c.len_utf8();
    }
    let prefix = out[..cut].trim_end_matches('_');
    format!("{prefix}_{}", &digest[..8])
}

/// Destination column for a source field, or `None` when nothing storable is left.
pub fn storage_column_name(raw: &str) -> Option<String> {
    let name = normalize_identifier(raw);
    if name.is_empty() {
        return None;
    }
    if SYSTEM_COLUMNS.contains(&name.as_str()) {
        return Some(format!("src_{name}"));
    }
    Some(name)
}

pub fn table_name_for(prefix: &str, collection: &str) -> String {
    normalize_identifier(&format!("{prefix}{collection}"))
}

pub fn detect_type(value: &JsonValue) -> ColumnType {
    match value {
        JsonValue::Null => ColumnType::Text,
        JsonValue::Bool(_) => ColumnType::Boolean,
        JsonValue::Number(_) => ColumnType::Numeric,
        JsonValue::Object(_) | JsonValue::Array(_) => ColumnType::Structured,
        JsonValue::String(s) => {
            let s = s.trim();
            if ISO_TIMESTAMP.is_match(s) {
                ColumnType::Timestamp
            } else if NUMERIC_TEXT.is_match(s) {
                ColumnType::Numeric
            } else {
                ColumnType::Text
            }
        }
    }
}

/// Infers a type per destination column. Types come from at most `sample_limit` leading
/// rows, where disagreements resolve to the more permissive type. Every column present in
/// any row is returned. A column first seen after the sample takes the type of its first
/// non-null value, or TEXT when it is only ever null.
pub fn infer_types(rows: &[Record], sample_limit: usize) -> BTreeMap<String, ColumnType> {
    let mut types: BTreeMap<String, ColumnType> = BTreeMap::new();
    for row in rows.iter().take(sample_limit) {
        for (raw_key, value) in row {
            let Some(column) = storage_column_name(raw_key) else {
                continue;
            };
            let detected = detect_type(value);
            types
                .entry(column)
                .and_modify(|current| {
                    if *current != detected {
                        let widened = current.widen(detected);
                        debug!(field = %raw_key, from = %current, seen = %detected, to = %widened, "resolved column type conflict");
                        *current = widened;
                    }
                })
                .or_insert(detected);
        }
    }

    let mut late: BTreeMap<String, Option<ColumnType>> = BTreeMap::new();
    for row in rows.iter().skip(sample_limit) {
        for (raw_key, value) in row {
            let Some(column) = storage_column_name(raw_key) else {
                continue;
            };
            if types.contains_key(&column) {
                continue;
            }
            let slot = late.entry(column).or_insert(None);
            if slot.is_none() && !value.is_null() {
                *slot = Some(detect_type(value));
            }
        }
    }
    for (column, detected) in late {
        debug!(column = %column, "column first seen after the inference sample");
        types.insert(column, detected.unwrap_or(ColumnType::Text));
    }
    types
}

/// Finds the value feeding `column`: exact name, then any field normalizing to it, then a
/// case-insensitive match that ignores underscores.
pub fn bind_field<'a>(row: &'a Record, column: &str) -> Option<&'a JsonValue> {
    if let Some(v) = row.get(column) {
        return Some(v);
    }
    if let Some(v) = row
        .iter()
        .find(|(k, _)| storage_column_name(k).as_deref() == Some(column))
        .map(|(_, v)| v)
    {
        return Some(v);
    }
    let folded = fold_name(column);
    row.iter()
        .find(|(k, _)| fold_name(k) == folded)
        .map(|(_, v)| v)
}

fn fold_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// JSON text with object keys sorted at every depth.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn row_hash(row: &Record) -> String {
    let mut out = String::new();
    write_canonical_record(row, &mut out);
    sha256_hex(out.as_bytes())
}

fn write_canonical_record(row: &Record, out: &mut String) {
    let mut keys: Vec<&String> = row.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&JsonValue::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&row[key], out);
    }
    out.push('}');
}

pub fn hash_rows(rows: Vec<Record>) -> Vec<OutputRow> {
    rows.into_iter()
        .map(|fields| OutputRow {
            hash: row_hash(&fields),
            fields,
        })
        .collect()
}

/// Picks the source field used as the cursor key. A declared key always wins; otherwise the
/// first conventional identifier name present in the sample, else `id`.
pub fn detect_key_column(rows: &[Record], declared: Option<&str>) -> String {
    if let Some(declared) = declared.filter(|d| !d.trim().is_empty()) {
        return declared.to_string();
    }
    for candidate in KEY_CANDIDATES {
        for row in rows.iter().take(DEFAULT_SAMPLE_ROWS) {
            if let Some(name) = row.keys().find(|k| k.eq_ignore_ascii_case(candidate)) {
                return name.clone();
            }
        }
    }
    "id".to_string()
}

pub fn detect_timestamp_column(rows: &[Record]) -> Option<String> {
    let first = rows.first()?;
    first
        .iter()
        .find(|(name, value)| {
            let lower = name.to_lowercase();
            lower.contains("date")
                || lower.contains("time")
                || detect_type(value) == ColumnType::Timestamp
        })
        .map(|(name, _)| name.clone())
}

/// Reads the cursor key of a row through the tolerant binding rules.
pub fn record_key(row: &Record, key_column: &str) -> Option<String> {
    bind_field(row, key_column)
        .or_else(|| {
            storage_column_name(key_column).and_then(|col| bind_field(row, &col))
        })
        .and_then(odsync_core::key_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: JsonValue) -> Record {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn detail_lines_expand_into_rows() {
        let normalizer = RecordNormalizer::default();
        let rows = normalizer.expand(&json!({"A": 1, "RecordSet": [{"x": 1}, {"x": 2}]}));
        assert_eq!(rows, vec![rec(json!({"A": 1, "x": 1})), rec(json!({"A": 1, "x": 2}))]);
    }

    #[test]
    fn record_without_details_is_kept_minus_aliases() {
        let normalizer = RecordNormalizer::default();
        assert_eq!(
            normalizer.expand(&json!({"A": 1, "B": "b"})),
            vec![rec(json!({"A": 1, "B": "b"}))]
        );
        assert_eq!(
            normalizer.expand(&json!({"A": 1, "Recordset": [], "recordset": null})),
            vec![rec(json!({"A": 1}))]
        );
    }

    #[test]
    fn detail_fields_win_on_collision() {
        let normalizer = RecordNormalizer::default();
        let rows = normalizer.expand(&json!({
            "Number": "0001",
            "Sum": 10,
            "recordset": [{"Sum": 3, "LineNumber": 1}]
        }));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Sum"], json!(3));
        assert_eq!(rows[0]["Number"], json!("0001"));
        assert!(!rows[0].contains_key("recordset"));
    }

    #[test]
    fn identifiers_keep_cyrillic_and_collapse_punctuation() {
        assert_eq!(normalize_identifier("Организация_Key"), "организация_key");
        assert_eq!(normalize_identifier("__Ref  Key--(x)__"), "ref_key_x");
        assert_eq!(normalize_identifier("AccountDr_Key"), "accountdr_key");
        assert_eq!(normalize_identifier("@odata.etag"), "odata_etag");
        assert_eq!(normalize_identifier("!!!"), "");
    }

    #[test]
    fn long_identifiers_are_bounded_and_distinct() {
        let a = normalize_identifier(&"СтруктурнаяЕдиницаDr_Key".repeat(4));
        let b = normalize_identifier(&"СтруктурнаяЕдиницаCr_Key".repeat(4));
        assert!(a.len() <= MAX_IDENTIFIER_BYTES);
        assert!(b.len() <= MAX_IDENTIFIER_BYTES);
        assert_ne!(a, b);
        assert_eq!(a, normalize_identifier(&"СтруктурнаяЕдиницаDr_Key".repeat(4)));
    }

    #[test]
    fn system_columns_are_not_shadowed() {
        assert_eq!(storage_column_name("ID").as_deref(), Some("src_id"));
        assert_eq!(storage_column_name("Hash").as_deref(), Some("src_hash"));
        assert_eq!(storage_column_name("Ref_Key").as_deref(), Some("ref_key"));
        assert_eq!(storage_column_name("--"), None);
    }

    #[test]
    fn table_names_are_prefixed_and_normalized() {
        assert_eq!(table_name_for("odata_", "Catalog_Номенклатура"), "odata_catalog_номенклатура");
        assert_eq!(table_name_for("odata_", "Document.Sales Order"), "odata_document_sales_order");
    }

    #[test]
    fn values_are_detected_by_shape() {
        assert_eq!(detect_type(&JsonValue::Null), ColumnType::Text);
        assert_eq!(detect_type(&json!(true)), ColumnType::Boolean);
        assert_eq!(detect_type(&json!(1.5)), ColumnType::Numeric);
        assert_eq!(detect_type(&json!({"a": 1})), ColumnType::Structured);
        assert_eq!(detect_type(&json!([1])), ColumnType::Structured);
        assert_eq!(detect_type(&json!("2024-01-31")), ColumnType::Timestamp);
        assert_eq!(detect_type(&json!("2024-01-31T10:20:30")), ColumnType::Timestamp);
        assert_eq!(detect_type(&json!("2024-01-31 10:20:30.123+0300")), ColumnType::Timestamp);
        assert_eq!(detect_type(&json!(" -42.50 ")), ColumnType::Numeric);
        assert_eq!(detect_type(&json!("42a")), ColumnType::Text);
        assert_eq!(detect_type(&json!("2024-01-31T10:20")), ColumnType::Text);
    }

    #[test]
    fn inference_resolves_conflicts_by_precedence() {
        let rows = vec![
            rec(json!({"Amount": "10", "Flag": true, "Data": "2024-01-01", "Note": null})),
            rec(json!({"Amount": "n/a", "Flag": "yes", "Data": {"k": 1}, "Note": false})),
        ];
        let types = infer_types(&rows, DEFAULT_SAMPLE_ROWS);
        assert_eq!(types["amount"], ColumnType::Numeric);
        assert_eq!(types["flag"], ColumnType::Text);
        assert_eq!(types["data"], ColumnType::Structured);
        assert_eq!(types["note"], ColumnType::Text);
    }

    #[test]
    fn inference_samples_types_but_keeps_every_column() {
        let mut rows: Vec<Record> = (0..5).map(|i| rec(json!({"n": i}))).collect();
        rows.push(rec(json!({"n": "not a number", "late": null, "Total": null})));
        rows.push(rec(json!({"late": "x", "Total": "12.5"})));
        let types = infer_types(&rows, 5);
        // Rows past the sample do not widen sampled columns.
        assert_eq!(types["n"], ColumnType::Numeric);
        assert_eq!(types["late"], ColumnType::Text);
        assert_eq!(types["total"], ColumnType::Numeric);

        let only_null = vec![rec(json!({"n": 1})), rec(json!({"n": 2, "gone": null}))];
        assert_eq!(infer_types(&only_null, 1)["gone"], ColumnType::Text);
    }

    #[test]
    fn hash_ignores_field_order() {
        let a: Record = rec(serde_json::from_str(r#"{"b":2,"a":1,"n":{"y":[1,{"q":1,"p":2}],"x":0}}"#).unwrap());
        let mut b = Record::new();
        b.insert("n".into(), json!({"x": 0, "y": [1, {"p": 2, "q": 1}]}));
        b.insert("a".into(), json!(1));
        b.insert("b".into(), json!(2));
        assert_eq!(row_hash(&a), row_hash(&b));
        assert_eq!(canonical_json(&json!({"b": 1, "a": [true, null]})), r#"{"a":[true,null],"b":1}"#);
    }

    #[test]
    fn hash_changes_with_content() {
        assert_ne!(row_hash(&rec(json!({"a": 1}))), row_hash(&rec(json!({"a": 2}))));
        assert_ne!(row_hash(&rec(json!({"a": 1}))), row_hash(&rec(json!({"a": "1"}))));
    }

    #[test]
    fn binding_tolerates_case_variants() {
        let row = rec(json!({"Ref_Key": "k1", "КоличествоDr": 5, "RecorderType": "Doc"}));
        assert_eq!(bind_field(&row, "ref_key"), Some(&json!("k1")));
        assert_eq!(bind_field(&row, "количествоdr"), Some(&json!(5)));
        assert_eq!(bind_field(&row, "recorder_type"), Some(&json!("Doc")));
        assert_eq!(bind_field(&row, "missing"), None);
    }

    #[test]
    fn key_and_timestamp_columns_are_detected() {
        let rows = vec![rec(json!({"Description": "x", "Ref_Key": "a", "Date": "2024-01-01"}))];
        assert_eq!(detect_key_column(&rows, None), "Ref_Key");
        assert_eq!(detect_key_column(&rows, Some("Code")), "Code");
        assert_eq!(detect_key_column(&[rec(json!({"x": 1}))], None), "id");
        assert_eq!(detect_timestamp_column(&rows).as_deref(), Some("Date"));
        assert_eq!(record_key(&rows[0], "ref_key").as_deref(), Some("a"));
    }
}
