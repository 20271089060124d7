//! Column decoding helpers. Columns are read by name, so decoders survive
//! SELECT-list reordering, and every failure is classified as a
//! [`StoreError::CorruptRow`] naming the table and column it came from.

use crate::error::StoreError;

fn corrupt(table: &'static str, column: &'static str, detail: String) -> StoreError {
    StoreError::CorruptRow {
        table,
        column,
        detail,
    }
}

/// Read a required column by name.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(column)
        .map_err(|e| corrupt(table, column, e.to_string()))
}

/// Read a nullable column by name.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(column)
        .map_err(|e| corrupt(table, column, e.to_string()))
}

/// Decode a JSON TEXT column.
pub fn parse_json(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(table, column, format!("invalid JSON: {e}")))
}

/// Decode a JSON list-of-strings column (`completed_steps`, `chat_ids`).
pub fn parse_string_list(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(raw)
        .map_err(|e| corrupt(table, column, format!("invalid JSON list: {e}")))
}

/// Decode a TEXT enum column through its `FromStr`.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| corrupt(table, column, format!("unknown variant: {raw}")))
}
