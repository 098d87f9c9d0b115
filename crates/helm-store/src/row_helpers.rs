use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON text column into `T`, returning CorruptRow on failure.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}
