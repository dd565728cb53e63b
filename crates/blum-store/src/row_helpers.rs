use crate::error::StoreError;

/// Get a required column value from a row, returning `CorruptRow` on failure.
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

/// Read an `INTEGER` version column as `u64`.
pub fn get_version(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
) -> Result<u64, StoreError> {
    let raw: i64 = get(row, idx, table, "version")?;
    u64::try_from(raw).map_err(|_| StoreError::CorruptRow {
        table,
        column: "version",
        detail: format!("negative version {raw}"),
    })
}

/// Convert a version for binding as an `SQLite` integer.
pub fn version_param(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::Database(format!("version {version} exceeds SQLite range")))
}
