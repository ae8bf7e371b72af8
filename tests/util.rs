use std::path::Path;

use rusqlite::Connection;
use rusqlite::types::ValueRef as SqliteValueRef;
use sqlcarve::{Database, Value};
use tempfile::NamedTempFile;

pub fn make_db<F: FnOnce(&Connection)>(f: F) -> NamedTempFile {
    let file = NamedTempFile::new().expect("create temp db file");
    init_db(file.path(), f);
    file
}

fn init_db<F: FnOnce(&Connection)>(path: &Path, f: F) {
    let conn = Connection::open(path).expect("open temp sqlite db");
    conn.execute_batch(
        "PRAGMA journal_mode=DELETE; PRAGMA synchronous=OFF; PRAGMA secure_delete=OFF;",
    )
    .expect("set sqlite pragmas");
    f(&conn);
    drop(conn);
}

#[allow(dead_code)]
pub fn open_db(file: &NamedTempFile) -> Database {
    Database::open(file.path()).expect("open database")
}

#[allow(dead_code)]
pub fn file_bytes(file: &NamedTempFile) -> Vec<u8> {
    std::fs::read(file.path()).expect("read database bytes")
}

#[allow(dead_code)]
pub fn root_page(conn: &Connection, name: &str) -> u32 {
    conn.query_row("SELECT rootpage FROM sqlite_schema WHERE name = ?1", [name], |row| row.get(0))
        .expect("query root page")
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowValue {
    Null,
    Integer(i64),
    Real(u64),
    Text(Vec<u8>),
    Blob(Vec<u8>),
}

#[allow(dead_code)]
pub fn row_value_from_sqlcarve(value: &Value) -> RowValue {
    match value {
        Value::Null => RowValue::Null,
        Value::Integer(v) => RowValue::Integer(*v),
        Value::Real(v) => RowValue::Real(normalized_real_bits(*v)),
        Value::Text(text) => RowValue::Text(text.bytes().to_vec()),
        Value::Blob(bytes) => RowValue::Blob(bytes.clone()),
    }
}

#[allow(dead_code)]
pub fn row_value_from_sqlite(value: SqliteValueRef<'_>) -> RowValue {
    match value {
        SqliteValueRef::Null => RowValue::Null,
        SqliteValueRef::Integer(v) => RowValue::Integer(v),
        SqliteValueRef::Real(v) => RowValue::Real(normalized_real_bits(v)),
        SqliteValueRef::Text(bytes) => RowValue::Text(bytes.to_vec()),
        SqliteValueRef::Blob(bytes) => RowValue::Blob(bytes.to_vec()),
    }
}

#[allow(dead_code)]
pub fn collect_sqlite_rows(conn: &Connection, query: &str) -> rusqlite::Result<Vec<Vec<RowValue>>> {
    let mut stmt = conn.prepare(query)?;
    let col_count = stmt.column_count();
    let mut rows_iter = stmt.query([])?;
    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut out = Vec::with_capacity(col_count);
        for idx in 0..col_count {
            out.push(row_value_from_sqlite(row.get_ref(idx)?));
        }
        rows.push(out);
    }
    Ok(rows)
}

/// Live rows of one table as `[rowid, columns...]`, in rowid order.
#[allow(dead_code)]
pub fn collect_sqlcarve_rows(db: &Database, table: &str) -> Vec<Vec<RowValue>> {
    let walk = db.walk(table).expect("table walk");
    walk.records
        .iter()
        .map(|entry| {
            let rowid = entry.key.rowid().expect("table rows carry a rowid");
            std::iter::once(RowValue::Integer(rowid))
                .chain(entry.record.values.iter().map(row_value_from_sqlcarve))
                .collect()
        })
        .collect()
}

#[allow(dead_code)]
fn normalized_real_bits(value: f64) -> u64 {
    if value == 0.0 {
        0.0f64.to_bits()
    } else if value.is_nan() {
        0x7ff8_0000_0000_0000
    } else {
        value.to_bits()
    }
}
