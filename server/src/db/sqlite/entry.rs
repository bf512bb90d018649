use anyhow::Result;
use krypton_misc::api::entry::{ClipboardEntry, ContentType};
use krypton_misc::api::Value;
use log::debug;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};

use crate::db::sql::Select;
use crate::db::types::EntryQuery;

use super::convert_values;

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS entry (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    content_type INTEGER NOT NULL,
    content BLOB NOT NULL,
    preview TEXT NOT NULL,
    hash TEXT NOT NULL,
    source_device TEXT DEFAULT NULL,
    create_time INTEGER NOT NULL,
    external_path TEXT DEFAULT NULL
);

CREATE INDEX IF NOT EXISTS idx_entry_user_time ON entry(user_id, create_time DESC);
CREATE INDEX IF NOT EXISTS idx_entry_hash ON entry(hash);
"#;

const FIELDS: [&str; 9] = [
    "id",
    "user_id",
    "content_type",
    "content",
    "preview",
    "hash",
    "source_device",
    "create_time",
    "external_path",
];

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLE_SQL)?;
    Ok(())
}

pub fn create(tx: &Transaction, entry: &ClipboardEntry) -> Result<()> {
    let sql = r#"
    INSERT INTO entry (id, user_id, content_type, content, preview, hash, source_device, create_time, external_path)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#;
    debug!("Database create_entry: {} for {}", entry.id, entry.user_id);
    tx.execute(
        sql,
        params![
            entry.id,
            entry.user_id,
            entry.content_type.to_code(),
            entry.content,
            entry.preview,
            entry.hash,
            entry.source_device,
            entry.create_time,
            entry.external_path,
        ],
    )?;

    Ok(())
}

pub fn get(tx: &Transaction, user_id: &str, id: &str) -> Result<Option<ClipboardEntry>> {
    let mut select = Select::new(FIELDS.to_vec(), "entry");
    select.add_where("id = ?", Value::Text(id.to_string()));
    select.add_where("user_id = ?", Value::Text(user_id.to_string()));

    let (sql, values) = select.build();
    let values = convert_values(values);

    debug!("Database get_entry: {sql}, {values:?}");
    let mut stmt = tx.prepare(&sql)?;
    let entry = stmt
        .query_row(params_from_iter(values), map_row)
        .optional()?;

    Ok(entry)
}

pub fn count(tx: &Transaction, query: &EntryQuery) -> Result<u64> {
    let (sql, values) = build_select_sql(true, query);
    debug!("Database count_entries: {sql}, {values:?}");

    let mut stmt = tx.prepare(&sql)?;
    let count: i64 = stmt.query_row(params_from_iter(values), |row| row.get(0))?;

    Ok(count as u64)
}

pub fn list(tx: &Transaction, query: &EntryQuery) -> Result<Vec<ClipboardEntry>> {
    let (sql, values) = build_select_sql(false, query);
    debug!("Database get_entries: {sql}, {values:?}");

    let mut stmt = tx.prepare(&sql)?;
    let entries = stmt
        .query_map(params_from_iter(values), map_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

pub fn update_time(tx: &Transaction, user_id: &str, id: &str, create_time: u64) -> Result<bool> {
    let sql = "UPDATE entry SET create_time = ? WHERE id = ? AND user_id = ?";
    debug!("Database update_entry_time: {id}, {create_time}");
    let count = tx.execute(sql, params![create_time, id, user_id])?;
    Ok(count > 0)
}

pub fn delete(tx: &Transaction, user_id: &str, id: &str) -> Result<bool> {
    let sql = "DELETE FROM entry WHERE id = ? AND user_id = ?";
    debug!("Database delete_entry: {sql}, {id}");
    let count = tx.execute(sql, params![id, user_id])?;
    Ok(count > 0)
}

pub fn delete_batch(tx: &Transaction, ids: Vec<String>) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!("DELETE FROM entry WHERE id IN ({})", placeholders);
    debug!("Database delete_entry_batch: {sql}, {ids:?}");
    let count = tx.execute(&sql, params_from_iter(ids.iter()))?;
    Ok(count as u64)
}

fn build_select_sql(count: bool, query: &EntryQuery) -> (String, Vec<rusqlite::types::Value>) {
    let mut select = if count {
        Select::count("entry")
    } else {
        Select::new(FIELDS.to_vec(), "entry")
    };

    if let Some(ref user_id) = query.user_id {
        select.add_where("user_id = ?", Value::Text(user_id.clone()));
    }

    if let Some(ref search) = query.search {
        let search = format!("%{search}%");
        select.add_where("preview LIKE ?", Value::Text(search));
    }

    if let Some(create_before) = query.create_before {
        select.add_where("create_time < ?", Value::Integer(create_before));
    }

    if let Some(content_type) = query.content_type {
        select.add_where("content_type = ?", Value::Integer(content_type as u64));
    }

    select.add_order_by("create_time DESC");
    select.set_page(query.limit, query.offset);

    let (sql, values) = select.build();
    let values = convert_values(values);

    (sql, values)
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<ClipboardEntry> {
    Ok(ClipboardEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content_type: parse_content_type(row.get(2)?),
        content: row.get(3)?,
        preview: row.get(4)?,
        hash: row.get(5)?,
        source_device: row.get(6)?,
        create_time: row.get(7)?,
        external_path: row.get(8)?,
    })
}

fn parse_content_type(code: u32) -> ContentType {
    match ContentType::parse_code(code) {
        Ok(content_type) => content_type,
        Err(_) => ContentType::Text,
    }
}
