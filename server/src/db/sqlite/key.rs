use anyhow::Result;
use krypton_misc::api::key::ApiKey;
use krypton_misc::api::Value;
use log::debug;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};

use crate::db::sql::Select;

use super::convert_values;

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS api_key (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    key TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    create_time INTEGER NOT NULL,
    last_used_time INTEGER NOT NULL,
    expire_time INTEGER NOT NULL,
    revoked INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_api_key_user ON api_key(user_id);
"#;

const FIELDS: [&str; 8] = [
    "id",
    "user_id",
    "key",
    "name",
    "create_time",
    "last_used_time",
    "expire_time",
    "revoked",
];

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLE_SQL)?;
    Ok(())
}

pub fn create(tx: &Transaction, key: &ApiKey) -> Result<()> {
    let sql = r#"
    INSERT INTO api_key (id, user_id, key, name, create_time, last_used_time, expire_time, revoked)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    "#;
    debug!("Database create_api_key: {} for {}", key.name, key.user_id);
    tx.execute(
        sql,
        params![
            key.id,
            key.user_id,
            key.key,
            key.name,
            key.create_time,
            key.last_used_time,
            key.expire_time,
            key.revoked,
        ],
    )?;

    Ok(())
}

pub fn get_by_value(tx: &Transaction, value: &str) -> Result<Option<ApiKey>> {
    let mut select = Select::new(FIELDS.to_vec(), "api_key");
    select.add_where("key = ?", Value::Text(value.to_string()));

    let (sql, values) = select.build();
    let values = convert_values(values);

    debug!("Database get_api_key_by_value");
    let mut stmt = tx.prepare(&sql)?;
    let key = stmt
        .query_row(params_from_iter(values), map_row)
        .optional()?;

    Ok(key)
}

pub fn touch(tx: &Transaction, id: &str, used_time: u64) -> Result<()> {
    let sql = "UPDATE api_key SET last_used_time = ? WHERE id = ?";
    debug!("Database touch_api_key: {id}, {used_time}");
    tx.execute(sql, params![used_time, id])?;
    Ok(())
}

pub fn revoke(tx: &Transaction, id: &str) -> Result<bool> {
    let sql = "UPDATE api_key SET revoked = 1 WHERE id = ?";
    debug!("Database revoke_api_key: {id}");
    let count = tx.execute(sql, params![id])?;
    Ok(count > 0)
}

pub fn list(tx: &Transaction, user_id: Option<&str>) -> Result<Vec<ApiKey>> {
    let mut select = Select::new(FIELDS.to_vec(), "api_key");
    if let Some(user_id) = user_id {
        select.add_where("user_id = ?", Value::Text(user_id.to_string()));
    }
    select.add_order_by("create_time DESC");

    let (sql, values) = select.build();
    let values = convert_values(values);

    debug!("Database list_api_keys: {sql}, {values:?}");
    let mut stmt = tx.prepare(&sql)?;
    let keys = stmt
        .query_map(params_from_iter(values), map_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(keys)
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key: row.get(2)?,
        name: row.get(3)?,
        create_time: row.get(4)?,
        last_used_time: row.get(5)?,
        expire_time: row.get(6)?,
        revoked: row.get(7)?,
    })
}
