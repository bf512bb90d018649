use anyhow::Result;
use krypton_misc::api::Value;
use log::debug;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};

use crate::db::sql::{Select, Update};
use crate::db::types::UserRecord;

use super::convert_values;

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS user (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    salt TEXT NOT NULL,
    admin INTEGER NOT NULL,
    active INTEGER NOT NULL,
    create_time INTEGER NOT NULL,
    last_login_time INTEGER NOT NULL
);
"#;

const FIELDS: [&str; 8] = [
    "id",
    "name",
    "password",
    "salt",
    "admin",
    "active",
    "create_time",
    "last_login_time",
];

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLE_SQL)?;
    Ok(())
}

pub fn create(tx: &Transaction, user: &UserRecord) -> Result<()> {
    let sql = r#"
    INSERT INTO user (id, name, password, salt, admin, active, create_time, last_login_time)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    "#;
    debug!("Database create_user: {}", user.name);
    tx.execute(
        sql,
        params![
            user.id,
            user.name,
            user.password,
            user.salt,
            user.admin,
            user.active,
            user.create_time,
            user.last_login_time,
        ],
    )?;

    Ok(())
}

pub fn get(tx: &Transaction, field: &'static str, value: &str) -> Result<Option<UserRecord>> {
    let mut select = Select::new(FIELDS.to_vec(), "user");
    select.add_where(format!("{field} = ?"), Value::Text(value.to_string()));

    let (sql, values) = select.build();
    let values = convert_values(values);

    debug!("Database get_user: {sql}, {values:?}");
    let mut stmt = tx.prepare(&sql)?;
    let user = stmt
        .query_row(params_from_iter(values), map_row)
        .optional()?;

    Ok(user)
}

pub fn has(tx: &Transaction, name: &str) -> Result<bool> {
    let mut select = Select::count("user");
    select.add_where("name = ?", Value::Text(name.to_string()));

    let (sql, values) = select.build();
    let values = convert_values(values);

    debug!("Database has_user: {sql}, {values:?}");
    let mut stmt = tx.prepare(&sql)?;
    let count: i64 = stmt.query_row(params_from_iter(values), |row| row.get(0))?;

    Ok(count > 0)
}

pub fn list(tx: &Transaction) -> Result<Vec<UserRecord>> {
    let mut select = Select::new(FIELDS.to_vec(), "user");
    select.add_order_by("create_time DESC");

    let (sql, values) = select.build();
    let values = convert_values(values);

    debug!("Database list_users: {sql}");
    let mut stmt = tx.prepare(&sql)?;
    let users = stmt
        .query_map(params_from_iter(values), map_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(users)
}

pub fn update_login(tx: &Transaction, id: &str, login_time: u64) -> Result<()> {
    let sql = "UPDATE user SET last_login_time = ? WHERE id = ?";
    debug!("Database update_user_login: {id}, {login_time}");
    tx.execute(sql, params![login_time, id])?;
    Ok(())
}

pub fn set_admin(tx: &Transaction, name: &str, admin: bool) -> Result<bool> {
    set_flag(tx, name, "admin", admin)
}

pub fn set_active(tx: &Transaction, name: &str, active: bool) -> Result<bool> {
    set_flag(tx, name, "active", active)
}

fn set_flag(tx: &Transaction, name: &str, field: &'static str, value: bool) -> Result<bool> {
    let mut update = Update::new("user");
    update.add_field(field, Value::Bool(value));
    update.add_where("name = ?", Value::Text(name.to_string()));

    let (sql, values) = update.build();
    let values = convert_values(values);

    debug!("Database set_user_flag: {sql}, {values:?}");
    let count = tx.execute(&sql, params_from_iter(values.iter()))?;
    Ok(count > 0)
}

pub fn delete(tx: &Transaction, name: &str) -> Result<bool> {
    let sql = "DELETE FROM user WHERE name = ?";
    debug!("Database delete_user: {sql}, {name}");
    let count = tx.execute(sql, params![name])?;
    Ok(count > 0)
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        password: row.get(2)?,
        salt: row.get(3)?,
        admin: row.get(4)?,
        active: row.get(5)?,
        create_time: row.get(6)?,
        last_login_time: row.get(7)?,
    })
}
