mod entry;
mod key;
mod user;

pub mod config;

use std::path::Path;

use anyhow::{Context, Result};
use krypton_misc::api::entry::ClipboardEntry;
use krypton_misc::api::key::ApiKey;
use krypton_misc::api::Value;
use rusqlite::types::Value as DbValue;
use rusqlite::Connection as DbConnection;
use rusqlite::Transaction as DbTransaction;

use super::types::{Connection, EntryQuery, Transaction, UserRecord};

pub struct SqliteConnection {
    conn: DbConnection,
}

pub struct SqliteTransaction<'a> {
    tx: DbTransaction<'a>,
}

impl SqliteConnection {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = DbConnection::open(path)
            .with_context(|| format!("open sqlite database {}", path.display()))?;
        let conn = SqliteConnection { conn };
        conn.init_tables()?;
        Ok(conn)
    }

    pub fn memory() -> Result<Self> {
        let conn = DbConnection::open_in_memory().context("open in-memory sqlite database")?;
        let conn = SqliteConnection { conn };
        conn.init_tables()?;
        Ok(conn)
    }

    fn init_tables(&self) -> Result<()> {
        user::create_table(&self.conn)?;
        key::create_table(&self.conn)?;
        entry::create_table(&self.conn)?;
        Ok(())
    }
}

impl<'a> Connection<'a, SqliteTransaction<'a>> for SqliteConnection {
    fn transaction(&'a mut self) -> Result<SqliteTransaction<'a>> {
        let tx = self.conn.transaction()?;
        Ok(SqliteTransaction { tx })
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn create_user(&self, user: &UserRecord) -> Result<()> {
        user::create(&self.tx, user)
    }

    fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        user::get(&self.tx, "id", id)
    }

    fn get_user_by_name(&self, name: &str) -> Result<Option<UserRecord>> {
        user::get(&self.tx, "name", name)
    }

    fn has_user(&self, name: &str) -> Result<bool> {
        user::has(&self.tx, name)
    }

    fn list_users(&self) -> Result<Vec<UserRecord>> {
        user::list(&self.tx)
    }

    fn update_user_login(&self, id: &str, login_time: u64) -> Result<()> {
        user::update_login(&self.tx, id, login_time)
    }

    fn set_user_admin(&self, name: &str, admin: bool) -> Result<bool> {
        user::set_admin(&self.tx, name, admin)
    }

    fn set_user_active(&self, name: &str, active: bool) -> Result<bool> {
        user::set_active(&self.tx, name, active)
    }

    fn delete_user(&self, name: &str) -> Result<bool> {
        user::delete(&self.tx, name)
    }

    fn create_api_key(&self, key: &ApiKey) -> Result<()> {
        key::create(&self.tx, key)
    }

    fn get_api_key_by_value(&self, value: &str) -> Result<Option<ApiKey>> {
        key::get_by_value(&self.tx, value)
    }

    fn touch_api_key(&self, id: &str, used_time: u64) -> Result<()> {
        key::touch(&self.tx, id, used_time)
    }

    fn revoke_api_key(&self, id: &str) -> Result<bool> {
        key::revoke(&self.tx, id)
    }

    fn list_api_keys(&self, user_id: Option<&str>) -> Result<Vec<ApiKey>> {
        key::list(&self.tx, user_id)
    }

    fn create_entry(&self, entry: &ClipboardEntry) -> Result<()> {
        entry::create(&self.tx, entry)
    }

    fn get_entry(&self, user_id: &str, id: &str) -> Result<Option<ClipboardEntry>> {
        entry::get(&self.tx, user_id, id)
    }

    fn count_entries(&self, query: &EntryQuery) -> Result<u64> {
        entry::count(&self.tx, query)
    }

    fn get_entries(&self, query: &EntryQuery) -> Result<Vec<ClipboardEntry>> {
        entry::list(&self.tx, query)
    }

    fn update_entry_time(&self, user_id: &str, id: &str, create_time: u64) -> Result<bool> {
        entry::update_time(&self.tx, user_id, id, create_time)
    }

    fn delete_entry(&self, user_id: &str, id: &str) -> Result<bool> {
        entry::delete(&self.tx, user_id, id)
    }

    fn delete_entries(&self, ids: Vec<String>) -> Result<u64> {
        entry::delete_batch(&self.tx, ids)
    }

    fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .context("failed to commit sqlite transaction")
    }

    fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .context("failed to rollback sqlite transaction")
    }
}

pub fn convert_values(values: Vec<Value>) -> Vec<DbValue> {
    values
        .into_iter()
        .map(|v| match v {
            Value::Text(text) => DbValue::Text(text),
            Value::Integer(int) => DbValue::Integer(int as i64),
            Value::Bool(b) => DbValue::Integer(b as i64),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use crate::db::tests::run_tests;
    use crate::db::{Database, UnionConnection};

    use super::*;

    #[test]
    fn test_memory() {
        let conn = SqliteConnection::memory().unwrap();
        let db = Database::new(UnionConnection::Sqlite(conn));

        run_tests(&db);
    }

    #[test]
    fn test_file() {
        fs::create_dir_all("testdata").unwrap();
        let path = PathBuf::from("testdata/sqlite.db");
        let _ = fs::remove_file(&path);

        let conn = SqliteConnection::open(&path).unwrap();
        let db = Database::new(UnionConnection::Sqlite(conn));

        run_tests(&db);
    }
}
