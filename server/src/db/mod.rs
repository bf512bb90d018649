mod sql;
mod sqlite;

#[cfg(test)]
mod tests;

pub mod config;
pub mod types;

use std::cell::RefCell;
use std::sync::Mutex;

use anyhow::{bail, Result};
use krypton_misc::api::entry::ClipboardEntry;
use krypton_misc::api::key::ApiKey;
use krypton_misc::api::user::User;
use sqlite::{SqliteConnection, SqliteTransaction};
use types::{Connection, EntryQuery, Transaction, UserRecord};

/// Serialized access to the underlying store. Handlers run short
/// transactions through [`Database::with_transaction`]; the mutex makes
/// the embedded connection safe to share between tasks.
pub struct Database {
    conn: Mutex<RefCell<UnionConnection>>,
}

impl Database {
    pub fn new(conn: UnionConnection) -> Self {
        Self {
            conn: Mutex::new(RefCell::new(conn)),
        }
    }

    #[cfg(test)]
    pub fn new_test() -> Self {
        let conn = SqliteConnection::memory().unwrap();
        Self::new(UnionConnection::Sqlite(conn))
    }

    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Transaction) -> Result<T>,
    {
        let conn = match self.conn.lock() {
            Ok(conn) => conn,
            Err(e) => bail!("failed to lock connection: {:#}", e),
        };
        let mut conn = conn.borrow_mut();
        let tx = conn.transaction()?;

        let result = f(&tx);

        if result.is_ok() {
            tx.commit()
        } else {
            tx.rollback()
        }?;

        result
    }
}

pub enum UnionConnection {
    Sqlite(SqliteConnection),
}

pub enum UnionTransaction<'a> {
    Sqlite(SqliteTransaction<'a>),
}

impl<'a> Connection<'a, UnionTransaction<'a>> for UnionConnection {
    fn transaction(&'a mut self) -> Result<UnionTransaction<'a>> {
        match self {
            UnionConnection::Sqlite(conn) => conn.transaction().map(UnionTransaction::Sqlite),
        }
    }
}

impl Transaction for UnionTransaction<'_> {
    fn create_user(&self, user: &UserRecord) -> Result<()> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.create_user(user),
        }
    }

    fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.get_user(id),
        }
    }

    fn get_user_by_name(&self, name: &str) -> Result<Option<UserRecord>> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.get_user_by_name(name),
        }
    }

    fn has_user(&self, name: &str) -> Result<bool> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.has_user(name),
        }
    }

    fn list_users(&self) -> Result<Vec<UserRecord>> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.list_users(),
        }
    }

    fn update_user_login(&self, id: &str, login_time: u64) -> Result<()> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.update_user_login(id, login_time),
        }
    }

    fn set_user_admin(&self, name: &str, admin: bool) -> Result<bool> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.set_user_admin(name, admin),
        }
    }

    fn set_user_active(&self, name: &str, active: bool) -> Result<bool> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.set_user_active(name, active),
        }
    }

    fn delete_user(&self, name: &str) -> Result<bool> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.delete_user(name),
        }
    }

    fn create_api_key(&self, key: &ApiKey) -> Result<()> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.create_api_key(key),
        }
    }

    fn get_api_key_by_value(&self, value: &str) -> Result<Option<ApiKey>> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.get_api_key_by_value(value),
        }
    }

    fn touch_api_key(&self, id: &str, used_time: u64) -> Result<()> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.touch_api_key(id, used_time),
        }
    }

    fn revoke_api_key(&self, id: &str) -> Result<bool> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.revoke_api_key(id),
        }
    }

    fn list_api_keys(&self, user_id: Option<&str>) -> Result<Vec<ApiKey>> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.list_api_keys(user_id),
        }
    }

    fn create_entry(&self, entry: &ClipboardEntry) -> Result<()> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.create_entry(entry),
        }
    }

    fn get_entry(&self, user_id: &str, id: &str) -> Result<Option<ClipboardEntry>> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.get_entry(user_id, id),
        }
    }

    fn count_entries(&self, query: &EntryQuery) -> Result<u64> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.count_entries(query),
        }
    }

    fn get_entries(&self, query: &EntryQuery) -> Result<Vec<ClipboardEntry>> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.get_entries(query),
        }
    }

    fn update_entry_time(&self, user_id: &str, id: &str, create_time: u64) -> Result<bool> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.update_entry_time(user_id, id, create_time),
        }
    }

    fn delete_entry(&self, user_id: &str, id: &str) -> Result<bool> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.delete_entry(user_id, id),
        }
    }

    fn delete_entries(&self, ids: Vec<String>) -> Result<u64> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.delete_entries(ids),
        }
    }

    fn commit(self) -> Result<()> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.commit(),
        }
    }

    fn rollback(self) -> Result<()> {
        match self {
            UnionTransaction::Sqlite(tx) => tx.rollback(),
        }
    }
}

/// Convenience wrapper used by handlers that only touch the public
/// [`User`] shape.
pub fn strip_users(records: Vec<UserRecord>) -> Vec<User> {
    records.iter().map(|r| r.to_user()).collect()
}
