use anyhow::Result;
use krypton_misc::api::entry::ClipboardEntry;
use krypton_misc::api::key::ApiKey;
use krypton_misc::api::user::User;

pub trait Connection<'a, T>
where
    T: Transaction + 'a,
{
    fn transaction(&'a mut self) -> Result<T>;
}

pub trait Transaction {
    fn create_user(&self, user: &UserRecord) -> Result<()>;
    fn get_user(&self, id: &str) -> Result<Option<UserRecord>>;
    fn get_user_by_name(&self, name: &str) -> Result<Option<UserRecord>>;
    fn has_user(&self, name: &str) -> Result<bool>;
    fn list_users(&self) -> Result<Vec<UserRecord>>;
    fn update_user_login(&self, id: &str, login_time: u64) -> Result<()>;
    fn set_user_admin(&self, name: &str, admin: bool) -> Result<bool>;
    fn set_user_active(&self, name: &str, active: bool) -> Result<bool>;
    fn delete_user(&self, name: &str) -> Result<bool>;

    fn create_api_key(&self, key: &ApiKey) -> Result<()>;
    fn get_api_key_by_value(&self, value: &str) -> Result<Option<ApiKey>>;
    fn touch_api_key(&self, id: &str, used_time: u64) -> Result<()>;
    fn revoke_api_key(&self, id: &str) -> Result<bool>;
    fn list_api_keys(&self, user_id: Option<&str>) -> Result<Vec<ApiKey>>;

    fn create_entry(&self, entry: &ClipboardEntry) -> Result<()>;
    fn get_entry(&self, user_id: &str, id: &str) -> Result<Option<ClipboardEntry>>;
    fn count_entries(&self, query: &EntryQuery) -> Result<u64>;
    fn get_entries(&self, query: &EntryQuery) -> Result<Vec<ClipboardEntry>>;
    fn update_entry_time(&self, user_id: &str, id: &str, create_time: u64) -> Result<bool>;
    fn delete_entry(&self, user_id: &str, id: &str) -> Result<bool>;
    fn delete_entries(&self, ids: Vec<String>) -> Result<u64>;

    fn commit(self) -> Result<()>;
    fn rollback(self) -> Result<()>;
}

/// Full user row, including the password hash and salt. Never leaves the
/// server; [`UserRecord::to_user`] strips the secrets.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub password: String,
    pub salt: String,
    pub admin: bool,
    pub active: bool,
    pub create_time: u64,
    pub last_login_time: u64,
}

impl UserRecord {
    pub fn to_user(&self) -> User {
        User {
            id: self.id.clone(),
            name: self.name.clone(),
            admin: self.admin,
            active: self.active,
            create_time: self.create_time,
            last_login_time: self.last_login_time,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EntryQuery {
    pub user_id: Option<String>,

    /// Case-insensitive substring match against the preview.
    pub search: Option<String>,

    pub create_before: Option<u64>,

    pub content_type: Option<u32>,

    pub limit: Option<u64>,
    pub offset: Option<u64>,
}
