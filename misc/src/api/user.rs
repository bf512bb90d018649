use serde::{Deserialize, Serialize};

/// A registered account. The password hash and salt never leave the
/// server; this is the shape shared with clients and CLI output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub admin: bool,

    #[serde(default)]
    pub active: bool,

    #[serde(default)]
    pub create_time: u64,

    /// Unix millis of the last successful authentication, 0 if never.
    #[serde(default)]
    pub last_login_time: u64,
}
