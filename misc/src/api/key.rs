use serde::{Deserialize, Serialize};

/// A bearer credential minted for one device. The `key` value is returned
/// to the caller exactly once, on creation; listings carry an empty
/// string in its place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,

    pub user_id: String,

    #[serde(default)]
    pub key: String,

    pub name: String,

    #[serde(default)]
    pub create_time: u64,

    /// Unix millis of the last successful key authentication, 0 if never.
    #[serde(default)]
    pub last_used_time: u64,

    /// Unix millis after which the key stops authenticating, 0 for no
    /// expiry.
    #[serde(default)]
    pub expire_time: u64,

    #[serde(default)]
    pub revoked: bool,
}

impl ApiKey {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expire_time > 0 && self.expire_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_expired() {
        let mut key = ApiKey::default();
        assert!(!key.is_expired(1000));

        key.expire_time = 500;
        assert!(key.is_expired(1000));
        assert!(key.is_expired(500));
        assert!(!key.is_expired(499));
    }
}
