use krypton_misc::api::key::ApiKey;

use crate::db::Database;

pub fn run_key_tests(db: &Database) {
    test_create(db);
    test_get(db);
    test_touch_revoke(db);
}

fn key(idx: u32, user_id: &str) -> ApiKey {
    ApiKey {
        id: format!("key-{idx}"),
        user_id: user_id.to_string(),
        key: format!("secret-{idx}"),
        name: format!("Device {idx}"),
        create_time: 100 + idx as u64,
        last_used_time: 0,
        expire_time: 0,
        revoked: false,
    }
}

fn test_create(db: &Database) {
    db.with_transaction(|tx| {
        tx.create_api_key(&key(1, "user-white"))?;
        tx.create_api_key(&key(2, "user-white"))?;
        tx.create_api_key(&key(3, "user-black"))?;
        Ok(())
    })
    .unwrap();

    // The key value is unique.
    let result = db.with_transaction(|tx| tx.create_api_key(&key(1, "user-black")));
    assert!(result.is_err());
}

fn test_get(db: &Database) {
    db.with_transaction(|tx| {
        assert_eq!(tx.get_api_key_by_value("secret-1")?, Some(key(1, "user-white")));
        assert_eq!(tx.get_api_key_by_value("missing")?, None);

        let keys = tx.list_api_keys(Some("user-white"))?;
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], key(2, "user-white"));
        assert_eq!(keys[1], key(1, "user-white"));

        let all = tx.list_api_keys(None)?;
        assert_eq!(all.len(), 3);
        Ok(())
    })
    .unwrap();
}

fn test_touch_revoke(db: &Database) {
    db.with_transaction(|tx| {
        tx.touch_api_key("key-1", 7777)?;
        let touched = tx.get_api_key_by_value("secret-1")?.unwrap();
        assert_eq!(touched.last_used_time, 7777);

        assert!(tx.revoke_api_key("key-2")?);
        let revoked = tx.get_api_key_by_value("secret-2")?.unwrap();
        assert!(revoked.revoked);

        assert!(!tx.revoke_api_key("missing")?);
        Ok(())
    })
    .unwrap();
}
