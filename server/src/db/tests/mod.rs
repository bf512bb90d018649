mod key;

use anyhow::{bail, Result};

use super::types::UserRecord;
use super::Database;

pub fn run_tests(db: &Database) {
    user::run_user_tests(db);
    key::run_key_tests(db);
    entry::run_entry_tests(db);

    test_rollback(db);
}

fn test_rollback(db: &Database) {
    let result: Result<()> = db.with_transaction(|tx| {
        tx.create_user(&UserRecord {
            id: String::from("rollback-id"),
            name: String::from("none"),
            password: String::from("test123"),
            salt: String::from("test_salt"),
            admin: true,
            active: true,
            create_time: 50,
            last_login_time: 0,
        })
        .unwrap();

        bail!("rollback");
    });
    assert!(result.is_err());

    db.with_transaction(|tx| {
        assert!(!tx.has_user("none")?);
        Ok(())
    })
    .unwrap();
}
