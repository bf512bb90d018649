use anyhow::{Context, Result};
use krypton_misc::api::key::ApiKey;
use krypton_misc::api::user::User;
use krypton_misc::code;
use krypton_misc::time::now_millis;
use log::info;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use uuid::Uuid;

use crate::context::ServerContext;
use crate::db::types::{Transaction, UserRecord};

const SALT_LENGTH: usize = 16;
const KEY_LENGTH: usize = 32;

const MIN_USERNAME_LEN: usize = 3;
const MIN_PASSWORD_LEN: usize = 8;

/// Generic credential failure message. Deliberately identical for a
/// missing user and a wrong password.
const INVALID_CREDENTIALS: &str = "Invalid username or password";
const INVALID_API_KEY: &str = "Invalid API key";

#[derive(Debug)]
pub struct AuthResult {
    pub user: User,

    /// Freshly minted key, plaintext. This is the only moment the value
    /// is ever handed out.
    pub api_key: Option<ApiKey>,
}

/// Outcome of an authentication attempt. `Denied` is a normal protocol
/// answer; an `Err` from the functions below means the backend itself
/// failed.
#[derive(Debug)]
pub enum AuthOutcome {
    Allowed(AuthResult),
    Denied(String),
}

pub fn register(
    ctx: &ServerContext,
    username: &str,
    password: &str,
    device_name: Option<&str>,
) -> Result<AuthOutcome> {
    if username.len() < MIN_USERNAME_LEN {
        return Ok(AuthOutcome::Denied(format!(
            "username must be at least {MIN_USERNAME_LEN} characters"
        )));
    }
    if password.len() < MIN_PASSWORD_LEN {
        return Ok(AuthOutcome::Denied(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let rounds = ctx.cfg.password_hash_rounds;
    let salt = code::base64_encode(code::random_bytes(SALT_LENGTH));
    let hash = hash_password(password, &salt, rounds);
    let now = now_millis();

    let key_name = match device_name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => String::from("Registration"),
    };

    let outcome = ctx.db.with_transaction(|tx| {
        if tx.has_user(username)? {
            return Ok(AuthOutcome::Denied(format!(
                "username '{username}' is already taken"
            )));
        }

        let user = UserRecord {
            id: Uuid::new_v4().to_string(),
            name: username.to_string(),
            password: hash.clone(),
            salt: salt.clone(),
            admin: false,
            active: true,
            create_time: now,
            last_login_time: now,
        };
        tx.create_user(&user)?;

        let key = mint_key_tx(tx, &user.id, &key_name, 0)?;

        Ok(AuthOutcome::Allowed(AuthResult {
            user: user.to_user(),
            api_key: Some(key),
        }))
    })?;

    if let AuthOutcome::Allowed(ref result) = outcome {
        info!("Registered new user '{}'", result.user.name);
    }
    Ok(outcome)
}

pub fn login(ctx: &ServerContext, username: &str, password: &str) -> Result<AuthOutcome> {
    let rounds = ctx.cfg.password_hash_rounds;
    let now = now_millis();

    ctx.db.with_transaction(|tx| {
        let record = match tx.get_user_by_name(username)? {
            Some(record) => record,
            None => return Ok(AuthOutcome::Denied(String::from(INVALID_CREDENTIALS))),
        };

        let hash = hash_password(password, &record.salt, rounds);
        if !code::constant_time_eq(hash.as_bytes(), record.password.as_bytes()) {
            return Ok(AuthOutcome::Denied(String::from(INVALID_CREDENTIALS)));
        }
        if !record.active {
            return Ok(AuthOutcome::Denied(String::from(INVALID_CREDENTIALS)));
        }

        tx.update_user_login(&record.id, now)?;

        // A fresh key per password login lets the client switch to
        // key-based reconnects without keeping the password around.
        let key = mint_key_tx(tx, &record.id, "Default Key", 0)?;

        let mut user = record.to_user();
        user.last_login_time = now;
        Ok(AuthOutcome::Allowed(AuthResult {
            user,
            api_key: Some(key),
        }))
    })
}

pub fn login_api_key(ctx: &ServerContext, value: &str) -> Result<AuthOutcome> {
    let now = now_millis();

    ctx.db.with_transaction(|tx| {
        let key = match tx.get_api_key_by_value(value)? {
            Some(key) => key,
            None => return Ok(AuthOutcome::Denied(String::from(INVALID_API_KEY))),
        };
        if key.revoked || key.is_expired(now) {
            return Ok(AuthOutcome::Denied(String::from(INVALID_API_KEY)));
        }

        let record = match tx.get_user(&key.user_id)? {
            Some(record) => record,
            None => return Ok(AuthOutcome::Denied(String::from(INVALID_API_KEY))),
        };
        if !record.active {
            return Ok(AuthOutcome::Denied(String::from(INVALID_API_KEY)));
        }

        tx.touch_api_key(&key.id, now)?;
        tx.update_user_login(&record.id, now)?;

        let mut user = record.to_user();
        user.last_login_time = now;
        Ok(AuthOutcome::Allowed(AuthResult {
            user,
            api_key: None,
        }))
    })
}

/// Mints a new API key for a user. Used by the CLI; protocol logins mint
/// through the same transaction helper.
pub fn mint_key(
    ctx: &ServerContext,
    user_id: &str,
    name: &str,
    expire_time: u64,
) -> Result<ApiKey> {
    ctx.db
        .with_transaction(|tx| mint_key_tx(tx, user_id, name, expire_time))
}

fn mint_key_tx(
    tx: &dyn Transaction,
    user_id: &str,
    name: &str,
    expire_time: u64,
) -> Result<ApiKey> {
    let key = ApiKey {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        key: code::base64_encode(code::random_bytes(KEY_LENGTH)),
        name: name.to_string(),
        create_time: now_millis(),
        last_used_time: 0,
        expire_time,
        revoked: false,
    };
    tx.create_api_key(&key).context("create api key")?;
    Ok(key)
}

fn hash_password(password: &str, salt: &str, rounds: u32) -> String {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), rounds, &mut out);
    hex_encode(&out)
}

fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
