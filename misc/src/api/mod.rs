pub mod entry;
pub mod key;
pub mod user;

use std::fmt::Display;

/// Value used by the SQL builders and generic request plumbing.
#[derive(Debug, Clone)]
pub enum Value {
    Text(String),
    Integer(u64),
    Bool(bool),
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Text(text) => write!(f, "{text}"),
            Value::Integer(integer) => write!(f, "{integer}"),
            Value::Bool(boolean) => write!(f, "{boolean}"),
        }
    }
}
