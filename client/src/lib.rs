pub mod config;
pub mod events;
pub mod session;

pub use config::ClientConfig;
pub use events::ClientEvent;
pub use session::{Client, PushOutcome};
