use krypton_misc::api::entry::ClipboardEntry;

/// Events surfaced to the embedding application (tray, GUI, daemon).
/// Delivered in order over an mpsc channel; the UI layer decides
/// presentation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Outcome of an authentication attempt.
    AuthResult { success: bool, message: String },

    /// A sibling device pushed a new entry.
    ClipboardReceived(ClipboardEntry),

    /// Reconnection attempts are exhausted; user intervention needed.
    ConnectionLost,

    /// A reconnect cycle succeeded; the offline queue flush follows.
    ConnectionRestored,

    /// Round-trip time of the latest heartbeat, in milliseconds.
    HeartbeatLatency(u64),

    /// The server speaks a different version. Advisory, never fatal.
    ServerVersionMismatch {
        server_version: String,
        client_version: String,
    },
}
