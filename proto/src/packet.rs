use bytes::Bytes;
use krypton_misc::api::entry::{ClipboardEntry, NewEntry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::frame::{FrameError, RawFrame};

/// Stable packet type codes. Client and server must agree on these
/// numeric values; never reorder or reuse them.
pub const PROTOCOL_SERVER_HELLO: u16 = 1;
pub const PROTOCOL_START_TLS: u16 = 2;
pub const PROTOCOL_START_TLS_ACK: u16 = 3;
pub const PROTOCOL_CONNECT: u16 = 4;
pub const PROTOCOL_CONNECT_ACK: u16 = 5;
pub const PROTOCOL_AUTH_LOGIN: u16 = 6;
pub const PROTOCOL_AUTH_REGISTER: u16 = 7;
pub const PROTOCOL_AUTH_API_KEY: u16 = 8;
pub const PROTOCOL_AUTH_LOGOUT: u16 = 9;
pub const PROTOCOL_AUTH_RESPONSE: u16 = 10;
pub const PROTOCOL_CLIPBOARD_PUSH: u16 = 11;
pub const PROTOCOL_CLIPBOARD_PUSH_ACK: u16 = 12;
pub const PROTOCOL_CLIPBOARD_PULL: u16 = 13;
pub const PROTOCOL_CLIPBOARD_HISTORY: u16 = 14;
pub const PROTOCOL_CLIPBOARD_SEARCH: u16 = 15;
pub const PROTOCOL_CLIPBOARD_SEARCH_RESULT: u16 = 16;
pub const PROTOCOL_CLIPBOARD_MOVE_TO_TOP: u16 = 17;
pub const PROTOCOL_CLIPBOARD_MOVE_TO_TOP_ACK: u16 = 18;
pub const PROTOCOL_CLIPBOARD_DELETE: u16 = 19;
pub const PROTOCOL_CLIPBOARD_DELETE_ACK: u16 = 20;
pub const PROTOCOL_CLIPBOARD_BROADCAST: u16 = 21;
pub const PROTOCOL_HEARTBEAT: u16 = 22;
pub const PROTOCOL_HEARTBEAT_ACK: u16 = 23;
pub const PROTOCOL_DISCONNECT: u16 = 24;
pub const PROTOCOL_ERROR_RESPONSE: u16 = 25;

/// Error codes carried by [`ErrorResponse`].
pub const CODE_BAD_REQUEST: u32 = 400;
pub const CODE_AUTH_REQUIRED: u32 = 401;
pub const CODE_NOT_FOUND: u32 = 404;
pub const CODE_INTERNAL: u32 = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_version: String,
    pub tls_available: bool,
    pub tls_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartTlsAck {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connect {
    pub client_version: String,
    pub platform: String,
    pub device_id: String,
    pub device_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectAck {
    pub server_version: String,
    pub requires_auth: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthLogin {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthRegister {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthApiKey {
    pub api_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
    pub user_id: Option<String>,
    /// Plaintext key minted for this login; shown exactly once.
    pub api_key: Option<String>,
    pub admin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardPush {
    pub entry: NewEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardPushAck {
    pub success: bool,
    pub entry_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardPull {
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardHistory {
    pub entries: Vec<ClipboardEntry>,
    pub total_count: u64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardSearch {
    pub query: String,
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardSearchResult {
    pub entries: Vec<ClipboardEntry>,
    pub total_matches: u64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardMoveToTop {
    pub entry_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardMoveToTopAck {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardDelete {
    pub entry_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardDeleteAck {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipboardBroadcast {
    pub entry: ClipboardEntry,
    pub from_device: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}

impl ErrorResponse {
    pub fn auth_required() -> Self {
        Self {
            code: CODE_AUTH_REQUIRED,
            message: String::from("Authentication required"),
        }
    }

    pub fn bad_request(message: impl ToString) -> Self {
        Self {
            code: CODE_BAD_REQUEST,
            message: message.to_string(),
        }
    }

    pub fn internal(message: impl ToString) -> Self {
        Self {
            code: CODE_INTERNAL,
            message: message.to_string(),
        }
    }
}

/// A fully typed protocol packet. [`Packet::encode`] and
/// [`Packet::decode`] convert between this and the raw frame layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ServerHello(ServerHello),
    StartTls,
    StartTlsAck(StartTlsAck),
    Connect(Connect),
    ConnectAck(ConnectAck),
    AuthLogin(AuthLogin),
    AuthRegister(AuthRegister),
    AuthApiKey(AuthApiKey),
    AuthLogout,
    AuthResponse(AuthResponse),
    ClipboardPush(ClipboardPush),
    ClipboardPushAck(ClipboardPushAck),
    ClipboardPull(ClipboardPull),
    ClipboardHistory(ClipboardHistory),
    ClipboardSearch(ClipboardSearch),
    ClipboardSearchResult(ClipboardSearchResult),
    ClipboardMoveToTop(ClipboardMoveToTop),
    ClipboardMoveToTopAck(ClipboardMoveToTopAck),
    ClipboardDelete(ClipboardDelete),
    ClipboardDeleteAck(ClipboardDeleteAck),
    ClipboardBroadcast(ClipboardBroadcast),
    Heartbeat,
    HeartbeatAck,
    Disconnect(Disconnect),
    ErrorResponse(ErrorResponse),
}

impl Packet {
    pub fn packet_type(&self) -> u16 {
        match self {
            Packet::ServerHello(_) => PROTOCOL_SERVER_HELLO,
            Packet::StartTls => PROTOCOL_START_TLS,
            Packet::StartTlsAck(_) => PROTOCOL_START_TLS_ACK,
            Packet::Connect(_) => PROTOCOL_CONNECT,
            Packet::ConnectAck(_) => PROTOCOL_CONNECT_ACK,
            Packet::AuthLogin(_) => PROTOCOL_AUTH_LOGIN,
            Packet::AuthRegister(_) => PROTOCOL_AUTH_REGISTER,
            Packet::AuthApiKey(_) => PROTOCOL_AUTH_API_KEY,
            Packet::AuthLogout => PROTOCOL_AUTH_LOGOUT,
            Packet::AuthResponse(_) => PROTOCOL_AUTH_RESPONSE,
            Packet::ClipboardPush(_) => PROTOCOL_CLIPBOARD_PUSH,
            Packet::ClipboardPushAck(_) => PROTOCOL_CLIPBOARD_PUSH_ACK,
            Packet::ClipboardPull(_) => PROTOCOL_CLIPBOARD_PULL,
            Packet::ClipboardHistory(_) => PROTOCOL_CLIPBOARD_HISTORY,
            Packet::ClipboardSearch(_) => PROTOCOL_CLIPBOARD_SEARCH,
            Packet::ClipboardSearchResult(_) => PROTOCOL_CLIPBOARD_SEARCH_RESULT,
            Packet::ClipboardMoveToTop(_) => PROTOCOL_CLIPBOARD_MOVE_TO_TOP,
            Packet::ClipboardMoveToTopAck(_) => PROTOCOL_CLIPBOARD_MOVE_TO_TOP_ACK,
            Packet::ClipboardDelete(_) => PROTOCOL_CLIPBOARD_DELETE,
            Packet::ClipboardDeleteAck(_) => PROTOCOL_CLIPBOARD_DELETE_ACK,
            Packet::ClipboardBroadcast(_) => PROTOCOL_CLIPBOARD_BROADCAST,
            Packet::Heartbeat => PROTOCOL_HEARTBEAT,
            Packet::HeartbeatAck => PROTOCOL_HEARTBEAT_ACK,
            Packet::Disconnect(_) => PROTOCOL_DISCONNECT,
            Packet::ErrorResponse(_) => PROTOCOL_ERROR_RESPONSE,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::ServerHello(_) => "ServerHello",
            Packet::StartTls => "StartTls",
            Packet::StartTlsAck(_) => "StartTlsAck",
            Packet::Connect(_) => "Connect",
            Packet::ConnectAck(_) => "ConnectAck",
            Packet::AuthLogin(_) => "AuthLogin",
            Packet::AuthRegister(_) => "AuthRegister",
            Packet::AuthApiKey(_) => "AuthApiKey",
            Packet::AuthLogout => "AuthLogout",
            Packet::AuthResponse(_) => "AuthResponse",
            Packet::ClipboardPush(_) => "ClipboardPush",
            Packet::ClipboardPushAck(_) => "ClipboardPushAck",
            Packet::ClipboardPull(_) => "ClipboardPull",
            Packet::ClipboardHistory(_) => "ClipboardHistory",
            Packet::ClipboardSearch(_) => "ClipboardSearch",
            Packet::ClipboardSearchResult(_) => "ClipboardSearchResult",
            Packet::ClipboardMoveToTop(_) => "ClipboardMoveToTop",
            Packet::ClipboardMoveToTopAck(_) => "ClipboardMoveToTopAck",
            Packet::ClipboardDelete(_) => "ClipboardDelete",
            Packet::ClipboardDeleteAck(_) => "ClipboardDeleteAck",
            Packet::ClipboardBroadcast(_) => "ClipboardBroadcast",
            Packet::Heartbeat => "Heartbeat",
            Packet::HeartbeatAck => "HeartbeatAck",
            Packet::Disconnect(_) => "Disconnect",
            Packet::ErrorResponse(_) => "ErrorResponse",
        }
    }

    pub fn encode(&self) -> Result<RawFrame, FrameError> {
        let packet_type = self.packet_type();
        let payload = match self {
            Packet::ServerHello(p) => encode_object(p)?,
            Packet::StartTls => Bytes::new(),
            Packet::StartTlsAck(p) => encode_object(p)?,
            Packet::Connect(p) => encode_object(p)?,
            Packet::ConnectAck(p) => encode_object(p)?,
            Packet::AuthLogin(p) => encode_object(p)?,
            Packet::AuthRegister(p) => encode_object(p)?,
            Packet::AuthApiKey(p) => encode_object(p)?,
            Packet::AuthLogout => Bytes::new(),
            Packet::AuthResponse(p) => encode_object(p)?,
            Packet::ClipboardPush(p) => encode_object(p)?,
            Packet::ClipboardPushAck(p) => encode_object(p)?,
            Packet::ClipboardPull(p) => encode_object(p)?,
            Packet::ClipboardHistory(p) => encode_object(p)?,
            Packet::ClipboardSearch(p) => encode_object(p)?,
            Packet::ClipboardSearchResult(p) => encode_object(p)?,
            Packet::ClipboardMoveToTop(p) => encode_object(p)?,
            Packet::ClipboardMoveToTopAck(p) => encode_object(p)?,
            Packet::ClipboardDelete(p) => encode_object(p)?,
            Packet::ClipboardDeleteAck(p) => encode_object(p)?,
            Packet::ClipboardBroadcast(p) => encode_object(p)?,
            Packet::Heartbeat => Bytes::new(),
            Packet::HeartbeatAck => Bytes::new(),
            Packet::Disconnect(p) => encode_object(p)?,
            Packet::ErrorResponse(p) => encode_object(p)?,
        };
        Ok(RawFrame {
            packet_type,
            payload,
        })
    }

    pub fn decode(frame: RawFrame) -> Result<Packet, FrameError> {
        let data = frame.payload;
        let packet = match frame.packet_type {
            PROTOCOL_SERVER_HELLO => Packet::ServerHello(decode_object(&data)?),
            PROTOCOL_START_TLS => Packet::StartTls,
            PROTOCOL_START_TLS_ACK => Packet::StartTlsAck(decode_object(&data)?),
            PROTOCOL_CONNECT => Packet::Connect(decode_object(&data)?),
            PROTOCOL_CONNECT_ACK => Packet::ConnectAck(decode_object(&data)?),
            PROTOCOL_AUTH_LOGIN => Packet::AuthLogin(decode_object(&data)?),
            PROTOCOL_AUTH_REGISTER => Packet::AuthRegister(decode_object(&data)?),
            PROTOCOL_AUTH_API_KEY => Packet::AuthApiKey(decode_object(&data)?),
            PROTOCOL_AUTH_LOGOUT => Packet::AuthLogout,
            PROTOCOL_AUTH_RESPONSE => Packet::AuthResponse(decode_object(&data)?),
            PROTOCOL_CLIPBOARD_PUSH => Packet::ClipboardPush(decode_object(&data)?),
            PROTOCOL_CLIPBOARD_PUSH_ACK => Packet::ClipboardPushAck(decode_object(&data)?),
            PROTOCOL_CLIPBOARD_PULL => Packet::ClipboardPull(decode_object(&data)?),
            PROTOCOL_CLIPBOARD_HISTORY => Packet::ClipboardHistory(decode_object(&data)?),
            PROTOCOL_CLIPBOARD_SEARCH => Packet::ClipboardSearch(decode_object(&data)?),
            PROTOCOL_CLIPBOARD_SEARCH_RESULT => {
                Packet::ClipboardSearchResult(decode_object(&data)?)
            }
            PROTOCOL_CLIPBOARD_MOVE_TO_TOP => Packet::ClipboardMoveToTop(decode_object(&data)?),
            PROTOCOL_CLIPBOARD_MOVE_TO_TOP_ACK => {
                Packet::ClipboardMoveToTopAck(decode_object(&data)?)
            }
            PROTOCOL_CLIPBOARD_DELETE => Packet::ClipboardDelete(decode_object(&data)?),
            PROTOCOL_CLIPBOARD_DELETE_ACK => Packet::ClipboardDeleteAck(decode_object(&data)?),
            PROTOCOL_CLIPBOARD_BROADCAST => Packet::ClipboardBroadcast(decode_object(&data)?),
            PROTOCOL_HEARTBEAT => Packet::Heartbeat,
            PROTOCOL_HEARTBEAT_ACK => Packet::HeartbeatAck,
            PROTOCOL_DISCONNECT => Packet::Disconnect(decode_object(&data)?),
            PROTOCOL_ERROR_RESPONSE => Packet::ErrorResponse(decode_object(&data)?),
            other => return Err(FrameError::UnknownType(other)),
        };
        Ok(packet)
    }
}

fn decode_object<T: DeserializeOwned>(data: &[u8]) -> Result<T, FrameError> {
    match bincode::deserialize(data) {
        Ok(v) => Ok(v),
        Err(_) => Err(FrameError::Payload("decode packet failed, invalid object")),
    }
}

fn encode_object<T: Serialize>(value: &T) -> Result<Bytes, FrameError> {
    match bincode::serialize(value) {
        Ok(data) => Ok(data.into()),
        Err(_) => Err(FrameError::Payload("encode packet failed")),
    }
}
