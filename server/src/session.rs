use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use krypton_misc::api::entry::MAX_CONTENT_SIZE;
use krypton_misc::time::now_millis;
use krypton_proto::conn::Connection;
use krypton_proto::packet::{
    AuthResponse, ClipboardBroadcast, ClipboardDeleteAck, ClipboardHistory,
    ClipboardMoveToTopAck, ClipboardPush, ClipboardPushAck, ClipboardSearchResult, ConnectAck,
    Connect, ErrorResponse, Packet, ServerHello, StartTlsAck,
};
use log::{debug, error, warn};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{self, AuthOutcome};
use crate::context::ServerContext;
use crate::registry::Registry;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub client_version: String,
    pub platform: String,
    pub device_id: String,
    pub device_name: String,
}

#[derive(Debug, Clone)]
pub struct SessionUser {
    pub id: String,
    pub name: String,
    pub admin: bool,
}

/// One live client connection. Owned by the registry; the worker task and
/// broadcast paths hold non-owning `Arc` clones.
pub struct Session {
    pub id: String,
    pub remote: String,
    pub opened_at: u64,
    pub conn: Connection,
    pub cancel: CancellationToken,

    device: RwLock<Option<DeviceInfo>>,
    user: RwLock<Option<SessionUser>>,
}

impl Session {
    pub fn new(stream: TcpStream, remote: String, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            remote,
            opened_at: now_millis(),
            conn: Connection::new(stream),
            cancel,
            device: RwLock::new(None),
            user: RwLock::new(None),
        })
    }

    pub fn user(&self) -> Option<SessionUser> {
        self.user.read().unwrap().clone()
    }

    pub fn device_name(&self) -> Option<String> {
        self.device
            .read()
            .unwrap()
            .as_ref()
            .map(|d| d.device_name.clone())
    }

    pub(crate) fn set_device(&self, device: DeviceInfo) {
        *self.device.write().unwrap() = Some(device);
    }

    pub(crate) fn set_user(&self, user: SessionUser) {
        *self.user.write().unwrap() = Some(user);
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, opened {})",
            self.id,
            self.remote,
            krypton_misc::time::format_time(self.opened_at)
        )?;
        if let Some(device) = self.device.read().unwrap().as_ref() {
            write!(
                f,
                " device '{}' [{}] {} {}",
                device.device_name, device.device_id, device.platform, device.client_version
            )?;
        }
        if let Some(user) = self.user.read().unwrap().as_ref() {
            write!(f, " user '{}'", user.name)?;
            if user.admin {
                write!(f, " (admin)")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Greeted,
    Connected,
    Authenticated,
}

enum Flow {
    Continue,
    Terminate,
}

/// Runs the per-session protocol state machine: hello, optional TLS
/// upgrade, connect, auth, then the authenticated steady state.
pub struct SessionWorker {
    session: Arc<Session>,
    ctx: Arc<ServerContext>,
    registry: Arc<Registry>,
    acceptor: Option<TlsAcceptor>,
    state: State,
}

impl SessionWorker {
    pub fn new(
        session: Arc<Session>,
        ctx: Arc<ServerContext>,
        registry: Arc<Registry>,
        acceptor: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            session,
            ctx,
            registry,
            acceptor,
            state: State::Greeted,
        }
    }

    pub async fn run(mut self) {
        debug!(
            "Begin to handle session {} from {}",
            self.session.id, self.session.remote
        );
        match self.main_loop().await {
            Ok(()) => {}
            Err(err) => {
                let msg = format!("{:#}", err);
                if msg.contains("connection reset by peer") {
                    debug!("Session {} reset by peer", self.session.id);
                } else {
                    error!("Session {} error: {msg}", self.session.id);
                    let response = Packet::ErrorResponse(ErrorResponse::bad_request(&msg));
                    if let Err(err) = self.session.conn.send(&response).await {
                        debug!(
                            "Send error response to session {} failed: {:#}",
                            self.session.id, err
                        );
                    }
                }
            }
        }

        self.registry.remove(&self.session.id);
        self.session.cancel.cancel();
        self.session.conn.close().await;
        debug!("Session closed: {}", self.session);
    }

    async fn main_loop(&mut self) -> Result<()> {
        // The hello must be the first frame on the wire, before any read.
        let hello = Packet::ServerHello(ServerHello {
            server_version: String::from(SERVER_VERSION),
            tls_available: self.acceptor.is_some(),
            tls_required: self.ctx.cfg.tls.required,
        });
        self.session
            .conn
            .send(&hello)
            .await
            .context("send server hello")?;

        loop {
            let packet = tokio::select! {
                _ = self.session.cancel.cancelled() => return Ok(()),
                ret = self.session.conn.recv() => match ret.context("recv packet")? {
                    Some(packet) => packet,
                    // Peer closed cleanly.
                    None => return Ok(()),
                },
            };

            match self.dispatch(packet).await? {
                Flow::Continue => {}
                Flow::Terminate => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet) -> Result<Flow> {
        match packet {
            Packet::Disconnect(disconnect) => {
                debug!(
                    "Session {} disconnecting: {}",
                    self.session.id, disconnect.reason
                );
                Ok(Flow::Terminate)
            }

            Packet::StartTls => self.handle_start_tls().await,
            Packet::Connect(connect) => self.handle_connect(connect).await,

            Packet::AuthLogin(login) => {
                self.handle_auth("login", |ctx| auth::login(ctx, &login.username, &login.password))
                    .await
            }
            Packet::AuthRegister(register) => {
                let device_name = self.session.device_name();
                self.handle_auth("register", |ctx| {
                    auth::register(
                        ctx,
                        &register.username,
                        &register.password,
                        device_name.as_deref(),
                    )
                })
                .await
            }
            Packet::AuthApiKey(key) => {
                self.handle_auth("api key", |ctx| auth::login_api_key(ctx, &key.api_key))
                    .await
            }
            Packet::AuthLogout => {
                if self.state != State::Authenticated {
                    return self.out_of_order("AuthLogout").await;
                }
                debug!("Session {} logged out", self.session.id);
                Ok(Flow::Terminate)
            }

            Packet::Heartbeat => {
                if self.state == State::Greeted {
                    return self.out_of_order("Heartbeat").await;
                }
                self.send(Packet::HeartbeatAck).await?;
                Ok(Flow::Continue)
            }

            Packet::ClipboardPush(push) => match self.require_auth().await? {
                Some(user_id) => self.handle_push(user_id, push).await,
                None => Ok(Flow::Continue),
            },
            Packet::ClipboardPull(pull) => match self.require_auth().await? {
                Some(user_id) => self.handle_pull(user_id, pull.limit, pull.offset).await,
                None => Ok(Flow::Continue),
            },
            Packet::ClipboardSearch(search) => match self.require_auth().await? {
                Some(user_id) => self.handle_search(user_id, search.query, search.limit).await,
                None => Ok(Flow::Continue),
            },
            Packet::ClipboardMoveToTop(req) => match self.require_auth().await? {
                Some(user_id) => self.handle_move_to_top(user_id, req.entry_id).await,
                None => Ok(Flow::Continue),
            },
            Packet::ClipboardDelete(req) => match self.require_auth().await? {
                Some(user_id) => self.handle_delete(user_id, req.entry_id).await,
                None => Ok(Flow::Continue),
            },

            // Server-to-client packets have no business arriving here.
            other => self.out_of_order(other.name()).await,
        }
    }

    async fn handle_start_tls(&mut self) -> Result<Flow> {
        if self.state != State::Greeted || self.session.conn.is_tls() {
            return self.out_of_order("StartTls").await;
        }

        let acceptor = match self.acceptor {
            Some(ref acceptor) => acceptor.clone(),
            None => {
                self.send(Packet::StartTlsAck(StartTlsAck {
                    success: false,
                    message: String::from("TLS is not available"),
                }))
                .await?;
                if self.ctx.cfg.tls.required {
                    return Ok(Flow::Terminate);
                }
                return Ok(Flow::Continue);
            }
        };

        self.send(Packet::StartTlsAck(StartTlsAck {
            success: true,
            message: String::new(),
        }))
        .await?;

        // The ack is flushed and nothing else is in flight, so the
        // handshake owns the socket now. After the upgrade the session is
        // back in the greeted state and expects Connect.
        self.session
            .conn
            .upgrade_server(&acceptor)
            .await
            .context("tls upgrade")?;
        debug!("Session {} upgraded to tls", self.session.id);
        Ok(Flow::Continue)
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<Flow> {
        if self.state != State::Greeted {
            return self.out_of_order("Connect").await;
        }

        if self.ctx.cfg.tls.required && !self.session.conn.is_tls() {
            self.send(Packet::ErrorResponse(ErrorResponse::bad_request(
                "TLS is required by this server",
            )))
            .await?;
            return Ok(Flow::Terminate);
        }

        debug!(
            "Session {} connect: device '{}' platform '{}' version '{}'",
            self.session.id, connect.device_name, connect.platform, connect.client_version
        );
        self.session.set_device(DeviceInfo {
            client_version: connect.client_version,
            platform: connect.platform,
            device_id: connect.device_id,
            device_name: connect.device_name,
        });

        self.send(Packet::ConnectAck(ConnectAck {
            server_version: String::from(SERVER_VERSION),
            requires_auth: true,
        }))
        .await?;
        self.state = State::Connected;
        Ok(Flow::Continue)
    }

    async fn handle_auth<F>(&mut self, kind: &str, attempt: F) -> Result<Flow>
    where
        F: FnOnce(&ServerContext) -> Result<AuthOutcome>,
    {
        if self.state != State::Connected {
            return self.out_of_order("Auth").await;
        }

        let outcome = match attempt(&self.ctx) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Session {} {kind} auth error: {:#}", self.session.id, err);
                self.send(Packet::ErrorResponse(ErrorResponse::internal(
                    "Internal server error",
                )))
                .await?;
                return Ok(Flow::Continue);
            }
        };

        match outcome {
            AuthOutcome::Denied(message) => {
                debug!("Session {} {kind} auth denied", self.session.id);
                self.send(Packet::AuthResponse(AuthResponse {
                    success: false,
                    message,
                    user_id: None,
                    api_key: None,
                    admin: false,
                }))
                .await?;
                Ok(Flow::Continue)
            }
            AuthOutcome::Allowed(result) => {
                let user = result.user;
                debug!(
                    "Session {} authenticated as '{}' via {kind}",
                    self.session.id, user.name
                );
                self.session.set_user(SessionUser {
                    id: user.id.clone(),
                    name: user.name.clone(),
                    admin: user.admin,
                });
                self.registry.mark_authenticated(&self.session.id, &user.id);
                self.state = State::Authenticated;

                self.send(Packet::AuthResponse(AuthResponse {
                    success: true,
                    message: String::new(),
                    user_id: Some(user.id),
                    api_key: result.api_key.map(|k| k.key),
                    admin: user.admin,
                }))
                .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_push(&mut self, user_id: String, push: ClipboardPush) -> Result<Flow> {
        if push.entry.content.is_empty() {
            self.send(Packet::ClipboardPushAck(ClipboardPushAck {
                success: false,
                entry_id: None,
                message: String::from("content is empty"),
            }))
            .await?;
            return Ok(Flow::Continue);
        }
        if push.entry.content.len() > MAX_CONTENT_SIZE {
            self.send(Packet::ClipboardPushAck(ClipboardPushAck {
                success: false,
                entry_id: None,
                message: String::from("content too large"),
            }))
            .await?;
            return Ok(Flow::Continue);
        }

        // Keep the raw bytes around: an externally stored image leaves the
        // persisted record empty, but siblings still need the content.
        let content = push.entry.content.clone();
        let entry = match self.ctx.store.push(&user_id, push.entry) {
            Ok(entry) => entry,
            Err(err) => {
                error!("Session {} push error: {:#}", self.session.id, err);
                self.send(Packet::ErrorResponse(ErrorResponse::internal(
                    "Internal server error",
                )))
                .await?;
                return Ok(Flow::Continue);
            }
        };

        // The entry is durable at this point; ack the originator first,
        // fan-out is best-effort and independent.
        self.send(Packet::ClipboardPushAck(ClipboardPushAck {
            success: true,
            entry_id: Some(entry.id.clone()),
            message: String::new(),
        }))
        .await?;

        let mut broadcast_entry = entry;
        if broadcast_entry.content.is_empty() {
            broadcast_entry.content = content;
        }
        let broadcast = Packet::ClipboardBroadcast(ClipboardBroadcast {
            entry: broadcast_entry,
            from_device: self.session.device_name(),
        });
        self.registry
            .broadcast(&broadcast, Some(&self.session.id), Some(&user_id))
            .await;

        Ok(Flow::Continue)
    }

    async fn handle_pull(&mut self, user_id: String, limit: u64, offset: u64) -> Result<Flow> {
        match self.ctx.store.history(&user_id, limit, offset) {
            Ok((entries, total_count, has_more)) => {
                self.send(Packet::ClipboardHistory(ClipboardHistory {
                    entries,
                    total_count,
                    has_more,
                }))
                .await?;
            }
            Err(err) => {
                error!("Session {} pull error: {:#}", self.session.id, err);
                self.send(Packet::ErrorResponse(ErrorResponse::internal(
                    "Internal server error",
                )))
                .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_search(&mut self, user_id: String, query: String, limit: u64) -> Result<Flow> {
        match self.ctx.store.search(&user_id, &query, limit) {
            Ok((entries, total_matches, has_more)) => {
                self.send(Packet::ClipboardSearchResult(ClipboardSearchResult {
                    entries,
                    total_matches,
                    has_more,
                }))
                .await?;
            }
            Err(err) => {
                error!("Session {} search error: {:#}", self.session.id, err);
                self.send(Packet::ErrorResponse(ErrorResponse::internal(
                    "Internal server error",
                )))
                .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_move_to_top(&mut self, user_id: String, entry_id: String) -> Result<Flow> {
        let ack = match self.ctx.store.move_to_top(&user_id, &entry_id) {
            // "Entry not found" also covers entries owned by someone
            // else; existence is not leaked.
            Ok(success) => ClipboardMoveToTopAck {
                success,
                message: if success {
                    String::new()
                } else {
                    String::from("Entry not found")
                },
            },
            Err(err) => {
                error!("Session {} move error: {:#}", self.session.id, err);
                self.send(Packet::ErrorResponse(ErrorResponse::internal(
                    "Internal server error",
                )))
                .await?;
                return Ok(Flow::Continue);
            }
        };
        self.send(Packet::ClipboardMoveToTopAck(ack)).await?;
        Ok(Flow::Continue)
    }

    async fn handle_delete(&mut self, user_id: String, entry_id: String) -> Result<Flow> {
        let ack = match self.ctx.store.delete(&user_id, &entry_id) {
            Ok(success) => ClipboardDeleteAck {
                success,
                message: if success {
                    String::new()
                } else {
                    String::from("Entry not found")
                },
            },
            Err(err) => {
                error!("Session {} delete error: {:#}", self.session.id, err);
                self.send(Packet::ErrorResponse(ErrorResponse::internal(
                    "Internal server error",
                )))
                .await?;
                return Ok(Flow::Continue);
            }
        };
        self.send(Packet::ClipboardDeleteAck(ack)).await?;
        Ok(Flow::Continue)
    }

    /// Auth gate for clipboard operations: outside the authenticated
    /// state the client gets an error response and the session stays in
    /// its current state.
    async fn require_auth(&mut self) -> Result<Option<String>> {
        if self.state == State::Authenticated {
            if let Some(user) = self.session.user() {
                return Ok(Some(user.id));
            }
        }
        warn!(
            "Session {} sent a clipboard packet before authenticating",
            self.session.id
        );
        self.send(Packet::ErrorResponse(ErrorResponse::auth_required()))
            .await?;
        Ok(None)
    }

    async fn out_of_order(&mut self, name: &str) -> Result<Flow> {
        warn!(
            "Session {} sent out-of-order packet {name}, closing",
            self.session.id
        );
        self.send(Packet::ErrorResponse(ErrorResponse::bad_request(format!(
            "unexpected {name} packet"
        ))))
        .await?;
        Ok(Flow::Terminate)
    }

    async fn send(&self, packet: Packet) -> Result<()> {
        self.session
            .conn
            .send(&packet)
            .await
            .with_context(|| format!("send {} packet", packet.name()))
    }
}
