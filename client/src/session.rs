use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use krypton_misc::api::entry::{ContentType, NewEntry};
use krypton_misc::code;
use krypton_misc::time::now_millis;
use krypton_proto::conn::Connection;
use krypton_proto::packet::{
    AuthApiKey, AuthLogin, AuthRegister, AuthResponse, ClipboardBroadcast, ClipboardDelete,
    ClipboardHistory, ClipboardMoveToTop, ClipboardPull, ClipboardPush, ClipboardSearch,
    ClipboardSearchResult, Connect, Disconnect, Packet,
};
use krypton_proto::tls;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;

use crate::config::ClientConfig;
use crate::events::ClientEvent;

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Samples kept for the heartbeat latency display.
const LATENCY_WINDOW: usize = 5;

/// Consecutive heartbeat misses before a reconnect cycle starts.
const MAX_HEARTBEAT_MISSES: u32 = 3;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Persisted by the server.
    Acked { entry_id: String },

    /// Not connected; stored in the offline queue for the next flush.
    Queued,

    /// Identical to the most recently received broadcast; not re-pushed.
    Suppressed,
}

#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub authenticated: bool,
    pub was_ever_connected: bool,
    pub sequence_id: u32,
    pub queued: usize,
    pub latency_window: Vec<u64>,
    pub last_error: Option<String>,
}

enum Command {
    Connect {
        resp: oneshot::Sender<Result<()>>,
    },
    Login {
        username: String,
        password: String,
        resp: oneshot::Sender<Result<AuthResponse>>,
    },
    Register {
        username: String,
        password: String,
        resp: oneshot::Sender<Result<AuthResponse>>,
    },
    AuthKey {
        api_key: String,
        resp: oneshot::Sender<Result<AuthResponse>>,
    },
    Push {
        content_type: ContentType,
        content: Vec<u8>,
        preview: Option<String>,
        resp: oneshot::Sender<Result<PushOutcome>>,
    },
    Pull {
        limit: u64,
        offset: u64,
        resp: oneshot::Sender<Result<ClipboardHistory>>,
    },
    Search {
        query: String,
        limit: u64,
        resp: oneshot::Sender<Result<ClipboardSearchResult>>,
    },
    MoveToTop {
        entry_id: String,
        resp: oneshot::Sender<Result<bool>>,
    },
    Delete {
        entry_id: String,
        resp: oneshot::Sender<Result<bool>>,
    },
    Stats {
        resp: oneshot::Sender<ClientStats>,
    },
    Disconnect {
        resp: oneshot::Sender<()>,
    },
}

/// Handle to the client session worker. Cheap to clone; all operations
/// are forwarded to the worker task that owns the connection.
#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::Sender<Command>,
}

impl Client {
    /// Spawns the session worker and returns the handle plus the event
    /// stream. The returned client is idle until [`Client::connect`].
    pub fn start(cfg: ClientConfig) -> (Client, mpsc::Receiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        let worker = ClientWorker::new(cfg, cmd_rx, event_tx);
        tokio::spawn(async move {
            worker.main_loop().await;
        });

        (Client { cmd_tx }, event_rx)
    }

    pub async fn connect(&self) -> Result<()> {
        self.call(|resp| Command::Connect { resp }).await?
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<AuthResponse> {
        self.call(|resp| Command::Login {
            username: username.to_string(),
            password: password.to_string(),
            resp,
        })
        .await?
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<AuthResponse> {
        self.call(|resp| Command::Register {
            username: username.to_string(),
            password: password.to_string(),
            resp,
        })
        .await?
    }

    pub async fn authenticate_key(&self, api_key: &str) -> Result<AuthResponse> {
        self.call(|resp| Command::AuthKey {
            api_key: api_key.to_string(),
            resp,
        })
        .await?
    }

    pub async fn push(
        &self,
        content_type: ContentType,
        content: Vec<u8>,
        preview: Option<String>,
    ) -> Result<PushOutcome> {
        self.call(|resp| Command::Push {
            content_type,
            content,
            preview,
            resp,
        })
        .await?
    }

    pub async fn pull(&self, limit: u64, offset: u64) -> Result<ClipboardHistory> {
        self.call(|resp| Command::Pull {
            limit,
            offset,
            resp,
        })
        .await?
    }

    pub async fn search(&self, query: &str, limit: u64) -> Result<ClipboardSearchResult> {
        self.call(|resp| Command::Search {
            query: query.to_string(),
            limit,
            resp,
        })
        .await?
    }

    pub async fn move_to_top(&self, entry_id: &str) -> Result<bool> {
        self.call(|resp| Command::MoveToTop {
            entry_id: entry_id.to_string(),
            resp,
        })
        .await?
    }

    pub async fn delete(&self, entry_id: &str) -> Result<bool> {
        self.call(|resp| Command::Delete {
            entry_id: entry_id.to_string(),
            resp,
        })
        .await?
    }

    pub async fn stats(&self) -> Result<ClientStats> {
        self.call(|resp| Command::Stats { resp }).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.call(|resp| Command::Disconnect { resp }).await
    }

    async fn call<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(resp_tx))
            .await
            .context("send command to client worker")?;
        resp_rx
            .await
            .context("recv response from client worker")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connected,
    Authenticated,
}

struct QueuedPush {
    content_type: ContentType,
    content: Vec<u8>,
    preview: Option<String>,
    queued_at: u64,
}

enum PushReply {
    Acked(String),
    Rejected(String),
}

struct ClientWorker {
    cfg: ClientConfig,
    cmd_rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<ClientEvent>,

    conn: Option<Arc<Connection>>,
    state: State,
    sequence_id: u32,

    /// Key stored after the first successful auth; reconnects use it so
    /// the password never needs to be kept.
    api_key: Option<String>,
    was_ever_connected: bool,
    auto_reconnect: bool,
    needs_reconnect: bool,

    offline_queue: VecDeque<QueuedPush>,
    last_remote_hash: Option<String>,
    last_error: Option<String>,

    heartbeat: tokio::time::Interval,
    heartbeat_sent: Option<Instant>,
    heartbeat_misses: u32,
    latency_window: VecDeque<u64>,
}

impl ClientWorker {
    fn new(
        cfg: ClientConfig,
        cmd_rx: mpsc::Receiver<Command>,
        events: mpsc::Sender<ClientEvent>,
    ) -> Self {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(cfg.heartbeat_secs));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            cfg,
            cmd_rx,
            events,
            conn: None,
            state: State::Disconnected,
            sequence_id: 0,
            api_key: None,
            was_ever_connected: false,
            auto_reconnect: false,
            needs_reconnect: false,
            offline_queue: VecDeque::new(),
            last_remote_hash: None,
            last_error: None,
            heartbeat,
            heartbeat_sent: None,
            heartbeat_misses: 0,
            latency_window: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    async fn main_loop(mut self) {
        debug!("Client worker starting");
        loop {
            let authenticated = self.state == State::Authenticated && self.conn.is_some();
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // All handles dropped, shut down.
                    None => break,
                },
                ret = recv_or_pending(&self.conn) => self.handle_incoming(ret).await,
                _ = self.heartbeat.tick(), if authenticated => self.send_heartbeat().await,
            }

            if self.needs_reconnect {
                self.needs_reconnect = false;
                self.reconnect_cycle().await;
            }
        }
        debug!("Client worker stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { resp } => {
                let ret = self.establish().await;
                if let Err(ref err) = ret {
                    self.last_error = Some(format!("{err:#}"));
                }
                let _ = resp.send(ret);
            }
            Command::Login {
                username,
                password,
                resp,
            } => {
                let ret = self
                    .authenticate(Packet::AuthLogin(AuthLogin { username, password }))
                    .await;
                let _ = resp.send(ret);
            }
            Command::Register {
                username,
                password,
                resp,
            } => {
                let ret = self
                    .authenticate(Packet::AuthRegister(AuthRegister { username, password }))
                    .await;
                let _ = resp.send(ret);
            }
            Command::AuthKey { api_key, resp } => {
                let ret = self
                    .authenticate(Packet::AuthApiKey(AuthApiKey {
                        api_key: api_key.clone(),
                    }))
                    .await;
                if let Ok(ref response) = ret {
                    if response.success {
                        self.api_key = Some(api_key);
                    }
                }
                let _ = resp.send(ret);
            }
            Command::Push {
                content_type,
                content,
                preview,
                resp,
            } => {
                let ret = self.handle_push(content_type, content, preview).await;
                let _ = resp.send(ret);
            }
            Command::Pull {
                limit,
                offset,
                resp,
            } => {
                let ret = self.handle_pull(limit, offset).await;
                let _ = resp.send(ret);
            }
            Command::Search { query, limit, resp } => {
                let ret = self.handle_search(query, limit).await;
                let _ = resp.send(ret);
            }
            Command::MoveToTop { entry_id, resp } => {
                let ret = self.handle_move_to_top(entry_id).await;
                let _ = resp.send(ret);
            }
            Command::Delete { entry_id, resp } => {
                let ret = self.handle_delete(entry_id).await;
                let _ = resp.send(ret);
            }
            Command::Stats { resp } => {
                let _ = resp.send(ClientStats {
                    authenticated: self.state == State::Authenticated,
                    was_ever_connected: self.was_ever_connected,
                    sequence_id: self.sequence_id,
                    queued: self.offline_queue.len(),
                    latency_window: self.latency_window.iter().copied().collect(),
                    last_error: self.last_error.clone(),
                });
            }
            Command::Disconnect { resp } => {
                self.auto_reconnect = false;
                if let Some(ref conn) = self.conn {
                    let _ = conn
                        .send(&Packet::Disconnect(Disconnect {
                            reason: String::from("client disconnect"),
                        }))
                        .await;
                    conn.close().await;
                }
                self.conn = None;
                self.state = State::Disconnected;
                let _ = resp.send(());
            }
        }
    }

    /// Dial, read the hello, optionally upgrade to TLS, then connect.
    async fn establish(&mut self) -> Result<()> {
        if self.conn.is_some() {
            self.teardown().await;
        }
        let conn = Arc::new(Connection::dial(&self.cfg.server).await?);

        let hello = match conn.must_recv().await.context("recv server hello")? {
            Packet::ServerHello(hello) => hello,
            other => bail!("expected server hello, got {}", other.name()),
        };

        if self.cfg.tls.enable {
            if !hello.tls_available {
                bail!("tls is enabled but the server does not offer it");
            }
            conn.send(&Packet::StartTls).await?;
            match conn.must_recv().await.context("recv starttls ack")? {
                Packet::StartTlsAck(ack) if ack.success => {}
                Packet::StartTlsAck(ack) => bail!("server refused tls upgrade: {}", ack.message),
                other => bail!("expected starttls ack, got {}", other.name()),
            }
            let connector = self.build_connector()?;
            let host = self
                .cfg
                .server
                .split(':')
                .next()
                .unwrap_or(self.cfg.server.as_str());
            conn.upgrade_client(&connector, tls::server_name(host)?)
                .await?;
            debug!("Connection upgraded to tls");
        } else if hello.tls_required {
            bail!("server requires tls but the client has it disabled");
        }

        conn.send(&Packet::Connect(Connect {
            client_version: String::from(CLIENT_VERSION),
            platform: self.cfg.platform.clone(),
            device_id: self.cfg.device_id.clone(),
            device_name: self.cfg.device_name.clone(),
        }))
        .await?;
        let ack = match conn.must_recv().await.context("recv connect ack")? {
            Packet::ConnectAck(ack) => ack,
            Packet::ErrorResponse(err) => bail!("server rejected connect: {}", err.message),
            other => bail!("expected connect ack, got {}", other.name()),
        };

        if ack.server_version != CLIENT_VERSION {
            self.emit(ClientEvent::ServerVersionMismatch {
                server_version: ack.server_version.clone(),
                client_version: String::from(CLIENT_VERSION),
            })
            .await;
        }

        info!(
            "Connected to {} (server version {})",
            self.cfg.server, ack.server_version
        );
        self.conn = Some(conn);
        self.state = State::Connected;
        self.was_ever_connected = true;
        self.heartbeat.reset();
        self.heartbeat_sent = None;
        self.heartbeat_misses = 0;
        Ok(())
    }

    fn build_connector(&self) -> Result<TlsConnector> {
        let ca_path = if self.cfg.tls.ca_path.is_empty() {
            None
        } else {
            Some(std::path::PathBuf::from(&self.cfg.tls.ca_path))
        };
        tls::build_connector(ca_path.as_deref(), self.cfg.tls.danger_accept_invalid_certs)
    }

    async fn authenticate(&mut self, packet: Packet) -> Result<AuthResponse> {
        if self.state != State::Connected {
            bail!("not connected to server");
        }

        let response = match self.request_reply(packet).await? {
            Packet::AuthResponse(response) => response,
            other => bail!("expected auth response, got {}", other.name()),
        };

        self.emit(ClientEvent::AuthResult {
            success: response.success,
            message: response.message.clone(),
        })
        .await;

        if response.success {
            self.state = State::Authenticated;
            self.auto_reconnect = true;
            if let Some(ref key) = response.api_key {
                self.api_key = Some(key.clone());
            }
            info!("Authenticated, user id {:?}", response.user_id);
        }
        Ok(response)
    }

    async fn handle_push(
        &mut self,
        content_type: ContentType,
        content: Vec<u8>,
        preview: Option<String>,
    ) -> Result<PushOutcome> {
        // Echo suppression: never push back what was just received.
        let hash = code::sha256(&content);
        if self.last_remote_hash.as_deref() == Some(hash.as_str()) {
            debug!("Push suppressed, content matches last received broadcast");
            return Ok(PushOutcome::Suppressed);
        }

        if self.state != State::Authenticated {
            if self.was_ever_connected {
                self.offline_queue.push_back(QueuedPush {
                    content_type,
                    content,
                    preview,
                    queued_at: now_millis(),
                });
                debug!(
                    "Not authenticated, queued push ({} pending)",
                    self.offline_queue.len()
                );
                return Ok(PushOutcome::Queued);
            }
            bail!("not connected to server");
        }

        match self.send_push(content_type, content.clone(), preview.clone()).await {
            Ok(PushReply::Acked(entry_id)) => Ok(PushOutcome::Acked { entry_id }),
            Ok(PushReply::Rejected(message)) => bail!("server rejected push: {message}"),
            Err(err) => {
                // The connection is gone; keep the item and recover.
                warn!("Push failed, queueing and reconnecting: {err:#}");
                self.offline_queue.push_back(QueuedPush {
                    content_type,
                    content,
                    preview,
                    queued_at: now_millis(),
                });
                self.needs_reconnect = true;
                Ok(PushOutcome::Queued)
            }
        }
    }

    /// Distinguishes a transport failure (`Err`, the item is worth
    /// retrying) from a server-side rejection (`Rejected`, it is not).
    async fn send_push(
        &mut self,
        content_type: ContentType,
        content: Vec<u8>,
        preview: Option<String>,
    ) -> Result<PushReply> {
        let packet = Packet::ClipboardPush(ClipboardPush {
            entry: NewEntry {
                content_type,
                content,
                preview,
                source_device: Some(self.cfg.device_name.clone()),
            },
        });
        match self.request_reply(packet).await? {
            Packet::ClipboardPushAck(ack) => {
                if ack.success {
                    Ok(PushReply::Acked(ack.entry_id.unwrap_or_default()))
                } else {
                    Ok(PushReply::Rejected(ack.message))
                }
            }
            other => bail!("expected push ack, got {}", other.name()),
        }
    }

    async fn handle_pull(&mut self, limit: u64, offset: u64) -> Result<ClipboardHistory> {
        if self.state != State::Authenticated {
            bail!("not authenticated");
        }
        match self
            .request_reply(Packet::ClipboardPull(ClipboardPull { limit, offset }))
            .await?
        {
            Packet::ClipboardHistory(history) => Ok(history),
            other => bail!("expected history, got {}", other.name()),
        }
    }

    async fn handle_search(&mut self, query: String, limit: u64) -> Result<ClipboardSearchResult> {
        if self.state != State::Authenticated {
            bail!("not authenticated");
        }
        match self
            .request_reply(Packet::ClipboardSearch(ClipboardSearch { query, limit }))
            .await?
        {
            Packet::ClipboardSearchResult(result) => Ok(result),
            other => bail!("expected search result, got {}", other.name()),
        }
    }

    async fn handle_move_to_top(&mut self, entry_id: String) -> Result<bool> {
        if self.state != State::Authenticated {
            bail!("not authenticated");
        }
        match self
            .request_reply(Packet::ClipboardMoveToTop(ClipboardMoveToTop { entry_id }))
            .await?
        {
            Packet::ClipboardMoveToTopAck(ack) => Ok(ack.success),
            other => bail!("expected move ack, got {}", other.name()),
        }
    }

    async fn handle_delete(&mut self, entry_id: String) -> Result<bool> {
        if self.state != State::Authenticated {
            bail!("not authenticated");
        }
        match self
            .request_reply(Packet::ClipboardDelete(ClipboardDelete { entry_id }))
            .await?
        {
            Packet::ClipboardDeleteAck(ack) => Ok(ack.success),
            other => bail!("expected delete ack, got {}", other.name()),
        }
    }

    /// Sends a request and waits for its reply, servicing broadcasts and
    /// heartbeat acks that arrive in between.
    async fn request_reply(&mut self, packet: Packet) -> Result<Packet> {
        let conn = match self.conn {
            Some(ref conn) => conn.clone(),
            None => bail!("not connected to server"),
        };

        self.sequence_id = self.sequence_id.wrapping_add(1);
        debug!("Request #{}: {}", self.sequence_id, packet.name());
        conn.send(&packet).await?;

        loop {
            let reply = match conn.must_recv().await {
                Ok(reply) => reply,
                Err(err) => {
                    self.connection_broken(&err).await;
                    return Err(err);
                }
            };
            match reply {
                Packet::ClipboardBroadcast(broadcast) => {
                    self.handle_broadcast(broadcast).await;
                }
                Packet::HeartbeatAck => self.handle_heartbeat_ack().await,
                Packet::ErrorResponse(err) => {
                    return Err(anyhow!("server error {}: {}", err.code, err.message));
                }
                reply => return Ok(reply),
            }
        }
    }

    async fn handle_incoming(&mut self, ret: Result<Option<Packet>>) {
        match ret {
            Ok(Some(Packet::ClipboardBroadcast(broadcast))) => {
                self.handle_broadcast(broadcast).await;
            }
            Ok(Some(Packet::HeartbeatAck)) => self.handle_heartbeat_ack().await,
            Ok(Some(Packet::Disconnect(disconnect))) => {
                info!("Server disconnected us: {}", disconnect.reason);
                self.teardown().await;
                self.needs_reconnect = true;
            }
            Ok(Some(Packet::ErrorResponse(err))) => {
                warn!("Server error {}: {}", err.code, err.message);
                self.last_error = Some(err.message);
            }
            Ok(Some(other)) => {
                warn!("Unexpected packet {} outside a request", other.name());
            }
            Ok(None) => {
                info!("Connection closed by server");
                self.teardown().await;
                self.needs_reconnect = true;
            }
            Err(err) => {
                self.connection_broken(&err).await;
                self.needs_reconnect = true;
            }
        }
    }

    async fn handle_broadcast(&mut self, broadcast: ClipboardBroadcast) {
        debug!(
            "Received broadcast from {:?}: {}",
            broadcast.from_device, broadcast.entry.preview
        );
        self.last_remote_hash = Some(broadcast.entry.hash.clone());
        self.emit(ClientEvent::ClipboardReceived(broadcast.entry)).await;
    }

    async fn send_heartbeat(&mut self) {
        let conn = match self.conn {
            Some(ref conn) => conn.clone(),
            None => return,
        };

        if self.heartbeat_sent.is_some() {
            // The previous heartbeat was never acked.
            self.heartbeat_misses += 1;
            warn!(
                "Heartbeat miss {}/{}",
                self.heartbeat_misses, MAX_HEARTBEAT_MISSES
            );
            if self.heartbeat_misses >= MAX_HEARTBEAT_MISSES {
                self.teardown().await;
                self.needs_reconnect = true;
                return;
            }
        }

        self.heartbeat_sent = Some(Instant::now());
        if let Err(err) = conn.send(&Packet::Heartbeat).await {
            warn!("Heartbeat send failed: {err:#}");
            self.teardown().await;
            self.needs_reconnect = true;
        }
    }

    async fn handle_heartbeat_ack(&mut self) {
        if let Some(sent) = self.heartbeat_sent.take() {
            let latency = sent.elapsed().as_millis() as u64;
            self.heartbeat_misses = 0;
            if self.latency_window.len() == LATENCY_WINDOW {
                self.latency_window.pop_front();
            }
            self.latency_window.push_back(latency);
            self.emit(ClientEvent::HeartbeatLatency(latency)).await;
        }
    }

    async fn connection_broken(&mut self, err: &anyhow::Error) {
        error!("Connection error: {err:#}");
        self.last_error = Some(format!("{err:#}"));
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        self.state = State::Disconnected;
        self.heartbeat_sent = None;
        self.heartbeat_misses = 0;
    }

    /// Linear-backoff reconnect: re-run connect and key auth, then flush
    /// the offline queue in order.
    async fn reconnect_cycle(&mut self) {
        if !self.auto_reconnect || !self.was_ever_connected {
            return;
        }
        let api_key = match self.api_key.clone() {
            Some(key) => key,
            None => {
                self.emit(ClientEvent::ConnectionLost).await;
                return;
            }
        };

        for attempt in 1..=self.cfg.max_reconnect_attempts {
            if attempt > 1 {
                let delay = self.cfg.reconnect_delay_ms * (attempt as u64 - 1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            info!(
                "Reconnect attempt {}/{}",
                attempt, self.cfg.max_reconnect_attempts
            );

            match self.try_reconnect(&api_key).await {
                Ok(()) => {
                    info!("Reconnected to {}", self.cfg.server);
                    self.emit(ClientEvent::ConnectionRestored).await;
                    self.flush_offline_queue().await;
                    return;
                }
                Err(err) => {
                    warn!("Reconnect attempt {attempt} failed: {err:#}");
                    self.last_error = Some(format!("{err:#}"));
                }
            }
        }

        error!("Reconnect attempts exhausted");
        self.emit(ClientEvent::ConnectionLost).await;
    }

    async fn try_reconnect(&mut self, api_key: &str) -> Result<()> {
        self.teardown().await;
        self.establish().await?;
        let response = self
            .authenticate(Packet::AuthApiKey(AuthApiKey {
                api_key: api_key.to_string(),
            }))
            .await?;
        if !response.success {
            bail!("api key auth failed: {}", response.message);
        }
        Ok(())
    }

    /// Sends queued pushes oldest first. A failure leaves the head in
    /// place and aborts; the next successful reconnect retries.
    async fn flush_offline_queue(&mut self) {
        if self.offline_queue.is_empty() {
            return;
        }
        info!("Flushing {} queued pushes", self.offline_queue.len());

        while let Some(item) = self.offline_queue.front() {
            let content_type = item.content_type;
            let content = item.content.clone();
            let preview = item.preview.clone();
            debug!(
                "Flushing queued push from {}",
                krypton_misc::time::format_time(item.queued_at)
            );

            match self.send_push(content_type, content, preview).await {
                Ok(PushReply::Acked(_)) => {
                    self.offline_queue.pop_front();
                }
                Ok(PushReply::Rejected(message)) => {
                    // The server will never take this item; drop it and
                    // keep flushing the rest.
                    warn!("Server rejected queued push, dropping it: {message}");
                    self.offline_queue.pop_front();
                }
                Err(err) => {
                    warn!("Offline queue flush interrupted: {err:#}");
                    return;
                }
            }
        }
        info!("Offline queue flushed");
    }

    async fn emit(&self, event: ClientEvent) {
        if let Err(err) = self.events.send(event).await {
            debug!("Event receiver dropped: {err:#}");
        }
    }
}

async fn recv_or_pending(conn: &Option<Arc<Connection>>) -> Result<Option<Packet>> {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}
