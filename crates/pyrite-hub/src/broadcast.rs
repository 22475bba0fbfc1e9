use crate::cache::StateCache;
use crate::config::Config;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use pyrite_core::protocol::{
    decode_frame, encode_frame, ErrorPayload, InitPayload, WireEnvelope, WireMsg,
    DEFAULT_MAX_FRAME_BYTES,
};
use pyrite_core::{Diagnostic, DiagnosticKind};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex as AsyncMutex, RwLock,
    },
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub stale_after: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub debug: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            stale_after: Duration::from_secs(60),
            queue_capacity: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            debug: false,
        }
    }
}

impl From<&Config> for HubConfig {
    fn from(config: &Config) -> Self {
        Self {
            ping_interval: config.ping_interval,
            write_timeout: config.write_timeout,
            stale_after: config.stale_after,
            queue_capacity: config.queue_capacity.max(1),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            debug: config.debug,
        }
    }
}

pub struct Client {
    pub conn_id: String,
    client_id: AsyncMutex<Option<String>>,
    sender: mpsc::Sender<Message>,
    last_seen: AsyncMutex<Instant>,
}

impl Client {
    async fn touch(&self) {
        let mut last = self.last_seen.lock().await;
        *last = Instant::now();
    }

    async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    pub async fn client_id(&self) -> Option<String> {
        self.client_id.lock().await.clone()
    }

    fn close(&self, reason: &str) {
        let _ = self.sender.try_send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: reason.to_string().into(),
        })));
    }
}

/// Connected clients and the fan-out of hub messages to them.
pub struct Hub {
    config: HubConfig,
    cache: Arc<StateCache>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    // Serializes init snapshots against broadcasts so a client never sees an
    // init older than an update already queued to it.
    publish: AsyncMutex<()>,
}

impl Hub {
    pub fn new(config: HubConfig, cache: Arc<StateCache>) -> Self {
        Self {
            config,
            cache,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            publish: AsyncMutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Registers an outbound queue and sends it the current `init`.
    pub async fn attach(self: &Arc<Self>, sender: mpsc::Sender<Message>) -> Arc<Client> {
        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            client_id: AsyncMutex::new(None),
            sender,
            last_seen: AsyncMutex::new(Instant::now()),
        });

        let _order = self.publish.lock().await;
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        info!(event = "client_connected", conn_id = %client.conn_id);
        self.enqueue_init(&client).await;
        client
    }

    pub async fn send_init(&self, client: &Arc<Client>) {
        let _order = self.publish.lock().await;
        self.enqueue_init(client).await;
    }

    async fn enqueue_init(&self, client: &Arc<Client>) {
        let repositories = self.cache.all().await;
        let count = repositories.len();
        let envelope = WireEnvelope::from_hub(WireMsg::Init(InitPayload { repositories }));
        let frame = match encode_frame(&envelope, self.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                // Updates alone can never sync this client; close it.
                warn!(event = "init_encode_error", conn_id = %client.conn_id, error = %err);
                self.send_error(client, "init_failed", &err.to_string());
                self.cache
                    .record(Diagnostic::new(
                        "",
                        DiagnosticKind::Broadcast,
                        None,
                        format!("init for {} failed: {err}", client.conn_id),
                    ))
                    .await;
                self.remove_client(client, "init_failed").await;
                return;
            }
        };
        if let Err(err) = client.sender.try_send(Message::Text(frame)) {
            self.drop_failed(client, err).await;
            return;
        }
        info!(event = "init_sent", conn_id = %client.conn_id, repositories = count);
    }

    /// Sends `msg` to every registered client. Returns how many accepted it.
    pub async fn broadcast(&self, msg: WireMsg) -> usize {
        let kind = msg.type_name();
        let envelope = WireEnvelope::from_hub(msg);
        let frame = match encode_frame(&envelope, self.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "broadcast_encode_error", message_type = kind, error = %err);
                self.cache
                    .record(Diagnostic::new(
                        repository_of(&envelope.msg),
                        DiagnosticKind::Broadcast,
                        None,
                        err.to_string(),
                    ))
                    .await;
                return 0;
            }
        };

        let _order = self.publish.lock().await;
        let clients: Vec<Arc<Client>> = self.clients.read().await.values().cloned().collect();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for client in clients {
            match client.sender.try_send(Message::Text(frame.clone())) {
                Ok(()) => delivered += 1,
                Err(err) => failed.push((client, err)),
            }
        }
        for (client, err) in failed {
            self.drop_failed(&client, err).await;
        }
        debug!(event = "broadcast", message_type = kind, delivered = delivered);
        delivered
    }

    async fn drop_failed(&self, client: &Client, err: TrySendError<Message>) {
        let reason = match err {
            TrySendError::Full(_) => "slow_consumer",
            TrySendError::Closed(_) => "closed",
        };
        warn!(event = "send_error", conn_id = %client.conn_id, reason = reason);
        self.cache
            .record(Diagnostic::new(
                "",
                DiagnosticKind::Broadcast,
                None,
                format!("dropped {}: {reason}", client.conn_id),
            ))
            .await;
        self.remove_client(client, reason).await;
    }

    pub async fn remove_client(&self, client: &Client, reason: &str) {
        client.close(reason);
        if self.clients.write().await.remove(&client.conn_id).is_some() {
            info!(event = "client_disconnected", conn_id = %client.conn_id, reason = reason);
        }
    }

    fn send_error(&self, client: &Client, code: &str, message: &str) {
        let envelope = WireEnvelope::from_hub(WireMsg::Error(ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        }));
        if let Ok(frame) = encode_frame(&envelope, self.config.max_frame_bytes) {
            let _ = client.sender.try_send(Message::Text(frame));
        }
    }

    /// Handles one inbound frame from a client.
    pub async fn handle_frame(&self, client: &Arc<Client>, data: &[u8]) {
        client.touch().await;
        if self.config.debug {
            debug!(event = "message_received", conn_id = %client.conn_id, raw = %String::from_utf8_lossy(data));
        }
        let envelope: WireEnvelope = match decode_frame(data, self.config.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %client.conn_id, error = %err);
                self.send_error(client, "invalid_frame", &err.to_string());
                return;
            }
        };
        match envelope.msg {
            WireMsg::Hello(hello) => {
                info!(event = "hello", conn_id = %client.conn_id, client_id = %hello.client_id);
                *client.client_id.lock().await = Some(hello.client_id);
            }
            WireMsg::Resync(resync) => {
                info!(
                    event = "resync",
                    conn_id = %client.conn_id,
                    reason = resync.reason.as_deref().unwrap_or("")
                );
                self.send_init(client).await;
            }
            other => {
                warn!(event = "unexpected_message", conn_id = %client.conn_id, message_type = other.type_name());
                self.send_error(
                    client,
                    "unexpected_message",
                    &format!("clients may not send {}", other.type_name()),
                );
            }
        }
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() || closing {
                    return;
                }
            }
        });

        debug!(event = "socket_open", remote = %remote);
        let client = self.attach(tx).await;
        self.clone().start_ping(client.clone());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    client.touch().await;
                    continue;
                }
            };
            self.handle_frame(&client, &data).await;
        }

        self.remove_client(&client, "disconnect").await;
        drop(client);
        let _ = tokio::time::timeout(write_timeout, write_task).await;
    }

    /// Closes every client that has been silent for longer than
    /// `stale_after` as of `now`. Returns how many were closed.
    pub async fn reap_stale(&self, now: Instant) -> usize {
        let stale_after = self.config.stale_after;
        let clients: Vec<Arc<Client>> = self.clients.read().await.values().cloned().collect();
        let mut reaped = 0;
        for client in clients {
            let silent = now.saturating_duration_since(client.last_seen().await);
            if silent <= stale_after {
                continue;
            }
            warn!(
                event = "stale_close",
                conn_id = %client.conn_id,
                silent_ms = silent.as_millis() as u64
            );
            self.remove_client(&client, "stale").await;
            reaped += 1;
        }
        reaped
    }

    pub fn start_stale_reaper(self: Arc<Self>) {
        let stale_after = self.config.stale_after;
        if stale_after.is_zero() {
            return;
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stale_after / 2);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reaped = self.reap_stale(Instant::now()).await;
                if reaped > 0 {
                    debug!(event = "stale_reaped", clients = reaped);
                }
            }
        });
    }

    fn start_ping(self: Arc<Self>, client: Arc<Client>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !self.clients.read().await.contains_key(&client.conn_id) {
                    return;
                }
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(event = "ping_failed", conn_id = %client.conn_id);
                    self.remove_client(&client, "ping_failed").await;
                    return;
                }
            }
        });
    }
}

fn repository_of(msg: &WireMsg) -> String {
    match msg {
        WireMsg::Update(update) => update.repository.clone(),
        WireMsg::Snapshot(snapshot) => snapshot.snapshot.repository.clone(),
        WireMsg::Unwatched(unwatched) => unwatched.repository.clone(),
        WireMsg::Diagnostic(diagnostic) => diagnostic.repository.clone(),
        _ => String::new(),
    }
}
