use crate::store::{ApplyOutcome, ClientStore};
use futures_util::{SinkExt, StreamExt};
use pyrite_core::protocol::{
    decode_frame, encode_frame, HelloPayload, ResyncPayload, WireEnvelope, WireMsg,
    DEFAULT_MAX_FRAME_BYTES,
};
use pyrite_core::{next_backoff, INITIAL_BACKOFF};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:4870/ws";

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid hub url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported hub url scheme {0} (expected ws or wss)")]
    UnsupportedScheme(String),
    #[error("client store lock poisoned")]
    StorePoisoned,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: Url,
    pub client_id: String,
    pub max_frame_bytes: usize,
}

impl ConnectionConfig {
    pub fn new(url: &str, client_id: impl Into<String>) -> Result<Self, ConnectionError> {
        let parsed = Url::parse(url).map_err(|source| ConnectionError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConnectionError::UnsupportedScheme(other.to_string())),
        }
        Ok(Self {
            url: parsed,
            client_id: client_id.into(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }
}

/// Feeds one inbound text frame to the store. Returns a `resync` frame to
/// send back when the store lost track of the hub.
pub fn handle_frame(
    store: &Mutex<ClientStore>,
    config: &ConnectionConfig,
    text: &str,
) -> Result<Option<String>, ConnectionError> {
    let envelope: WireEnvelope = match decode_frame(text.as_bytes(), config.max_frame_bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(event = "frame_rejected", error = %err);
            return Ok(None);
        }
    };
    let outcome = store
        .lock()
        .map_err(|_| ConnectionError::StorePoisoned)?
        .handle_message(envelope.msg);
    debug!(event = "frame_applied", outcome = ?outcome);
    match outcome {
        ApplyOutcome::ResyncRequired { reason } => Ok(outbound(
            config,
            WireMsg::Resync(ResyncPayload {
                reason: Some(reason),
            }),
        )),
        _ => Ok(None),
    }
}

fn outbound(config: &ConnectionConfig, msg: WireMsg) -> Option<String> {
    let envelope = WireEnvelope::new(config.client_id.clone(), msg);
    match encode_frame(&envelope, config.max_frame_bytes) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(event = "frame_encode_failed", error = %err);
            None
        }
    }
}

/// Keeps a connection to the hub alive until the task is dropped. Every
/// reconnect starts from the `init` the hub sends on attach.
pub async fn run(config: ConnectionConfig, store: Arc<Mutex<ClientStore>>) -> Result<(), ConnectionError> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let (mut ws, _) = match connect_async(config.url.as_str()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_connect_error", url = %config.url, error = %err, retry_in_ms = backoff.as_millis() as u64);
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;
        info!(event = "hub_connected", url = %config.url);

        let hello = outbound(
            &config,
            WireMsg::Hello(HelloPayload {
                client_id: config.client_id.clone(),
            }),
        );
        if let Some(hello) = hello {
            if ws.send(Message::Text(hello)).await.is_err() {
                warn!(event = "hub_hello_error");
                let _ = ws.close(None).await;
                continue;
            }
        }

        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(resync) = handle_frame(&store, &config, &text)? {
                        info!(event = "resync_requested");
                        if ws.send(Message::Text(resync)).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(event = "hub_read_error", error = %err);
                    break;
                }
            }
        }
        let _ = ws.close(None).await;
        warn!(event = "hub_disconnected", retry_in_ms = backoff.as_millis() as u64);
        tokio::time::sleep(backoff).await;
    }
}
