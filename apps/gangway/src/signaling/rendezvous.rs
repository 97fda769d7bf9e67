//! Push channel to the rendezvous service.
//!
//! The client owns a websocket with a writer and a reader task. Outbound
//! messages queue in an unbounded channel until the socket is up; inbound
//! messages are decoded into [`RendezvousMessage`] and handed to whoever
//! holds the receiver (the session manager).

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{SignalTarget, SignalingBackend, SignalingError, decode_description, encode_description};
use crate::transport::{IceCandidate, SessionDescription};

const TARGET: &str = "gangway::signaling::rendezvous";

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("invalid rendezvous url: {0}")]
    Url(#[from] url::ParseError),
    #[error("rendezvous message is not an object")]
    NotAnObject,
    #[error("malformed rendezvous `{field}`: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("rendezvous client closed")]
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RendezvousConfig {
    /// Rendezvous service host, without scheme.
    pub host: String,
    pub fingerprint: String,
    pub name: String,
    pub kind: String,
    pub email: String,
}

pub fn rendezvous_url(config: &RendezvousConfig) -> Result<Url, RendezvousError> {
    let mut url = Url::parse(&format!("wss://{}/ws", config.host.trim_end_matches('/')))?;
    url.query_pairs_mut()
        .append_pair("fp", &config.fingerprint)
        .append_pair("name", &config.name)
        .append_pair("kind", &config.kind)
        .append_pair("email", &config.email);
    Ok(url)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PeerRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub fp: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub user: Option<String>,
}

impl PeerRecord {
    /// Only verified execution hosts become sessions.
    pub fn is_host(&self) -> bool {
        self.kind == "webexec" && self.verified
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RendezvousMessage {
    Error { code: i64, text: String },
    Peers(Vec<PeerRecord>),
    Verified(bool),
    Candidate {
        source_fp: String,
        candidate: IceCandidate,
    },
    Answer {
        source_fp: String,
        answer: SessionDescription,
    },
    PeerUpdate { source_fp: String, online: bool },
    /// Nothing this client acts on.
    Ignored(Value),
}

impl RendezvousMessage {
    pub fn from_value(value: Value) -> Result<Self, RendezvousError> {
        let Value::Object(map) = &value else {
            return Err(RendezvousError::NotAnObject);
        };

        if let Some(code) = map.get("code") {
            let text = map
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(RendezvousMessage::Error {
                code: code.as_i64().unwrap_or_default(),
                text,
            });
        }
        if let Some(peers) = map.get("peers") {
            let peers = serde_json::from_value(peers.clone()).map_err(|err| malformed("peers", err))?;
            return Ok(RendezvousMessage::Peers(peers));
        }
        if let Some(verified) = map.get("verified") {
            return Ok(RendezvousMessage::Verified(verified.as_bool().unwrap_or(false)));
        }

        let Some(source_fp) = map.get("source_fp").and_then(Value::as_str) else {
            return Ok(RendezvousMessage::Ignored(value));
        };
        let source_fp = source_fp.to_string();
        if let Some(candidate) = map.get("candidate") {
            let candidate =
                serde_json::from_value(candidate.clone()).map_err(|err| malformed("candidate", err))?;
            return Ok(RendezvousMessage::Candidate {
                source_fp,
                candidate,
            });
        }
        if let Some(answer) = map.get("answer") {
            let encoded = answer.as_str().ok_or_else(|| RendezvousError::Malformed {
                field: "answer",
                reason: "expected a base64 string".into(),
            })?;
            let answer = decode_description(encoded).map_err(|err| malformed("answer", err))?;
            return Ok(RendezvousMessage::Answer { source_fp, answer });
        }
        if let Some(update) = map.get("peer_update") {
            let online = update
                .get("online")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            return Ok(RendezvousMessage::PeerUpdate { source_fp, online });
        }
        Ok(RendezvousMessage::Ignored(value))
    }

    pub fn source_fp(&self) -> Option<&str> {
        match self {
            RendezvousMessage::Candidate { source_fp, .. }
            | RendezvousMessage::Answer { source_fp, .. }
            | RendezvousMessage::PeerUpdate { source_fp, .. } => Some(source_fp),
            _ => None,
        }
    }
}

fn malformed(field: &'static str, err: impl std::fmt::Display) -> RendezvousError {
    RendezvousError::Malformed {
        field,
        reason: err.to_string(),
    }
}

pub struct RendezvousClient {
    send_tx: mpsc::UnboundedSender<Value>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl RendezvousClient {
    /// Starts connecting in the background. Messages sent before the socket
    /// is up are delivered once it is.
    pub fn spawn(
        config: &RendezvousConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RendezvousMessage>), RendezvousError> {
        let url = rendezvous_url(config)?;
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Value>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RendezvousMessage>();

        let client = Arc::new(Self {
            send_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let registry = Arc::downgrade(&client);
        let socket_task = tokio::spawn(async move {
            tracing::debug!(target: TARGET, host = url.host_str().unwrap_or_default(), "connecting");
            let ws_stream = match connect_async(url.as_str()).await {
                Ok((stream, _)) => stream,
                Err(err) => {
                    tracing::warn!(target: TARGET, error = %err, "rendezvous websocket connect failed");
                    return;
                }
            };
            let (mut ws_write, mut ws_read) = ws_stream.split();

            let writer = tokio::spawn(async move {
                while let Some(message) = send_rx.recv().await {
                    tracing::trace!(target: TARGET, "sending rendezvous message");
                    if ws_write.send(Message::Text(message.to_string())).await.is_err() {
                        break;
                    }
                }
            });
            if let Some(client) = registry.upgrade() {
                client.tasks.lock().push(writer.abort_handle());
            }

            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(target: TARGET, error = %err, "rendezvous websocket error");
                        break;
                    }
                };
                let decoded = serde_json::from_str::<Value>(&text)
                    .map_err(|err| malformed("frame", err))
                    .and_then(RendezvousMessage::from_value);
                match decoded {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: TARGET, error = %err, "dropping rendezvous message");
                    }
                }
            }
            writer.abort();
            tracing::debug!(target: TARGET, "rendezvous websocket closed");
        });
        client.tasks.lock().push(socket_task.abort_handle());

        Ok((client, inbound_rx))
    }

    pub fn send(&self, message: Value) -> Result<(), RendezvousError> {
        self.send_tx.send(message).map_err(|_| RendezvousError::Closed)
    }

    pub fn send_offer(
        &self,
        fingerprint: &str,
        offer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let offer = encode_description(offer)?;
        self.send(json!({"target": fingerprint, "offer": offer}))?;
        Ok(())
    }

    /// Tears down the socket. Later sends fail with `Closed`.
    pub fn close(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for RendezvousClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Offers go out over the push channel; the answer arrives later as a
/// [`RendezvousMessage::Answer`].
pub struct RendezvousSignaling {
    client: Arc<RendezvousClient>,
}

impl RendezvousSignaling {
    pub fn new(client: Arc<RendezvousClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SignalingBackend for RendezvousSignaling {
    async fn exchange(
        &self,
        target: &SignalTarget,
        offer: &SessionDescription,
    ) -> Result<Option<SessionDescription>, SignalingError> {
        let fingerprint = target.fingerprint.as_deref().ok_or(SignalingError::NoRoute)?;
        self.client.send_offer(fingerprint, offer)?;
        tracing::debug!(target: TARGET, fingerprint, "offer relayed");
        Ok(None)
    }
}
