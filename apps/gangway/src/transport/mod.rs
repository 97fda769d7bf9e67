use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport timed out")]
    Timeout,
}

/// Connection state reported by the peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(LinkState),
    /// `None` marks the end of candidate gathering.
    Candidate(Option<IceCandidate>),
    ChannelOpen { label: String },
    ChannelClosed { label: String },
    ChannelMessage { label: String, data: Bytes },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEnvelope {
    pub generation: u64,
    pub event: LinkEvent,
}

/// Forwards link callbacks into the owning session, tagged with the
/// generation of the link that produced them.
#[derive(Clone, Debug)]
pub struct LinkEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEnvelope>,
}

impl LinkEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<LinkEnvelope>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(LinkEnvelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub ice_server: String,
    pub control_label: String,
}

pub struct OpenedLink {
    pub link: Arc<dyn PeerLink>,
    pub control: Arc<dyn DataChannel>,
}

impl std::fmt::Debug for OpenedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedLink")
            .field("control", &self.control.label())
            .finish()
    }
}

/// Creates peer links. Opening a link also creates the control substream
/// and starts candidate gathering with a local offer.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(
        &self,
        options: &LinkOptions,
        sink: LinkEventSink,
    ) -> Result<OpenedLink, TransportError>;
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn local_description(&self) -> Result<SessionDescription, TransportError>;

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn close(&self);
}

pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Queues `data` for delivery; never blocks.
    fn send(&self, data: Bytes) -> Result<(), TransportError>;
}
