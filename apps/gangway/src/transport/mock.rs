//! In-memory transport for tests.
//!
//! `MockConnector` records every link it opens; tests reach the links through
//! it to inject state changes and inbound frames, or to inspect what the
//! session wrote.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

use crate::protocol::{self, ControlFrame, MessageId};
use crate::transport::{
    DataChannel, IceCandidate, LinkEvent, LinkEventSink, LinkOptions, LinkState, OpenedLink,
    PeerConnector, PeerLink, SessionDescription, TransportError,
};

#[derive(Default)]
struct ConnectorState {
    links: Vec<Arc<MockPeerLink>>,
    fail_next: bool,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn latest(&self) -> Option<Arc<MockPeerLink>> {
        self.state.lock().links.last().cloned()
    }

    /// Makes the next `open` call fail with a setup error.
    pub fn fail_next_open(&self) {
        self.state.lock().fail_next = true;
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn open(
        &self,
        options: &LinkOptions,
        sink: LinkEventSink,
    ) -> Result<OpenedLink, TransportError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(TransportError::Setup("mock open refused".into()));
        }
        let link = Arc::new(MockPeerLink::new(sink));
        let control = link.channel(&options.control_label);
        state.links.push(Arc::clone(&link));
        Ok(OpenedLink {
            link: link as Arc<dyn PeerLink>,
            control,
        })
    }
}

#[derive(Default)]
struct MockLinkState {
    channels: HashMap<String, Arc<MockDataChannel>>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    reject_remote: bool,
    closed: bool,
}

pub struct MockPeerLink {
    sink: LinkEventSink,
    state: Mutex<MockLinkState>,
}

impl MockPeerLink {
    fn new(sink: LinkEventSink) -> Self {
        Self {
            sink,
            state: Mutex::new(MockLinkState::default()),
        }
    }

    fn channel(&self, label: &str) -> Arc<MockDataChannel> {
        let mut state = self.state.lock();
        Arc::clone(
            state
                .channels
                .entry(label.to_string())
                .or_insert_with(|| Arc::new(MockDataChannel::new(label))),
        )
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    pub fn emit(&self, event: LinkEvent) {
        self.sink.emit(event);
    }

    pub fn set_state(&self, state: LinkState) {
        self.emit(LinkEvent::StateChanged(state));
    }

    pub fn gather_candidate(&self) {
        self.emit(LinkEvent::Candidate(Some(IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })));
    }

    pub fn open_control(&self) {
        self.emit(LinkEvent::ChannelOpen {
            label: protocol::CONTROL_LABEL.into(),
        });
    }

    pub fn close_control(&self) {
        self.emit(LinkEvent::ChannelClosed {
            label: protocol::CONTROL_LABEL.into(),
        });
    }

    pub fn deliver(&self, data: Bytes) {
        self.emit(LinkEvent::ChannelMessage {
            label: protocol::CONTROL_LABEL.into(),
            data,
        });
    }

    pub fn ack(&self, reference: MessageId, body: Value) {
        if let Ok(frame) = protocol::ack_frame(reference, false, body) {
            self.deliver(frame);
        }
    }

    pub fn nack(&self, reference: MessageId, body: Value) {
        if let Ok(frame) = protocol::ack_frame(reference, true, body) {
            self.deliver(frame);
        }
    }

    pub fn sent(&self, label: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .channels
            .get(label)
            .map(|channel| channel.sent())
            .unwrap_or_default()
    }

    /// Frames written to the control substream, decoded.
    pub fn control_frames(&self) -> Vec<ControlFrame> {
        self.sent(protocol::CONTROL_LABEL)
            .iter()
            .filter_map(|bytes| serde_json::from_slice(bytes).ok())
            .collect()
    }

    pub fn channel_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.state.lock().channels.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn reject_remote_descriptions(&self) {
        self.state.lock().reject_remote = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl PeerLink for MockPeerLink {
    async fn local_description(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=mock {} 0 IN IP4 127.0.0.1\r\n",
            self.sink.generation()
        )))
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.reject_remote {
            return Err(TransportError::Setup("remote description rejected".into()));
        }
        state.remote = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.state.lock().candidates.push(candidate);
        Ok(())
    }

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        if self.state.lock().closed {
            return Err(TransportError::ChannelClosed);
        }
        Ok(self.channel(label))
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for channel in state.channels.values() {
            channel.close();
        }
    }
}

pub struct MockDataChannel {
    label: String,
    sent: Mutex<Vec<Bytes>>,
    closed: Mutex<bool>,
}

impl MockDataChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    fn close(&self) {
        *self.closed.lock() = true;
    }
}

impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if *self.closed.lock() {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.lock().push(data);
        Ok(())
    }
}
