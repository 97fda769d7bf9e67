use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::messenger::{Ack, AckDelivery, PendingMessage, ReliableMessenger};
use crate::protocol::{self, ControlMessage, Decoded};
use crate::transport::{DataChannel, TransportError};

const TARGET: &str = "gangway::control";

/// The reliable-ordered substream that carries control frames, plus the
/// backlog of messages written before it opened.
pub struct ControlChannel {
    label: String,
    substream: Option<Arc<dyn DataChannel>>,
    open: bool,
    backlog: VecDeque<PendingMessage>,
}

impl ControlChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            substream: None,
            open: false,
            backlog: VecDeque::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Binds a freshly created substream. It counts as closed until the
    /// link reports it open.
    pub fn attach(&mut self, substream: Arc<dyn DataChannel>) {
        self.substream = Some(substream);
        self.open = false;
    }

    /// Drops the substream together with anything still waiting in the
    /// backlog.
    pub fn reset(&mut self) {
        self.substream = None;
        self.open = false;
        if !self.backlog.is_empty() {
            tracing::debug!(target: TARGET, dropped = self.backlog.len(), "discarding queued control messages");
        }
        self.backlog.clear();
    }

    pub fn is_open(&self) -> bool {
        self.open && self.substream.is_some()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Marks the substream open and hands back the backlog, oldest first.
    pub fn on_open(&mut self) -> Vec<PendingMessage> {
        self.open = true;
        tracing::debug!(target: TARGET, label = %self.label, queued = self.backlog.len(), "control channel open");
        self.backlog.drain(..).collect()
    }

    pub fn on_close(&mut self) {
        tracing::debug!(target: TARGET, label = %self.label, "control channel closed");
        self.open = false;
        self.substream = None;
    }

    pub fn enqueue(&mut self, pending: PendingMessage) {
        self.backlog.push_back(pending);
    }

    pub fn transmit(&self, data: Bytes) -> Result<(), TransportError> {
        self.substream
            .as_ref()
            .ok_or(TransportError::ChannelClosed)?
            .send(data)
    }

    /// Decodes one inbound frame. Acks and nacks are settled against
    /// `messenger`; when a handler was registered it is returned with the
    /// ack. Everything else is logged and dropped.
    pub fn on_message<H>(
        &self,
        data: &[u8],
        messenger: &mut ReliableMessenger<H>,
    ) -> Option<(H, Ack)> {
        let (args, negative) = match protocol::decode(data) {
            Ok(Decoded::Known {
                message: ControlMessage::Ack(args),
                ..
            }) => (args, false),
            Ok(Decoded::Known {
                message: ControlMessage::Nack(args),
                ..
            }) => (args, true),
            Ok(Decoded::Known { message, .. }) => {
                tracing::debug!(target: TARGET, kind = message.kind(), "ignoring inbound control message");
                return None;
            }
            Ok(Decoded::Unknown { kind }) => {
                tracing::warn!(target: TARGET, kind = %kind, "unknown control message type");
                return None;
            }
            Err(err) => {
                tracing::warn!(target: TARGET, error = %err, frame_len = data.len(), "undecodable control frame");
                return None;
            }
        };

        match messenger.acknowledge(args.reference, negative, args.body) {
            AckDelivery::Delivered(handler, ack) => Some((handler, ack)),
            AckDelivery::Unclaimed | AckDelivery::Unknown => None,
        }
    }
}
