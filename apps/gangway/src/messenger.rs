//! Reliable delivery of control messages on top of a substream that neither
//! acknowledges nor retries.
//!
//! Every message gets a session-local id, is serialized exactly once and is
//! retransmitted byte-for-byte until the host acks or nacks it, or until the
//! retry budget runs out. Retry timers are spawned sleeps that post the id
//! back to the owning session; the session calls [`ReliableMessenger::on_retry_due`]
//! when one fires.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::control::ControlChannel;
use crate::protocol::{self, ControlFrame, ControlMessage, MessageId, ProtocolError};
use crate::transport::TransportError;

const TARGET: &str = "gangway::messenger";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time to wait for an ack before retransmitting.
    pub timeout: Duration,
    /// Total transmissions per message, the first one included.
    pub retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: MessageId,
    pub message: ControlMessage,
    pub created_ms: i64,
    pub attempts: u32,
    frozen: Option<Bytes>,
}

impl PendingMessage {
    fn new(id: MessageId, message: ControlMessage) -> Self {
        Self {
            id,
            message,
            created_ms: protocol::epoch_millis(),
            attempts: 0,
            frozen: None,
        }
    }

    fn freeze(&mut self) -> Result<Bytes, ProtocolError> {
        if let Some(bytes) = &self.frozen {
            return Ok(bytes.clone());
        }
        let bytes = ControlFrame::outbound(&self.message, self.id, self.created_ms, 1)?.to_bytes()?;
        self.frozen = Some(bytes.clone());
        Ok(bytes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub negative: bool,
    pub body: Value,
}

/// Outcome of one pass through the send routine.
#[derive(Debug)]
pub enum Dispatch<H> {
    /// Substream not open; the message waits in the backlog.
    Queued { id: MessageId },
    Sent { id: MessageId, attempt: u32 },
    /// The substream refused the frame. The retry timer is armed regardless.
    Failed {
        id: MessageId,
        attempt: u32,
        error: TransportError,
    },
    /// Retry budget exhausted; the message is dropped and its handler released.
    Abandoned {
        id: MessageId,
        attempts: u32,
        handler: Option<H>,
    },
    /// The message could not be serialized.
    Invalid {
        id: MessageId,
        error: ProtocolError,
        handler: Option<H>,
    },
}

impl<H> Dispatch<H> {
    pub fn id(&self) -> MessageId {
        match self {
            Dispatch::Queued { id }
            | Dispatch::Sent { id, .. }
            | Dispatch::Failed { id, .. }
            | Dispatch::Abandoned { id, .. }
            | Dispatch::Invalid { id, .. } => *id,
        }
    }
}

#[derive(Debug)]
pub enum AckDelivery<H> {
    Delivered(H, Ack),
    /// Known message without a registered handler.
    Unclaimed,
    Unknown,
}

/// One-shot handlers keyed by message id. Taking a handler removes it.
#[derive(Debug)]
pub struct AckRegistry<H> {
    handlers: HashMap<MessageId, H>,
}

impl<H> Default for AckRegistry<H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<H> AckRegistry<H> {
    pub fn register(&mut self, id: MessageId, handler: H) {
        self.handlers.insert(id, handler);
    }

    pub fn take(&mut self, id: MessageId) -> Option<H> {
        self.handlers.remove(&id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn drain(&mut self) -> Vec<H> {
        self.handlers.drain().map(|(_, handler)| handler).collect()
    }
}

pub struct ReliableMessenger<H> {
    policy: RetryPolicy,
    next_id: MessageId,
    outstanding: HashMap<MessageId, PendingMessage>,
    handlers: AckRegistry<H>,
    timers: HashMap<MessageId, JoinHandle<()>>,
    retry_tx: mpsc::UnboundedSender<MessageId>,
}

impl<H> ReliableMessenger<H> {
    pub fn new(policy: RetryPolicy, retry_tx: mpsc::UnboundedSender<MessageId>) -> Self {
        Self {
            policy,
            next_id: 0,
            outstanding: HashMap::new(),
            handlers: AckRegistry::default(),
            timers: HashMap::new(),
            retry_tx,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn has_timer(&self, id: MessageId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn has_handler(&self, id: MessageId) -> bool {
        self.handlers.contains(id)
    }

    /// Assigns the next id, registers `handler` under it and runs the send
    /// routine once.
    pub fn send(
        &mut self,
        message: ControlMessage,
        handler: Option<H>,
        channel: &mut ControlChannel,
    ) -> Dispatch<H> {
        let id = self.next_id;
        self.next_id += 1;
        if let Some(handler) = handler {
            self.handlers.register(id, handler);
        }
        tracing::trace!(target: TARGET, message_id = id, kind = message.kind(), "control message created");
        self.resend(PendingMessage::new(id, message), channel)
    }

    /// Send routine for a message that already has an id: backlog flushes
    /// and retries go through here.
    pub fn resend(&mut self, mut pending: PendingMessage, channel: &mut ControlChannel) -> Dispatch<H> {
        let id = pending.id;
        if !channel.is_open() {
            tracing::trace!(target: TARGET, message_id = id, "substream not open, queueing");
            channel.enqueue(pending);
            return Dispatch::Queued { id };
        }

        let bytes = match pending.freeze() {
            Ok(bytes) => bytes,
            Err(error) => {
                self.cancel_timer(id);
                return Dispatch::Invalid {
                    id,
                    error,
                    handler: self.handlers.take(id),
                };
            }
        };

        pending.attempts += 1;
        let attempt = pending.attempts;
        if attempt > self.policy.retries {
            self.cancel_timer(id);
            tracing::debug!(target: TARGET, message_id = id, attempts = attempt - 1, "giving up");
            return Dispatch::Abandoned {
                id,
                attempts: attempt - 1,
                handler: self.handlers.take(id),
            };
        }

        tracing::trace!(target: TARGET, message_id = id, attempt, frame_len = bytes.len(), "transmitting");
        let result = channel.transmit(bytes);
        self.arm_timer(id);
        self.outstanding.insert(id, pending);
        match result {
            Ok(()) => Dispatch::Sent { id, attempt },
            Err(error) => Dispatch::Failed { id, attempt, error },
        }
    }

    /// Handles a fired retry timer. Returns `None` when the message has
    /// already been settled.
    pub fn on_retry_due(&mut self, id: MessageId, channel: &mut ControlChannel) -> Option<Dispatch<H>> {
        self.timers.remove(&id);
        let pending = self.outstanding.remove(&id)?;
        Some(self.resend(pending, channel))
    }

    /// Settles message `reference`: its timer is cancelled, it leaves the
    /// outstanding table and its handler is handed back exactly once.
    pub fn acknowledge(&mut self, reference: MessageId, negative: bool, body: Value) -> AckDelivery<H> {
        self.cancel_timer(reference);
        let known = self.outstanding.remove(&reference).is_some();
        match self.handlers.take(reference) {
            Some(handler) => AckDelivery::Delivered(handler, Ack { negative, body }),
            None if known => {
                tracing::debug!(target: TARGET, message_id = reference, negative, "ack without handler");
                AckDelivery::Unclaimed
            }
            None => {
                tracing::debug!(target: TARGET, message_id = reference, "ack for unknown message");
                AckDelivery::Unknown
            }
        }
    }

    /// Stops every armed retry. Outstanding messages stay settleable by a
    /// late ack.
    pub fn cancel_timers(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }

    /// Forgets every outstanding message and hands back the handlers so the
    /// caller can release whatever they were waiting for. Ids keep counting.
    pub fn reset(&mut self) -> Vec<H> {
        self.cancel_timers();
        self.outstanding.clear();
        self.handlers.drain()
    }

    fn arm_timer(&mut self, id: MessageId) {
        let tx = self.retry_tx.clone();
        let timeout = self.policy.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(id);
        });
        if let Some(previous) = self.timers.insert(id, timer) {
            previous.abort();
        }
    }

    fn cancel_timer(&mut self, id: MessageId) {
        if let Some(timer) = self.timers.remove(&id) {
            timer.abort();
        }
    }
}

impl<H> Drop for ReliableMessenger<H> {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::protocol::{AuthArgs, NO_MARKER, ResizeArgs};
    use crate::transport::DataChannel;

    struct Harness {
        messenger: ReliableMessenger<&'static str>,
        channel: ControlChannel,
        substream: Arc<RecordingChannel>,
        retry_rx: mpsc::UnboundedReceiver<MessageId>,
    }

    #[derive(Default)]
    struct RecordingChannel {
        frames: parking_lot::Mutex<Vec<Bytes>>,
    }

    impl DataChannel for RecordingChannel {
        fn label(&self) -> &str {
            protocol::CONTROL_LABEL
        }

        fn send(&self, data: Bytes) -> Result<(), TransportError> {
            self.frames.lock().push(data);
            Ok(())
        }
    }

    impl RecordingChannel {
        fn frames(&self) -> Vec<Bytes> {
            self.frames.lock().clone()
        }
    }

    fn harness(retries: u32) -> Harness {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let messenger = ReliableMessenger::new(
            RetryPolicy {
                timeout: Duration::from_millis(3000),
                retries,
            },
            retry_tx,
        );
        let substream = Arc::new(RecordingChannel::default());
        let mut channel = ControlChannel::new(protocol::CONTROL_LABEL);
        channel.attach(substream.clone());
        channel.on_open();
        Harness {
            messenger,
            channel,
            substream,
            retry_rx,
        }
    }

    fn resize(pane_id: u64) -> ControlMessage {
        ControlMessage::Resize(ResizeArgs {
            pane_id,
            sx: 80,
            sy: 24,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique_and_increasing() {
        let mut h = harness(3);
        let ids: Vec<MessageId> = (0..5)
            .map(|pane| h.messenger.send(resize(pane), None, &mut h.channel).id())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);

        h.messenger.reset();
        let next = h.messenger.send(ControlMessage::Mark, None, &mut h.channel).id();
        assert_eq!(next, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_resend_identical_bytes_then_give_up() {
        let mut h = harness(3);
        let dispatch = h
            .messenger
            .send(resize(1), Some("resize"), &mut h.channel);
        assert!(matches!(dispatch, Dispatch::Sent { id: 0, attempt: 1 }));

        let mut outcomes = Vec::new();
        while let Some(id) = h.retry_rx.recv().await {
            match h.messenger.on_retry_due(id, &mut h.channel) {
                Some(dispatch @ Dispatch::Abandoned { .. }) => {
                    outcomes.push(dispatch);
                    break;
                }
                Some(dispatch) => outcomes.push(dispatch),
                None => {}
            }
        }

        let frames = h.substream.frames();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|frame| frame == &frames[0]));
        assert!(matches!(outcomes[0], Dispatch::Sent { attempt: 2, .. }));
        assert!(matches!(outcomes[1], Dispatch::Sent { attempt: 3, .. }));
        match &outcomes[2] {
            Dispatch::Abandoned {
                attempts, handler, ..
            } => {
                assert_eq!(*attempts, 3);
                assert_eq!(*handler, Some("resize"));
            }
            other => panic!("expected abandon, got {other:?}"),
        }
        assert_eq!(h.messenger.outstanding(), 0);
        assert!(!h.messenger.has_timer(0));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_fires_handler_once_and_clears_timer() {
        let mut h = harness(3);
        let id = h
            .messenger
            .send(ControlMessage::Mark, Some("mark"), &mut h.channel)
            .id();
        assert!(h.messenger.has_timer(id));

        match h.messenger.acknowledge(id, false, Value::from(7)) {
            AckDelivery::Delivered(handler, ack) => {
                assert_eq!(handler, "mark");
                assert!(!ack.negative);
                assert_eq!(ack.body, Value::from(7));
            }
            other => panic!("unexpected delivery {other:?}"),
        }
        assert!(!h.messenger.has_timer(id));
        assert_eq!(h.messenger.outstanding(), 0);
        assert!(matches!(
            h.messenger.acknowledge(id, true, Value::Null),
            AckDelivery::Unknown
        ));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.retry_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ack_without_handler_is_unclaimed() {
        let mut h = harness(3);
        let id = h.messenger.send(resize(2), None, &mut h.channel).id();
        assert!(matches!(
            h.messenger.acknowledge(id, false, Value::Null),
            AckDelivery::Unclaimed
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_substream_queues_in_order() {
        let (retry_tx, _retry_rx) = mpsc::unbounded_channel();
        let mut messenger: ReliableMessenger<()> = ReliableMessenger::new(RetryPolicy::default(), retry_tx);
        let mut channel = ControlChannel::new(protocol::CONTROL_LABEL);
        let substream = Arc::new(RecordingChannel::default());
        channel.attach(substream.clone());

        let auth = ControlMessage::Auth(AuthArgs {
            token: "t".into(),
            marker: NO_MARKER,
        });
        assert!(matches!(messenger.send(auth, None, &mut channel), Dispatch::Queued { id: 0 }));
        assert!(matches!(
            messenger.send(resize(3), None, &mut channel),
            Dispatch::Queued { id: 1 }
        ));
        assert_eq!(channel.backlog_len(), 2);

        let flushed: Vec<MessageId> = channel
            .on_open()
            .into_iter()
            .map(|pending| messenger.resend(pending, &mut channel).id())
            .collect();
        assert_eq!(flushed, vec![0, 1]);
        let sent = substream.frames();
        assert_eq!(sent.len(), 2);
        let first: ControlFrame = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(first.kind, "auth");
        assert_eq!(first.tries, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_timers_keeps_messages_settleable() {
        let mut h = harness(3);
        let id = h
            .messenger
            .send(ControlMessage::Mark, Some("mark"), &mut h.channel)
            .id();
        h.messenger.cancel_timers();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.retry_rx.try_recv().is_err());
        assert!(matches!(
            h.messenger.acknowledge(id, false, Value::Null),
            AckDelivery::Delivered("mark", _)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_releases_handlers() {
        let mut h = harness(3);
        h.messenger.send(ControlMessage::Mark, Some("a"), &mut h.channel);
        h.messenger.send(resize(1), Some("b"), &mut h.channel);
        let mut released = h.messenger.reset();
        released.sort();
        assert_eq!(released, vec!["a", "b"]);
        assert_eq!(h.messenger.outstanding(), 0);
        assert!(h.messenger.on_retry_due(0, &mut h.channel).is_none());
    }
}
