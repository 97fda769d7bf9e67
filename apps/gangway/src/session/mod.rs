//! Connection lifecycle of one host session.
//!
//! A [`ConnectionSession`] is a task that owns the peer link, the control
//! channel, the messenger and the workspace. Everything that happens to it
//! arrives as an event on one of four queues: link callbacks, results of
//! spawned work, retry timer expiries and caller commands. Callers talk to it
//! through a cloneable [`SessionHandle`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::control::ControlChannel;
use crate::layout::Workspace;
use crate::messenger::{Ack, Dispatch, ReliableMessenger, RetryPolicy};
use crate::observer::SessionObserver;
use crate::protocol::{
    self, AuthArgs, ControlMessage, MessageId, NO_MARKER, ResizeArgs, SetPayloadArgs,
};
use crate::signaling::{SignalTarget, SignalingBackend, SignalingError};
use crate::transport::{
    IceCandidate, LinkEnvelope, LinkEvent, LinkEventSink, LinkOptions, LinkState, OpenedLink,
    PeerConnector, PeerLink, SessionDescription, TransportError,
};

pub mod manager;
pub mod restore;

pub use manager::SessionManager;
use restore::RestorePlan;

const TARGET: &str = "gangway::session";

/// Adverse link states this close to a `disconnected` report are treated as
/// the same event.
pub const DISCONNECT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Delay that coalesces layout updates into one `set_payload`.
pub const LAYOUT_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session task has stopped")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    Boarding,
    Disengaging,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub boarding: bool,
    pub authenticated: bool,
    pub failed: bool,
    pub marker: Option<i64>,
    pub verified: bool,
    pub peer_online: Option<bool>,
    pub generation: u64,
    pub windows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub id: String,
    pub name: String,
    /// `host:port` of the signaling endpoint.
    pub addr: Option<String>,
    pub user: Option<String>,
    pub fingerprint: Option<String>,
    pub verified: bool,
}

impl HostEntry {
    pub fn new(addr: Option<String>, user: Option<String>) -> Self {
        let mut entry = Self {
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            addr,
            user,
            fingerprint: None,
            verified: false,
        };
        entry.name = entry.default_name();
        entry
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.name = name;
        }
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        if self.addr.is_none() && self.user.is_none() {
            self.name = self.default_name();
        }
        self
    }

    fn default_name(&self) -> String {
        match (&self.user, &self.addr, &self.fingerprint) {
            (Some(user), Some(addr), _) => format!("{user}@{addr}"),
            (None, Some(addr), _) => addr.clone(),
            (_, None, Some(fingerprint)) => fingerprint.clone(),
            _ => self.id.clone(),
        }
    }

    pub fn signal_target(&self) -> SignalTarget {
        SignalTarget {
            addr: self.addr.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    fn signal_label(&self) -> &str {
        self.addr
            .as_deref()
            .or(self.fingerprint.as_deref())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub token: String,
    pub ice_server: String,
    pub retry: RetryPolicy,
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn PeerConnector>,
    pub signaling: Arc<dyn SignalingBackend>,
    pub observer: Arc<dyn SessionObserver>,
}

enum SessionCommand {
    Connect,
    Authenticate { token: Option<String> },
    Disengage { done: oneshot::Sender<()> },
    Resize { pane_id: u64, sx: u16, sy: u16 },
    SendLayout { done: oneshot::Sender<()> },
    SetNetwork { online: bool },
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    PeerOnline(bool),
    Shutdown,
}

enum TaskEvent {
    Opened {
        generation: u64,
        result: Result<OpenedLink, TransportError>,
    },
    Signaled {
        generation: u64,
        via_http: bool,
        result: Result<Option<SessionDescription>, SignalingError>,
    },
    RemoteApplied {
        generation: u64,
        result: Result<(), TransportError>,
    },
    CandidateRejected {
        generation: u64,
        error: TransportError,
    },
    LayoutDue,
}

/// What to do when a control message is settled.
#[derive(Debug)]
enum AckAction {
    Auth,
    Mark(Option<oneshot::Sender<()>>),
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    pub fn connect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Connect)
    }

    /// Re-sends `auth`, optionally with a new token.
    pub fn authenticate(&self, token: Option<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::Authenticate { token })
    }

    /// Starts a disengage; the receiver resolves once it is over.
    pub fn begin_disengage(&self) -> Result<oneshot::Receiver<()>, SessionError> {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Disengage { done })?;
        Ok(rx)
    }

    pub async fn disengage(&self) -> Result<(), SessionError> {
        self.begin_disengage()?
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Disengages, then connects again so the host restores from the marker.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.disengage().await?;
        self.connect()
    }

    pub fn send_resize(&self, pane_id: u64, sx: u16, sy: u16) -> Result<(), SessionError> {
        self.send(SessionCommand::Resize { pane_id, sx, sy })
    }

    pub fn request_layout(&self) -> Result<oneshot::Receiver<()>, SessionError> {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::SendLayout { done })?;
        Ok(rx)
    }

    /// Resolves once the debounced `set_payload` carrying the current layout
    /// has been handed to the messenger.
    pub async fn send_layout(&self) -> Result<(), SessionError> {
        self.request_layout()?
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub fn set_network(&self, online: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetNetwork { online })
    }

    pub fn deliver_answer(&self, answer: SessionDescription) -> Result<(), SessionError> {
        self.send(SessionCommand::RemoteAnswer(answer))
    }

    pub fn deliver_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.send(SessionCommand::RemoteCandidate(candidate))
    }

    pub fn set_peer_online(&self, online: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::PeerOnline(online))
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionStatus) -> bool,
    ) -> Result<SessionStatus, SessionError> {
        let mut status = self.status.clone();
        let matched = status
            .wait_for(predicate)
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(matched.clone())
    }
}

pub struct ConnectionSession {
    host: HostEntry,
    config: SessionConfig,
    deps: SessionDeps,
    workspace: Box<dyn Workspace>,
    control: ControlChannel,
    messenger: ReliableMessenger<AckAction>,
    link: Option<Arc<dyn PeerLink>>,
    generation: u64,
    state: SessionState,
    boarding: bool,
    authenticated: bool,
    failed: bool,
    marker: Option<i64>,
    network_up: bool,
    peer_online: Option<bool>,
    last_disconnect: Option<Instant>,
    offer_started: bool,
    offer_deferred: bool,
    remote_candidates: Vec<IceCandidate>,
    layout_waiters: Vec<oneshot::Sender<()>>,
    layout_timer: Option<JoinHandle<()>>,
    status_tx: watch::Sender<SessionStatus>,
    link_tx: mpsc::UnboundedSender<LinkEnvelope>,
    task_tx: mpsc::UnboundedSender<TaskEvent>,
}

struct SessionQueues {
    links: mpsc::UnboundedReceiver<LinkEnvelope>,
    tasks: mpsc::UnboundedReceiver<TaskEvent>,
    retries: mpsc::UnboundedReceiver<MessageId>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl ConnectionSession {
    /// Spawns the session task. The session stays idle until `connect`.
    pub fn spawn(
        host: HostEntry,
        config: SessionConfig,
        deps: SessionDeps,
        workspace: Box<dyn Workspace>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (link_tx, links) = mpsc::unbounded_channel();
        let (task_tx, tasks) = mpsc::unbounded_channel();
        let (retry_tx, retries) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();

        let messenger = ReliableMessenger::new(config.retry, retry_tx);
        let initial = SessionStatus {
            state: SessionState::Idle,
            boarding: false,
            authenticated: false,
            failed: false,
            marker: None,
            verified: host.verified,
            peer_online: None,
            generation: 0,
            windows: workspace.window_count(),
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let session = Self {
            host,
            config,
            deps,
            workspace,
            control: ControlChannel::new(protocol::CONTROL_LABEL),
            messenger,
            link: None,
            generation: 0,
            state: SessionState::Idle,
            boarding: false,
            authenticated: false,
            failed: false,
            marker: None,
            network_up: true,
            peer_online: None,
            last_disconnect: None,
            offer_started: false,
            offer_deferred: false,
            remote_candidates: Vec::new(),
            layout_waiters: Vec::new(),
            layout_timer: None,
            status_tx,
            link_tx,
            task_tx,
        };
        let queues = SessionQueues {
            links,
            tasks,
            retries,
            commands,
        };
        let task = tokio::spawn(session.run(queues));
        let handle = SessionHandle {
            commands: command_tx,
            status: status_rx,
        };
        (handle, task)
    }

    async fn run(mut self, mut queues: SessionQueues) {
        tracing::debug!(target: TARGET, session = %self.host.name, "session task started");
        loop {
            tokio::select! {
                biased;
                Some(envelope) = queues.links.recv() => self.on_link_envelope(envelope),
                Some(event) = queues.tasks.recv() => self.on_task_event(event),
                Some(id) = queues.retries.recv() => self.on_retry_due(id),
                command = queues.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
            self.publish();
        }
        self.teardown().await;
        tracing::debug!(target: TARGET, session = %self.host.name, "session task stopped");
    }

    async fn teardown(&mut self) {
        self.cancel_layout();
        let released = self.messenger.reset();
        self.release_all(released);
        self.control.reset();
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            boarding: self.boarding,
            authenticated: self.authenticated,
            failed: self.failed,
            marker: self.marker,
            verified: self.host.verified,
            peer_online: self.peer_online,
            generation: self.generation,
            windows: self.workspace.window_count(),
        }
    }

    fn publish(&self) {
        let next = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn notify(&self, message: &str) {
        self.deps.observer.notify(&self.host, message);
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect => self.connect(),
            SessionCommand::Authenticate { token } => self.authenticate(token),
            SessionCommand::Disengage { done } => self.disengage(done),
            SessionCommand::Resize { pane_id, sx, sy } => self.send_resize(pane_id, sx, sy),
            SessionCommand::SendLayout { done } => self.send_layout(done),
            SessionCommand::SetNetwork { online } => {
                self.network_up = online;
                if !online {
                    self.stop_boarding();
                    if matches!(
                        self.state,
                        SessionState::Connecting
                            | SessionState::Authenticating
                            | SessionState::Boarding
                            | SessionState::Reconnecting
                    ) {
                        self.state = SessionState::Idle;
                    }
                }
            }
            SessionCommand::RemoteAnswer(answer) => self.apply_remote_description(answer),
            SessionCommand::RemoteCandidate(candidate) => self.add_remote_candidate(candidate),
            SessionCommand::PeerOnline(online) => self.peer_online = Some(online),
            SessionCommand::Shutdown => {}
        }
    }

    fn connect(&mut self) {
        if !self.network_up {
            tracing::debug!(target: TARGET, session = %self.host.name, "network down, not connecting");
            return;
        }
        if self.boarding {
            if self.workspace.window_count() == 0 {
                let window = self.workspace.add_window("", true);
                self.workspace.set_active_window(window);
            }
            self.workspace.focus();
            return;
        }

        tracing::info!(target: TARGET, session = %self.host.name, "connecting");
        self.control.reset();
        let released = self.messenger.reset();
        self.release_all(released);
        self.close_link();

        self.generation += 1;
        self.authenticated = false;
        self.offer_started = false;
        self.offer_deferred = false;
        self.remote_candidates.clear();
        self.last_disconnect = None;
        if self.state != SessionState::Reconnecting {
            self.state = SessionState::Connecting;
        }

        let connector = Arc::clone(&self.deps.connector);
        let options = LinkOptions {
            ice_server: self.config.ice_server.clone(),
            control_label: protocol::CONTROL_LABEL.to_string(),
        };
        let generation = self.generation;
        let sink = LinkEventSink::new(generation, self.link_tx.clone());
        let tasks = self.task_tx.clone();
        tokio::spawn(async move {
            let result = connector.open(&options, sink).await;
            let _ = tasks.send(TaskEvent::Opened { generation, result });
        });

        self.authenticate(None);
    }

    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            tokio::spawn(async move { link.close().await });
        }
    }

    fn authenticate(&mut self, token: Option<String>) {
        if let Some(token) = token {
            self.config.token = token;
        }
        let message = ControlMessage::Auth(AuthArgs {
            token: self.config.token.clone(),
            marker: self.marker.unwrap_or(NO_MARKER),
        });
        let dispatch = self
            .messenger
            .send(message, Some(AckAction::Auth), &mut self.control);
        self.on_dispatch(dispatch);
    }

    fn disengage(&mut self, done: oneshot::Sender<()>) {
        if !self.boarding {
            let _ = done.send(());
            return;
        }
        tracing::info!(target: TARGET, session = %self.host.name, "disengaging");
        self.messenger.cancel_timers();
        self.cancel_layout();
        let dispatch = self.messenger.send(
            ControlMessage::Mark,
            Some(AckAction::Mark(Some(done))),
            &mut self.control,
        );
        self.state = SessionState::Disengaging;
        self.boarding = false;
        self.on_dispatch(dispatch);
    }

    fn send_resize(&mut self, pane_id: u64, sx: u16, sy: u16) {
        if self.link.is_none() || !self.boarding {
            tracing::debug!(target: TARGET, session = %self.host.name, pane_id, "not boarding, dropping resize");
            return;
        }
        let dispatch = self.messenger.send(
            ControlMessage::Resize(ResizeArgs { pane_id, sx, sy }),
            None,
            &mut self.control,
        );
        self.on_dispatch(dispatch);
    }

    fn send_layout(&mut self, done: oneshot::Sender<()>) {
        self.layout_waiters.push(done);
        if self.layout_timer.is_some() {
            return;
        }
        let tasks = self.task_tx.clone();
        self.layout_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(LAYOUT_DEBOUNCE).await;
            let _ = tasks.send(TaskEvent::LayoutDue);
        }));
    }

    fn flush_layout(&mut self) {
        self.layout_timer = None;
        if !self.boarding {
            tracing::debug!(target: TARGET, session = %self.host.name, "not boarding, dropping layout");
            self.release_layout_waiters();
            return;
        }
        let message = ControlMessage::SetPayload(SetPayloadArgs {
            payload: self.workspace.dump(),
        });
        let dispatch = self.messenger.send(message, None, &mut self.control);
        self.on_dispatch(dispatch);
        self.release_layout_waiters();
    }

    fn cancel_layout(&mut self) {
        if let Some(timer) = self.layout_timer.take() {
            timer.abort();
        }
        self.release_layout_waiters();
    }

    fn release_layout_waiters(&mut self) {
        for waiter in self.layout_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn stop_boarding(&mut self) {
        if !self.boarding {
            return;
        }
        self.messenger.cancel_timers();
        self.cancel_layout();
        self.boarding = false;
    }

    fn fail(&mut self) {
        self.stop_boarding();
        self.state = SessionState::Failed;
        self.failed = true;
    }

    fn on_link_envelope(&mut self, envelope: LinkEnvelope) {
        if envelope.generation != self.generation {
            tracing::trace!(
                target: TARGET,
                session = %self.host.name,
                generation = envelope.generation,
                current = self.generation,
                "dropping event from stale link"
            );
            return;
        }
        match envelope.event {
            LinkEvent::StateChanged(state) => self.on_link_state(state),
            LinkEvent::Candidate(Some(_)) => {
                if self.offer_started {
                    return;
                }
                if self.link.is_some() {
                    self.start_offer();
                } else {
                    self.offer_deferred = true;
                }
            }
            LinkEvent::Candidate(None) => {
                tracing::trace!(target: TARGET, session = %self.host.name, "candidate gathering complete");
            }
            LinkEvent::ChannelOpen { label } if label == self.control.label() => {
                for pending in self.control.on_open() {
                    let dispatch = self.messenger.resend(pending, &mut self.control);
                    self.on_dispatch(dispatch);
                }
            }
            LinkEvent::ChannelClosed { label } if label == self.control.label() => {
                self.control.on_close();
                if self.boarding {
                    self.notify("Control Channel is closed. Reconnecting.");
                    self.stop_boarding();
                    self.state = SessionState::Reconnecting;
                    self.connect();
                }
            }
            LinkEvent::ChannelMessage { label, data } if label == self.control.label() => {
                if let Some((action, ack)) = self.control.on_message(&data, &mut self.messenger) {
                    self.on_ack(action, ack);
                }
            }
            LinkEvent::ChannelOpen { label }
            | LinkEvent::ChannelClosed { label }
            | LinkEvent::ChannelMessage { label, .. } => {
                tracing::trace!(target: TARGET, session = %self.host.name, label = %label, "pane channel event");
            }
        }
    }

    fn on_link_state(&mut self, state: LinkState) {
        tracing::debug!(target: TARGET, session = %self.host.name, ?state, generation = self.generation, "link state");
        match state {
            LinkState::Connected => {
                self.notify("WebRTC connected");
                self.boarding = true;
                self.failed = false;
                self.state = if self.authenticated {
                    SessionState::Boarding
                } else {
                    SessionState::Authenticating
                };
            }
            LinkState::Disconnected => {
                self.notify("WebRTC disconnected and may reconnect or close");
                self.last_disconnect = Some(Instant::now());
            }
            LinkState::New | LinkState::Connecting => {}
            LinkState::Failed | LinkState::Closed if self.boarding => {
                let flapping = self
                    .last_disconnect
                    .is_some_and(|at| at.elapsed() <= DISCONNECT_DEBOUNCE);
                if flapping {
                    tracing::debug!(target: TARGET, session = %self.host.name, ?state, "ignoring link event right after disconnect");
                    return;
                }
                self.notify("WebRTC closed");
                self.fail();
                self.deps.observer.session_lost(&self.host);
            }
            LinkState::Failed | LinkState::Closed => {}
        }
    }

    fn start_offer(&mut self) {
        let Some(link) = self.link.clone() else {
            self.offer_deferred = true;
            return;
        };
        self.offer_started = true;
        self.offer_deferred = false;
        self.notify("Sending connection request");

        let signaling = Arc::clone(&self.deps.signaling);
        let target = self.host.signal_target();
        let via_http = target.addr.is_some();
        let generation = self.generation;
        let tasks = self.task_tx.clone();
        tokio::spawn(async move {
            let result = match link.local_description().await {
                Ok(offer) => signaling.exchange(&target, &offer).await,
                Err(err) => Err(SignalingError::from(err)),
            };
            let _ = tasks.send(TaskEvent::Signaled {
                generation,
                via_http,
                result,
            });
        });
    }

    fn apply_remote_description(&mut self, answer: SessionDescription) {
        let Some(link) = self.link.clone() else {
            tracing::warn!(target: TARGET, session = %self.host.name, "answer arrived without a link");
            return;
        };
        let generation = self.generation;
        let tasks = self.task_tx.clone();
        tokio::spawn(async move {
            let result = link.apply_remote_description(answer).await;
            let _ = tasks.send(TaskEvent::RemoteApplied { generation, result });
        });
    }

    fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(link) = self.link.clone() else {
            self.remote_candidates.push(candidate);
            return;
        };
        let generation = self.generation;
        let tasks = self.task_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = link.add_ice_candidate(candidate).await {
                let _ = tasks.send(TaskEvent::CandidateRejected { generation, error });
            }
        });
    }

    fn on_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Opened { generation, result } => self.on_opened(generation, result),
            TaskEvent::Signaled {
                generation,
                via_http,
                result,
            } if generation == self.generation => self.on_signaled(via_http, result),
            TaskEvent::RemoteApplied { generation, result } if generation == self.generation => {
                if let Err(err) = result {
                    self.notify(&format!("Failed to set remote description: {err}"));
                    self.fail();
                    self.deps.observer.session_lost(&self.host);
                }
            }
            TaskEvent::CandidateRejected { generation, error } if generation == self.generation => {
                self.notify(&format!("ICE candidate error: {error}"));
            }
            TaskEvent::Signaled { .. }
            | TaskEvent::RemoteApplied { .. }
            | TaskEvent::CandidateRejected { .. } => {
                tracing::trace!(target: TARGET, session = %self.host.name, "dropping stale task result");
            }
            TaskEvent::LayoutDue => self.flush_layout(),
        }
    }

    fn on_opened(&mut self, generation: u64, result: Result<OpenedLink, TransportError>) {
        if generation != self.generation {
            if let Ok(opened) = result {
                tokio::spawn(async move { opened.link.close().await });
            }
            return;
        }
        match result {
            Ok(opened) => {
                tracing::debug!(target: TARGET, session = %self.host.name, generation, "peer link open");
                self.control.attach(opened.control);
                self.link = Some(opened.link);
                for candidate in std::mem::take(&mut self.remote_candidates) {
                    self.add_remote_candidate(candidate);
                }
                if self.offer_deferred {
                    self.start_offer();
                }
            }
            Err(err) => {
                self.notify(&format!("Failed to open peer connection: {err}"));
                self.state = SessionState::Failed;
                self.failed = true;
                self.deps.observer.no_signal(&self.host, &err.to_string());
            }
        }
    }

    fn on_signaled(
        &mut self,
        via_http: bool,
        result: Result<Option<SessionDescription>, SignalingError>,
    ) {
        match result {
            Ok(Some(answer)) => {
                if via_http && !self.host.verified {
                    self.host.verified = true;
                    self.deps.observer.verified(&self.host);
                }
                self.apply_remote_description(answer);
            }
            Ok(None) => {
                tracing::debug!(target: TARGET, session = %self.host.name, "offer relayed, waiting for answer");
            }
            Err(err) => {
                tracing::warn!(target: TARGET, session = %self.host.name, error = %err, "signaling failed");
                let label = self.host.signal_label().to_string();
                self.notify(&format!("HTTP POST to {label} failed"));
                self.state = SessionState::Failed;
                self.failed = true;
                self.deps.observer.no_signal(&self.host, &err.to_string());
            }
        }
    }

    fn on_retry_due(&mut self, id: MessageId) {
        if let Some(dispatch) = self.messenger.on_retry_due(id, &mut self.control) {
            self.on_dispatch(dispatch);
        }
    }

    fn on_dispatch(&mut self, dispatch: Dispatch<AckAction>) {
        let policy = self.messenger.policy();
        match dispatch {
            Dispatch::Queued { .. } => {}
            Dispatch::Sent { id, attempt } => self.notify_retry(id, attempt, policy),
            Dispatch::Failed { id, attempt, error } => {
                self.notify_retry(id, attempt, policy);
                self.notify(&format!("Sending ctrl message failed: {error}"));
            }
            Dispatch::Abandoned {
                id,
                attempts,
                handler,
            } => {
                self.notify(&format!("#{id} tried {attempts} times and given up"));
                if let Some(handler) = handler {
                    self.release(handler);
                }
            }
            Dispatch::Invalid { id, error, handler } => {
                tracing::error!(target: TARGET, session = %self.host.name, message_id = id, error = %error, "control message not encodable");
                self.notify(&format!("#{id} could not be encoded: {error}"));
                if let Some(handler) = handler {
                    self.release(handler);
                }
            }
        }
    }

    fn notify_retry(&self, id: MessageId, attempt: u32, policy: RetryPolicy) {
        if attempt == 2 {
            self.notify(&format!(
                "#{id} no ACK in {}ms, trying {} more times",
                policy.timeout.as_millis(),
                policy.retries.saturating_sub(1)
            ));
        }
    }

    /// Resolves whatever an unsettled handler was waiting for.
    fn release(&mut self, action: AckAction) {
        match action {
            AckAction::Auth => {}
            AckAction::Mark(done) => {
                if self.state == SessionState::Disengaging {
                    self.state = SessionState::Idle;
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }

    fn release_all(&mut self, actions: Vec<AckAction>) {
        for action in actions {
            self.release(action);
        }
    }

    fn on_ack(&mut self, action: AckAction, ack: Ack) {
        match action {
            AckAction::Auth if ack.negative => {
                self.notify("Authorization FAILED");
                self.authenticated = false;
                self.deps.observer.auth_rejected(&self.host);
            }
            AckAction::Auth => {
                self.notify("Authorization accepted");
                self.authenticated = true;
                if self.boarding {
                    self.state = SessionState::Boarding;
                }
                self.restore(&ack.body);
                self.marker = None;
            }
            AckAction::Mark(done) => {
                self.marker = protocol::parse_marker(&ack.body);
                tracing::info!(target: TARGET, session = %self.host.name, marker = ?self.marker, "disengaged");
                if self.state == SessionState::Disengaging {
                    self.state = SessionState::Idle;
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }

    fn restore(&mut self, body: &Value) {
        let snapshot = restore::snapshot_from_body(body);
        match restore::plan(self.marker, self.workspace.window_count(), snapshot) {
            RestorePlan::Reattach => {
                tracing::debug!(target: TARGET, session = %self.host.name, marker = ?self.marker, "restoring with marker");
                if let Some(link) = self.link.clone() {
                    self.workspace.reopen_pane_channels(link);
                }
            }
            RestorePlan::Rebuild(snapshot) => {
                self.notify("Restoring layout");
                self.workspace.clear();
                for window in &snapshot.windows {
                    let id = self.workspace.restore_window(window);
                    if window.active {
                        self.workspace.set_active_window(id);
                    }
                }
            }
            RestorePlan::Fresh { unexpected_marker } => {
                if unexpected_marker {
                    tracing::warn!(
                        target: TARGET,
                        session = %self.host.name,
                        marker = ?self.marker,
                        "holding a marker without local windows; starting fresh"
                    );
                }
                self.workspace.clear();
                let window = self.workspace.add_window("", true);
                self.workspace.set_active_window(window);
            }
        }
        if self.workspace.active_window().is_none() && self.workspace.window_count() > 0 {
            self.workspace.set_active_window(0);
        }
        self.workspace.focus();
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(timer) = self.layout_timer.take() {
            timer.abort();
        }
    }
}
