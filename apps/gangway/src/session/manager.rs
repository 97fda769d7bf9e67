use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{ConnectionSession, HostEntry, SessionConfig, SessionDeps, SessionError, SessionHandle};
use crate::config::Config;
use crate::layout::Workspace;
use crate::signaling::{RendezvousClient, RendezvousMessage};

const TARGET: &str = "gangway::session::manager";

/// How often `disengage_all` checks for outstanding disengages.
pub const DISENGAGE_POLL: Duration = Duration::from_millis(10);

pub type WorkspaceFactory = Arc<dyn Fn() -> Box<dyn Workspace> + Send + Sync>;

struct ManagedSession {
    host: HostEntry,
    handle: SessionHandle,
    task: JoinHandle<()>,
}

/// Owns every host session of the process.
pub struct SessionManager {
    config: SessionConfig,
    deps: SessionDeps,
    workspaces: WorkspaceFactory,
    sessions: Vec<ManagedSession>,
    active: Option<String>,
    network_up: bool,
    rendezvous: Option<Arc<RendezvousClient>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, deps: SessionDeps, workspaces: WorkspaceFactory) -> Self {
        Self {
            config,
            deps,
            workspaces,
            sessions: Vec::new(),
            active: None,
            network_up: true,
            rendezvous: None,
        }
    }

    pub fn from_config(
        config: &Config,
        token: impl Into<String>,
        deps: SessionDeps,
        workspaces: WorkspaceFactory,
    ) -> Self {
        let session_config = SessionConfig {
            token: token.into(),
            ice_server: config.net.ice_server.clone(),
            retry: config.net.retry_policy(),
        };
        Self::new(session_config, deps, workspaces)
    }

    /// Registers `host` and spawns its session. Adding a host whose id is
    /// already known returns the existing handle.
    pub fn add_host(&mut self, host: HostEntry) -> SessionHandle {
        if let Some(existing) = self.sessions.iter().find(|s| s.host.id == host.id) {
            return existing.handle.clone();
        }
        tracing::info!(target: TARGET, host = %host.name, "adding host");
        let (handle, task) = ConnectionSession::spawn(
            host.clone(),
            self.config.clone(),
            self.deps.clone(),
            (self.workspaces)(),
        );
        if !self.network_up {
            let _ = handle.set_network(false);
        }
        self.sessions.push(ManagedSession {
            host,
            handle: handle.clone(),
            task,
        });
        handle
    }

    /// Stops and forgets the session of host `id`.
    pub fn remove_host(&mut self, id: &str) -> bool {
        let Some(index) = self.sessions.iter().position(|s| s.host.id == id) else {
            return false;
        };
        let removed = self.sessions.remove(index);
        tracing::info!(target: TARGET, host = %removed.host.name, "removing host");
        let _ = removed.handle.shutdown();
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        true
    }

    /// Host entries, with the `verified` flag as last reported by their
    /// sessions.
    pub fn hosts(&self) -> Vec<HostEntry> {
        self.sessions
            .iter()
            .map(|s| {
                let mut host = s.host.clone();
                host.verified |= s.handle.status().verified;
                host
            })
            .collect()
    }

    pub fn session(&self, id: &str) -> Option<SessionHandle> {
        self.sessions
            .iter()
            .find(|s| s.host.id == id)
            .map(|s| s.handle.clone())
    }

    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Option<SessionHandle> {
        self.sessions
            .iter()
            .find(|s| s.host.fingerprint.as_deref() == Some(fingerprint))
            .map(|s| s.handle.clone())
    }

    /// Makes host `id` the foreground session and connects it.
    pub fn activate(&mut self, id: &str) -> Result<SessionHandle, SessionError> {
        let handle = self.session(id).ok_or(SessionError::Closed)?;
        self.active = Some(id.to_string());
        handle.connect()?;
        Ok(handle)
    }

    pub fn active(&self) -> Option<SessionHandle> {
        self.active.as_deref().and_then(|id| self.session(id))
    }

    pub fn set_rendezvous(&mut self, client: Arc<RendezvousClient>) {
        self.rendezvous = Some(client);
    }

    /// Fans a reachability change out to every session. Coming back online
    /// reconnects the foreground session.
    pub fn update_network_status(&mut self, online: bool) {
        tracing::info!(target: TARGET, online, "network status changed");
        self.network_up = online;
        for session in &self.sessions {
            let _ = session.handle.set_network(online);
        }
        if online {
            if let Some(active) = self.active() {
                let _ = active.connect();
            }
        }
    }

    /// Disengages every boarding session and waits, polling, until all of
    /// them are done or `ceiling` has passed. Returns whether all finished.
    pub async fn disengage_all(&mut self, ceiling: Duration) -> bool {
        let outstanding = Arc::new(AtomicUsize::new(0));
        for session in &self.sessions {
            if !session.handle.status().boarding {
                continue;
            }
            let Ok(done) = session.handle.begin_disengage() else {
                continue;
            };
            outstanding.fetch_add(1, Ordering::SeqCst);
            let outstanding = Arc::clone(&outstanding);
            tokio::spawn(async move {
                let _ = done.await;
                outstanding.fetch_sub(1, Ordering::SeqCst);
            });
        }
        if let Some(rendezvous) = self.rendezvous.take() {
            rendezvous.close();
        }

        let deadline = Instant::now() + ceiling;
        loop {
            let remaining = outstanding.load(Ordering::SeqCst);
            if remaining == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(target: TARGET, remaining, "disengage ceiling reached");
                return false;
            }
            tokio::time::sleep(DISENGAGE_POLL).await;
        }
    }

    pub fn handle_rendezvous(&mut self, message: RendezvousMessage) {
        match message {
            RendezvousMessage::Error { code, text } => {
                tracing::warn!(target: TARGET, code, text = %text, "rendezvous error");
                self.deps.observer.notice(&text);
            }
            RendezvousMessage::Peers(peers) => {
                self.deps.observer.notice("Got a fresh server list");
                for peer in peers.into_iter().filter(|peer| peer.is_host()) {
                    if self.find_by_fingerprint(&peer.fp).is_some() {
                        continue;
                    }
                    let mut host = HostEntry::new(None, peer.user.clone())
                        .with_fingerprint(peer.fp.clone())
                        .with_name(peer.name.clone());
                    host.verified = peer.verified;
                    self.add_host(host);
                }
            }
            RendezvousMessage::Verified(true) => {
                tracing::debug!(target: TARGET, "rendezvous identity verified");
            }
            RendezvousMessage::Verified(false) => {
                self.deps.observer.notice("UNVERIFIED. Please check your email.");
            }
            RendezvousMessage::Candidate {
                source_fp,
                candidate,
            } => {
                if let Some(session) = self.routed(&source_fp) {
                    let _ = session.deliver_candidate(candidate);
                }
            }
            RendezvousMessage::Answer { source_fp, answer } => {
                if let Some(session) = self.routed(&source_fp) {
                    let _ = session.deliver_answer(answer);
                }
            }
            RendezvousMessage::PeerUpdate { source_fp, online } => {
                if let Some(session) = self.routed(&source_fp) {
                    let _ = session.set_peer_online(online);
                }
            }
            RendezvousMessage::Ignored(value) => {
                tracing::trace!(target: TARGET, message = %value, "ignoring rendezvous message");
            }
        }
    }

    fn routed(&self, fingerprint: &str) -> Option<SessionHandle> {
        let session = self.find_by_fingerprint(fingerprint);
        if session.is_none() {
            tracing::warn!(target: TARGET, fingerprint, "rendezvous message for unknown host");
        }
        session
    }

    /// Stops every session task and waits for them to close their links.
    pub async fn shutdown(&mut self) {
        if let Some(rendezvous) = self.rendezvous.take() {
            rendezvous.close();
        }
        for session in self.sessions.drain(..) {
            let _ = session.handle.shutdown();
            if let Err(err) = session.task.await {
                tracing::warn!(target: TARGET, host = %session.host.name, error = %err, "session task ended abnormally");
            }
        }
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HeadlessWorkspace;
    use crate::messenger::RetryPolicy;
    use crate::observer::{Observed, RecordingObserver};
    use crate::signaling::{PeerRecord, SignalTarget, SignalingBackend, SignalingError};
    use crate::transport::mock::MockConnector;
    use crate::transport::{IceCandidate, LinkState, SessionDescription};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    /// Answers arrive later through the rendezvous channel.
    #[derive(Default)]
    struct RelayedSignaling {
        targets: Mutex<Vec<SignalTarget>>,
    }

    #[async_trait]
    impl SignalingBackend for RelayedSignaling {
        async fn exchange(
            &self,
            target: &SignalTarget,
            _offer: &SessionDescription,
        ) -> Result<Option<SessionDescription>, SignalingError> {
            self.targets.lock().push(target.clone());
            Ok(None)
        }
    }

    fn manager() -> (SessionManager, MockConnector, RecordingObserver) {
        let connector = MockConnector::new();
        let observer = RecordingObserver::new();
        let deps = SessionDeps {
            connector: Arc::new(connector.clone()),
            signaling: Arc::new(RelayedSignaling::default()),
            observer: Arc::new(observer.clone()),
        };
        let config = SessionConfig {
            token: "t".into(),
            ice_server: String::new(),
            retry: RetryPolicy::default(),
        };
        let workspaces: WorkspaceFactory = Arc::new(|| Box::new(HeadlessWorkspace::new(3)));
        (SessionManager::new(config, deps, workspaces), connector, observer)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn remote_host(fp: &str) -> HostEntry {
        HostEntry::new(None, None).with_fingerprint(fp)
    }

    /// Completes the handshake of a session that has just been connected.
    async fn board(handle: &SessionHandle, connector: &MockConnector) {
        settle().await;
        let link = connector.latest().unwrap();
        link.set_state(LinkState::Connected);
        link.open_control();
        settle().await;
        let auth = link
            .control_frames()
            .into_iter()
            .rfind(|frame| frame.kind == "auth")
            .unwrap();
        link.ack(auth.message_id.unwrap(), Value::Null);
        handle.wait_for(|s| s.authenticated).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn routes_answer_and_candidates_by_fingerprint() {
        let (mut manager, connector, _observer) = manager();
        let host = remote_host("FP1");
        let id = host.id.clone();
        manager.add_host(host);
        manager.activate(&id).unwrap();
        settle().await;
        let link = connector.latest().unwrap();
        link.gather_candidate();
        settle().await;

        manager.handle_rendezvous(RendezvousMessage::Answer {
            source_fp: "FP1".into(),
            answer: SessionDescription::answer("v=0 relayed"),
        });
        manager.handle_rendezvous(RendezvousMessage::Candidate {
            source_fp: "FP1".into(),
            candidate: IceCandidate {
                candidate: "candidate:2 1 udp 1 10.0.0.3 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        });
        manager.handle_rendezvous(RendezvousMessage::PeerUpdate {
            source_fp: "FP1".into(),
            online: true,
        });
        settle().await;

        assert_eq!(link.remote_description().unwrap().sdp, "v=0 relayed");
        assert_eq!(link.candidates().len(), 1);
        let status = manager.active().unwrap().status();
        assert_eq!(status.peer_online, Some(true));
        assert!(!status.verified);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_list_adds_verified_hosts_once() {
        let (mut manager, _connector, observer) = manager();
        manager.add_host(remote_host("known"));
        let peers = vec![
            PeerRecord {
                name: "build box".into(),
                kind: "webexec".into(),
                fp: "new".into(),
                verified: true,
                ..Default::default()
            },
            PeerRecord {
                name: "known".into(),
                kind: "webexec".into(),
                fp: "known".into(),
                verified: true,
                ..Default::default()
            },
            PeerRecord {
                name: "phone".into(),
                kind: "terminal7".into(),
                fp: "client".into(),
                verified: true,
                ..Default::default()
            },
            PeerRecord {
                name: "pending".into(),
                kind: "webexec".into(),
                fp: "pending".into(),
                verified: false,
                ..Default::default()
            },
        ];
        manager.handle_rendezvous(RendezvousMessage::Peers(peers));

        let hosts = manager.hosts();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[1].name, "build box");
        assert!(hosts[1].verified);
        assert!(manager.find_by_fingerprint("new").is_some());
        assert!(observer.messages().contains(&"Got a fresh server list".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn rendezvous_notices() {
        let (mut manager, _connector, observer) = manager();
        manager.handle_rendezvous(RendezvousMessage::Error {
            code: 401,
            text: "bad fingerprint".into(),
        });
        manager.handle_rendezvous(RendezvousMessage::Verified(false));
        manager.handle_rendezvous(RendezvousMessage::Answer {
            source_fp: "nobody".into(),
            answer: SessionDescription::answer("v=0"),
        });
        assert_eq!(
            observer.events(),
            vec![
                Observed::Notice("bad fingerprint".into()),
                Observed::Notice("UNVERIFIED. Please check your email.".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disengage_all_waits_for_marks() {
        let (mut manager, connector, _observer) = manager();
        let handle = manager.add_host(remote_host("FP1"));
        handle.connect().unwrap();
        board(&handle, &connector).await;
        let idle = manager.add_host(remote_host("FP2"));

        let link = connector.latest().unwrap();
        let acker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mark = link
                .control_frames()
                .into_iter()
                .find(|frame| frame.kind == "mark")
                .unwrap();
            link.ack(mark.message_id.unwrap(), Value::from(12));
        });

        assert!(manager.disengage_all(Duration::from_secs(5)).await);
        acker.await.unwrap();
        let status = handle.wait_for(|s| s.marker.is_some()).await.unwrap();
        assert_eq!(status.marker, Some(12));
        assert!(idle.status().marker.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn disengage_all_gives_up_at_ceiling() {
        let (mut manager, connector, _observer) = manager();
        let handle = manager.add_host(remote_host("FP1"));
        handle.connect().unwrap();
        board(&handle, &connector).await;
        let started = Instant::now();
        assert!(!manager.disengage_all(Duration::from_secs(1)).await);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn network_changes_fan_out() {
        let (mut manager, connector, _observer) = manager();
        let host = remote_host("FP1");
        let id = host.id.clone();
        let handle = manager.add_host(host);
        manager.activate(&id).unwrap();
        board(&handle, &connector).await;
        assert_eq!(connector.opened(), 1);

        manager.update_network_status(false);
        handle.wait_for(|s| !s.boarding).await.unwrap();
        let late = manager.add_host(remote_host("FP2"));
        late.connect().unwrap();
        settle().await;
        assert_eq!(connector.opened(), 1);

        manager.update_network_status(true);
        settle().await;
        assert_eq!(connector.opened(), 2);
        assert_eq!(connector.latest().unwrap().generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_host_stops_session() {
        let (mut manager, _connector, _observer) = manager();
        let host = remote_host("FP1");
        let id = host.id.clone();
        let handle = manager.add_host(host.clone());
        assert!(manager.add_host(host).status() == handle.status());
        assert_eq!(manager.hosts().len(), 1);

        assert!(manager.remove_host(&id));
        assert!(!manager.remove_host(&id));
        settle().await;
        assert!(matches!(handle.connect(), Err(SessionError::Closed)));
        assert!(manager.session(&id).is_none());
    }
}
