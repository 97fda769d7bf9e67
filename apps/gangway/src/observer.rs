//! Notification port between sessions and whatever presents them.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::HostEntry;

pub trait SessionObserver: Send + Sync {
    /// Operator-visible message about `host`.
    fn notify(&self, host: &HostEntry, message: &str);

    /// Message not tied to a single host.
    fn notice(&self, message: &str) {
        tracing::info!(target: "gangway::observer", "{message}");
    }

    /// A boarding session hit a non-debounced link failure.
    fn session_lost(&self, host: &HostEntry) {
        let _ = host;
    }

    /// Signaling never reached the host.
    fn no_signal(&self, host: &HostEntry, reason: &str) {
        let _ = (host, reason);
    }

    /// The host refused the session token.
    fn auth_rejected(&self, host: &HostEntry) {
        let _ = host;
    }

    fn verified(&self, host: &HostEntry) {
        let _ = host;
    }
}

/// Logs every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn notify(&self, host: &HostEntry, message: &str) {
        tracing::info!(target: "gangway::observer", host = %host.name, "{message}");
    }

    fn session_lost(&self, host: &HostEntry) {
        tracing::warn!(target: "gangway::observer", host = %host.name, "session lost");
    }

    fn no_signal(&self, host: &HostEntry, reason: &str) {
        tracing::warn!(target: "gangway::observer", host = %host.name, reason, "no signal");
    }

    fn auth_rejected(&self, host: &HostEntry) {
        tracing::warn!(target: "gangway::observer", host = %host.name, "authorization rejected");
    }

    fn verified(&self, host: &HostEntry) {
        tracing::info!(target: "gangway::observer", host = %host.name, "host verified");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Notify { host: String, message: String },
    Notice(String),
    SessionLost(String),
    NoSignal { host: String, reason: String },
    AuthRejected(String),
    Verified(String),
}

/// Collects notifications for later inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<Observed>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Observed::Notify { message, .. } => Some(message.clone()),
                Observed::Notice(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Observed) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    fn push(&self, event: Observed) {
        self.events.lock().push(event);
    }
}

impl SessionObserver for RecordingObserver {
    fn notify(&self, host: &HostEntry, message: &str) {
        self.push(Observed::Notify {
            host: host.name.clone(),
            message: message.to_string(),
        });
    }

    fn notice(&self, message: &str) {
        self.push(Observed::Notice(message.to_string()));
    }

    fn session_lost(&self, host: &HostEntry) {
        self.push(Observed::SessionLost(host.name.clone()));
    }

    fn no_signal(&self, host: &HostEntry, reason: &str) {
        self.push(Observed::NoSignal {
            host: host.name.clone(),
            reason: reason.to_string(),
        });
    }

    fn auth_rejected(&self, host: &HostEntry) {
        self.push(Observed::AuthRejected(host.name.clone()));
    }

    fn verified(&self, host: &HostEntry) {
        self.push(Observed::Verified(host.name.clone()));
    }
}
