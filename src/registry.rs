use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::driver::Connector;
use crate::error::RelayError;
use crate::protocol::ServerMessage;
use crate::session::{InputMode, Session, SessionHandle, DEFAULT_MAX_LINE_BYTES};

/// Identifies one browser connection for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

struct ChannelEntry {
    outbound: mpsc::Sender<ServerMessage>,
    sessions: HashMap<String, SessionHandle>,
}

struct RegistryInner {
    channels: HashMap<ChannelId, ChannelEntry>,
    next_channel: u64,
    next_serial: u64,
}

/// Thread-safe index of open connections and the sessions each one owns.
///
/// Session ids are scoped per connection: two browsers may both use `"main"`.
/// A session leaves the index on its own once it reaches a terminal state,
/// so its id becomes reusable.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
    max_sessions_per_channel: usize,
    max_line_bytes: usize,
}

impl Registry {
    pub fn new(max_sessions_per_channel: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                channels: HashMap::new(),
                next_channel: 1,
                next_serial: 0,
            })),
            max_sessions_per_channel,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Cap on each session's unterminated line buffer.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Open a connection whose sessions will publish on `outbound`.
    pub fn register_channel(&self, outbound: mpsc::Sender<ServerMessage>) -> ChannelId {
        let mut inner = self.inner.write();
        let id = ChannelId(inner.next_channel);
        inner.next_channel += 1;
        inner.channels.insert(
            id,
            ChannelEntry {
                outbound,
                sessions: HashMap::new(),
            },
        );
        id
    }

    /// Create a session owned by `channel` and start its task.
    pub fn create_session(
        &self,
        channel: ChannelId,
        id: String,
        mode: InputMode,
        connector: Arc<dyn Connector>,
    ) -> Result<SessionHandle, RelayError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let entry = inner
            .channels
            .get_mut(&channel)
            .ok_or(RelayError::ChannelClosed)?;

        if entry.sessions.contains_key(&id) {
            return Err(RelayError::DuplicateSession(id));
        }
        if entry.sessions.len() >= self.max_sessions_per_channel {
            return Err(RelayError::SessionLimit(self.max_sessions_per_channel));
        }

        inner.next_serial += 1;
        let serial = inner.next_serial;
        let session = Session::new(id.clone(), mode, entry.outbound.clone())
            .with_max_line_bytes(self.max_line_bytes);

        let registry = self.clone();
        let exit_id = id.clone();
        let handle = SessionHandle::spawn(session, serial, connector, move || {
            registry.release(channel, &exit_id, serial);
        });
        entry.sessions.insert(id, handle.clone());
        tracing::debug!(%channel, session = %handle.id(), "session created");
        Ok(handle)
    }

    /// Remove a finished session, unless its id was already reused.
    fn release(&self, channel: ChannelId, id: &str, serial: u64) {
        let mut inner = self.inner.write();
        let Some(entry) = inner.channels.get_mut(&channel) else {
            return;
        };
        if entry.sessions.get(id).map(SessionHandle::serial) == Some(serial) {
            entry.sessions.remove(id);
            tracing::debug!(%channel, session = %id, "session released");
        }
    }

    pub fn get_session(&self, channel: ChannelId, id: &str) -> Option<SessionHandle> {
        let inner = self.inner.read();
        inner.channels.get(&channel)?.sessions.get(id).cloned()
    }

    /// The channel's only session, for clients that omit `sessionId`.
    pub fn sole_session(&self, channel: ChannelId) -> Result<SessionHandle, RelayError> {
        let inner = self.inner.read();
        let entry = inner
            .channels
            .get(&channel)
            .ok_or(RelayError::ChannelClosed)?;
        let mut sessions = entry.sessions.values();
        match (sessions.next(), sessions.next()) {
            (Some(only), None) => Ok(only.clone()),
            _ => Err(RelayError::AmbiguousSession(entry.sessions.len())),
        }
    }

    /// Tear down one session. Unknown ids are ignored.
    pub fn terminate_session(&self, channel: ChannelId, id: &str) -> bool {
        match self.get_session(channel, id) {
            Some(handle) => {
                handle.terminate();
                true
            }
            None => false,
        }
    }

    pub fn outbound(&self, channel: ChannelId) -> Option<mpsc::Sender<ServerMessage>> {
        let inner = self.inner.read();
        inner.channels.get(&channel).map(|e| e.outbound.clone())
    }

    /// Forget a connection and terminate everything it owned.
    ///
    /// Returns the number of sessions that were terminated.
    pub fn drop_channel(&self, channel: ChannelId) -> usize {
        let entry = self.inner.write().channels.remove(&channel);
        let Some(entry) = entry else {
            return 0;
        };
        let count = entry.sessions.len();
        for handle in entry.sessions.values() {
            handle.terminate();
        }
        tracing::debug!(%channel, sessions = count, "channel dropped");
        count
    }

    pub fn session_count(&self, channel: ChannelId) -> usize {
        let inner = self.inner.read();
        inner
            .channels
            .get(&channel)
            .map_or(0, |e| e.sessions.len())
    }

    pub fn channel_count(&self) -> usize {
        self.inner.read().channels.len()
    }

    pub fn total_sessions(&self) -> usize {
        let inner = self.inner.read();
        inner.channels.values().map(|e| e.sessions.len()).sum()
    }
}
