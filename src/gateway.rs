//! Routes client envelopes to sessions.
//!
//! One [`Gateway`] serves every connection. Each connection is registered as
//! a channel; inbound text frames go through [`Gateway::handle_message`],
//! and everything the channel's sessions emit lands on the outbound queue
//! supplied to [`Gateway::open_channel`]. Failures are answered with an
//! `error` envelope and never close the connection.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::driver::Connector;
use crate::error::RelayError;
use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::registry::{ChannelId, Registry};
use crate::session::{InputMode, SessionCommand};

#[derive(Clone)]
pub struct Gateway {
    registry: Registry,
    connector: Arc<dyn Connector>,
    input_mode: InputMode,
}

impl Gateway {
    pub fn new(registry: Registry, connector: Arc<dyn Connector>, input_mode: InputMode) -> Self {
        Self {
            registry,
            connector,
            input_mode,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    pub fn open_channel(&self, outbound: mpsc::Sender<ServerMessage>) -> ChannelId {
        let channel = self.registry.register_channel(outbound);
        tracing::info!(%channel, "channel opened");
        channel
    }

    /// The connection is gone: terminate every session it owned.
    pub fn close_channel(&self, channel: ChannelId) -> usize {
        let count = self.registry.drop_channel(channel);
        tracing::info!(%channel, sessions = count, "channel closed");
        count
    }

    /// Handle one inbound text frame.
    pub async fn handle_message(&self, channel: ChannelId, raw: &str) {
        let msg = match protocol::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(%channel, error = %e, "rejected client message");
                self.report(channel, None, e.into()).await;
                return;
            }
        };

        match msg {
            ClientMessage::Connect { session_id, target } => {
                let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let result = self
                    .registry
                    .create_session(channel, id.clone(), self.input_mode, self.connector.clone())
                    .and_then(|handle| handle.send(SessionCommand::Connect(target)));
                if let Err(e) = result {
                    tracing::debug!(%channel, session = %id, error = %e, "connect rejected");
                    self.report(channel, Some(&id), e).await;
                }
            }
            ClientMessage::Input {
                session_id,
                payload,
            } => {
                let handle = match &session_id {
                    Some(id) => self
                        .registry
                        .get_session(channel, id)
                        .ok_or_else(|| RelayError::SessionNotFound(id.clone())),
                    None => self.registry.sole_session(channel),
                };
                let result = handle.and_then(|h| h.send(SessionCommand::Input(payload)));
                if let Err(e) = result {
                    self.report(channel, session_id.as_deref(), e).await;
                }
            }
            ClientMessage::Disconnect { session_id } => {
                if !self.registry.terminate_session(channel, &session_id) {
                    let err = RelayError::SessionNotFound(session_id.clone());
                    self.report(channel, Some(&session_id), err).await;
                }
            }
        }
    }

    async fn report(&self, channel: ChannelId, session_id: Option<&str>, err: RelayError) {
        let Some(outbound) = self.registry.outbound(channel) else {
            return;
        };
        let msg = ServerMessage::error(session_id, err.code(), err.to_string());
        if outbound.send(msg).await.is_err() {
            tracing::debug!(%channel, "channel gone, dropping error report");
        }
    }
}
