use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::driver::{Connector, DriverError, Shell, ShellEvent, ShellHandle, Target, Transport};
use crate::error::RelayError;
use crate::protocol::{ServerMessage, TextDecoder, ETX};

pub const STATUS_READY: &str = "SSH connection ready";
pub const STATUS_CLOSED: &str = "SSH shell closed";
pub const SHELL_OPEN_FAILED: &str = "Failed to open shell";

/// Longest unterminated line held in line mode before it is sent as-is.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4096;

/// Input accepted from the browser but not yet taken by the shell. Beyond
/// this, further input is dropped until the remote catches up.
const MAX_PENDING_INPUT_BYTES: usize = 1024 * 1024;

/// Lifecycle of one logical terminal.
///
/// `Initializing → Connecting → Connected → Closing → Closed`, with `Failed`
/// reachable from `Connecting` or `Connected`. `Closed` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// How keystrokes reach the remote shell.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Accumulate keystrokes and send whole lines on carriage return.
    /// Ctrl-C bypasses the buffer.
    #[default]
    Line,
    /// Forward every chunk verbatim, for shells running in PTY/raw mode.
    Raw,
}

/// Turns browser keystrokes into remote writes.
#[derive(Debug)]
pub struct LineDiscipline {
    mode: InputMode,
    buffer: String,
    max_line_bytes: usize,
}

impl Default for LineDiscipline {
    fn default() -> Self {
        Self::new(InputMode::default())
    }
}

impl LineDiscipline {
    pub fn new(mode: InputMode) -> Self {
        Self::with_limit(mode, DEFAULT_MAX_LINE_BYTES)
    }

    /// A line buffer that flushes unterminated input once it reaches
    /// `max_line_bytes`, without appending a newline.
    pub fn with_limit(mode: InputMode, max_line_bytes: usize) -> Self {
        Self {
            mode,
            buffer: String::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    /// Characters received but not yet terminated by a carriage return.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Feed one keystroke or pasted chunk, returning the writes it produces
    /// in order.
    pub fn feed(&mut self, chunk: &str) -> Vec<Bytes> {
        if self.mode == InputMode::Raw {
            if chunk.is_empty() {
                return Vec::new();
            }
            return vec![Bytes::copy_from_slice(chunk.as_bytes())];
        }

        let mut writes = Vec::new();
        for c in chunk.chars() {
            match c {
                '\r' => {
                    let mut line = std::mem::take(&mut self.buffer);
                    line.push('\n');
                    writes.push(Bytes::from(line));
                }
                ETX => writes.push(Bytes::from_static(b"\x03")),
                other => {
                    self.buffer.push(other);
                    if self.buffer.len() >= self.max_line_bytes {
                        writes.push(Bytes::from(std::mem::take(&mut self.buffer)));
                    }
                }
            }
        }
        writes
    }
}

/// Requests queued to a running session.
#[derive(Debug)]
pub enum SessionCommand {
    Connect(Target),
    Input(String),
}

/// Completion of one asynchronous connect stage.
pub enum HandshakeStep {
    Transport(Result<Box<dyn Transport>, DriverError>),
    Shell(Result<Shell, DriverError>),
}

pub type Handshake = BoxFuture<'static, HandshakeStep>;

/// One logical terminal bound to at most one remote shell.
///
/// The state machine is driven by [`Session::run`]; the individual handlers
/// are public so they can be exercised against a hand-driven shell.
pub struct Session {
    id: String,
    state: watch::Sender<SessionState>,
    line: LineDiscipline,
    shell: Option<ShellHandle>,
    /// Writes the shell's input queue had no room for yet, oldest first.
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    outbound: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
    stdout: TextDecoder,
    stderr: TextDecoder,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(id: String, mode: InputMode, outbound: mpsc::Sender<ServerMessage>) -> Self {
        let (state, _) = watch::channel(SessionState::Initializing);
        Self {
            id,
            state,
            line: LineDiscipline::new(mode),
            shell: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            outbound,
            cancel: CancellationToken::new(),
            stdout: TextDecoder::new(),
            stderr: TextDecoder::new(),
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.line = LineDiscipline::with_limit(self.line.mode(), max_line_bytes);
        self
    }

    /// Token that stops [`run`](Self::run) and everything it started.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn buffered_input(&self) -> &str {
        self.line.buffered()
    }

    /// Bytes accepted as input but still waiting for room in the shell.
    pub fn pending_input(&self) -> usize {
        self.pending_bytes
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(session = %self.id, from = ?prev, to = ?next, "session state");
        }
    }

    async fn emit(&self, msg: ServerMessage) {
        let delivered = tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.outbound.send(msg) => sent.is_ok(),
        };
        if !delivered {
            tracing::debug!(session = %self.id, "channel gone, dropping event");
        }
    }

    fn close_shell(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
        if let Some(shell) = self.shell.take() {
            shell.close();
        }
    }

    /// Move queued writes into the shell until its input queue is full.
    fn flush_pending(&mut self) {
        let Some(shell) = self.shell.as_ref() else {
            return;
        };
        while let Some(write) = self.pending.pop_front() {
            let len = write.len();
            match shell.try_write(write) {
                Ok(()) => self.pending_bytes -= len,
                Err(TrySendError::Full(write)) => {
                    self.pending.push_front(write);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(session = %self.id, "write to closed shell");
                    self.pending.clear();
                    self.pending_bytes = 0;
                    return;
                }
            }
        }
    }

    /// Start connecting. Only valid from `Initializing`; anything else is
    /// logged and ignored.
    pub fn handle_connect(
        &mut self,
        target: Target,
        connector: &Arc<dyn Connector>,
    ) -> Option<Handshake> {
        let state = self.state();
        if state != SessionState::Initializing {
            tracing::warn!(session = %self.id, ?state, "connect ignored: session already started");
            return None;
        }
        tracing::info!(
            session = %self.id,
            host = %target.address(),
            user = %target.username,
            "connecting"
        );
        self.set_state(SessionState::Connecting);
        Some(
            connector
                .connect(target, self.cancel.child_token())
                .map(HandshakeStep::Transport)
                .boxed(),
        )
    }

    /// Authentication succeeded; announce it and request the shell.
    pub async fn transport_ready(&mut self, transport: Box<dyn Transport>) -> Option<Handshake> {
        if self.state() != SessionState::Connecting {
            return None;
        }
        tracing::info!(session = %self.id, "transport ready");
        self.emit(ServerMessage::status(&self.id, STATUS_READY)).await;
        Some(transport.open_shell().map(HandshakeStep::Shell).boxed())
    }

    pub async fn connect_failed(&mut self, err: DriverError) {
        if self.state() != SessionState::Connecting {
            return;
        }
        tracing::warn!(session = %self.id, error = %err, "connect failed");
        self.emit(ServerMessage::error(
            Some(&self.id),
            RelayError::TRANSPORT,
            format!("SSH error: {err}"),
        ))
        .await;
        self.set_state(SessionState::Failed);
    }

    /// The shell is open: adopt it and start relaying.
    ///
    /// Returns the shell's event stream for the caller to poll.
    pub fn shell_ready(&mut self, shell: Shell) -> Option<mpsc::Receiver<ShellEvent>> {
        if self.state() != SessionState::Connecting {
            shell.handle.close();
            return None;
        }
        self.shell = Some(shell.handle);
        self.set_state(SessionState::Connected);
        Some(shell.events)
    }

    pub async fn shell_failed(&mut self, err: DriverError) {
        if self.state() != SessionState::Connecting {
            return;
        }
        tracing::warn!(session = %self.id, error = %err, "shell open failed");
        self.emit(ServerMessage::error(
            Some(&self.id),
            RelayError::SHELL,
            SHELL_OPEN_FAILED.to_string(),
        ))
        .await;
        self.close_shell();
        self.set_state(SessionState::Failed);
    }

    /// Apply one keystroke or chunk. Ignored unless `Connected`.
    ///
    /// Never waits on the shell: writes the input queue cannot take yet stay
    /// pending and are drained by [`run`](Self::run) as room appears.
    pub fn handle_input(&mut self, chunk: &str) {
        if self.state() != SessionState::Connected {
            tracing::debug!(
                session = %self.id,
                state = ?self.state(),
                "input dropped: not connected"
            );
            return;
        }
        for write in self.line.feed(chunk) {
            if self.pending_bytes + write.len() > MAX_PENDING_INPUT_BYTES {
                tracing::warn!(
                    session = %self.id,
                    pending = self.pending_bytes,
                    "shell is not keeping up, dropping input"
                );
                break;
            }
            self.pending_bytes += write.len();
            self.pending.push_back(write);
        }
        self.flush_pending();
    }

    pub async fn handle_remote_data(&mut self, bytes: &[u8]) {
        if self.state() != SessionState::Connected {
            return;
        }
        let text = self.stdout.decode(bytes);
        if !text.is_empty() {
            self.emit(ServerMessage::data(&self.id, text)).await;
        }
    }

    pub async fn handle_remote_error(&mut self, bytes: &[u8]) {
        if self.state() != SessionState::Connected {
            return;
        }
        let text = self.stderr.decode(bytes);
        if !text.is_empty() {
            self.emit(ServerMessage::stderr(&self.id, text)).await;
        }
    }

    /// Transport broke while the shell was live.
    pub async fn handle_remote_failure(&mut self, detail: &str) {
        if self.state() != SessionState::Connected {
            return;
        }
        tracing::warn!(session = %self.id, error = %detail, "transport failed");
        self.emit(ServerMessage::error(
            Some(&self.id),
            RelayError::TRANSPORT,
            format!("SSH error: {detail}"),
        ))
        .await;
        self.close_shell();
        self.set_state(SessionState::Failed);
    }

    pub async fn handle_remote_close(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        self.set_state(SessionState::Closing);
        self.emit(ServerMessage::status(&self.id, STATUS_CLOSED)).await;
        self.close_shell();
        self.set_state(SessionState::Closed);
        tracing::info!(session = %self.id, "shell closed by remote");
    }

    /// Tear down from the owning channel. Idempotent; emits nothing.
    pub fn terminate(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        self.set_state(SessionState::Closing);
        self.close_shell();
        self.set_state(SessionState::Closed);
    }

    /// Drive the session until it reaches a terminal state.
    ///
    /// Commands, handshake progress, shell output and pending writes are
    /// multiplexed here. A shell that stops reading input never stops its
    /// output from being drained, and cancelling [`cancel_token`] abandons
    /// whatever is in flight.
    ///
    /// [`cancel_token`]: Self::cancel_token
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        connector: Arc<dyn Connector>,
    ) {
        let cancel = self.cancel.clone();
        let mut handshake: Option<Handshake> = None;
        let mut events: Option<mpsc::Receiver<ShellEvent>> = None;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.terminate();
                }

                step = async {
                    match handshake.as_mut() {
                        Some(h) => h.await,
                        None => std::future::pending().await,
                    }
                } => {
                    handshake = None;
                    match step {
                        HandshakeStep::Transport(Ok(transport)) => {
                            handshake = self.transport_ready(transport).await;
                        }
                        HandshakeStep::Transport(Err(e)) => self.connect_failed(e).await,
                        HandshakeStep::Shell(Ok(shell)) => events = self.shell_ready(shell),
                        HandshakeStep::Shell(Err(e)) => self.shell_failed(e).await,
                    }
                }

                event = async {
                    match events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Some(ShellEvent::Data(data)) => self.handle_remote_data(&data).await,
                        Some(ShellEvent::Stderr(data)) => self.handle_remote_error(&data).await,
                        Some(ShellEvent::Error(detail)) => {
                            self.handle_remote_failure(&detail).await
                        }
                        Some(ShellEvent::Closed) | None => {
                            events = None;
                            self.handle_remote_close().await;
                        }
                    }
                }

                permit = async {
                    match self.shell.as_ref() {
                        Some(shell) if !self.pending.is_empty() => shell.reserve().await,
                        _ => std::future::pending().await,
                    }
                } => {
                    match permit {
                        Ok(permit) => {
                            if let Some(write) = self.pending.pop_front() {
                                self.pending_bytes -= write.len();
                                permit.send(write);
                            }
                            self.flush_pending();
                        }
                        Err(e) => {
                            tracing::debug!(
                                session = %self.id,
                                error = %e,
                                "write to closed shell"
                            );
                            self.pending.clear();
                            self.pending_bytes = 0;
                        }
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Connect(target)) => {
                            if let Some(h) = self.handle_connect(target, &connector) {
                                handshake = Some(h);
                            }
                        }
                        Some(SessionCommand::Input(chunk)) => self.handle_input(&chunk),
                        None => self.terminate(),
                    }
                }
            }

            if self.state().is_terminal() {
                break;
            }
        }

        tracing::debug!(session = %self.id, state = ?self.state(), "session task exiting");
    }
}

/// Registry-side reference to a running [`Session`] task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    serial: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Spawn `session` onto the runtime. `on_exit` runs once the session has
    /// reached a terminal state.
    pub fn spawn<F>(
        session: Session,
        serial: u64,
        connector: Arc<dyn Connector>,
        on_exit: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: session.id().to_owned(),
            serial,
            commands,
            cancel: session.cancel_token(),
            state: session.watch_state(),
        };
        tokio::spawn(async move {
            session.run(commands_rx, connector).await;
            on_exit();
        });
        handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Queue a command. Fails once the session has terminated.
    pub fn send(&self, command: SessionCommand) -> Result<(), RelayError> {
        if self.state().is_terminal() {
            return Err(RelayError::SessionClosed(self.id.clone()));
        }
        self.commands
            .send(command)
            .map_err(|_| RelayError::SessionClosed(self.id.clone()))
    }

    /// Request teardown. Returns immediately; idempotent.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session reaches `Closed` or `Failed`.
    pub async fn terminated(&self) -> SessionState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }
}
