//! Remote shell driver abstraction.
//!
//! A [`Connector`] opens a [`Transport`] to a remote host; the transport then
//! yields either an interactive [`Shell`] or a one-shot exec result. A live
//! shell is split in two halves connected by channels:
//!
//! - [`ShellHandle`] + event receiver, owned by the session
//! - [`ShellBackend`], owned by whatever task pumps bytes to the real remote
//!
//! Tests build shells with [`shell_channel`] directly and drive the backend
//! half by hand.

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio_util::sync::CancellationToken;

/// Queued writes waiting for the remote shell's stdin.
pub(crate) const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Remote output chunks waiting to be relayed to the browser.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("{0}")]
    Connect(String),

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("All configured authentication methods failed")]
    AuthRejected,

    #[error("command did not finish within {0}s")]
    ExecTimeout(u64),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("failed to open shell: {0}")]
    ShellOpen(String),

    #[error("{0}")]
    Transport(String),

    #[error("driver is closed")]
    Closed,
}

/// Login material for one connection request.
///
/// At least one of `password` / `private_key` is present; the codec rejects
/// requests without either. When both are given the key is tried first.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.private_key.is_none()
    }
}

/// Where to connect and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
}

impl Target {
    /// `host:port`, used in log fields and error messages.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Asynchronous output of a live shell, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Remote standard output.
    Data(Bytes),
    /// Remote standard error (SSH extended data type 1).
    Stderr(Bytes),
    /// Unrecoverable transport failure. A `Closed` follows.
    Error(String),
    /// The shell stream ended. Sent exactly once.
    Closed,
}

/// Session-side half of a shell: write input, request close.
#[derive(Debug, Clone)]
pub struct ShellHandle {
    input_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl ShellHandle {
    /// Queue bytes for the remote shell's stdin.
    ///
    /// Fails with [`DriverError::Closed`] once [`close`](Self::close) was
    /// called or the backend went away.
    pub async fn write(&self, data: Bytes) -> Result<(), DriverError> {
        self.reserve().await?.send(data);
        Ok(())
    }

    /// Queue bytes without waiting. A full queue hands the bytes back as
    /// [`TrySendError::Full`].
    pub fn try_write(&self, data: Bytes) -> Result<(), TrySendError<Bytes>> {
        if self.cancel.is_cancelled() {
            return Err(TrySendError::Closed(data));
        }
        self.input_tx.try_send(data)
    }

    /// Wait for room in the input queue. Resolves to [`DriverError::Closed`]
    /// as soon as the shell is closed, even while the queue stays full.
    pub async fn reserve(&self) -> Result<OwnedPermit<Bytes>, DriverError> {
        if self.cancel.is_cancelled() {
            return Err(DriverError::Closed);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DriverError::Closed),
            permit = self.input_tx.clone().reserve_owned() => {
                permit.map_err(|_| DriverError::Closed)
            }
        }
    }

    /// Terminate the shell stream and its transport. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.input_tx.is_closed()
    }
}

/// A freshly opened interactive shell.
#[derive(Debug)]
pub struct Shell {
    pub handle: ShellHandle,
    pub events: mpsc::Receiver<ShellEvent>,
}

/// Transport-side half of a shell.
///
/// The pump task reads `input_rx`, publishes on `events_tx`, and stops when
/// `cancel` fires.
#[derive(Debug)]
pub struct ShellBackend {
    pub input_rx: mpsc::Receiver<Bytes>,
    pub events_tx: mpsc::Sender<ShellEvent>,
    pub cancel: CancellationToken,
}

impl ShellBackend {
    /// Hand one event to the session. Returns `false` once the session is
    /// gone or `cancel` fires, including while the event queue is full.
    pub async fn publish(&self, event: ShellEvent) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.events_tx.send(event) => sent.is_ok(),
        }
    }
}

/// Create a connected [`Shell`] / [`ShellBackend`] pair.
///
/// `cancel` is shared by both halves; cancelling it (directly, through a
/// parent token, or via [`ShellHandle::close`]) tells the backend to stop.
pub fn shell_channel(cancel: CancellationToken) -> (Shell, ShellBackend) {
    let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let shell = Shell {
        handle: ShellHandle {
            input_tx,
            cancel: cancel.clone(),
        },
        events: events_rx,
    };
    let backend = ShellBackend {
        input_rx,
        events_tx,
        cancel,
    };
    (shell, backend)
}

/// Captured result of a one-shot remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Stdout, with each stderr chunk appended as `STDERR: <chunk>`.
    pub output: String,
    pub exit_status: Option<u32>,
}

/// Opens authenticated transports to remote hosts.
///
/// `cancel` is a child of the requesting session's token: implementations
/// must abandon the attempt (dropping any half-open connection) when it
/// fires, and hand it on to the shell they eventually open.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        target: Target,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Box<dyn Transport>, DriverError>>;
}

/// An authenticated connection, ready to open one channel.
///
/// Both methods consume the transport. On failure the transport is torn down
/// before the error is returned.
pub trait Transport: Send {
    fn open_shell(self: Box<Self>) -> BoxFuture<'static, Result<Shell, DriverError>>;

    fn exec(
        self: Box<Self>,
        command: String,
    ) -> BoxFuture<'static, Result<ExecOutput, DriverError>>;
}

/// In-memory connector for unit tests: every shell it opens is a bare
/// [`shell_channel`] whose backend half is handed to the test.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FakeMode {
        Succeed,
        RefuseTransport,
        RefuseShell,
        /// Connects, but every exec fails.
        FailExec,
        /// Connect never completes.
        Hang,
    }

    #[derive(Default)]
    struct Recorded {
        backends: VecDeque<ShellBackend>,
        tokens: VecDeque<CancellationToken>,
        connects: usize,
        commands: Vec<String>,
    }

    #[derive(Clone)]
    pub struct FakeConnector {
        mode: FakeMode,
        recorded: Arc<Mutex<Recorded>>,
    }

    struct FakeTransport {
        mode: FakeMode,
        cancel: CancellationToken,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl FakeConnector {
        pub fn new(mode: FakeMode) -> Self {
            Self {
                mode,
                recorded: Arc::default(),
            }
        }

        pub fn connect_count(&self) -> usize {
            self.recorded.lock().connects
        }

        pub fn commands(&self) -> Vec<String> {
            self.recorded.lock().commands.clone()
        }

        /// Wait for the next shell opened through this connector.
        pub async fn next_backend(&self) -> ShellBackend {
            let recorded = self.recorded.clone();
            poll(move || recorded.lock().backends.pop_front()).await
        }

        /// Wait for the cancellation token of the next connect attempt.
        pub async fn next_connect_token(&self) -> CancellationToken {
            let recorded = self.recorded.clone();
            poll(move || recorded.lock().tokens.pop_front()).await
        }
    }

    async fn poll<T>(mut take: impl FnMut() -> Option<T>) -> T {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(value) = take() {
                return value;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for fake driver");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    impl Connector for FakeConnector {
        fn connect(
            &self,
            _target: Target,
            cancel: CancellationToken,
        ) -> BoxFuture<'static, Result<Box<dyn Transport>, DriverError>> {
            let mode = self.mode;
            let recorded = self.recorded.clone();
            {
                let mut rec = recorded.lock();
                rec.connects += 1;
                rec.tokens.push_back(cancel.clone());
            }
            async move {
                match mode {
                    FakeMode::Succeed | FakeMode::RefuseShell | FakeMode::FailExec => {
                        Ok(Box::new(FakeTransport {
                            mode,
                            cancel,
                            recorded,
                        }) as Box<dyn Transport>)
                    }
                    FakeMode::RefuseTransport => Err(DriverError::AuthRejected),
                    FakeMode::Hang => std::future::pending().await,
                }
            }
            .boxed()
        }
    }

    impl Transport for FakeTransport {
        fn open_shell(self: Box<Self>) -> BoxFuture<'static, Result<Shell, DriverError>> {
            async move {
                if self.mode == FakeMode::RefuseShell {
                    return Err(DriverError::ShellOpen("channel refused".into()));
                }
                let (shell, backend) = shell_channel(self.cancel.clone());
                self.recorded.lock().backends.push_back(backend);
                Ok(shell)
            }
            .boxed()
        }

        fn exec(
            self: Box<Self>,
            command: String,
        ) -> BoxFuture<'static, Result<ExecOutput, DriverError>> {
            async move {
                self.recorded.lock().commands.push(command.clone());
                if self.mode == FakeMode::FailExec {
                    return Err(DriverError::ExecTimeout(60));
                }
                Ok(ExecOutput {
                    output: format!("ran {command}\n"),
                    exit_status: Some(0),
                })
            }
            .boxed()
        }
    }
}
