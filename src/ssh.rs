//! SSH driver backed by `russh`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key;
use tokio_util::sync::CancellationToken;

use crate::config::SshSettings;
use crate::driver::{
    shell_channel, Connector, Credentials, DriverError, ExecOutput, Shell, ShellBackend,
    ShellEvent, Target, Transport,
};
use crate::protocol::TextDecoder;

/// SSH extended-data stream number for stderr.
const EXTENDED_DATA_STDERR: u32 = 1;

impl From<russh::Error> for DriverError {
    fn from(e: russh::Error) -> Self {
        DriverError::Transport(e.to_string())
    }
}

/// Accepts every host key and logs its fingerprint.
struct HostKeyLogger {
    address: String,
}

#[async_trait]
impl client::Handler for HostKeyLogger {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::info!(
            host = %self.address,
            fingerprint = %server_public_key.fingerprint(),
            "accepting host key"
        );
        Ok(true)
    }
}

type SshHandle = client::Handle<HostKeyLogger>;

/// Opens SSH transports with the configured timeouts and PTY geometry.
#[derive(Debug, Clone)]
pub struct SshConnector {
    settings: Arc<SshSettings>,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            keepalive_interval: self.settings.keepalive_interval(),
            ..Default::default()
        })
    }
}

impl Connector for SshConnector {
    fn connect(
        &self,
        target: Target,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Box<dyn Transport>, DriverError>> {
        let config = self.client_config();
        let settings = self.settings.clone();
        async move {
            let address = target.address();
            let attempt = tokio::time::timeout(
                settings.connect_timeout(),
                open_authenticated(config, &target),
            );
            let handle = tokio::select! {
                _ = cancel.cancelled() => return Err(DriverError::Closed),
                result = attempt => match result {
                    Ok(handle) => handle?,
                    Err(_) => return Err(DriverError::Timeout(address)),
                },
            };
            tracing::debug!(host = %address, user = %target.username, "authenticated");
            Ok(Box::new(SshTransport {
                handle,
                settings,
                cancel,
                address,
            }) as Box<dyn Transport>)
        }
        .boxed()
    }
}

async fn open_authenticated(
    config: Arc<client::Config>,
    target: &Target,
) -> Result<SshHandle, DriverError> {
    let handler = HostKeyLogger {
        address: target.address(),
    };
    let mut handle = client::connect(config, (target.host.as_str(), target.port), handler)
        .await
        .map_err(|e| DriverError::Connect(e.to_string()))?;

    if authenticate(&mut handle, &target.username, &target.credentials).await? {
        Ok(handle)
    } else {
        disconnect(&handle).await;
        Err(DriverError::AuthRejected)
    }
}

/// Try the private key first, then the password.
async fn authenticate(
    handle: &mut SshHandle,
    username: &str,
    credentials: &Credentials,
) -> Result<bool, DriverError> {
    if let Some(pem) = &credentials.private_key {
        match russh_keys::decode_secret_key(pem, credentials.passphrase.as_deref()) {
            Ok(key) => {
                if handle.authenticate_publickey(username, Arc::new(key)).await? {
                    return Ok(true);
                }
                tracing::debug!(user = %username, "public key rejected");
            }
            Err(e) if credentials.password.is_some() => {
                tracing::warn!(error = %e, "could not decode private key, trying password");
            }
            Err(e) => return Err(DriverError::InvalidKey(e.to_string())),
        }
    }

    if let Some(password) = &credentials.password {
        return Ok(handle.authenticate_password(username, password).await?);
    }
    Ok(false)
}

async fn disconnect(handle: &SshHandle) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        tracing::debug!(error = %e, "disconnect failed");
    }
}

struct SshTransport {
    handle: SshHandle,
    settings: Arc<SshSettings>,
    cancel: CancellationToken,
    address: String,
}

impl SshTransport {
    async fn start_shell(&self) -> Result<Channel<Msg>, DriverError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel
            .request_pty(
                false,
                &self.settings.term,
                self.settings.cols,
                self.settings.rows,
                0,
                0,
                &[],
            )
            .await?;
        channel.request_shell(true).await?;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(channel),
                Some(ChannelMsg::Failure) => {
                    return Err(DriverError::ShellOpen("shell request refused".into()))
                }
                Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) | None => {
                    return Err(DriverError::ShellOpen("channel closed".into()))
                }
                Some(_) => continue,
            }
        }
    }
}

impl Transport for SshTransport {
    fn open_shell(self: Box<Self>) -> BoxFuture<'static, Result<Shell, DriverError>> {
        async move {
            let channel = match self.start_shell().await {
                Ok(channel) => channel,
                Err(e) => {
                    disconnect(&self.handle).await;
                    return Err(match e {
                        DriverError::ShellOpen(_) => e,
                        other => DriverError::ShellOpen(other.to_string()),
                    });
                }
            };
            tracing::info!(host = %self.address, "shell opened");

            let SshTransport {
                handle,
                cancel,
                address,
                ..
            } = *self;
            let (shell, backend) = shell_channel(cancel);
            tokio::spawn(pump(channel, handle, backend, address));
            Ok(shell)
        }
        .boxed()
    }

    fn exec(
        self: Box<Self>,
        command: String,
    ) -> BoxFuture<'static, Result<ExecOutput, DriverError>> {
        async move {
            let result = bounded_exec(
                self.settings.exec_timeout(),
                &self.cancel,
                run_command(&self.handle, &command),
            )
            .await;
            if let Err(DriverError::ExecTimeout(_)) = &result {
                tracing::warn!(host = %self.address, %command, "command timed out");
            }
            disconnect(&self.handle).await;
            result
        }
        .boxed()
    }
}

/// Run `command` under the exec time limit, giving up early on `cancel`.
async fn bounded_exec(
    limit: Duration,
    cancel: &CancellationToken,
    command: impl Future<Output = Result<ExecOutput, DriverError>>,
) -> Result<ExecOutput, DriverError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DriverError::Closed),
        outcome = tokio::time::timeout(limit, command) => {
            outcome.unwrap_or(Err(DriverError::ExecTimeout(limit.as_secs())))
        }
    }
}

async fn run_command(handle: &SshHandle, command: &str) -> Result<ExecOutput, DriverError> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut stdout = TextDecoder::new();
    let mut stderr = TextDecoder::new();
    let mut result = ExecOutput::default();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => result.output.push_str(&stdout.decode(&data)),
            ChannelMsg::ExtendedData { data, ext } if ext == EXTENDED_DATA_STDERR => {
                result.output.push_str("STDERR: ");
                result.output.push_str(&stderr.decode(&data));
            }
            ChannelMsg::ExitStatus { exit_status } => result.exit_status = Some(exit_status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    Ok(result)
}

/// Shuttle bytes between a live channel and its [`ShellBackend`] until the
/// remote closes, the transport drops, or the session cancels.
///
/// Every await here also watches `cancel`, so a session that stops draining
/// events can still tear the pump down.
async fn pump(
    mut channel: Channel<Msg>,
    handle: SshHandle,
    mut backend: ShellBackend,
    address: String,
) {
    let cancel = backend.cancel.clone();
    let mut remote_closed = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = channel.eof().await;
                break;
            }

            input = backend.input_rx.recv() => {
                let Some(data) = input else { break };
                let written = tokio::select! {
                    _ = cancel.cancelled() => break,
                    written = channel.data(&data[..]) => written,
                };
                if let Err(e) = written {
                    backend.publish(ShellEvent::Error(e.to_string())).await;
                    break;
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if !backend.publish(ShellEvent::Data(Bytes::copy_from_slice(&data))).await {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == EXTENDED_DATA_STDERR => {
                        let event = ShellEvent::Stderr(Bytes::copy_from_slice(&data));
                        if !backend.publish(event).await {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        tracing::debug!(host = %address, exit_status, "remote shell exited");
                    }
                    Some(ChannelMsg::Close) => {
                        remote_closed = true;
                        break;
                    }
                    Some(_) => {}
                    None => {
                        if !cancel.is_cancelled() {
                            backend.publish(ShellEvent::Error("connection lost".into())).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    disconnect(&handle).await;
    if !cancel.is_cancelled() {
        backend.publish(ShellEvent::Closed).await;
    }
    tracing::debug!(host = %address, remote_closed, "shell pump finished");
}
