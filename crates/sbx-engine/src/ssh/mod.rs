//! Pure-library SSH transport into the guest: exec, SFTP copy, and local
//! port forwarding over one connection.
//!
//! One [`SshClient`] wraps one connection. Forwarded connections and exec
//! calls may run concurrently on separate channels, but overlapping SFTP
//! copies on the same client are not supported; open a second client
//! instead.

mod copy;
mod forward;

pub use forward::{parse_port_mapping, PortMapping};

use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Sig};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sbx_types::{Error, Result};

const DEFAULT_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection parameters. The host key check is intentionally accepting:
/// the peer is a just-booted guest on a host-local interface whose identity
/// is established by the injected authorized key, not by TOFU.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key_pem: String,
    pub connect_timeout: Duration,
}

impl DialOptions {
    pub fn new(host: impl Into<String>, user: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            private_key_pem: private_key_pem.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Output plumbing for one exec. Absent writers discard that stream.
#[derive(Default)]
pub struct ExecIo<'a> {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin + 'static>>,
    pub stdout: Option<&'a mut (dyn AsyncWrite + Send + Unpin)>,
    pub stderr: Option<&'a mut (dyn AsyncWrite + Send + Unpin)>,
}

pub(crate) struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshClient {
    handle: Arc<client::Handle<AcceptAnyHostKey>>,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient").finish_non_exhaustive()
    }
}

impl SshClient {
    /// Connects and authenticates. Fails `NotValid` on missing parameters or
    /// an unparseable key, `Timeout` on a slow dial, `Cancelled` when the
    /// token fires first.
    pub async fn dial(cancel: &CancellationToken, opts: &DialOptions) -> Result<Self> {
        if opts.host.is_empty() {
            return Err(Error::NotValid("ssh host is required".into()));
        }
        if opts.user.is_empty() {
            return Err(Error::NotValid("ssh user is required".into()));
        }
        if opts.private_key_pem.is_empty() {
            return Err(Error::NotValid("ssh private key is required".into()));
        }
        let key = decode_secret_key(&opts.private_key_pem, None)
            .map_err(|e| Error::NotValid(format!("could not parse private key: {e}")))?;

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            conn = tokio::time::timeout(
                opts.connect_timeout,
                TcpStream::connect((opts.host.as_str(), opts.port)),
            ) => match conn {
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "connecting to {}:{}",
                        opts.host, opts.port
                    )))
                }
                Ok(Err(e)) => {
                    return Err(Error::transport(
                        format!("could not connect to {}:{}", opts.host, opts.port),
                        e,
                    ))
                }
                Ok(Ok(stream)) => stream,
            },
        };

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect_stream(config, stream, AcceptAnyHostKey)
            .await
            .map_err(|e| Error::transport("ssh handshake failed", e))?;

        let auth = handle
            .authenticate_publickey(
                &opts.user,
                PrivateKeyWithHashAlg::new(Arc::new(key), None),
            )
            .await
            .map_err(|e| Error::transport("ssh authentication failed", e))?;
        if !auth.success() {
            return Err(Error::transport_msg(format!(
                "ssh authentication rejected for user {}",
                opts.user
            )));
        }
        debug!(host = %opts.host, user = %opts.user, "ssh session established");
        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Runs one command on a fresh channel and returns its exit code. A
    /// non-zero remote exit is not an error; cancellation SIGKILLs the
    /// remote process and returns `Cancelled`.
    pub async fn exec(
        &self,
        cancel: &CancellationToken,
        command: &str,
        mut io: ExecIo<'_>,
    ) -> Result<u32> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::transport("could not open ssh channel", e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::transport("could not start remote command", e))?;

        if let Some(mut stdin) = io.stdin.take() {
            let mut writer = channel.make_writer();
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdin, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }

        let mut exit_code: Option<u32> = None;
        loop {
            // The handler bodies must not touch `channel` while its wait
            // future is live, so cancellation is mapped to a sentinel first.
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                msg = channel.wait() => Some(msg),
            };
            let msg = match event {
                None => {
                    let _ = channel.signal(Sig::KILL).await;
                    return Err(Error::Cancelled);
                }
                Some(None) => break,
                Some(Some(msg)) => msg,
            };
            match msg {
                ChannelMsg::Data { ref data } => {
                    if let Some(out) = io.stdout.as_deref_mut() {
                        out.write_all(data)
                            .await
                            .map_err(|e| Error::transport("writing stdout", e))?;
                    }
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    if let Some(err) = io.stderr.as_deref_mut() {
                        err.write_all(data)
                            .await
                            .map_err(|e| Error::transport("writing stderr", e))?;
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }
        Ok(exit_code.unwrap_or(0))
    }

    /// Runs a command and captures its stdout as a string; convenience for
    /// short in-guest configuration commands.
    pub async fn exec_capture(
        &self,
        cancel: &CancellationToken,
        command: &str,
    ) -> Result<(u32, String)> {
        let mut stdout = std::io::Cursor::new(Vec::new());
        let code = self
            .exec(
                cancel,
                command,
                ExecIo {
                    stdin: None,
                    stdout: Some(&mut stdout),
                    stderr: None,
                },
            )
            .await?;
        Ok((
            code,
            String::from_utf8_lossy(&stdout.into_inner()).into_owned(),
        ))
    }

    /// Closes the underlying connection.
    pub async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| Error::transport("ssh disconnect failed", e))
    }

    pub(crate) fn handle(&self) -> &Arc<client::Handle<AcceptAnyHostKey>> {
        &self.handle
    }
}
