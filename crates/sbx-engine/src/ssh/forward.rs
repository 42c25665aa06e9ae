//! Local port forwarding: one listener per mapping, one `direct-tcpip`
//! channel per accepted connection.

use std::fmt;
use std::str::FromStr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sbx_types::{Error, Result};

use super::SshClient;

/// `local_port` on `bind_address` (default localhost) tunnels to
/// `remote_port` on the guest's loopback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub bind_address: Option<String>,
    pub local_port: u16,
    pub remote_port: u16,
}

impl FromStr for PortMapping {
    type Err = Error;

    /// Accepts `"P"` (same port both sides) and `"L:R"`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::NotValid(format!("invalid port mapping {s:?}, expected P or L:R"));
        match s.split_once(':') {
            None => {
                let port: u16 = s.parse().map_err(|_| invalid())?;
                Ok(PortMapping {
                    bind_address: None,
                    local_port: port,
                    remote_port: port,
                })
            }
            Some((local, remote)) => Ok(PortMapping {
                bind_address: None,
                local_port: local.parse().map_err(|_| invalid())?,
                remote_port: remote.parse().map_err(|_| invalid())?,
            }),
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local_port == self.remote_port {
            write!(f, "{}", self.local_port)
        } else {
            write!(f, "{}:{}", self.local_port, self.remote_port)
        }
    }
}

pub fn parse_port_mapping(s: &str) -> Result<PortMapping> {
    s.parse()
}

impl SshClient {
    /// Serves all mappings until the token fires, then returns `Cancelled`.
    /// Accepted connections are tunneled concurrently; either side closing
    /// ends its tunnel.
    pub async fn forward(
        &self,
        cancel: &CancellationToken,
        mappings: &[PortMapping],
    ) -> Result<()> {
        if mappings.is_empty() {
            return Err(Error::NotValid("no port mappings given".into()));
        }

        let mut loops = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let bind = mapping.bind_address.clone().unwrap_or_else(|| "localhost".to_string());
            let listener = TcpListener::bind((bind.as_str(), mapping.local_port))
                .await
                .map_err(|e| {
                    Error::transport(
                        format!("could not listen on {bind}:{}", mapping.local_port),
                        e,
                    )
                })?;
            debug!(bind, local = mapping.local_port, remote = mapping.remote_port, "forwarding");
            loops.push(tokio::spawn(accept_loop(
                listener,
                self.handle().clone(),
                mapping.remote_port,
            )));
        }

        cancel.cancelled().await;
        for task in &loops {
            task.abort();
        }
        Err(Error::Cancelled)
    }
}

async fn accept_loop(
    listener: TcpListener,
    handle: std::sync::Arc<russh::client::Handle<super::AcceptAnyHostKey>>,
    remote_port: u16,
) {
    loop {
        let (mut socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "forward accept failed");
                continue;
            }
        };
        let handle = handle.clone();
        tokio::spawn(async move {
            let channel = match handle
                .channel_open_direct_tcpip(
                    "localhost",
                    remote_port as u32,
                    &peer.ip().to_string(),
                    peer.port() as u32,
                )
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(remote_port, error = %e, "could not open direct-tcpip channel");
                    return;
                }
            };
            let mut stream = channel.into_stream();
            // copy_bidirectional propagates each half-close, so EOF travels
            // end to end in both directions.
            if let Err(e) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
                debug!(error = %e, "forward tunnel closed with error");
            }
        });
    }
}
