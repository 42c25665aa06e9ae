//! Transparent TCP proxy. Connections arrive via the PREROUTING DNAT rules;
//! each one is classified from its first bytes, checked against the policy,
//! and on allow tunneled to the destination the guest originally dialed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use sbx_types::{EgressAction, Error, Result};

use super::classify::{classify, ClassifyResult};
use super::policy::PolicyMatcher;

const PEEK_WINDOW: usize = 1024;
const PEEK_DEADLINE: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept loop. Runs until the listener fails; each accepted connection gets
/// its own task.
pub async fn run(listen: SocketAddr, matcher: Arc<PolicyMatcher>) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| Error::transport(format!("could not listen on {listen}"), e))?;
    info!(%listen, "egress proxy listening");
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| Error::transport("proxy accept failed", e))?;
        let matcher = matcher.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, matcher).await {
                debug!(%peer, error = %e, "egress connection ended");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, matcher: Arc<PolicyMatcher>) -> Result<()> {
    // The pre-DNAT destination is the only record of where the guest was
    // actually going; without it the flow cannot be policied or tunneled.
    let original = original_destination(&stream)?;

    let mut peek = vec![0u8; PEEK_WINDOW];
    let n = match tokio::time::timeout(PEEK_DEADLINE, stream.read(&mut peek)).await {
        Err(_) => 0, // silent client; classify the empty prefix
        Ok(Err(e)) => return Err(Error::transport("could not read client prefix", e)),
        Ok(Ok(n)) => n,
    };
    peek.truncate(n);

    let result = classify(&peek);
    let action = decide(&result, *original.ip(), &matcher);
    match action {
        EgressAction::Deny => {
            info!(
                dst = %original,
                protocol = ?result.protocol,
                host = result.host.as_deref().unwrap_or("-"),
                "egress denied"
            );
            Ok(())
        }
        EgressAction::Allow => {
            debug!(
                dst = %original,
                protocol = ?result.protocol,
                host = result.host.as_deref().unwrap_or("-"),
                "egress allowed"
            );
            tunnel(stream, original, &peek).await
        }
    }
}

/// Flows with a classified hostname are judged by domain rules; everything
/// else (unknown protocol, hostless TLS/HTTP) falls back to CIDR rules
/// against the original destination address.
pub fn decide(result: &ClassifyResult, dst: Ipv4Addr, matcher: &PolicyMatcher) -> EgressAction {
    match &result.host {
        Some(host) => matcher.match_domain(host),
        None => matcher.match_ip(IpAddr::V4(dst)),
    }
}

async fn tunnel(mut client: TcpStream, original: SocketAddrV4, peek: &[u8]) -> Result<()> {
    let mut origin = match tokio::time::timeout(
        DIAL_TIMEOUT,
        TcpStream::connect(SocketAddr::V4(original)),
    )
    .await
    {
        Err(_) => return Err(Error::Timeout(format!("dialing {original}"))),
        Ok(Err(e)) => return Err(Error::transport(format!("could not dial {original}"), e)),
        Ok(Ok(stream)) => stream,
    };

    // The peeked bytes were consumed from the client socket; the origin must
    // see them before anything else.
    origin
        .write_all(peek)
        .await
        .map_err(|e| Error::transport("could not replay prefix", e))?;

    // copy_bidirectional shuts down each write side as its read side hits
    // EOF, which propagates half-closes between the peers.
    let _ = tokio::io::copy_bidirectional(&mut client, &mut origin).await;
    Ok(())
}

/// Reads the pre-DNAT destination off a redirected socket.
#[cfg(target_os = "linux")]
fn original_destination(stream: &TcpStream) -> Result<SocketAddrV4> {
    use nix::sys::socket::sockopt::OriginalDst;

    let addr = nix::sys::socket::getsockopt(stream, OriginalDst)
        .map_err(|e| Error::transport("could not read SO_ORIGINAL_DST", e))?;
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(not(target_os = "linux"))]
fn original_destination(_stream: &TcpStream) -> Result<SocketAddrV4> {
    Err(Error::transport_msg(
        "transparent egress interception is only supported on linux",
    ))
}
