//! UDP DNS forwarder paired with the TCP proxy. Guest queries are DNAT'ed
//! here, relayed verbatim to the configured upstream resolver, and the
//! answer is passed back untouched. Upstream trouble turns into SERVFAIL so
//! the guest resolver fails fast instead of timing out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use sbx_types::{Error, Result};

const MAX_PACKET: usize = 4096;
const UPSTREAM_DEADLINE: Duration = Duration::from_secs(5);

pub async fn run(listen: SocketAddr, upstream: SocketAddr) -> Result<()> {
    let sock = UdpSocket::bind(listen)
        .await
        .map_err(|e| Error::transport(format!("could not bind dns forwarder on {listen}"), e))?;
    let sock = Arc::new(sock);
    info!(%listen, %upstream, "dns forwarder listening");

    let mut buf = [0u8; MAX_PACKET];
    loop {
        let (n, client) = sock
            .recv_from(&mut buf)
            .await
            .map_err(|e| Error::transport("dns recv failed", e))?;
        let query = buf[..n].to_vec();
        let sock = sock.clone();
        tokio::spawn(async move {
            match relay(&query, upstream).await {
                Ok(answer) => {
                    let _ = sock.send_to(&answer, client).await;
                }
                Err(e) => {
                    warn!(%upstream, error = %e, "dns upstream failed, answering SERVFAIL");
                    if let Some(fail) = servfail(&query) {
                        let _ = sock.send_to(&fail, client).await;
                    }
                }
            }
        });
    }
}

async fn relay(query: &[u8], upstream: SocketAddr) -> std::io::Result<Vec<u8>> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.send_to(query, upstream).await?;
    let mut buf = [0u8; MAX_PACKET];
    let (n, _) = tokio::time::timeout(UPSTREAM_DEADLINE, sock.recv_from(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timeout"))??;
    debug!(bytes = n, "relayed dns answer");
    Ok(buf[..n].to_vec())
}

/// Builds a SERVFAIL response for a query: id and question echoed, QR and RA
/// set, rcode 2, all answer counts zeroed.
fn servfail(query: &[u8]) -> Option<Vec<u8>> {
    if query.len() < 12 {
        return None;
    }
    let mut response = query.to_vec();
    response[2] |= 0x80; // QR: this is a response
    response[3] = 0x82; // RA set, rcode SERVFAIL
    for b in &mut response[6..12] {
        *b = 0; // ancount, nscount, arcount
    }
    Some(response)
}
