//! Per-sandbox egress proxy process. Spawned by the orchestrator with the
//! policy as JSON on the command line; guest HTTP/HTTPS lands on the TCP
//! proxy and guest DNS on the UDP forwarder via the host's DNAT rules.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use sbx_engine::egress::{dns, proxy, PolicyMatcher};
use sbx_types::EgressPolicy;

#[derive(Parser, Debug)]
#[command(name = "sbx-egress-proxy", about = "Transparent egress proxy for one sandbox")]
struct Args {
    /// Gateway address of the sandbox TAP; both listeners bind here.
    #[arg(long)]
    gateway: Ipv4Addr,

    /// TCP port receiving DNAT'ed guest HTTP and HTTPS flows.
    #[arg(long)]
    http_port: u16,

    /// UDP port receiving DNAT'ed guest DNS queries.
    #[arg(long)]
    dns_port: u16,

    /// Egress policy as JSON: {"default":"allow|deny","rules":[...]}.
    #[arg(long)]
    policy: String,

    /// Resolver the DNS forwarder relays to.
    #[arg(long, default_value = "8.8.8.8:53")]
    upstream_dns: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let policy: EgressPolicy =
        serde_json::from_str(&args.policy).context("could not parse --policy JSON")?;
    let matcher = Arc::new(PolicyMatcher::compile(&policy).context("invalid egress policy")?);
    info!(
        gateway = %args.gateway,
        http_port = args.http_port,
        dns_port = args.dns_port,
        rules = policy.rules.len(),
        "egress proxy starting"
    );

    let tcp_listen = SocketAddr::from((args.gateway, args.http_port));
    let dns_listen = SocketAddr::from((args.gateway, args.dns_port));

    // Either listener failing is fatal; the orchestrator restarts the whole
    // process on the next sandbox start.
    tokio::select! {
        result = proxy::run(tcp_listen, matcher) => {
            result.context("tcp proxy exited")?;
        }
        result = dns::run(dns_listen, args.upstream_dns) => {
            result.context("dns forwarder exited")?;
        }
    }
    Ok(())
}
