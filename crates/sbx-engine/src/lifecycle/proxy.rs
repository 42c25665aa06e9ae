//! Egress proxy child process management. The proxy is a separate binary
//! that receives its policy as JSON argv; the filesystem (pid file, ports
//! file, log) is the only channel between it and the orchestrator.

use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use sbx_types::{EgressPolicy, Error, ProxyPorts, Result};
use tracing::info;

use crate::proc;

pub const PROXY_PID_FILE: &str = "proxy.pid";
pub const PROXY_LOG_FILE: &str = "proxy.log";
pub const PROXY_PORTS_FILE: &str = "proxy.json";

const PROXY_STOP_GRACE: Duration = Duration::from_secs(2);

/// Finds free TCP and UDP ports on the gateway address by probe-binding.
/// The listeners are dropped before the proxy starts, so the ports are
/// reserved only probabilistically; the proxy re-binds them immediately.
pub async fn allocate_ports(gateway: Ipv4Addr) -> Result<ProxyPorts> {
    let tcp = tokio::net::TcpListener::bind((gateway, 0))
        .await
        .map_err(|e| Error::transport(format!("could not probe tcp port on {gateway}"), e))?;
    let http_port = tcp
        .local_addr()
        .map_err(|e| Error::transport("could not read probed tcp port", e))?
        .port();
    let udp = tokio::net::UdpSocket::bind((gateway, 0))
        .await
        .map_err(|e| Error::transport(format!("could not probe udp port on {gateway}"), e))?;
    let dns_port = udp
        .local_addr()
        .map_err(|e| Error::transport("could not read probed udp port", e))?
        .port();
    Ok(ProxyPorts {
        http_port,
        // 80 and 443 both DNAT into the single protocol-aware TCP listener.
        tls_port: http_port,
        dns_port,
    })
}

/// Spawns the proxy in its own process group, logging to `proxy.log`, and
/// records `proxy.pid` and `proxy.json` in the VM directory.
pub async fn spawn_proxy(
    binary: &str,
    vm_dir: &Path,
    gateway: Ipv4Addr,
    ports: ProxyPorts,
    policy: &EgressPolicy,
    upstream_dns: &str,
) -> Result<u32> {
    let policy_json = serde_json::to_string(policy)
        .map_err(|e| Error::transport("could not encode egress policy", e))?;

    let log_path = vm_dir.join(PROXY_LOG_FILE);
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| Error::transport(format!("could not open {}", log_path.display()), e))?;
    let log_err = log
        .try_clone()
        .map_err(|e| Error::transport("could not clone log handle", e))?;

    let mut cmd = std::process::Command::new(binary);
    cmd.arg("--gateway")
        .arg(gateway.to_string())
        .arg("--http-port")
        .arg(ports.http_port.to_string())
        .arg("--dns-port")
        .arg(ports.dns_port.to_string())
        .arg("--upstream-dns")
        .arg(upstream_dns)
        .arg("--policy")
        .arg(&policy_json)
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err)
        .process_group(0);
    let child = cmd
        .spawn()
        .map_err(|e| Error::transport(format!("could not spawn {binary}"), e))?;
    let pid = child.id();
    drop(child);

    tokio::fs::write(vm_dir.join(PROXY_PID_FILE), pid.to_string())
        .await
        .map_err(|e| Error::transport("could not write proxy pid file", e))?;
    let ports_json = serde_json::to_vec(&ports)
        .map_err(|e| Error::transport("could not encode proxy ports", e))?;
    tokio::fs::write(vm_dir.join(PROXY_PORTS_FILE), ports_json)
        .await
        .map_err(|e| Error::transport("could not write proxy ports file", e))?;

    info!(pid, %gateway, http_port = ports.http_port, dns_port = ports.dns_port, "egress proxy spawned");
    Ok(pid)
}

/// Terminates the proxy recorded in `proxy.pid`, if any. Missing files and
/// dead pids are no-ops.
pub async fn kill_proxy(vm_dir: &Path) {
    let pid_file = vm_dir.join(PROXY_PID_FILE);
    if let Some(pid) = proc::read_pid_file(&pid_file).await {
        proc::terminate_pid(pid, PROXY_STOP_GRACE).await;
    }
    let _ = tokio::fs::remove_file(&pid_file).await;
}

/// Reads the ports the running proxy bound, if it is recorded.
pub async fn read_ports(vm_dir: &Path) -> Option<ProxyPorts> {
    let bytes = tokio::fs::read(vm_dir.join(PROXY_PORTS_FILE)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocated_ports_share_the_tcp_listener_for_http_and_tls() {
        let ports = allocate_ports(Ipv4Addr::LOCALHOST).await.unwrap();
        assert_ne!(ports.http_port, 0);
        assert_ne!(ports.dns_port, 0);
        assert_eq!(ports.http_port, ports.tls_port);
    }

    #[tokio::test]
    async fn ports_file_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let ports = ProxyPorts {
            http_port: 4080,
            tls_port: 4080,
            dns_port: 4053,
        };
        tokio::fs::write(
            tmp.path().join(PROXY_PORTS_FILE),
            serde_json::to_vec(&ports).unwrap(),
        )
        .await
        .unwrap();

        let read = read_ports(tmp.path()).await.unwrap();
        assert_eq!(read.http_port, 4080);
        assert_eq!(read.dns_port, 4053);
    }

    #[tokio::test]
    async fn killing_without_a_pid_file_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        kill_proxy(tmp.path()).await;
    }
}
