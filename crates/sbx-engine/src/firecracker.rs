//! Firecracker adapter: spawn the hypervisor, wait for its control socket,
//! and drive the HTTP-over-Unix configuration sequence.

use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use hyperlocal::UnixConnector;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sbx_types::{Error, Resources, Result};

pub const SOCKET_FILE: &str = "firecracker.sock";
pub const PID_FILE: &str = "firecracker.pid";
pub const LOG_FILE: &str = "firecracker.log";

const SOCKET_WAIT: Duration = Duration::from_secs(10);
const SOCKET_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Hypervisor {
    binary: String,
}

impl Hypervisor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Launches the hypervisor against a fresh control socket, logging to
    /// `firecracker.log` and recording the pid. The child runs in its own
    /// process group so it survives the calling process; it is only ever
    /// stopped through Stop/Remove. Fails if the socket never becomes
    /// connectable.
    pub async fn spawn(
        &self,
        vm_dir: &Path,
        socket_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let _ = tokio::fs::remove_file(socket_path).await;

        let log_path = vm_dir.join(LOG_FILE);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| Error::transport(format!("could not open {}", log_path.display()), e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| Error::transport("could not clone log handle", e))?;

        let mut cmd = std::process::Command::new(&self.binary);
        cmd.arg("--api-sock")
            .arg(socket_path)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0);
        let child = cmd
            .spawn()
            .map_err(|e| Error::transport(format!("could not spawn {}", self.binary), e))?;
        let pid = child.id();
        drop(child);

        tokio::fs::write(vm_dir.join(PID_FILE), pid.to_string())
            .await
            .map_err(|e| Error::transport("could not write pid file", e))?;

        let deadline = Instant::now() + SOCKET_WAIT;
        loop {
            if cancel.is_cancelled() {
                kill_pid(pid);
                return Err(Error::Cancelled);
            }
            if tokio::net::UnixStream::connect(socket_path).await.is_ok() {
                info!(pid, socket = %socket_path.display(), "hypervisor control socket up");
                return Ok(pid);
            }
            if Instant::now() >= deadline {
                warn!(pid, "hypervisor socket never came up, killing child");
                kill_pid(pid);
                return Err(Error::Timeout(format!(
                    "hypervisor control socket {} not reachable within {:?}",
                    socket_path.display(),
                    SOCKET_WAIT
                )));
            }
            tokio::time::sleep(SOCKET_POLL).await;
        }
    }

    /// Drives the boot-source → drive → machine-config → network PUT
    /// sequence. Every call must come back 2xx before the next is issued.
    #[allow(clippy::too_many_arguments)]
    pub async fn configure(
        &self,
        cancel: &CancellationToken,
        socket_path: &Path,
        kernel_path: &Path,
        vm_dir: &Path,
        mac: &str,
        tap: &str,
        vm_ip: Ipv4Addr,
        gateway: Ipv4Addr,
        resources: &Resources,
    ) -> Result<()> {
        let rootfs = vm_dir.join(crate::rootfs::ROOTFS_FILE);
        let steps: [(&str, serde_json::Value); 4] = [
            (
                "/boot-source",
                json!({
                    "kernel_image_path": kernel_path.to_string_lossy(),
                    "boot_args": boot_args(vm_ip, gateway),
                }),
            ),
            (
                "/drives/rootfs",
                json!({
                    "drive_id": "rootfs",
                    "path_on_host": rootfs.to_string_lossy(),
                    "is_root_device": true,
                    "is_read_only": false,
                }),
            ),
            (
                "/machine-config",
                json!({
                    "vcpu_count": vcpu_count(resources.vcpus),
                    "mem_size_mib": resources.memory_mib,
                }),
            ),
            (
                "/network-interfaces/eth0",
                json!({
                    "iface_id": "eth0",
                    "guest_mac": mac,
                    "host_dev_name": tap,
                }),
            ),
        ];
        for (path, body) in steps {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            put(socket_path, path, &body).await?;
        }
        Ok(())
    }

    /// Starts the configured instance.
    pub async fn boot(&self, cancel: &CancellationToken, socket_path: &Path) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        put(socket_path, "/actions", &json!({"action_type": "InstanceStart"})).await
    }
}

/// Guest kernel command line. The `ip=` clause is consumed by the in-guest
/// init to bring up eth0 statically.
pub fn boot_args(vm_ip: Ipv4Addr, gateway: Ipv4Addr) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off init=/usr/sbin/sbx-init \
         ip={vm_ip}::{gateway}:255.255.255.0::eth0:off"
    )
}

fn vcpu_count(vcpus: f64) -> u32 {
    (vcpus.round() as u32).max(1)
}

fn kill_pid(pid: u32) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    );
}

/// One PUT to the hypervisor API over the Unix socket. Non-2xx responses
/// surface the API body so misconfigurations are diagnosable.
async fn put(socket_path: &Path, path: &str, body: &serde_json::Value) -> Result<()> {
    let client: Client<UnixConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(UnixConnector);
    let uri = hyperlocal::Uri::new(socket_path, path);
    let payload =
        serde_json::to_vec(body).map_err(|e| Error::transport("could not encode API body", e))?;
    let req = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(payload)))
        .map_err(|e| Error::transport("could not build API request", e))?;

    let res = client
        .request(req)
        .await
        .map_err(|e| Error::transport(format!("PUT {path} failed"), e))?;
    let status = res.status();
    if !status.is_success() {
        let body = res
            .into_body()
            .collect()
            .await
            .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
            .unwrap_or_default();
        return Err(Error::transport_msg(format!(
            "PUT {path} returned {status}: {}",
            body.trim()
        )));
    }
    Ok(())
}
