//! The Firecracker engine: everything between "a validated sandbox record"
//! and "a booted, reachable guest". Create runs as a strict step sequence
//! with LIFO best-effort compensations; stop and remove tolerate whatever
//! state a previous run left behind.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sbx_types::{Error, Result, Sandbox};

use crate::config::EngineConfig;
use crate::firecracker::{self, Hypervisor};
use crate::keys::SandboxKeys;
use crate::lifecycle::alloc::{allocate_network, NetworkAllocation};
use crate::net;
use crate::proc;
use crate::rootfs;
use crate::ssh::{DialOptions, SshClient};

const HYPERVISOR_STOP_GRACE: Duration = Duration::from_secs(5);
const SSH_WAIT: Duration = Duration::from_secs(60);
const SSH_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
const SSH_RETRY_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub allocation: NetworkAllocation,
    pub running: bool,
    pub pid: Option<u32>,
}

/// Capability boundary between the orchestrator and the hypervisor machinery.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Full first boot: rootfs prep, network fabric, hypervisor, guest
    /// filesystem expansion. Returns the hypervisor pid.
    async fn create(
        &self,
        sandbox: &Sandbox,
        keys: &SandboxKeys,
        cancel: &CancellationToken,
    ) -> Result<u32>;

    /// Boots an already-created sandbox, recreating host network state if it
    /// went missing. The rootfs is preserved.
    async fn start(
        &self,
        sandbox: &Sandbox,
        keys: &SandboxKeys,
        cancel: &CancellationToken,
    ) -> Result<u32>;

    /// Orderly shutdown: in-guest poweroff (best effort), then SIGTERM and
    /// finally SIGKILL for the hypervisor. Missing pid files are no-ops.
    async fn stop(
        &self,
        sandbox: &Sandbox,
        keys: Option<&SandboxKeys>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Tears down all host state for the sandbox. Only the VM directory
    /// removal itself is fatal.
    async fn remove(&self, sandbox_id: &str) -> Result<()>;

    /// Process liveness plus the deterministic allocation. `NotFound` when
    /// the VM directory does not exist.
    async fn status(&self, sandbox_id: &str) -> Result<EngineStatus>;
}

pub struct FirecrackerEngine {
    config: EngineConfig,
    hypervisor: Hypervisor,
}

impl FirecrackerEngine {
    pub fn new(config: EngineConfig) -> Self {
        let hypervisor = Hypervisor::new(config.firecracker_bin.clone());
        Self { config, hypervisor }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn socket_path(&self, sandbox_id: &str) -> PathBuf {
        self.config.vm_dir(sandbox_id).join(firecracker::SOCKET_FILE)
    }

    async fn boot_sequence(
        &self,
        sandbox: &Sandbox,
        alloc: &NetworkAllocation,
        keys: &SandboxKeys,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let vm_dir = self.config.vm_dir(&sandbox.id);
        let socket = self.socket_path(&sandbox.id);
        let pid = self.hypervisor.spawn(&vm_dir, &socket, cancel).await?;

        let result = async {
            self.hypervisor
                .configure(
                    cancel,
                    &socket,
                    std::path::Path::new(&sandbox.config.firecracker_engine.kernel_path),
                    &vm_dir,
                    &alloc.mac,
                    &alloc.tap,
                    alloc.vm_ip,
                    alloc.gateway,
                    &sandbox.config.resources,
                )
                .await?;
            self.hypervisor.boot(cancel, &socket).await?;
            self.expand_filesystem(alloc, keys, cancel).await
        }
        .await;

        match result {
            Ok(()) => Ok(pid),
            Err(e) => {
                proc::kill_pid(pid, nix::sys::signal::Signal::SIGKILL);
                Err(e)
            }
        }
    }

    /// Grows the guest filesystem onto the resized block device once sshd
    /// answers.
    async fn expand_filesystem(
        &self,
        alloc: &NetworkAllocation,
        keys: &SandboxKeys,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let client = self.wait_for_ssh(alloc, keys, cancel).await?;
        let (code, output) = client.exec_capture(cancel, "resize2fs /dev/vda").await?;
        let _ = client.close().await;
        if code != 0 {
            return Err(Error::transport_msg(format!(
                "resize2fs exited {code}: {}",
                output.trim()
            )));
        }
        Ok(())
    }

    /// Polls the guest's sshd until it accepts our key. The guest has just
    /// been told to boot; the first seconds of refused connections are
    /// expected.
    async fn wait_for_ssh(
        &self,
        alloc: &NetworkAllocation,
        keys: &SandboxKeys,
        cancel: &CancellationToken,
    ) -> Result<SshClient> {
        let mut opts = DialOptions::new(
            alloc.vm_ip.to_string(),
            self.config.ssh_user.clone(),
            keys.private_pem.clone(),
        );
        opts.connect_timeout = SSH_ATTEMPT_TIMEOUT;

        let deadline = tokio::time::Instant::now() + SSH_WAIT;
        loop {
            match SshClient::dial(cancel, &opts).await {
                Ok(client) => return Ok(client),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::Timeout(format!(
                            "guest ssh at {} never came up: {e}",
                            alloc.vm_ip
                        )));
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(SSH_RETRY_PAUSE) => {}
            }
        }
    }

}

#[async_trait]
impl Engine for FirecrackerEngine {
    async fn create(
        &self,
        sandbox: &Sandbox,
        keys: &SandboxKeys,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let alloc = allocate_network(&sandbox.id);
        let vm_dir = self.config.vm_dir(&sandbox.id);
        tokio::fs::create_dir_all(&vm_dir)
            .await
            .map_err(|e| Error::transport(format!("could not create {}", vm_dir.display()), e))?;

        let mut rollback = CreateRollback::new(vm_dir.clone(), alloc.tap.clone());
        match self
            .try_create(sandbox, &alloc, keys, cancel, &mut rollback)
            .await
        {
            Ok(pid) => {
                info!(sandbox_id = %sandbox.id, pid, tap = %alloc.tap, "sandbox created");
                Ok(pid)
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox.id, error = %e, "create failed, rolling back");
                rollback.run().await;
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        sandbox: &Sandbox,
        keys: &SandboxKeys,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let alloc = allocate_network(&sandbox.id);
        let vm_dir = self.config.vm_dir(&sandbox.id);
        if tokio::fs::metadata(&vm_dir).await.is_err() {
            return Err(Error::NotFound(format!(
                "sandbox {} has no VM directory",
                sandbox.id
            )));
        }

        // Host network state may have been cleared by a reboot; recreate it.
        net::ensure_tap(&alloc.tap, &alloc.gateway.to_string()).await?;
        net::install_nat(&net::NatSpec {
            tap: alloc.tap.clone(),
            gateway: alloc.gateway,
            vm_ip: alloc.vm_ip,
        })
        .await?;

        let pid = self.boot_sequence(sandbox, &alloc, keys, cancel).await?;
        info!(sandbox_id = %sandbox.id, pid, "sandbox started");
        Ok(pid)
    }

    async fn stop(
        &self,
        sandbox: &Sandbox,
        keys: Option<&SandboxKeys>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let alloc = allocate_network(&sandbox.id);
        // Give the guest a chance at a clean shutdown; a dead or hung guest
        // is handled by the signals below.
        if let Some(keys) = keys {
            let mut opts = DialOptions::new(
                alloc.vm_ip.to_string(),
                self.config.ssh_user.clone(),
                keys.private_pem.clone(),
            );
            opts.connect_timeout = Duration::from_secs(3);
            if let Ok(client) = SshClient::dial(cancel, &opts).await {
                let _ = client.exec_capture(cancel, "poweroff").await;
                let _ = client.close().await;
            }
        }

        let vm_dir = self.config.vm_dir(&sandbox.id);
        crate::lifecycle::proxy::kill_proxy(&vm_dir).await;

        let pid_file = vm_dir.join(firecracker::PID_FILE);
        if let Some(pid) = proc::read_pid_file(&pid_file).await {
            proc::terminate_pid(pid, HYPERVISOR_STOP_GRACE).await;
        }
        info!(sandbox_id = %sandbox.id, "sandbox stopped");
        Ok(())
    }

    async fn remove(&self, sandbox_id: &str) -> Result<()> {
        let alloc = allocate_network(sandbox_id);
        let vm_dir = self.config.vm_dir(sandbox_id);

        crate::lifecycle::proxy::kill_proxy(&vm_dir).await;
        if let Some(pid) = proc::read_pid_file(&vm_dir.join(firecracker::PID_FILE)).await {
            proc::kill_pid(pid, nix::sys::signal::Signal::SIGKILL);
        }
        if let Err(e) = net::cleanup_proxy_redirect(&alloc.tap).await {
            warn!(tap = %alloc.tap, error = %e, "proxy redirect cleanup failed");
        }
        if let Err(e) = net::cleanup_nat(&alloc.tap).await {
            warn!(tap = %alloc.tap, error = %e, "nat cleanup failed");
        }
        if let Err(e) = net::delete_tap(&alloc.tap).await {
            warn!(tap = %alloc.tap, error = %e, "tap deletion failed");
        }

        match tokio::fs::remove_dir_all(&vm_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::transport(
                    format!("could not remove {}", vm_dir.display()),
                    e,
                ))
            }
        }
        info!(sandbox_id, "sandbox removed");
        Ok(())
    }

    async fn status(&self, sandbox_id: &str) -> Result<EngineStatus> {
        let vm_dir = self.config.vm_dir(sandbox_id);
        if tokio::fs::metadata(&vm_dir).await.is_err() {
            return Err(Error::NotFound(format!(
                "sandbox {sandbox_id} has no VM directory"
            )));
        }
        let allocation = allocate_network(sandbox_id);
        let pid = proc::read_pid_file(&vm_dir.join(firecracker::PID_FILE)).await;
        let running = pid.map(proc::pid_alive).unwrap_or(false);
        Ok(EngineStatus {
            allocation,
            running,
            pid,
        })
    }
}

impl FirecrackerEngine {
    async fn try_create(
        &self,
        sandbox: &Sandbox,
        alloc: &NetworkAllocation,
        keys: &SandboxKeys,
        cancel: &CancellationToken,
        rollback: &mut CreateRollback,
    ) -> Result<u32> {
        let vm_dir = self.config.vm_dir(&sandbox.id);
        let engine_cfg = &sandbox.config.firecracker_engine;
        let base_rootfs = std::path::Path::new(&engine_cfg.rootfs_path);

        rootfs::copy_rootfs(base_rootfs, &vm_dir, cancel).await?;
        rootfs::resize_rootfs(&vm_dir, sandbox.config.resources.disk_gib, base_rootfs).await?;
        rootfs::patch_rootfs_ssh(&vm_dir, &keys.public_openssh).await?;
        rootfs::patch_rootfs_dns(&vm_dir, &self.config.nameservers).await?;

        net::ensure_tap(&alloc.tap, &alloc.gateway.to_string()).await?;
        rollback.tap_created = true;
        net::install_nat(&net::NatSpec {
            tap: alloc.tap.clone(),
            gateway: alloc.gateway,
            vm_ip: alloc.vm_ip,
        })
        .await?;
        rollback.nat_installed = true;

        // boot_sequence kills its own child on failure, so the rollback only
        // records the pid of a fully booted hypervisor.
        let pid = self.boot_sequence(sandbox, alloc, keys, cancel).await?;
        rollback.hypervisor_pid = Some(pid);
        Ok(pid)
    }
}

/// Compensation state for a failed create, unwound newest-first. Cleaners
/// log and keep going; they never mask the original error.
struct CreateRollback {
    vm_dir: PathBuf,
    tap: String,
    tap_created: bool,
    nat_installed: bool,
    hypervisor_pid: Option<u32>,
}

impl CreateRollback {
    fn new(vm_dir: PathBuf, tap: String) -> Self {
        Self {
            vm_dir,
            tap,
            tap_created: false,
            nat_installed: false,
            hypervisor_pid: None,
        }
    }

    async fn run(self) {
        if let Some(pid) = self.hypervisor_pid {
            proc::kill_pid(pid, nix::sys::signal::Signal::SIGKILL);
        }
        if self.nat_installed {
            if let Err(e) = net::cleanup_nat(&self.tap).await {
                warn!(tap = %self.tap, error = %e, "rollback: nat cleanup failed");
            }
        }
        if self.tap_created {
            if let Err(e) = net::delete_tap(&self.tap).await {
                warn!(tap = %self.tap, error = %e, "rollback: tap deletion failed");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.vm_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(vm_dir = %self.vm_dir.display(), error = %e, "rollback: vm dir removal failed");
            }
        }
    }
}
