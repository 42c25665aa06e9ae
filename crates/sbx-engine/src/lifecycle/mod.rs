//! Sandbox lifecycle orchestration. `Sandboxes` validates requests, keeps
//! the repository in step with the host, and drives the engine through
//! create/start/stop/remove. It is the single writer of sandbox records.

pub mod alloc;
pub mod command;
pub mod proxy;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sbx_types::{
    looks_like_ulid, new_id, validate_snapshot_name, Error, Result, Sandbox, SandboxConfig,
    SandboxStatus, SessionConfig, Snapshot,
};

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineStatus, FirecrackerEngine};
use crate::keys::{KeyStore, SandboxKeys};
use crate::net;
use crate::repo::Repository;
use crate::snapshot;
use crate::ssh::{DialOptions, ExecIo, PortMapping, SshClient};

use alloc::{allocate_network, NetworkAllocation};
use command::{build_remote_command, shell_quote};

/// The wait between proxy spawn and DNAT install. Redirecting traffic before
/// the proxy is accepting would black-hole the first guest connections.
const PROXY_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub tty: bool,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub sandbox: Sandbox,
    pub state: SandboxStatus,
    pub pid: Option<u32>,
    pub allocation: NetworkAllocation,
}

pub struct Sandboxes {
    config: EngineConfig,
    repo: Arc<dyn Repository>,
    engine: Arc<dyn Engine>,
    keys: KeyStore,
}

impl Sandboxes {
    pub fn new(config: EngineConfig, repo: Arc<dyn Repository>, engine: Arc<dyn Engine>) -> Self {
        let keys = KeyStore::new(config.data_dir.clone());
        Self {
            config,
            repo,
            engine,
            keys,
        }
    }

    /// Convenience constructor wiring in the Firecracker engine.
    pub fn firecracker(config: EngineConfig, repo: Arc<dyn Repository>) -> Self {
        let engine = Arc::new(FirecrackerEngine::new(config.clone()));
        Self::new(config, repo, engine)
    }

    /// Creates and boots a new sandbox. The record is published as `pending`
    /// before any host side effect and flips to `running` or `failed` with
    /// the outcome.
    pub async fn create(
        &self,
        config: SandboxConfig,
        cancel: &CancellationToken,
    ) -> Result<Sandbox> {
        if config.name.is_empty() {
            return Err(Error::NotValid("sandbox name is required".into()));
        }
        config.resources.validate()?;
        if self.repo.find_sandbox_by_name(&config.name).await.is_ok() {
            return Err(Error::AlreadyExists(format!(
                "sandbox named {:?}",
                config.name
            )));
        }

        let id = new_id();
        let allocation = allocate_network(&id);
        let mut sandbox = Sandbox {
            id: id.clone(),
            name: config.name.clone(),
            status: SandboxStatus::Pending,
            config,
            created_at: chrono::Utc::now(),
            started_at: None,
            stopped_at: None,
            pid: None,
            control_socket_path: self
                .config
                .vm_dir(&id)
                .join(crate::firecracker::SOCKET_FILE)
                .to_string_lossy()
                .into_owned(),
            tap_name: allocation.tap.clone(),
            guest_ip: allocation.vm_ip.to_string(),
        };
        self.repo.create_sandbox(sandbox.clone()).await?;

        let outcome = async {
            let keys = self.keys.ensure_keys(&id).await?;
            self.engine.create(&sandbox, &keys, cancel).await
        }
        .await;

        match outcome {
            Ok(pid) => {
                sandbox.status = SandboxStatus::Running;
                sandbox.pid = Some(pid);
                sandbox.started_at = Some(chrono::Utc::now());
                self.repo.update_sandbox(sandbox.clone()).await?;
                Ok(sandbox)
            }
            Err(e) => {
                sandbox.status = SandboxStatus::Failed;
                if let Err(update_err) = self.repo.update_sandbox(sandbox).await {
                    warn!(sandbox_id = %id, error = %update_err, "could not record failed status");
                }
                Err(e)
            }
        }
    }

    /// Boots a previously created sandbox with per-session settings: env
    /// written into the guest, and optionally an egress policy enforced by
    /// the proxy.
    pub async fn start(
        &self,
        name_or_id: &str,
        session: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Sandbox> {
        let mut sandbox = self.lookup(name_or_id).await?;
        if let Ok(status) = self.engine.status(&sandbox.id).await {
            if status.running {
                return Err(Error::NotValid(format!(
                    "sandbox {:?} is already running",
                    sandbox.name
                )));
            }
        }

        let keys = self.keys.ensure_keys(&sandbox.id).await?;
        let pid = self.engine.start(&sandbox, &keys, cancel).await?;

        let session_result = self
            .configure_session(&sandbox, &keys, session, cancel)
            .await;
        if let Err(e) = session_result {
            warn!(sandbox_id = %sandbox.id, error = %e, "session setup failed, stopping sandbox");
            let vm_dir = self.config.vm_dir(&sandbox.id);
            proxy::kill_proxy(&vm_dir).await;
            let alloc = allocate_network(&sandbox.id);
            if let Err(cleanup_err) = net::cleanup_proxy_redirect(&alloc.tap).await {
                warn!(error = %cleanup_err, "proxy redirect cleanup failed");
            }
            if let Err(stop_err) = self.engine.stop(&sandbox, Some(&keys), cancel).await {
                warn!(error = %stop_err, "hypervisor stop after failed start failed");
            }
            return Err(e);
        }

        sandbox.status = SandboxStatus::Running;
        sandbox.pid = Some(pid);
        sandbox.started_at = Some(chrono::Utc::now());
        sandbox.stopped_at = None;
        self.repo.update_sandbox(sandbox.clone()).await?;
        Ok(sandbox)
    }

    async fn configure_session(
        &self,
        sandbox: &Sandbox,
        keys: &SandboxKeys,
        session: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let alloc = allocate_network(&sandbox.id);

        if !session.env.is_empty() {
            self.write_session_env(&alloc, keys, &session.env, cancel)
                .await?;
        }

        let Some(policy) = &session.egress else {
            return Ok(());
        };
        // Validate the policy before spawning anything with it.
        crate::egress::PolicyMatcher::compile(policy)?;

        // Guest DNS must flow through the forwarder so domain policies see
        // every lookup.
        self.exec_in_guest(
            &alloc,
            keys,
            &format!(
                "printf 'nameserver %s\\n' {} > /etc/resolv.conf",
                shell_quote(&alloc.gateway.to_string())
            ),
            cancel,
        )
        .await?;

        let vm_dir = self.config.vm_dir(&sandbox.id);
        let ports = proxy::allocate_ports(alloc.gateway).await?;
        proxy::spawn_proxy(
            &self.config.egress_proxy_bin,
            &vm_dir,
            alloc.gateway,
            ports,
            policy,
            &self.config.upstream_dns,
        )
        .await?;

        tokio::time::sleep(PROXY_SETTLE).await;

        net::install_proxy_redirect(&net::RedirectSpec {
            tap: alloc.tap.clone(),
            gateway: alloc.gateway,
            vm_ip: alloc.vm_ip,
            http_port: ports.http_port,
            dns_port: ports.dns_port,
        })
        .await
    }

    async fn write_session_env(
        &self,
        alloc: &NetworkAllocation,
        keys: &SandboxKeys,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut content = String::new();
        for (key, value) in env {
            content.push_str("export ");
            content.push_str(key);
            content.push('=');
            content.push_str(&shell_quote(value));
            content.push('\n');
        }

        let client = self.dial(alloc, keys, cancel).await?;
        let code = client
            .exec(
                cancel,
                "mkdir -p /etc/sbx && cat > /etc/sbx/session-env.sh",
                ExecIo {
                    stdin: Some(Box::new(std::io::Cursor::new(content.into_bytes()))),
                    stdout: None,
                    stderr: None,
                },
            )
            .await?;
        let _ = client.close().await;
        if code != 0 {
            return Err(Error::transport_msg(format!(
                "writing session env exited {code}"
            )));
        }
        Ok(())
    }

    /// Graceful shutdown. Succeeds even when the guest, proxy, or hypervisor
    /// are already gone.
    pub async fn stop(&self, name_or_id: &str, cancel: &CancellationToken) -> Result<Sandbox> {
        let mut sandbox = self.lookup(name_or_id).await?;
        let keys = match self.keys.keys_exist(&sandbox.id).await {
            true => Some(self.keys.ensure_keys(&sandbox.id).await?),
            false => None,
        };
        self.engine.stop(&sandbox, keys.as_ref(), cancel).await?;

        sandbox.status = SandboxStatus::Stopped;
        sandbox.stopped_at = Some(chrono::Utc::now());
        sandbox.pid = None;
        self.repo.update_sandbox(sandbox.clone()).await?;
        Ok(sandbox)
    }

    /// Tears the sandbox down and deletes its record. Snapshot artifacts are
    /// never touched; they outlive their source sandbox.
    pub async fn remove(&self, name_or_id: &str) -> Result<()> {
        let sandbox = self.lookup(name_or_id).await?;
        self.engine.remove(&sandbox.id).await?;
        self.repo.delete_sandbox(&sandbox.id).await?;
        info!(sandbox_id = %sandbox.id, name = %sandbox.name, "sandbox removed");
        Ok(())
    }

    /// Live process state plus the deterministic allocation for correlation.
    pub async fn status(&self, name_or_id: &str) -> Result<StatusReport> {
        let sandbox = self.lookup(name_or_id).await?;
        let EngineStatus {
            allocation,
            running,
            pid,
        } = self.engine.status(&sandbox.id).await?;
        Ok(StatusReport {
            state: if running {
                SandboxStatus::Running
            } else {
                SandboxStatus::Stopped
            },
            pid,
            allocation,
            sandbox,
        })
    }

    /// Runs a command in the guest. TTY sessions delegate to the external
    /// `ssh` binary, which owns raw mode and window-size handling; plain
    /// exec stays on the library transport.
    pub async fn exec(
        &self,
        name_or_id: &str,
        request: &ExecRequest,
        io: ExecIo<'_>,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        if request.argv.is_empty() {
            return Err(Error::NotValid("exec argv is empty".into()));
        }
        let sandbox = self.lookup(name_or_id).await?;
        let alloc = allocate_network(&sandbox.id);
        let command = build_remote_command(
            &request.argv,
            &request.env,
            request.working_dir.as_deref(),
        );

        if request.tty {
            return self.exec_tty(&sandbox, &alloc, &command).await;
        }

        let keys = self.keys.ensure_keys(&sandbox.id).await?;
        let client = self.dial(&alloc, &keys, cancel).await?;
        let code = client.exec(cancel, &command, io).await;
        let _ = client.close().await;
        code
    }

    async fn exec_tty(
        &self,
        sandbox: &Sandbox,
        alloc: &NetworkAllocation,
        command: &str,
    ) -> Result<u32> {
        let key_path = self
            .config
            .vm_dir(&sandbox.id)
            .join(crate::keys::PRIVATE_KEY_FILE);
        let status = tokio::process::Command::new("ssh")
            .arg("-tt")
            .arg("-i")
            .arg(&key_path)
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg(format!("{}@{}", self.config.ssh_user, alloc.vm_ip))
            .arg(command)
            .status()
            .await
            .map_err(|e| Error::transport("could not run ssh binary", e))?;
        Ok(status.code().unwrap_or(1) as u32)
    }

    /// Copies a local path into the guest.
    pub async fn copy_to(
        &self,
        name_or_id: &str,
        src: &std::path::Path,
        dst: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (client, _) = self.connect(name_or_id, cancel).await?;
        let result = client.copy_to(cancel, src, dst).await;
        let _ = client.close().await;
        result
    }

    /// Copies a guest path onto the local filesystem.
    pub async fn copy_from(
        &self,
        name_or_id: &str,
        src: &str,
        dst: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (client, _) = self.connect(name_or_id, cancel).await?;
        let result = client.copy_from(cancel, src, dst).await;
        let _ = client.close().await;
        result
    }

    /// Serves local port forwards into the guest until cancelled.
    pub async fn forward(
        &self,
        name_or_id: &str,
        mappings: &[PortMapping],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (client, _) = self.connect(name_or_id, cancel).await?;
        let result = client.forward(cancel, mappings).await;
        let _ = client.close().await;
        result
    }

    /// Snapshots the sandbox rootfs into the snapshot store.
    pub async fn snapshot(
        &self,
        name_or_id: &str,
        snapshot_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        validate_snapshot_name(snapshot_name)?;
        let sandbox = self.lookup(name_or_id).await?;
        if self.repo.find_snapshot_by_name(snapshot_name).await.is_ok() {
            return Err(Error::AlreadyExists(format!(
                "snapshot named {snapshot_name:?}"
            )));
        }

        let id = new_id();
        let path = self.config.snapshots_dir().join(format!("{id}.ext4"));
        let stats = snapshot::create_snapshot(
            cancel,
            &self.config.data_dir,
            &sandbox.id,
            &id,
            &path,
        )
        .await?;

        let record = Snapshot {
            id,
            name: snapshot_name.to_string(),
            path: path.to_string_lossy().into_owned(),
            source_sandbox_id: sandbox.id.clone(),
            source_sandbox_name: sandbox.name.clone(),
            virtual_size_bytes: stats.virtual_size,
            allocated_size_bytes: stats.allocated_size,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.repo.create_snapshot(record.clone()).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        Ok(record)
    }

    /// Fetches the stored record by name or id.
    pub async fn get(&self, name_or_id: &str) -> Result<Sandbox> {
        self.lookup(name_or_id).await
    }

    pub async fn list(&self) -> Result<Vec<Sandbox>> {
        self.repo.list_sandboxes().await
    }

    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.repo.list_snapshots().await
    }

    /// Deletes a snapshot record and its on-disk artifact.
    pub async fn delete_snapshot(&self, name_or_id: &str) -> Result<()> {
        let snapshot = match self.repo.find_snapshot_by_name(name_or_id).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_not_found() && looks_like_ulid(name_or_id) => {
                self.repo.get_snapshot(name_or_id).await?
            }
            Err(e) => return Err(e),
        };
        match tokio::fs::remove_file(&snapshot.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::transport(format!("could not remove {}", snapshot.path), e)),
        }
        self.repo.delete_snapshot(&snapshot.id).await
    }

    /// Host preflight checks for this engine configuration.
    pub async fn doctor(&self) -> Vec<sbx_types::CheckResult> {
        crate::doctor::run_checks(&self.config).await
    }

    /// Resolves "try by name, then by id". Only strings shaped like ULIDs
    /// are ever treated as ids.
    async fn lookup(&self, name_or_id: &str) -> Result<Sandbox> {
        match self.repo.find_sandbox_by_name(name_or_id).await {
            Ok(sandbox) => Ok(sandbox),
            Err(e) if e.is_not_found() && looks_like_ulid(name_or_id) => {
                self.repo.get_sandbox(name_or_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn connect(
        &self,
        name_or_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(SshClient, Sandbox)> {
        let sandbox = self.lookup(name_or_id).await?;
        let alloc = allocate_network(&sandbox.id);
        let keys = self.keys.ensure_keys(&sandbox.id).await?;
        let client = self.dial(&alloc, &keys, cancel).await?;
        Ok((client, sandbox))
    }

    async fn dial(
        &self,
        alloc: &NetworkAllocation,
        keys: &SandboxKeys,
        cancel: &CancellationToken,
    ) -> Result<SshClient> {
        let opts = DialOptions::new(
            alloc.vm_ip.to_string(),
            self.config.ssh_user.clone(),
            keys.private_pem.clone(),
        );
        SshClient::dial(cancel, &opts).await
    }

    async fn exec_in_guest(
        &self,
        alloc: &NetworkAllocation,
        keys: &SandboxKeys,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let client = self.dial(alloc, keys, cancel).await?;
        let (code, output) = client.exec_capture(cancel, command).await?;
        let _ = client.close().await;
        if code != 0 {
            return Err(Error::transport_msg(format!(
                "guest command exited {code}: {}",
                output.trim()
            )));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.config.data_dir
    }

    pub fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.config.snapshots_dir().join(format!("{snapshot_id}.ext4"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryRepository;
    use async_trait::async_trait;
    use sbx_types::{FirecrackerEngineConfig, Resources, MAX_DISK_GIB};
    use std::sync::Mutex;

    /// Engine stub recording calls; lets lifecycle logic run without a
    /// hypervisor or root privileges.
    #[derive(Default)]
    struct FakeEngine {
        created: Mutex<Vec<String>>,
        fail_create: bool,
        running: Mutex<bool>,
    }

    #[async_trait]
    impl Engine for FakeEngine {
        async fn create(
            &self,
            sandbox: &Sandbox,
            _keys: &SandboxKeys,
            _cancel: &CancellationToken,
        ) -> Result<u32> {
            if self.fail_create {
                return Err(Error::transport_msg("boot blew up"));
            }
            self.created.lock().unwrap().push(sandbox.id.clone());
            *self.running.lock().unwrap() = true;
            Ok(31337)
        }

        async fn start(
            &self,
            _sandbox: &Sandbox,
            _keys: &SandboxKeys,
            _cancel: &CancellationToken,
        ) -> Result<u32> {
            *self.running.lock().unwrap() = true;
            Ok(31338)
        }

        async fn stop(
            &self,
            _sandbox: &Sandbox,
            _keys: Option<&SandboxKeys>,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            *self.running.lock().unwrap() = false;
            Ok(())
        }

        async fn remove(&self, _sandbox_id: &str) -> Result<()> {
            Ok(())
        }

        async fn status(&self, sandbox_id: &str) -> Result<EngineStatus> {
            let running = *self.running.lock().unwrap();
            Ok(EngineStatus {
                allocation: allocate_network(sandbox_id),
                running,
                pid: running.then_some(31337),
            })
        }
    }

    fn sandbox_config(name: &str, disk_gib: u64) -> SandboxConfig {
        SandboxConfig {
            name: name.into(),
            firecracker_engine: FirecrackerEngineConfig {
                rootfs_path: "/images/base.ext4".into(),
                kernel_path: "/images/vmlinux".into(),
            },
            resources: Resources {
                vcpus: 1.0,
                memory_mib: 512,
                disk_gib,
            },
        }
    }

    fn orchestrator(tmp: &tempfile::TempDir, engine: FakeEngine) -> (Sandboxes, Arc<FakeEngine>) {
        let engine = Arc::new(engine);
        let sb = Sandboxes::new(
            EngineConfig::with_data_dir(tmp.path()),
            Arc::new(MemoryRepository::new()),
            engine.clone(),
        );
        (sb, engine)
    }

    #[tokio::test]
    async fn create_publishes_running_record_with_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, engine) = orchestrator(&tmp, FakeEngine::default());
        let cancel = CancellationToken::new();

        let sandbox = sb.create(sandbox_config("alpha", 2), &cancel).await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(sandbox.pid, Some(31337));
        assert_eq!(*engine.created.lock().unwrap(), vec![sandbox.id.clone()]);
        assert!(looks_like_ulid(&sandbox.id));
        assert!(sandbox.tap_name.starts_with("sbx-"));
        assert!(sandbox.guest_ip.starts_with("10."));
        assert!(sandbox.control_socket_path.ends_with("firecracker.sock"));
        assert!(sandbox.started_at.is_some());
    }

    #[tokio::test]
    async fn create_rejects_oversized_disks_before_any_side_effect() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, _engine) = orchestrator(&tmp, FakeEngine::default());
        let cancel = CancellationToken::new();

        let err = sb
            .create(sandbox_config("fat", MAX_DISK_GIB + 1), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sbx_types::ErrorKind::NotValid);
        assert!(err.to_string().contains("exceeds maximum allowed"));
        // No record and no VM directory.
        assert!(sb.list().await.unwrap().is_empty());
        assert!(!tmp.path().join("vms").exists());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_names() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, _engine) = orchestrator(&tmp, FakeEngine::default());
        let cancel = CancellationToken::new();

        sb.create(sandbox_config("alpha", 2), &cancel).await.unwrap();
        let err = sb
            .create(sandbox_config("alpha", 2), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sbx_types::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn failed_create_records_failed_status() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, _engine) = orchestrator(
            &tmp,
            FakeEngine {
                fail_create: true,
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();

        let err = sb.create(sandbox_config("doomed", 2), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), sbx_types::ErrorKind::TransportFailed);

        let all = sb.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, SandboxStatus::Failed);
    }

    #[tokio::test]
    async fn stop_flips_the_record_to_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, _engine) = orchestrator(&tmp, FakeEngine::default());
        let cancel = CancellationToken::new();

        sb.create(sandbox_config("alpha", 2), &cancel).await.unwrap();
        let stopped = sb.stop("alpha", &cancel).await.unwrap();
        assert_eq!(stopped.status, SandboxStatus::Stopped);
        assert_eq!(stopped.pid, None);
        assert!(stopped.stopped_at.is_some());
    }

    #[tokio::test]
    async fn start_refuses_an_already_running_sandbox() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, _engine) = orchestrator(&tmp, FakeEngine::default());
        let cancel = CancellationToken::new();

        sb.create(sandbox_config("alpha", 2), &cancel).await.unwrap();
        let err = sb
            .start("alpha", &SessionConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sbx_types::ErrorKind::NotValid);
    }

    #[tokio::test]
    async fn remove_deletes_the_record() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, _engine) = orchestrator(&tmp, FakeEngine::default());
        let cancel = CancellationToken::new();

        sb.create(sandbox_config("alpha", 2), &cancel).await.unwrap();
        sb.remove("alpha").await.unwrap();
        assert!(sb.list().await.unwrap().is_empty());
        assert!(sb.status("alpha").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn lookup_tries_name_then_ulid_shaped_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, _engine) = orchestrator(&tmp, FakeEngine::default());
        let cancel = CancellationToken::new();

        let created = sb.create(sandbox_config("alpha", 2), &cancel).await.unwrap();
        assert_eq!(sb.lookup("alpha").await.unwrap().id, created.id);
        assert_eq!(sb.lookup(&created.id).await.unwrap().name, "alpha");
        assert!(sb.lookup("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn exec_requires_argv() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, _engine) = orchestrator(&tmp, FakeEngine::default());
        let err = sb
            .exec(
                "whatever",
                &ExecRequest::default(),
                ExecIo::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), sbx_types::ErrorKind::NotValid);
    }

    #[tokio::test]
    async fn snapshot_validates_name_and_source() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, _engine) = orchestrator(&tmp, FakeEngine::default());
        let cancel = CancellationToken::new();

        let err = sb.snapshot("ghost", "bad name", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), sbx_types::ErrorKind::NotValid);

        let err = sb.snapshot("ghost", "ok-name", &cancel).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn snapshot_copies_the_rootfs_and_records_sizes() {
        let tmp = tempfile::tempdir().unwrap();
        let (sb, _engine) = orchestrator(&tmp, FakeEngine::default());
        let cancel = CancellationToken::new();

        let sandbox = sb.create(sandbox_config("alpha", 2), &cancel).await.unwrap();
        // The fake engine does not build a rootfs; plant one.
        let vm_dir = tmp.path().join("vms").join(&sandbox.id);
        tokio::fs::create_dir_all(&vm_dir).await.unwrap();
        tokio::fs::write(vm_dir.join("rootfs.ext4"), vec![7u8; 65536])
            .await
            .unwrap();

        let snap = sb.snapshot("alpha", "base", &cancel).await.unwrap();
        assert_eq!(snap.name, "base");
        assert_eq!(snap.source_sandbox_name, "alpha");
        assert_eq!(snap.virtual_size_bytes, 65536);
        assert!(std::path::Path::new(&snap.path).exists());

        // Duplicate snapshot names are rejected.
        let err = sb.snapshot("alpha", "base", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), sbx_types::ErrorKind::AlreadyExists);

        // Removing the sandbox leaves the snapshot artifact alone.
        sb.remove("alpha").await.unwrap();
        assert!(std::path::Path::new(&snap.path).exists());

        // Explicit snapshot deletion removes record and artifact.
        sb.delete_snapshot("base").await.unwrap();
        assert!(!std::path::Path::new(&snap.path).exists());
        assert!(sb.list_snapshots().await.unwrap().is_empty());
        assert!(sb.delete_snapshot("base").await.unwrap_err().is_not_found());
    }
}
