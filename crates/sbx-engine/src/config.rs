//! Engine configuration. Plain constructor-injected values, no globals; the
//! defaults match a stock host install.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of all sandbox state. `vms/`, `images/`, `snapshots/` live here.
    pub data_dir: PathBuf,
    /// Hypervisor binary, resolved through PATH unless absolute.
    pub firecracker_bin: String,
    /// Egress proxy binary spawned per sandbox when a policy is active.
    pub egress_proxy_bin: String,
    /// Upstream resolver the DNS forwarder relays to.
    pub upstream_dns: String,
    /// Guest account the injected key authorizes.
    pub ssh_user: String,
    /// Resolvers written into the guest when no egress policy intercepts DNS.
    pub nameservers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".sbx"))
            .unwrap_or_else(|| PathBuf::from(".sbx"));
        Self {
            data_dir,
            firecracker_bin: "firecracker".into(),
            egress_proxy_bin: "sbx-egress-proxy".into(),
            upstream_dns: "8.8.8.8:53".into(),
            ssh_user: "root".into(),
            nameservers: vec!["8.8.8.8".into(), "1.1.1.1".into()],
        }
    }
}

impl EngineConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn vm_dir(&self, sandbox_id: &str) -> PathBuf {
        self.data_dir.join("vms").join(sandbox_id)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }
}
