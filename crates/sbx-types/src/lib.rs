mod error;

pub use error::{Error, ErrorKind, Result};

use serde::{Deserialize, Serialize};

/// Largest rootfs a sandbox may request. Guards `create` before any side
/// effect touches the disk.
pub const MAX_DISK_GIB: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Pending => "pending",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub name: String,
    pub status: SandboxStatus,
    pub config: SandboxConfig,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub control_socket_path: String,
    pub tap_name: String,
    pub guest_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub name: String,
    pub firecracker_engine: FirecrackerEngineConfig,
    pub resources: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerEngineConfig {
    pub rootfs_path: String,
    pub kernel_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    pub vcpus: f64,
    pub memory_mib: u32,
    pub disk_gib: u64,
}

impl Resources {
    /// Validates the resource request without touching the host.
    pub fn validate(&self) -> Result<()> {
        if self.vcpus <= 0.0 {
            return Err(Error::NotValid("vcpus must be greater than zero".into()));
        }
        if self.memory_mib == 0 {
            return Err(Error::NotValid("memory_mib must be greater than zero".into()));
        }
        if self.disk_gib == 0 {
            return Err(Error::NotValid("disk_gib must be greater than zero".into()));
        }
        if self.disk_gib > MAX_DISK_GIB {
            return Err(Error::NotValid(format!(
                "disk size {} GiB exceeds maximum allowed {} GiB",
                self.disk_gib, MAX_DISK_GIB
            )));
        }
        Ok(())
    }
}

/// Per-start session settings. The sandbox itself is immutable on resources;
/// only the environment and egress policy vary between starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub name: String,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<EgressPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgressAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressPolicy {
    pub default: EgressAction,
    #[serde(default)]
    pub rules: Vec<EgressRule>,
}

/// One ordered rule. Exactly one of `domain`/`cidr` is present; first match
/// wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressRule {
    pub action: EgressAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub path: String,
    pub source_sandbox_id: String,
    pub source_sandbox_name: String,
    pub virtual_size_bytes: u64,
    pub allocated_size_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Ports the egress proxy bound on the gateway address, published as
/// `proxy.json` inside the VM directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProxyPorts {
    pub http_port: u16,
    pub tls_port: u16,
    pub dns_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

/// Outcome of one host preflight check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub message: String,
    pub status: CheckStatus,
}

/// Sandbox ids are ULIDs: 26 chars of uppercase Crockford base32. Gates the
/// "try by name, then by id" lookup so arbitrary names are never parsed as
/// ids.
pub fn looks_like_ulid(s: &str) -> bool {
    s.len() == 26 && s.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}

/// Allocates a new time-ordered sandbox or snapshot id.
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Snapshot names are restricted so they embed safely in paths.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::NotValid("snapshot name is empty".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(Error::NotValid(format!(
            "snapshot name {name:?} contains characters outside [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_reject_disk_over_cap() {
        let res = Resources {
            vcpus: 1.0,
            memory_mib: 512,
            disk_gib: MAX_DISK_GIB + 1,
        };
        let err = res.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotValid);
        assert!(err.to_string().contains("exceeds maximum allowed"));
    }

    #[test]
    fn resources_reject_zero_values() {
        for res in [
            Resources { vcpus: 0.0, memory_mib: 512, disk_gib: 2 },
            Resources { vcpus: 1.0, memory_mib: 0, disk_gib: 2 },
            Resources { vcpus: 1.0, memory_mib: 512, disk_gib: 0 },
        ] {
            assert_eq!(res.validate().unwrap_err().kind(), ErrorKind::NotValid);
        }
    }

    #[test]
    fn ulid_gate_accepts_generated_ids() {
        let id = new_id();
        assert_eq!(id.len(), 26);
        assert!(looks_like_ulid(&id));
    }

    #[test]
    fn ulid_gate_rejects_names() {
        assert!(!looks_like_ulid("my-sandbox"));
        assert!(!looks_like_ulid("lowercase01234567890123456"));
        assert!(!looks_like_ulid("SHORT"));
    }

    #[test]
    fn snapshot_names_are_path_safe() {
        assert!(validate_snapshot_name("base-image_v1.2").is_ok());
        assert!(validate_snapshot_name("").is_err());
        assert!(validate_snapshot_name("a/b").is_err());
        assert!(validate_snapshot_name("a b").is_err());
    }

    #[test]
    fn egress_policy_round_trips_wire_format() {
        let json = r#"{"default":"deny","rules":[{"action":"allow","domain":"github.com"},{"action":"deny","cidr":"10.0.0.0/8"}]}"#;
        let policy: EgressPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.default, EgressAction::Deny);
        assert_eq!(policy.rules.len(), 2);
        assert_eq!(policy.rules[0].domain.as_deref(), Some("github.com"));
        assert_eq!(policy.rules[1].cidr.as_deref(), Some("10.0.0.0/8"));
        let back = serde_json::to_string(&policy).unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn proxy_ports_serialize_with_expected_keys() {
        let ports = ProxyPorts { http_port: 4080, tls_port: 4080, dns_port: 4053 };
        let v: serde_json::Value = serde_json::to_value(ports).unwrap();
        assert_eq!(v["http_port"], 4080);
        assert_eq!(v["tls_port"], 4080);
        assert_eq!(v["dns_port"], 4053);
    }
}
