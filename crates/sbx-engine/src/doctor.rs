//! Host preflight checks. None of these mutate the host; they only report
//! whether a sandbox could be created here.

use std::path::Path;

use sbx_types::{CheckResult, CheckStatus};

use crate::config::EngineConfig;

pub async fn run_checks(config: &EngineConfig) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(device_check("kvm", "/dev/kvm", "hardware virtualization"));
    results.push(device_check("tun", "/dev/net/tun", "TAP device creation"));
    results.push(binary_check(
        "firecracker",
        &config.firecracker_bin,
        CheckStatus::Error,
    ));
    results.push(binary_check("nft", "nft", CheckStatus::Error));
    results.push(binary_check("debugfs", "debugfs", CheckStatus::Error));
    results.push(binary_check(
        "egress-proxy",
        &config.egress_proxy_bin,
        // Only sandboxes with an egress policy need the proxy binary.
        CheckStatus::Warning,
    ));
    // TTY exec delegates to the system ssh client.
    results.push(binary_check("ssh", "ssh", CheckStatus::Warning));
    results.push(data_dir_check(config).await);

    results
}

fn device_check(id: &str, path: &str, purpose: &str) -> CheckResult {
    if Path::new(path).exists() {
        CheckResult {
            id: id.into(),
            message: format!("{path} is available"),
            status: CheckStatus::Ok,
        }
    } else {
        CheckResult {
            id: id.into(),
            message: format!("{path} is missing; {purpose} will not work"),
            status: CheckStatus::Error,
        }
    }
}

fn binary_check(id: &str, binary: &str, missing_status: CheckStatus) -> CheckResult {
    match find_in_path(binary) {
        Some(found) => CheckResult {
            id: id.into(),
            message: format!("{} found at {}", binary, found.display()),
            status: CheckStatus::Ok,
        },
        None => CheckResult {
            id: id.into(),
            message: format!("{binary} not found in PATH"),
            status: missing_status,
        },
    }
}

async fn data_dir_check(config: &EngineConfig) -> CheckResult {
    match tokio::fs::create_dir_all(&config.data_dir).await {
        Ok(()) => CheckResult {
            id: "data-dir".into(),
            message: format!("data dir {} is writable", config.data_dir.display()),
            status: CheckStatus::Ok,
        },
        Err(e) => CheckResult {
            id: "data-dir".into(),
            message: format!(
                "data dir {} is not writable: {e}",
                config.data_dir.display()
            ),
            status: CheckStatus::Error,
        },
    }
}

fn find_in_path(binary: &str) -> Option<std::path::PathBuf> {
    let candidate = Path::new(binary);
    if candidate.is_absolute() {
        return candidate.exists().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|p| p.exists())
}
