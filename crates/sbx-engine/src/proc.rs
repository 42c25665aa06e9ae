//! Child-process bookkeeping shared by the hypervisor and proxy lifecycles:
//! pid files, liveness probes, and graceful termination.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

/// Reads a pid file; absent or unparseable files read as None.
pub async fn read_pid_file(path: &Path) -> Option<u32> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    content.trim().parse().ok()
}

/// Signal-0 liveness probe.
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub fn kill_pid(pid: u32, signal: Signal) {
    let _ = kill(Pid::from_raw(pid as i32), Some(signal));
}

/// SIGTERM, a bounded wait for exit, then SIGKILL. A pid that is already
/// gone is a no-op.
pub async fn terminate_pid(pid: u32, grace: Duration) {
    if !pid_alive(pid) {
        return;
    }
    kill_pid(pid, Signal::SIGTERM);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            debug!(pid, "process exited on SIGTERM");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    debug!(pid, "process ignored SIGTERM, sending SIGKILL");
    kill_pid(pid, Signal::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pid_file_parsing_tolerates_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.pid");
        assert_eq!(read_pid_file(&path).await, None);

        tokio::fs::write(&path, "12345\n").await.unwrap();
        assert_eq!(read_pid_file(&path).await, Some(12345));

        tokio::fs::write(&path, "not-a-pid").await.unwrap();
        assert_eq!(read_pid_file(&path).await, None);
    }

    #[test]
    fn own_process_is_alive_and_bogus_pid_is_not() {
        assert!(pid_alive(std::process::id()));
        // Pid max on Linux defaults well below this.
        assert!(!pid_alive(4_000_000));
    }

    #[tokio::test]
    async fn terminating_a_dead_pid_is_a_noop() {
        terminate_pid(4_000_000, Duration::from_millis(50)).await;
    }
}
