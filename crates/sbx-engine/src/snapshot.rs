//! Snapshot engine: clone a sandbox rootfs into the snapshot store without
//! inflating its holes. Snapshots outlive their source sandbox.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::info;

use sbx_types::{Error, Result};

use crate::rootfs;
use crate::sparse::{self, SizeStats};

/// Sparse-copies `<data_dir>/vms/<sandbox_id>/rootfs.ext4` to `dst` and
/// reports the virtual and allocated sizes of the result. A failed copy
/// never leaves a partial destination behind.
pub async fn create_snapshot(
    cancel: &CancellationToken,
    data_dir: &Path,
    sandbox_id: &str,
    snapshot_id: &str,
    dst: &Path,
) -> Result<SizeStats> {
    if sandbox_id.is_empty() {
        return Err(Error::NotValid("sandbox id is empty".into()));
    }
    if snapshot_id.is_empty() {
        return Err(Error::NotValid("snapshot id is empty".into()));
    }
    if dst.as_os_str().is_empty() {
        return Err(Error::NotValid("snapshot destination path is empty".into()));
    }

    let src = rootfs::rootfs_path(&vm_dir(data_dir, sandbox_id));
    if tokio::fs::metadata(&src).await.is_err() {
        return Err(Error::NotFound(format!(
            "rootfs for sandbox {sandbox_id} not found at {}",
            src.display()
        )));
    }
    if tokio::fs::metadata(dst).await.is_ok() {
        return Err(Error::AlreadyExists(format!(
            "snapshot destination {} already exists",
            dst.display()
        )));
    }

    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::transport(format!("could not create {}", parent.display()), e))?;
    }

    sparse::copy_sparse(&src, dst, cancel).await?;
    if let Err(e) = sparse::fsync(dst).await {
        let _ = tokio::fs::remove_file(dst).await;
        return Err(e);
    }

    let stats = sparse::size_stats(dst)?;
    info!(
        sandbox_id,
        snapshot_id,
        dst = %dst.display(),
        virtual_size = stats.virtual_size,
        allocated_size = stats.allocated_size,
        "snapshot created"
    );
    Ok(stats)
}

fn vm_dir(data_dir: &Path, sandbox_id: &str) -> PathBuf {
    data_dir.join("vms").join(sandbox_id)
}
