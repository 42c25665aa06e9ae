//! Rootfs preparation: clone the base image, grow it, and patch guest files
//! into the unmounted ext4 image with `debugfs` so the first boot already
//! carries the sandbox SSH key and resolver config.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use sbx_types::{Error, Result};

use crate::sparse;

pub const ROOTFS_FILE: &str = "rootfs.ext4";

pub fn rootfs_path(vm_dir: &Path) -> PathBuf {
    vm_dir.join(ROOTFS_FILE)
}

/// Sparse-copies the base image into `<vm_dir>/rootfs.ext4` and syncs it.
pub async fn copy_rootfs(src: &Path, vm_dir: &Path, cancel: &CancellationToken) -> Result<PathBuf> {
    let dst = rootfs_path(vm_dir);
    sparse::copy_sparse(src, &dst, cancel).await?;
    sparse::fsync(&dst).await?;
    Ok(dst)
}

/// Extends the copied rootfs to `target_gib`. Shrinking below the base image
/// is rejected; matching it exactly is a no-op. The in-guest filesystem is
/// grown separately after boot.
pub async fn resize_rootfs(vm_dir: &Path, target_gib: u64, base_image: &Path) -> Result<()> {
    let rootfs = rootfs_path(vm_dir);
    let rootfs_meta = tokio::fs::metadata(&rootfs)
        .await
        .map_err(|e| missing_or_transport(e, "could not stat rootfs"))?;
    let base_meta = tokio::fs::metadata(base_image)
        .await
        .map_err(|e| missing_or_transport(e, "could not stat base image"))?;

    let target = target_gib * (1 << 30);
    if target < base_meta.len() {
        return Err(Error::NotValid(format!(
            "disk size {} GiB is smaller than base image ({} bytes)",
            target_gib,
            base_meta.len()
        )));
    }
    if target == rootfs_meta.len() {
        return Ok(());
    }

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&rootfs)
        .await
        .map_err(|e| Error::transport(format!("could not open {}", rootfs.display()), e))?;
    file.set_len(target)
        .await
        .map_err(|e| Error::transport(format!("could not grow {}", rootfs.display()), e))
}

fn missing_or_transport(err: std::io::Error, msg: &str) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(msg.into())
    } else {
        Error::transport(msg.to_string(), err)
    }
}

/// Injects `/root/.ssh/authorized_keys` (0600 inside a 0700 dir) into the
/// unmounted image. Any key shipped by the base image is removed first so a
/// stale key cannot survive into the new sandbox.
pub async fn patch_rootfs_ssh(vm_dir: &Path, authorized_key: &str) -> Result<()> {
    let rootfs = existing_rootfs(vm_dir).await?;
    let mut content = authorized_key.trim_end().to_string();
    content.push('\n');
    let staged = stage_file(content.as_bytes())?;

    let script = format!(
        "mkdir /root\n\
         mkdir /root/.ssh\n\
         rm /root/.ssh/authorized_keys\n\
         cd /root/.ssh\n\
         write {staged} authorized_keys\n\
         sif authorized_keys mode 0100600\n\
         sif /root/.ssh mode 040700\n",
        staged = staged.path().display(),
    );
    run_debugfs(&rootfs, &script).await?;
    verify_inode(&rootfs, "/root/.ssh/authorized_keys").await
}

/// Writes `/etc/resolv.conf` with the given resolver list, creating `/etc`
/// if the image lacks it and replacing any symlinked resolv.conf.
pub async fn patch_rootfs_dns(vm_dir: &Path, nameservers: &[String]) -> Result<()> {
    let rootfs = rootfs_path(vm_dir);
    if tokio::fs::metadata(&rootfs).await.is_err() {
        return Err(Error::NotFound(format!(
            "rootfs not found at {}",
            rootfs.display()
        )));
    }

    let mut content = String::new();
    for ns in nameservers {
        content.push_str("nameserver ");
        content.push_str(ns);
        content.push('\n');
    }
    let staged = stage_file(content.as_bytes())?;

    let script = format!(
        "mkdir /etc\n\
         rm /etc/resolv.conf\n\
         cd /etc\n\
         write {staged} resolv.conf\n\
         sif resolv.conf mode 0100644\n",
        staged = staged.path().display(),
    );
    run_debugfs(&rootfs, &script).await?;
    verify_inode(&rootfs, "/etc/resolv.conf").await
}

async fn existing_rootfs(vm_dir: &Path) -> Result<PathBuf> {
    let rootfs = rootfs_path(vm_dir);
    tokio::fs::metadata(&rootfs)
        .await
        .map_err(|e| missing_or_transport(e, "could not stat rootfs"))?;
    Ok(rootfs)
}

fn stage_file(content: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut staged = tempfile::NamedTempFile::new()
        .map_err(|e| Error::transport("could not stage file for debugfs", e))?;
    staged
        .write_all(content)
        .map_err(|e| Error::transport("could not stage file for debugfs", e))?;
    staged
        .flush()
        .map_err(|e| Error::transport("could not stage file for debugfs", e))?;
    Ok(staged)
}

/// Feeds a command script to `debugfs -w -f -`. debugfs reports per-command
/// failures on stderr while still exiting zero, so the interesting errors
/// (unwritable image, corrupt superblock) are surfaced from the output and
/// per-file success is confirmed separately with `stat`.
async fn run_debugfs(image: &Path, script: &str) -> Result<String> {
    let mut child = Command::new("debugfs")
        .args(["-w", "-f", "-"])
        .arg(image)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::transport("could not launch debugfs", e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| Error::transport("could not write debugfs script", e))?;
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::transport("debugfs did not finish", e))?;

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !output.status.success() || combined.contains("Bad magic number") {
        return Err(Error::transport_msg(format!(
            "debugfs failed on {}: {}",
            image.display(),
            combined.trim()
        )));
    }
    Ok(combined)
}

async fn verify_inode(image: &Path, guest_path: &str) -> Result<()> {
    let output = Command::new("debugfs")
        .args(["-R", &format!("stat {guest_path}")])
        .arg(image)
        .output()
        .await
        .map_err(|e| Error::transport("could not launch debugfs", e))?;
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !combined.contains("Inode:") {
        return Err(Error::transport_msg(format!(
            "debugfs did not write {guest_path}: {}",
            combined.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn vm_dir_with_rootfs(len: u64) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = rootfs_path(tmp.path());
        let f = tokio::fs::File::create(&rootfs).await.unwrap();
        f.set_len(len).await.unwrap();
        let dir = tmp.path().to_path_buf();
        (tmp, dir)
    }

    async fn base_image(dir: &Path, len: u64) -> PathBuf {
        let path = dir.join("base.ext4");
        let f = tokio::fs::File::create(&path).await.unwrap();
        f.set_len(len).await.unwrap();
        path
    }

    #[tokio::test]
    async fn resize_below_base_is_rejected() {
        let (tmp, vm_dir) = vm_dir_with_rootfs(2 << 30).await;
        let base = base_image(tmp.path(), 2 << 30).await;
        let err = resize_rootfs(&vm_dir, 1, &base).await.unwrap_err();
        assert_eq!(err.kind(), sbx_types::ErrorKind::NotValid);
        assert!(err.to_string().contains("smaller than base image"));
    }

    #[tokio::test]
    async fn resize_to_same_size_is_a_noop() {
        let (tmp, vm_dir) = vm_dir_with_rootfs(1 << 30).await;
        let base = base_image(tmp.path(), 1 << 30).await;
        resize_rootfs(&vm_dir, 1, &base).await.unwrap();
        let len = tokio::fs::metadata(rootfs_path(&vm_dir)).await.unwrap().len();
        assert_eq!(len, 1 << 30);
    }

    #[tokio::test]
    async fn resize_extends_to_target() {
        let (tmp, vm_dir) = vm_dir_with_rootfs(1 << 30).await;
        let base = base_image(tmp.path(), 1 << 30).await;
        resize_rootfs(&vm_dir, 3, &base).await.unwrap();
        let len = tokio::fs::metadata(rootfs_path(&vm_dir)).await.unwrap().len();
        assert_eq!(len, 3 << 30);
    }

    #[tokio::test]
    async fn resize_distinguishes_missing_rootfs_from_missing_base() {
        let tmp = tempfile::tempdir().unwrap();
        let base = base_image(tmp.path(), 1 << 30).await;

        let err = resize_rootfs(tmp.path(), 2, &base).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("could not stat rootfs"));

        let (_tmp2, vm_dir) = vm_dir_with_rootfs(1 << 30).await;
        let err = resize_rootfs(&vm_dir, 2, &tmp.path().join("gone.ext4"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("could not stat base image"));
    }

    #[tokio::test]
    async fn dns_patch_requires_a_rootfs() {
        let tmp = tempfile::tempdir().unwrap();
        let err = patch_rootfs_dns(tmp.path(), &["8.8.8.8".into()])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("rootfs not found"));
    }

    #[tokio::test]
    async fn copy_rootfs_lands_in_vm_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("base.ext4");
        tokio::fs::write(&src, vec![0x55; 16384]).await.unwrap();
        let vm_dir = tmp.path().join("vm");
        tokio::fs::create_dir_all(&vm_dir).await.unwrap();

        let dst = copy_rootfs(&src, &vm_dir, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(dst, vm_dir.join(ROOTFS_FILE));
        assert_eq!(
            tokio::fs::read(&src).await.unwrap(),
            tokio::fs::read(&dst).await.unwrap()
        );
    }
}
