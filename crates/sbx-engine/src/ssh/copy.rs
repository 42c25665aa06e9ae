//! SFTP file transfer. Directories are walked recursively with modes
//! preserved; symlinks are skipped rather than followed so a guest cannot
//! steer a copy outside the chosen tree.

use std::path::{Path, PathBuf};

use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sbx_types::{Error, Result};

use super::SshClient;

const COPY_CHUNK: usize = 256 * 1024;

impl SshClient {
    /// Copies a local file or directory tree into the guest.
    pub async fn copy_to(
        &self,
        cancel: &CancellationToken,
        src: &Path,
        dst: &str,
    ) -> Result<()> {
        let meta = tokio::fs::symlink_metadata(src).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("{} does not exist", src.display()))
            } else {
                Error::transport(format!("could not stat {}", src.display()), e)
            }
        })?;

        let sftp = self.open_sftp().await?;
        if meta.is_dir() {
            self.push_tree(cancel, &sftp, src, dst).await?;
        } else {
            push_file(cancel, &sftp, src, dst, unix_mode(&meta)).await?;
        }
        let _ = sftp.close().await;
        Ok(())
    }

    /// Copies a guest file or directory tree onto the local filesystem.
    pub async fn copy_from(
        &self,
        cancel: &CancellationToken,
        src: &str,
        dst: &Path,
    ) -> Result<()> {
        let sftp = self.open_sftp().await?;
        let meta = sftp
            .metadata(src)
            .await
            .map_err(|_| Error::NotFound(format!("remote path {src} does not exist")))?;

        if meta.is_dir() {
            self.pull_tree(cancel, &sftp, src, dst).await?;
        } else {
            pull_file(cancel, &sftp, src, dst, meta.permissions).await?;
        }
        let _ = sftp.close().await;
        Ok(())
    }

    async fn open_sftp(&self) -> Result<SftpSession> {
        let channel = self
            .handle()
            .channel_open_session()
            .await
            .map_err(|e| Error::transport("could not open ssh channel", e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::transport("could not request sftp subsystem", e))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::transport("could not start sftp session", e))
    }

    async fn push_tree(
        &self,
        cancel: &CancellationToken,
        sftp: &SftpSession,
        src: &Path,
        dst: &str,
    ) -> Result<()> {
        let mut pending: Vec<(PathBuf, String)> = vec![(src.to_path_buf(), dst.to_string())];
        while let Some((local_dir, remote_dir)) = pending.pop() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let dir_meta = tokio::fs::metadata(&local_dir)
                .await
                .map_err(|e| Error::transport(format!("could not stat {}", local_dir.display()), e))?;
            ensure_remote_dir(sftp, &remote_dir, unix_mode(&dir_meta)).await?;

            let mut entries = tokio::fs::read_dir(&local_dir)
                .await
                .map_err(|e| Error::transport(format!("could not list {}", local_dir.display()), e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::transport("could not read directory entry", e))?
            {
                let path = entry.path();
                let meta = tokio::fs::symlink_metadata(&path)
                    .await
                    .map_err(|e| Error::transport(format!("could not stat {}", path.display()), e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let remote = join_remote(&remote_dir, &name);
                if meta.file_type().is_symlink() {
                    debug!(path = %path.display(), "skipping symlink");
                } else if meta.is_dir() {
                    pending.push((path, remote));
                } else {
                    push_file(cancel, sftp, &path, &remote, unix_mode(&meta)).await?;
                }
            }
        }
        Ok(())
    }

    async fn pull_tree(
        &self,
        cancel: &CancellationToken,
        sftp: &SftpSession,
        src: &str,
        dst: &Path,
    ) -> Result<()> {
        let mut pending: Vec<(String, PathBuf)> = vec![(src.to_string(), dst.to_path_buf())];
        while let Some((remote_dir, local_dir)) = pending.pop() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tokio::fs::create_dir_all(&local_dir)
                .await
                .map_err(|e| Error::transport(format!("could not create {}", local_dir.display()), e))?;

            let entries = sftp
                .read_dir(&remote_dir)
                .await
                .map_err(|e| Error::transport(format!("could not list remote {remote_dir}"), e))?;
            for entry in entries {
                let name = entry.file_name();
                let meta = entry.metadata();
                let remote = join_remote(&remote_dir, &name);
                let local = local_dir.join(&name);
                if meta.is_symlink() {
                    debug!(remote, "skipping symlink");
                } else if meta.is_dir() {
                    pending.push((remote, local));
                } else {
                    pull_file(cancel, sftp, &remote, &local, meta.permissions).await?;
                }
            }
        }
        Ok(())
    }
}

async fn ensure_remote_dir(sftp: &SftpSession, path: &str, mode: u32) -> Result<()> {
    // An existing directory is fine; anything else shows up on first write.
    if sftp.create_dir(path).await.is_ok() {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        let _ = sftp.set_metadata(path, attrs).await;
    }
    Ok(())
}

async fn push_file(
    cancel: &CancellationToken,
    sftp: &SftpSession,
    src: &Path,
    dst: &str,
    mode: u32,
) -> Result<()> {
    let mut reader = tokio::fs::File::open(src)
        .await
        .map_err(|e| Error::transport(format!("could not open {}", src.display()), e))?;
    let mut writer = sftp
        .create(dst)
        .await
        .map_err(|e| Error::transport(format!("could not create remote {dst}"), e))?;
    copy_cancellable(cancel, &mut reader, &mut writer).await?;
    writer
        .shutdown()
        .await
        .map_err(|e| Error::transport(format!("could not finish remote {dst}"), e))?;

    let attrs = FileAttributes {
        permissions: Some(mode),
        ..Default::default()
    };
    sftp.set_metadata(dst, attrs)
        .await
        .map_err(|e| Error::transport(format!("could not set mode on remote {dst}"), e))?;
    Ok(())
}

async fn pull_file(
    cancel: &CancellationToken,
    sftp: &SftpSession,
    src: &str,
    dst: &Path,
    permissions: Option<u32>,
) -> Result<()> {
    let mut reader = sftp
        .open(src)
        .await
        .map_err(|e| Error::transport(format!("could not open remote {src}"), e))?;
    let mut writer = tokio::fs::File::create(dst)
        .await
        .map_err(|e| Error::transport(format!("could not create {}", dst.display()), e))?;
    copy_cancellable(cancel, &mut reader, &mut writer).await?;
    writer
        .flush()
        .await
        .map_err(|e| Error::transport(format!("could not finish {}", dst.display()), e))?;

    if let Some(mode) = permissions {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode & 0o7777);
        tokio::fs::set_permissions(dst, perms)
            .await
            .map_err(|e| Error::transport(format!("could not set mode on {}", dst.display()), e))?;
    }
    Ok(())
}

async fn copy_cancellable<R, W>(
    cancel: &CancellationToken,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| Error::transport("copy read failed", e))?;
        if n == 0 {
            return Ok(total);
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| Error::transport("copy write failed", e))?;
        total += n as u64;
    }
}

fn unix_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_paths_join_without_doubled_slashes() {
        assert_eq!(join_remote("/srv", "file"), "/srv/file");
        assert_eq!(join_remote("/srv/", "file"), "/srv/file");
    }

    #[tokio::test]
    async fn copy_cancellable_moves_bytes_and_reports_totals() {
        let data = vec![9u8; 1024 * 600];
        let mut reader = std::io::Cursor::new(data.clone());
        let mut writer = std::io::Cursor::new(Vec::new());
        let n = copy_cancellable(&CancellationToken::new(), &mut reader, &mut writer)
            .await
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(writer.into_inner(), data);
    }

    #[tokio::test]
    async fn copy_cancellable_honors_a_pre_cancelled_token() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut reader = std::io::Cursor::new(vec![0u8; 16]);
        let mut writer = std::io::Cursor::new(Vec::new());
        let err = copy_cancellable(&cancel, &mut reader, &mut writer)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
