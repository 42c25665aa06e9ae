//! Hole-preserving file copy and size accounting.
//!
//! The copy walks the source with `SEEK_DATA`/`SEEK_HOLE` and only writes the
//! data extents, so a mostly-empty rootfs clones in milliseconds. Filesystems
//! without extent mapping degrade to a plain linear copy.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::unistd::{lseek, Whence};
use tokio_util::sync::CancellationToken;

use sbx_types::{Error, Result};

const CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeStats {
    /// Logical file length in bytes.
    pub virtual_size: u64,
    /// Bytes actually backed by filesystem blocks (512-byte units).
    pub allocated_size: u64,
}

/// Copies `src` to `dst` preserving holes. Cancellation is honored between
/// 1 MiB chunks.
pub async fn copy_sparse(src: &Path, dst: &Path, cancel: &CancellationToken) -> Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || copy_sparse_blocking(&src, &dst, &cancel))
        .await
        .map_err(|e| Error::transport("sparse copy task failed", e))?
}

/// Reports `(virtual, allocated)` sizes for a file. Allocated size comes from
/// block accounting; where that is unavailable it equals the virtual size.
pub fn size_stats(path: &Path) -> Result<SizeStats> {
    let meta = std::fs::metadata(path).map_err(|e| stat_error(path, e))?;
    let virtual_size = meta.len();
    #[cfg(unix)]
    let allocated_size = {
        use std::os::unix::fs::MetadataExt;
        meta.blocks() * 512
    };
    #[cfg(not(unix))]
    let allocated_size = virtual_size;
    Ok(SizeStats {
        virtual_size,
        allocated_size,
    })
}

fn stat_error(path: &Path, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(format!("could not stat {}", path.display()))
    } else {
        Error::transport(format!("could not stat {}", path.display()), err)
    }
}

fn copy_sparse_blocking(src: &Path, dst: &Path, cancel: &CancellationToken) -> Result<()> {
    let mut src_file = File::open(src).map_err(|e| stat_error(src, e))?;
    let src_len = src_file
        .metadata()
        .map_err(|e| stat_error(src, e))?
        .len();
    let mut dst_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)
        .map_err(|e| Error::transport(format!("could not open {}", dst.display()), e))?;

    let mut buf = vec![0u8; CHUNK];
    let mut offset: i64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(cleanup_partial(dst, Error::Cancelled));
        }
        let data_start = match lseek(src_file.as_raw_fd(), offset, Whence::SeekData) {
            Ok(o) => o,
            // No data at or past offset: the rest of the file is one hole.
            Err(Errno::ENXIO) => break,
            Err(Errno::ENOSYS | Errno::EINVAL | Errno::EOPNOTSUPP) => {
                return copy_linear_blocking(&mut src_file, &mut dst_file, dst, cancel, &mut buf)
            }
            Err(e) => {
                return Err(cleanup_partial(
                    dst,
                    Error::transport("seeking next data extent", e),
                ))
            }
        };
        let hole_start = lseek(src_file.as_raw_fd(), data_start, Whence::SeekHole)
            .map_err(|e| cleanup_partial(dst, Error::transport("seeking next hole", e)))?;
        copy_extent(
            &mut src_file,
            &mut dst_file,
            data_start as u64,
            (hole_start - data_start) as u64,
            cancel,
            &mut buf,
        )
        .map_err(|e| cleanup_partial(dst, e))?;
        offset = hole_start;
    }

    // Truncating to the source length materializes any trailing hole.
    dst_file
        .set_len(src_len)
        .map_err(|e| cleanup_partial(dst, Error::transport("truncating destination", e)))?;
    Ok(())
}

fn copy_extent(
    src: &mut File,
    dst: &mut File,
    start: u64,
    len: u64,
    cancel: &CancellationToken,
    buf: &mut [u8],
) -> Result<()> {
    src.seek(SeekFrom::Start(start))
        .map_err(|e| Error::transport("seeking source extent", e))?;
    dst.seek(SeekFrom::Start(start))
        .map_err(|e| Error::transport("seeking destination extent", e))?;
    let mut remaining = len;
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let want = remaining.min(buf.len() as u64) as usize;
        let n = src
            .read(&mut buf[..want])
            .map_err(|e| Error::transport("reading source extent", e))?;
        if n == 0 {
            // Source shrank underneath us; the truncate at the end settles it.
            break;
        }
        dst.write_all(&buf[..n])
            .map_err(|e| Error::transport("writing destination extent", e))?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Fallback for filesystems without `SEEK_DATA`. Rewinds both handles and
/// streams the whole file; the destination ends up fully allocated.
fn copy_linear_blocking(
    src: &mut File,
    dst: &mut File,
    dst_path: &Path,
    cancel: &CancellationToken,
    buf: &mut [u8],
) -> Result<()> {
    src.seek(SeekFrom::Start(0))
        .map_err(|e| cleanup_partial(dst_path, Error::transport("rewinding source", e)))?;
    dst.seek(SeekFrom::Start(0))
        .map_err(|e| cleanup_partial(dst_path, Error::transport("rewinding destination", e)))?;
    dst.set_len(0)
        .map_err(|e| cleanup_partial(dst_path, Error::transport("truncating destination", e)))?;
    loop {
        if cancel.is_cancelled() {
            return Err(cleanup_partial(dst_path, Error::Cancelled));
        }
        let n = src
            .read(buf)
            .map_err(|e| cleanup_partial(dst_path, Error::transport("reading source", e)))?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&buf[..n])
            .map_err(|e| cleanup_partial(dst_path, Error::transport("writing destination", e)))?;
    }
}

/// A failed copy never leaves a half-written destination behind.
fn cleanup_partial(dst: &Path, err: Error) -> Error {
    let _ = std::fs::remove_file(dst);
    err
}

/// Syncs a finished copy to stable storage.
pub async fn fsync(path: &Path) -> Result<()> {
    let path = PathBuf::from(path);
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| stat_error(&path, e))?;
    file.sync_all()
        .await
        .map_err(|e| Error::transport(format!("could not fsync {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// 4 KiB of data, a hole, then 4 KiB more data at the 1 MiB mark.
    fn holey_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("src.img");
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        f.write_all(&[0xAB; 4096]).unwrap();
        f.seek(SeekFrom::Start(1024 * 1024)).unwrap();
        f.write_all(&[0xCD; 4096]).unwrap();
        f.set_len(4 * 1024 * 1024).unwrap();
        path
    }

    #[tokio::test]
    async fn copy_preserves_virtual_size_and_content() {
        let tmp = tempfile::tempdir().unwrap();
        let src = holey_fixture(tmp.path());
        let dst = tmp.path().join("dst.img");

        copy_sparse(&src, &dst, &CancellationToken::new())
            .await
            .unwrap();

        let src_stats = size_stats(&src).unwrap();
        let dst_stats = size_stats(&dst).unwrap();
        assert_eq!(dst_stats.virtual_size, src_stats.virtual_size);
        assert_eq!(std::fs::read(&src).unwrap(), std::fs::read(&dst).unwrap());
    }

    #[tokio::test]
    async fn copy_keeps_holes_on_sparse_filesystems() {
        let tmp = tempfile::tempdir().unwrap();
        let src = holey_fixture(tmp.path());
        let dst = tmp.path().join("dst.img");

        copy_sparse(&src, &dst, &CancellationToken::new())
            .await
            .unwrap();

        let src_stats = size_stats(&src).unwrap();
        let dst_stats = size_stats(&dst).unwrap();
        // Only meaningful where the filesystem tracks holes at all; a linear
        // fallback is allowed to allocate more than the source.
        if src_stats.allocated_size < src_stats.virtual_size {
            assert!(dst_stats.allocated_size < dst_stats.virtual_size);
        }
    }

    #[tokio::test]
    async fn cancelled_copy_reports_cancelled_and_removes_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let src = holey_fixture(tmp.path());
        let dst = tmp.path().join("dst.img");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = copy_sparse(&src, &dst, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dst.exists());
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = copy_sparse(
            &tmp.path().join("absent.img"),
            &tmp.path().join("dst.img"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn size_stats_reports_block_accounting() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plain.bin");
        std::fs::write(&path, vec![7u8; 8192]).unwrap();
        let stats = size_stats(&path).unwrap();
        assert_eq!(stats.virtual_size, 8192);
        assert!(stats.allocated_size >= 8192);
    }
}
