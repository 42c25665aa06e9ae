//! Per-sandbox SSH identity. Each sandbox gets its own Ed25519 keypair under
//! its VM directory; the public half is injected into the guest rootfs before
//! first boot.

use std::path::{Path, PathBuf};

use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey};
use tokio::io::AsyncWriteExt;

use sbx_types::{Error, Result};

pub const PRIVATE_KEY_FILE: &str = "id_ed25519";
pub const PUBLIC_KEY_FILE: &str = "id_ed25519.pub";

#[derive(Clone)]
pub struct SandboxKeys {
    pub private_pem: String,
    pub public_openssh: String,
}

#[derive(Debug, Clone)]
pub struct KeyStore {
    data_dir: PathBuf,
}

impl KeyStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn vm_dir(&self, sandbox_id: &str) -> PathBuf {
        self.data_dir.join("vms").join(sandbox_id)
    }

    fn private_path(&self, sandbox_id: &str) -> PathBuf {
        self.vm_dir(sandbox_id).join(PRIVATE_KEY_FILE)
    }

    fn public_path(&self, sandbox_id: &str) -> PathBuf {
        self.vm_dir(sandbox_id).join(PUBLIC_KEY_FILE)
    }

    /// Generates the sandbox keypair if it does not exist yet and returns it.
    /// A keypair left by an earlier run is reused as-is.
    pub async fn ensure_keys(&self, sandbox_id: &str) -> Result<SandboxKeys> {
        let dir = self.vm_dir(sandbox_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::transport(format!("could not create {}", dir.display()), e))?;

        if self.keys_exist(sandbox_id).await {
            return Ok(SandboxKeys {
                private_pem: self.load_private_key(sandbox_id).await?,
                public_openssh: self.load_public_key(sandbox_id).await?,
            });
        }

        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .map_err(|e| Error::transport("could not generate ed25519 key", e))?;
        let private_pem = key
            .to_openssh(LineEnding::LF)
            .map_err(|e| Error::transport("could not encode private key", e))?
            .to_string();
        let public_openssh = key
            .public_key()
            .to_openssh()
            .map_err(|e| Error::transport("could not encode public key", e))?;

        let private_path = self.private_path(sandbox_id);
        write_with_mode(&private_path, private_pem.as_bytes(), 0o600).await?;
        if let Err(e) =
            write_with_mode(&self.public_path(sandbox_id), public_openssh.as_bytes(), 0o644).await
        {
            // Never leave a private key on disk without its public half.
            let _ = tokio::fs::remove_file(&private_path).await;
            return Err(e);
        }

        Ok(SandboxKeys {
            private_pem,
            public_openssh,
        })
    }

    pub async fn load_private_key(&self, sandbox_id: &str) -> Result<String> {
        read_key(&self.private_path(sandbox_id)).await
    }

    pub async fn load_public_key(&self, sandbox_id: &str) -> Result<String> {
        read_key(&self.public_path(sandbox_id)).await
    }

    pub async fn keys_exist(&self, sandbox_id: &str) -> bool {
        tokio::fs::metadata(self.private_path(sandbox_id)).await.is_ok()
            && tokio::fs::metadata(self.public_path(sandbox_id)).await.is_ok()
    }
}

async fn write_with_mode(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(mode);
    let mut file = tokio::fs::OpenOptions::from(opts)
        .open(path)
        .await
        .map_err(|e| Error::transport(format!("could not create {}", path.display()), e))?;
    file.write_all(content)
        .await
        .map_err(|e| Error::transport(format!("could not write {}", path.display()), e))?;
    file.flush()
        .await
        .map_err(|e| Error::transport(format!("could not write {}", path.display()), e))
}

async fn read_key(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
            "key file {} does not exist",
            path.display()
        ))),
        Err(e) => Err(Error::transport(
            format!("could not read {}", path.display()),
            e,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn ensure_keys_generates_a_usable_pair() {
        let tmp = tempfile::tempdir().unwrap();
        let store = KeyStore::new(tmp.path());

        let keys = store.ensure_keys("01HZX3V7J8K9M2N4P6Q8R1S3T5").await.unwrap();
        assert!(keys.private_pem.contains("OPENSSH PRIVATE KEY"));
        assert!(keys.public_openssh.starts_with("ssh-ed25519 "));
        assert!(store.keys_exist("01HZX3V7J8K9M2N4P6Q8R1S3T5").await);
    }

    #[tokio::test]
    async fn key_files_carry_restrictive_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = KeyStore::new(tmp.path());
        store.ensure_keys("SBOX1").await.unwrap();

        let private = tmp.path().join("vms/SBOX1").join(PRIVATE_KEY_FILE);
        let public = tmp.path().join("vms/SBOX1").join(PUBLIC_KEY_FILE);
        let pmode = std::fs::metadata(&private).unwrap().permissions().mode() & 0o777;
        let umode = std::fs::metadata(&public).unwrap().permissions().mode() & 0o777;
        assert_eq!(pmode, 0o600);
        assert_eq!(umode, 0o644);
    }

    #[tokio::test]
    async fn ensure_keys_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = KeyStore::new(tmp.path());

        let first = store.ensure_keys("SBOX2").await.unwrap();
        let second = store.ensure_keys("SBOX2").await.unwrap();
        assert_eq!(first.public_openssh, second.public_openssh);
        assert_eq!(first.private_pem, second.private_pem);
    }

    #[tokio::test]
    async fn loading_missing_keys_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = KeyStore::new(tmp.path());
        assert!(store.load_private_key("NOPE").await.unwrap_err().is_not_found());
        assert!(store.load_public_key("NOPE").await.unwrap_err().is_not_found());
        assert!(!store.keys_exist("NOPE").await);
    }
}
