use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh::keys::{Algorithm, PrivateKey};
use tracing::info;

use crate::auth::pubkey;

/// The server's identity, and whether this run created it.
///
/// A missing key file is filled with a fresh Ed25519 key. The file is only
/// ever created, never overwritten, so two servers started on the same path
/// end up sharing whichever key was written first.
pub struct HostKey {
    key: PrivateKey,
    path: Option<PathBuf>,
    created: bool,
}

impl HostKey {
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let (key, created) = match fs::read_to_string(path) {
            Ok(pem) => (decode(path, &pem)?, false),
            Err(e) if e.kind() == ErrorKind::NotFound => create(path)?,
            Err(e) => {
                return Err(e).with_context(|| format!("reading host key {}", path.display()))
            }
        };
        if !created {
            check_permissions(path);
        }

        let host_key = Self {
            key,
            path: Some(path.to_path_buf()),
            created,
        };
        info!(
            path = %path.display(),
            created = created,
            fingerprint = %host_key.fingerprint(),
            "Host key ready"
        );
        Ok(host_key)
    }

    /// An in-memory key that is never written anywhere.
    pub fn ephemeral() -> Result<Self> {
        Ok(Self {
            key: generate()?,
            path: None,
            created: true,
        })
    }

    pub fn fingerprint(&self) -> String {
        pubkey::fingerprint(self.key.public_key())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn into_private_key(self) -> PrivateKey {
        self.key
    }
}

fn generate() -> Result<PrivateKey> {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| anyhow::anyhow!("generating host key: {}", e))
}

fn decode(path: &Path, pem: &str) -> Result<PrivateKey> {
    russh::keys::decode_secret_key(pem, None)
        .map_err(|e| anyhow::anyhow!("decoding host key {}: {}", path.display(), e))
}

/// Write a new key to `path`. If another process created the file first,
/// its key is used instead.
fn create(path: &Path) -> Result<(PrivateKey, bool)> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let key = generate()?;
    let mut pem = Vec::new();
    russh::keys::encode_pkcs8_pem(&key, &mut pem)
        .map_err(|e| anyhow::anyhow!("encoding host key: {}", e))?;

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    match options.open(path) {
        Ok(mut file) => {
            file.write_all(&pem)
                .with_context(|| format!("writing host key {}", path.display()))?;
            Ok((key, true))
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let pem = fs::read_to_string(path)
                .with_context(|| format!("reading host key {}", path.display()))?;
            Ok((decode(path, &pem)?, false))
        }
        Err(e) => Err(e).with_context(|| format!("creating host key {}", path.display())),
    }
}

#[cfg(unix)]
fn check_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = fs::metadata(path) {
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            tracing::warn!(
                path = %path.display(),
                mode = %format!("{:o}", mode),
                "Host key is readable by other users"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) {}
