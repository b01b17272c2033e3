//! Persisted key material.
//!
//! Two keys live under the config dir, both PEM, both 0600:
//!
//! - `keys/private_key.pem` — the P-256 command-signing key. Enrollment on
//!   the vehicle happens out of band; this module never generates it, it
//!   only loads what the setup flow provisioned. Absence means signed
//!   commands are rejected with `KeyNotEnrolled` before any network I/O.
//! - `openclaw/device-key.pem` — the Ed25519 gateway identity. Purely
//!   local, generated on first use and reused across reconnects.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use p256::SecretKey;
use rand::rngs::OsRng;
use tracing::info;

use crate::errors::{NodeError, Result};

pub struct KeyStore {
    config_dir: PathBuf,
}

impl KeyStore {
    pub fn new(config_dir: &Path) -> Self {
        Self { config_dir: config_dir.to_path_buf() }
    }

    pub fn command_key_path(&self) -> PathBuf {
        self.config_dir.join("keys").join("private_key.pem")
    }

    pub fn device_key_path(&self) -> PathBuf {
        self.config_dir.join("openclaw").join("device-key.pem")
    }

    /// Load the enrolled P-256 command key, if the setup flow left one.
    pub fn load_command_key(&self) -> Result<Option<SecretKey>> {
        let path = self.command_key_path();
        if !path.exists() {
            return Ok(None);
        }
        let pem = fs::read_to_string(&path)?;
        let key = SecretKey::from_pkcs8_pem(&pem)
            .map_err(|e| NodeError::Decode(format!("command key PEM: {e}")))?;
        Ok(Some(key))
    }

    /// Load the Ed25519 gateway identity, generating it on first use.
    pub fn device_key(&self) -> Result<SigningKey> {
        let path = self.device_key_path();
        if path.exists() {
            let pem = fs::read_to_string(&path)?;
            return SigningKey::from_pkcs8_pem(&pem)
                .map_err(|e| NodeError::Decode(format!("device key PEM: {e}")));
        }

        let key = SigningKey::generate(&mut OsRng);
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| NodeError::Decode(format!("device key encode: {e}")))?;
        write_private(&path, pem.as_bytes())?;
        info!("Generated gateway device identity at {}", path.display());
        Ok(key)
    }
}

/// Write key material with 0600 permissions, parents created as needed.
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Test/tooling helper: persist a P-256 command key the way the setup flow
/// would.
pub fn store_command_key(store: &KeyStore, key: &SecretKey) -> Result<()> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| NodeError::Decode(format!("command key encode: {e}")))?;
    write_private(&store.command_key_path(), pem.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_key_is_generated_once_with_0600() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());

        let first = store.device_key().unwrap();
        let second = store.device_key().unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());

        let mode = fs::metadata(store.device_key_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_command_key_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        assert!(store.load_command_key().unwrap().is_none());
    }

    #[test]
    fn command_key_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let key = SecretKey::random(&mut OsRng);
        store_command_key(&store, &key).unwrap();
        let loaded = store.load_command_key().unwrap().unwrap();
        assert_eq!(loaded.to_bytes(), key.to_bytes());
    }
}
