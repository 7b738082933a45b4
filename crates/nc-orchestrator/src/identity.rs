//! Identity material
//!
//! The orchestrator's own long-lived host key, and [`MasterIdentity`], the
//! canonical form of a master's public key captured at approval time.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A master public key that could not be parsed
#[derive(Debug, Error)]
#[error("Invalid master public key: {0}")]
pub struct InvalidIdentity(String);

/// A master's public key in canonical form.
///
/// The canonical form is the base64 of the SSH wire encoding of the key,
/// so two identities are equal exactly when the underlying keys are.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MasterIdentity {
    /// Base64 SSH key blob
    encoded: String,
    /// SHA256 fingerprint, for logs and display
    fingerprint: String,
}

impl MasterIdentity {
    /// Capture the identity presented by an authenticated peer
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self {
            encoded: key.public_key_base64(),
            fingerprint: key.fingerprint(),
        }
    }

    /// Parse an OpenSSH public key line (`type base64 [comment]`) or a bare
    /// base64 key blob
    pub fn from_openssh(line: &str) -> Result<Self, InvalidIdentity> {
        let line = line.trim();
        let blob = match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            [blob] => *blob,
            [_, blob, ..] => *blob,
            [] => return Err(InvalidIdentity("empty key".to_string())),
        };

        russh_keys::parse_public_key_base64(blob)
            .map(|key| Self::from_public_key(&key))
            .map_err(|e| InvalidIdentity(e.to_string()))
    }

    /// SHA256 fingerprint of the key
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Canonical base64 encoding of the key
    pub fn as_base64(&self) -> &str {
        &self.encoded
    }
}

impl PartialEq for MasterIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for MasterIdentity {}

impl fmt::Debug for MasterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MasterIdentity").field(&self.fingerprint).finish()
    }
}

impl fmt::Display for MasterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

impl TryFrom<String> for MasterIdentity {
    type Error = InvalidIdentity;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_openssh(&s)
    }
}

impl From<MasterIdentity> for String {
    fn from(identity: MasterIdentity) -> Self {
        identity.encoded
    }
}

/// Load the orchestrator host key, generating and persisting one if absent
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    tracing::info!("Generating new host key at {:?}", path);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("Failed to encode host key")?;
    tokio::fs::write(path, &pem)
        .await
        .with_context(|| format!("Failed to write host key to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn public_key() -> PublicKey {
        KeyPair::generate_ed25519()
            .unwrap()
            .clone_public_key()
            .unwrap()
    }

    #[test]
    fn test_identity_equality_is_by_key() {
        let k1 = public_key();
        let k2 = public_key();

        let id1 = MasterIdentity::from_public_key(&k1);
        assert_eq!(id1, MasterIdentity::from_public_key(&k1));
        assert_ne!(id1, MasterIdentity::from_public_key(&k2));
    }

    #[test]
    fn test_identity_from_openssh_line() {
        let key = public_key();
        let identity = MasterIdentity::from_public_key(&key);

        let line = format!("ssh-ed25519 {} master@acme", identity.as_base64());
        assert_eq!(MasterIdentity::from_openssh(&line).unwrap(), identity);
        assert_eq!(
            MasterIdentity::from_openssh(identity.as_base64()).unwrap(),
            identity
        );
        assert!(MasterIdentity::from_openssh("").is_err());
        assert!(MasterIdentity::from_openssh("ssh-ed25519 bm90LWEta2V5").is_err());
    }

    #[test]
    fn test_identity_serde_uses_canonical_form() {
        let identity = MasterIdentity::from_public_key(&public_key());
        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(json, format!("\"{}\"", identity.as_base64()));

        let parsed: MasterIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, identity);
        assert_eq!(parsed.fingerprint(), identity.fingerprint());
    }

    #[tokio::test]
    async fn test_host_key_is_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("host_key");

        let generated = load_or_generate_host_key(&path).await.unwrap();
        assert!(path.exists());

        let loaded = load_or_generate_host_key(&path).await.unwrap();
        assert_eq!(
            generated.clone_public_key().unwrap().fingerprint(),
            loaded.clone_public_key().unwrap().fingerprint()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
