//! Master key material

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;

/// OpenSSH `authorized_keys`-style line for the key's public half
pub fn public_key_line(key: &KeyPair) -> Result<String> {
    let public = key
        .clone_public_key()
        .context("Failed to derive public key")?;
    Ok(format!(
        "{} {} nectar-master",
        public.name(),
        public.public_key_base64()
    ))
}

/// Where the public half of `path` is written
pub fn public_key_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// Load the master key, generating one if absent.
///
/// A generated key is written as PKCS#8 PEM (0600) with its public line next
/// to it in `<path>.pub`, ready to hand to an operator for manual approval.
pub async fn load_or_generate_master_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::debug!("Loading master key from {:?}", path);
        return russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load master key from {:?}", path));
    }

    tracing::info!("Generating new master key at {:?}", path);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("Failed to encode master key")?;
    tokio::fs::write(path, &pem)
        .await
        .with_context(|| format!("Failed to write master key to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
    }

    let pub_path = public_key_path(path);
    tokio::fs::write(&pub_path, format!("{}\n", public_key_line(&key)?))
        .await
        .with_context(|| format!("Failed to write public key to {:?}", pub_path))?;

    Ok(key)
}
