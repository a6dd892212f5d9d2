//! Secret provider contract
//!
//! The real KMS is an external collaborator; this module pins down the
//! part of its contract the pipeline relies on. Key material never
//! reaches the catalog or shard sidecars, only the opaque `key_ref`.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use shardstore_common::{Error, Result};
use std::path::PathBuf;
use uuid::Uuid;

/// 256-bit object encryption key
#[derive(Clone)]
pub struct KeyMaterial([u8; 32]);

impl KeyMaterial {
    /// Generate a fresh random key
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never render key bytes.
        f.write_str("KeyMaterial(..)")
    }
}

/// Per-object key management
///
/// `generate_key` is called once per object on the write path;
/// `unwrap_key` on every read. Implementations talk to whatever backs
/// the deployment (Vault, cloud KMS, the local file store below).
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Create a key for the given scope, returning an opaque reference
    /// and the material itself
    async fn generate_key(&self, scope: &str) -> Result<(String, KeyMaterial)>;

    /// Resolve a previously issued reference back to key material
    async fn unwrap_key(&self, key_ref: &str) -> Result<KeyMaterial>;
}

/// File-backed secret provider
///
/// Stand-in for deployments without an external KMS: one base64 keyfile
/// per reference under a directory only the client can read. References
/// look like `local:<uuid>`.
pub struct LocalSecretProvider {
    dir: PathBuf,
}

const REF_PREFIX: &str = "local:";

impl LocalSecretProvider {
    /// Open (creating if needed) a provider rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn key_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.key"))
    }
}

#[async_trait]
impl SecretProvider for LocalSecretProvider {
    async fn generate_key(&self, _scope: &str) -> Result<(String, KeyMaterial)> {
        let material = KeyMaterial::generate();
        let id = Uuid::new_v4().to_string();

        let encoded = BASE64.encode(material.as_bytes());
        tokio::fs::write(self.key_path(&id), encoded).await?;

        Ok((format!("{REF_PREFIX}{id}"), material))
    }

    async fn unwrap_key(&self, key_ref: &str) -> Result<KeyMaterial> {
        let id = key_ref
            .strip_prefix(REF_PREFIX)
            .ok_or_else(|| Error::invalid_request(format!("unknown key ref: {key_ref}")))?;

        let encoded = tokio::fs::read_to_string(self.key_path(id))
            .await
            .map_err(|_| Error::upstream(format!("key ref not resolvable: {key_ref}")))?;

        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Serialization(format!("corrupt keyfile for {key_ref}: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Serialization(format!("corrupt keyfile for {key_ref}")))?;

        Ok(KeyMaterial::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_and_unwrap() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalSecretProvider::open(dir.path()).unwrap();

        let (key_ref, material) = provider.generate_key("b1/hello.txt").await.unwrap();
        assert!(key_ref.starts_with("local:"));

        let unwrapped = provider.unwrap_key(&key_ref).await.unwrap();
        assert_eq!(unwrapped.as_bytes(), material.as_bytes());
    }

    #[tokio::test]
    async fn test_unknown_ref() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalSecretProvider::open(dir.path()).unwrap();

        assert!(provider.unwrap_key("local:missing").await.is_err());
        assert!(provider.unwrap_key("vault:whatever").await.is_err());
    }
}
