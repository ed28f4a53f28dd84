//! Artifact storage for generated plot images
//!
//! Images are stored under opaque keys of the form
//! `predictions/{namespace}/{filename}`. Keys are resolved to time-limited
//! signed URLs; the service itself serves those URLs from `/artifacts/*key`
//! after checking the signature and expiry.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use xplat_common::config::StorageConfig;

const KEY_PREFIX: &str = "predictions";

type HmacSha256 = Hmac<Sha256>;

/// Artifact storage errors
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Invalid base64 image data: {0}")]
    InvalidData(String),

    #[error("Invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Signed URL has expired")]
    Expired,

    #[error("Signature does not match")]
    BadSignature,

    #[error("Invalid signing secret")]
    SigningKey,

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Object storage used by the prediction pipeline
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a base64-encoded PNG at `predictions/{namespace}/{filename}`
    ///
    /// Returns the key, or `None` if the upload failed. Failures are logged
    /// here and never propagated.
    async fn upload(&self, base64_data: &str, namespace: &str, filename: &str) -> Option<String>;

    /// Temporary URL granting read access to `key`
    fn presigned_url(&self, key: &str, ttl: Duration) -> String;

    /// Default lifetime of presigned URLs
    fn default_ttl(&self) -> Duration;
}

/// Filesystem-backed artifact store with HMAC-SHA256 signed URLs
pub struct LocalArtifactStore {
    root: PathBuf,
    public_base_url: String,
    /// Keyed with the signing secret; cloned per signature
    signer: HmacSha256,
    default_ttl: Duration,
}

impl LocalArtifactStore {
    pub fn new(config: &StorageConfig) -> Result<Self, ArtifactError> {
        let signer = HmacSha256::new_from_slice(config.signing_secret.as_bytes())
            .map_err(|_| ArtifactError::SigningKey)?;

        Ok(Self {
            root: config.artifact_folder.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            signer,
            default_ttl: config.presign_ttl,
        })
    }

    /// Root directory of stored artifacts
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store raw bytes; the fallible core of [`ArtifactStore::upload`]
    pub async fn put(
        &self,
        base64_data: &str,
        namespace: &str,
        filename: &str,
    ) -> Result<String, ArtifactError> {
        for part in [namespace, filename] {
            if part.is_empty() || part.contains('/') || part.contains('\\') || part == ".." || part == "." {
                return Err(ArtifactError::InvalidKey(format!("{}/{}", namespace, filename)));
            }
        }

        let bytes = decode_image(base64_data)?;
        let key = format!("{}/{}/{}", KEY_PREFIX, namespace, filename);
        let path = self.path_for(&key)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;

        tracing::debug!(key = %key, bytes = bytes.len(), "Stored artifact");
        Ok(key)
    }

    /// Read an artifact after verifying its signed URL parameters
    pub async fn read_signed(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now_unix: i64,
    ) -> Result<Vec<u8>, ArtifactError> {
        self.verify(key, expires, signature, now_unix)?;
        let path = self.path_for(key)?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check a signature and expiry for `key`
    pub fn verify(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now_unix: i64,
    ) -> Result<(), ArtifactError> {
        validate_key(key)?;

        let expected = self.sign(key, expires);
        if !constant_time_eq(expected.as_bytes(), signature.to_ascii_lowercase().as_bytes()) {
            return Err(ArtifactError::BadSignature);
        }
        if now_unix > expires {
            return Err(ArtifactError::Expired);
        }
        Ok(())
    }

    /// Presigned URL with an explicit expiry timestamp
    pub fn presigned_url_at(&self, key: &str, expires: i64) -> String {
        let encoded_key = key
            .split('/')
            .map(encode_path_segment)
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/artifacts/{}?expires={}&signature={}",
            self.public_base_url,
            encoded_key,
            expires,
            self.sign(key, expires)
        )
    }

    /// Hex HMAC-SHA256 over `key\nexpires`
    fn sign(&self, key: &str, expires: i64) -> String {
        let mut mac = self.signer.clone();
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        format!("{:x}", mac.finalize().into_bytes())
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn upload(&self, base64_data: &str, namespace: &str, filename: &str) -> Option<String> {
        match self.put(base64_data, namespace, filename).await {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(
                    namespace = namespace,
                    filename = filename,
                    error = %e,
                    "Artifact upload failed"
                );
                None
            }
        }
    }

    fn presigned_url(&self, key: &str, ttl: Duration) -> String {
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        self.presigned_url_at(key, expires)
    }

    fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

/// Keys are relative paths under `predictions/` with no traversal
fn validate_key(key: &str) -> Result<(), ArtifactError> {
    let invalid = || ArtifactError::InvalidKey(key.to_string());

    if key.is_empty() || key.contains('\\') || !key.starts_with("predictions/") {
        return Err(invalid());
    }

    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(invalid()),
        }
    }

    if key.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return Err(invalid());
    }

    Ok(())
}

fn decode_image(base64_data: &str) -> Result<Vec<u8>, ArtifactError> {
    // Tolerate data URLs and line-wrapped base64
    let data = match base64_data.find(";base64,") {
        Some(idx) if base64_data.starts_with("data:") => &base64_data[idx + ";base64,".len()..],
        _ => base64_data,
    };
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    if compact.is_empty() {
        return Err(ArtifactError::InvalidData("empty image".to_string()));
    }

    general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ArtifactError::InvalidData(e.to_string()))
}

fn encode_path_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
