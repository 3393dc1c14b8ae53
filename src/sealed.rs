//! Sealed blob store.
//!
//! Bytes-in/bytes-out encryption for everything the runtime persists:
//! each blob is stored as `iv(12) ‖ tag(16) ‖ ciphertext` under a key
//! derived from the enclave sealing material, and every write leaves an
//! advisory sidecar record next to the blob. The GCM tag is the only
//! authority on integrity; the sidecar exists for host-side inspection
//! and to let listings recover keys whose file names carry a hash suffix.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::primitives::Primitives;
use crate::storage::blob_io::BlobIo;

/// Advisory sidecar written next to every blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub path: String,
    /// Original storage key, before file-name sanitization.
    pub key: String,
    pub size: u64,
    pub timestamp_ms: u64,
    /// Hex SHA-256 of the plaintext.
    pub hash: String,
}

fn sidecar_file(file: &str) -> String {
    format!(".metadata/{}.metadata", file)
}

pub struct SealedBlobStore {
    io: Arc<dyn BlobIo>,
    primitives: Arc<Primitives>,
}

impl SealedBlobStore {
    pub fn new(io: Arc<dyn BlobIo>, primitives: Arc<Primitives>) -> Self {
        Self { io, primitives }
    }

    fn blob_key(&self) -> Result<[u8; 16]> {
        self.primitives.seal_key("blob")
    }

    /// Seal `plaintext` and write it under `namespace/file`, recording
    /// the original `key` in the sidecar.
    pub fn put(&self, namespace: &str, file: &str, key: &str, plaintext: &[u8]) -> Result<()> {
        let sealed = self.primitives.seal_with(&self.blob_key()?, plaintext)?;
        self.io.write(namespace, file, &sealed)?;

        let metadata = BlobMetadata {
            path: format!("{}/{}", namespace, file),
            key: key.to_string(),
            size: plaintext.len() as u64,
            timestamp_ms: self.primitives.timestamp_ms(),
            hash: hex::encode(self.primitives.sha256(plaintext)),
        };
        let body = serde_json::to_vec(&metadata)
            .map_err(|e| Error::Unknown(format!("sidecar encode: {}", e)))?;
        self.io.write(namespace, &sidecar_file(file), &body)
    }

    /// Read and open a blob. Absent blobs are `Ok(None)`; tampered or
    /// truncated blobs are [`Error::Corruption`].
    pub fn get(&self, namespace: &str, file: &str) -> Result<Option<Vec<u8>>> {
        let sealed = match self.io.read(namespace, file)? {
            Some(sealed) => sealed,
            None => return Ok(None),
        };
        self.primitives
            .open_with(&self.blob_key()?, &sealed)
            .map(Some)
            .map_err(|e| match e {
                Error::Corruption(detail) => {
                    Error::Corruption(format!("{}/{}: {}", namespace, file, detail))
                }
                other => other,
            })
    }

    /// Remove a blob and its sidecar. A missing sidecar is logged, not
    /// an error.
    pub fn remove(&self, namespace: &str, file: &str) -> Result<bool> {
        let removed = self.io.remove(namespace, file)?;
        if removed && !self.io.remove(namespace, &sidecar_file(file))? {
            warn!(namespace, file, "blob removed but sidecar was missing");
        }
        Ok(removed)
    }

    pub fn exists(&self, namespace: &str, file: &str) -> Result<bool> {
        self.io.exists(namespace, file)
    }

    /// File names present in the namespace, unsorted.
    pub fn list(&self, namespace: &str) -> Result<Vec<String>> {
        self.io.list(namespace)
    }

    /// Advisory sidecar for a blob, if present and decodable.
    pub fn read_metadata(&self, namespace: &str, file: &str) -> Result<Option<BlobMetadata>> {
        let body = match self.io.read(namespace, &sidecar_file(file))? {
            Some(body) => body,
            None => return Ok(None),
        };
        match serde_json::from_slice(&body) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                warn!(namespace, file, error = %e, "undecodable sidecar metadata");
                Ok(None)
            }
        }
    }
}
