//! Named key manager.
//!
//! Keys generated inside the enclave, addressed by caller-chosen ids and
//! usable only through the operations their usage flags allow. Material
//! is sealed under the `keys` sealing key and mirrored into the `keys`
//! namespace of the KV store; it leaves the enclave only for keys marked
//! exportable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};
use crate::primitives::{Primitives, IV_LEN, SEALED_OVERHEAD, TAG_LEN};
use crate::record;
use crate::storage::KvStore;

const NAMESPACE: &str = "keys";

/// Usage flags; combined bitwise in [`KeyMetadata::usage`].
pub const USAGE_SIGN: u32 = 0x01;
pub const USAGE_VERIFY: u32 = 0x02;
pub const USAGE_ENCRYPT: u32 = 0x04;
pub const USAGE_DECRYPT: u32 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Secp256k1,
    Ed25519,
    Aes256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: String,
    pub key_type: KeyType,
    pub usage: u32,
    pub exportable: bool,
    pub description: String,
    /// Opaque handle safe to show outside the enclave.
    pub fingerprint: String,
    pub created_at: u64,
    pub last_used_at: u64,
    pub usage_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    metadata: KeyMetadata,
    /// Key material sealed under the `keys` sealing key, base64.
    sealed_b64: String,
}

fn storage_key(key_id: &str) -> String {
    format!("key:{}", key_id)
}

#[derive(Default)]
struct ManagerState {
    loaded: bool,
    keys: HashMap<String, KeyRecord>,
}

pub struct KeyManager {
    kv: Arc<KvStore>,
    primitives: Arc<Primitives>,
    state: Mutex<ManagerState>,
}

impl KeyManager {
    pub fn new(kv: Arc<KvStore>, primitives: Arc<Primitives>) -> Self {
        Self {
            kv,
            primitives,
            state: Mutex::new(ManagerState::default()),
        }
    }

    fn manager_key(&self) -> Result<[u8; 16]> {
        self.primitives.seal_key("keys")
    }

    /// Load persisted keys. Idempotent; undecodable records are logged
    /// and skipped.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().loaded
    }

    fn ensure_loaded(&self, state: &mut ManagerState) -> Result<()> {
        if state.loaded {
            return Ok(());
        }

        for key in self.kv.list(NAMESPACE)? {
            let bytes = match self.kv.get(NAMESPACE, &key) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key, error = %e, "skipping unreadable key record");
                    continue;
                }
            };
            match record::decode::<KeyRecord>(&bytes) {
                Ok(record) => {
                    state.keys.insert(record.metadata.key_id.clone(), record);
                }
                Err(e) => warn!(key, error = %e, "skipping undecodable key record"),
            }
        }

        state.loaded = true;
        debug!(keys = state.keys.len(), "key manager loaded");
        Ok(())
    }

    fn persist(&self, record: &KeyRecord) -> Result<()> {
        self.kv.put(
            NAMESPACE,
            &storage_key(&record.metadata.key_id),
            &record::encode(record)?,
        )
    }

    /// Generate a key. The material never leaves the enclave unless the
    /// key is marked exportable.
    pub fn generate(
        &self,
        key_id: &str,
        key_type: KeyType,
        usage: u32,
        exportable: bool,
        description: &str,
    ) -> Result<KeyMetadata> {
        if key_id.is_empty() {
            return Err(Error::InvalidArgument("empty key id".to_string()));
        }
        if usage == 0 {
            return Err(Error::InvalidArgument("key usage must not be empty".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        if state.keys.contains_key(key_id) {
            return Err(Error::AlreadyExists(format!("key {}", key_id)));
        }

        let material = Zeroizing::new(self.generate_material(key_type)?);
        let mut seal = self.manager_key()?;
        let sealed = self.primitives.seal_with(&seal, &material);
        seal.zeroize();

        let now = self.primitives.timestamp_ms();
        let record = KeyRecord {
            metadata: KeyMetadata {
                key_id: key_id.to_string(),
                key_type,
                usage,
                exportable,
                description: description.to_string(),
                fingerprint: uuid::Uuid::new_v4().to_string(),
                created_at: now,
                last_used_at: 0,
                usage_count: 0,
            },
            sealed_b64: BASE64.encode(sealed?),
        };

        self.persist(&record)?;
        let metadata = record.metadata.clone();
        state.keys.insert(key_id.to_string(), record);
        debug!(key_id, ?key_type, "key generated");
        Ok(metadata)
    }

    fn generate_material(&self, key_type: KeyType) -> Result<Vec<u8>> {
        match key_type {
            KeyType::Secp256k1 => {
                // Rejection-sample until the scalar lands in range.
                for _ in 0..64 {
                    let candidate = Zeroizing::new(self.primitives.random(32)?);
                    if k256::ecdsa::SigningKey::from_slice(&candidate).is_ok() {
                        return Ok(candidate.to_vec());
                    }
                }
                Err(Error::Platform("secp256k1 key generation exhausted".to_string()))
            }
            KeyType::Ed25519 | KeyType::Aes256 => self.primitives.random(32),
        }
    }

    pub fn metadata(&self, key_id: &str) -> Result<KeyMetadata> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;
        state
            .keys
            .get(key_id)
            .map(|record| record.metadata.clone())
            .ok_or_else(|| Error::NotFound(format!("key {}", key_id)))
    }

    pub fn list(&self) -> Result<Vec<KeyMetadata>> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;
        let mut keys: Vec<KeyMetadata> =
            state.keys.values().map(|record| record.metadata.clone()).collect();
        keys.sort_by(|a, b| a.key_id.cmp(&b.key_id));
        Ok(keys)
    }

    /// `Ok(false)` when the key does not exist.
    pub fn delete(&self, key_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;
        if state.keys.remove(key_id).is_none() {
            return Ok(false);
        }
        self.kv.del(NAMESPACE, &storage_key(key_id))?;
        debug!(key_id, "key deleted");
        Ok(true)
    }

    /// Raw material of an exportable key.
    pub fn export(&self, key_id: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;
        let record = state
            .keys
            .get(key_id)
            .ok_or_else(|| Error::NotFound(format!("key {}", key_id)))?;
        if !record.metadata.exportable {
            return Err(Error::InvalidArgument(format!("key {} is not exportable", key_id)));
        }
        self.open_material(record).map(|material| material.to_vec())
    }

    fn open_material(&self, record: &KeyRecord) -> Result<Zeroizing<Vec<u8>>> {
        let sealed = BASE64
            .decode(&record.sealed_b64)
            .map_err(|e| Error::Corruption(format!("key material base64: {}", e)))?;
        let mut seal = self.manager_key()?;
        let opened = self.primitives.open_with(&seal, &sealed);
        seal.zeroize();
        opened.map(Zeroizing::new)
    }

    fn with_key<T>(
        &self,
        key_id: &str,
        required_usage: u32,
        op: impl FnOnce(&KeyRecord, &[u8]) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        let record = state
            .keys
            .get(key_id)
            .ok_or_else(|| Error::NotFound(format!("key {}", key_id)))?;
        if record.metadata.usage & required_usage == 0 {
            return Err(Error::InvalidArgument(format!(
                "key {} does not allow this operation",
                key_id
            )));
        }

        let material = self.open_material(record)?;
        let result = op(record, &material)?;

        // Touch usage counters; a failed persist only loses statistics.
        let now = self.primitives.timestamp_ms();
        if let Some(record) = state.keys.get_mut(key_id) {
            record.metadata.last_used_at = now;
            record.metadata.usage_count += 1;
            if let Err(e) = self.persist(record) {
                warn!(key_id, error = %e, "failed to persist key usage counters");
            }
        }
        Ok(result)
    }

    pub fn sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>> {
        self.with_key(key_id, USAGE_SIGN, |record, material| {
            match record.metadata.key_type {
                KeyType::Secp256k1 => {
                    let key = k256::ecdsa::SigningKey::from_slice(material)
                        .map_err(|_| Error::Corruption("bad secp256k1 material".to_string()))?;
                    let signature: k256::ecdsa::Signature = key.sign(data);
                    Ok(signature.to_bytes().to_vec())
                }
                KeyType::Ed25519 => {
                    let seed: [u8; 32] = material
                        .try_into()
                        .map_err(|_| Error::Corruption("bad ed25519 material".to_string()))?;
                    let key = ed25519_dalek::SigningKey::from_bytes(&seed);
                    Ok(key.sign(data).to_bytes().to_vec())
                }
                KeyType::Aes256 => {
                    Err(Error::InvalidArgument("AES keys cannot sign".to_string()))
                }
            }
        })
    }

    pub fn verify(&self, key_id: &str, data: &[u8], signature: &[u8]) -> Result<bool> {
        self.with_key(key_id, USAGE_VERIFY, |record, material| {
            match record.metadata.key_type {
                KeyType::Secp256k1 => {
                    let key = k256::ecdsa::SigningKey::from_slice(material)
                        .map_err(|_| Error::Corruption("bad secp256k1 material".to_string()))?;
                    let signature = match k256::ecdsa::Signature::from_slice(signature) {
                        Ok(signature) => signature,
                        Err(_) => return Ok(false),
                    };
                    Ok(key.verifying_key().verify(data, &signature).is_ok())
                }
                KeyType::Ed25519 => {
                    let seed: [u8; 32] = material
                        .try_into()
                        .map_err(|_| Error::Corruption("bad ed25519 material".to_string()))?;
                    let key = ed25519_dalek::SigningKey::from_bytes(&seed);
                    let bytes: [u8; 64] = match signature.try_into() {
                        Ok(bytes) => bytes,
                        Err(_) => return Ok(false),
                    };
                    let signature = ed25519_dalek::Signature::from_bytes(&bytes);
                    Ok(key.verifying_key().verify(data, &signature).is_ok())
                }
                KeyType::Aes256 => {
                    Err(Error::InvalidArgument("AES keys cannot verify".to_string()))
                }
            }
        })
    }

    /// AES-256-GCM encryption with the named key, `iv ‖ tag ‖ ct` layout.
    pub fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.with_key(key_id, USAGE_ENCRYPT, |record, material| {
            if record.metadata.key_type != KeyType::Aes256 {
                return Err(Error::InvalidArgument("key is not an encryption key".to_string()));
            }
            let cipher = Aes256Gcm::new_from_slice(material)
                .map_err(|_| Error::Corruption("bad AES material".to_string()))?;

            let mut iv = [0u8; IV_LEN];
            self.primitives.platform().fill_random(&mut iv)?;

            let mut buf = plaintext.to_vec();
            let tag = cipher
                .encrypt_in_place_detached(GenericArray::from_slice(&iv), &[], &mut buf)
                .map_err(|_| Error::Platform("encryption failed".to_string()))?;

            let mut out = Vec::with_capacity(SEALED_OVERHEAD + buf.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(&tag);
            out.extend_from_slice(&buf);
            Ok(out)
        })
    }

    pub fn decrypt(&self, key_id: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        self.with_key(key_id, USAGE_DECRYPT, |record, material| {
            if record.metadata.key_type != KeyType::Aes256 {
                return Err(Error::InvalidArgument("key is not a decryption key".to_string()));
            }
            if sealed.len() < SEALED_OVERHEAD {
                return Err(Error::Corruption(format!("sealed blob too short: {} bytes", sealed.len())));
            }
            let cipher = Aes256Gcm::new_from_slice(material)
                .map_err(|_| Error::Corruption("bad AES material".to_string()))?;

            let mut buf = sealed[SEALED_OVERHEAD..].to_vec();
            cipher
                .decrypt_in_place_detached(
                    GenericArray::from_slice(&sealed[..IV_LEN]),
                    &[],
                    &mut buf,
                    GenericArray::from_slice(&sealed[IV_LEN..IV_LEN + TAG_LEN]),
                )
                .map_err(|_| Error::Corruption("authentication tag mismatch".to_string()))?;
            Ok(buf)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SoftwarePlatform;
    use crate::sealed::SealedBlobStore;
    use crate::storage::blob_io::MemBlobIo;

    fn build(seed: [u8; 32], io: Arc<MemBlobIo>) -> KeyManager {
        let primitives = Arc::new(Primitives::new(Arc::new(SoftwarePlatform::with_seed(seed))).unwrap());
        let sealed = Arc::new(SealedBlobStore::new(io, primitives.clone()));
        KeyManager::new(Arc::new(KvStore::new(sealed)), primitives)
    }

    fn manager() -> KeyManager {
        build([21u8; 32], Arc::new(MemBlobIo::new()))
    }

    #[test]
    fn test_generate_and_duplicate_rejected() {
        let manager = manager();
        let metadata = manager
            .generate("signer", KeyType::Secp256k1, USAGE_SIGN | USAGE_VERIFY, false, "result signer")
            .unwrap();
        assert_eq!(metadata.usage_count, 0);
        assert!(metadata.created_at > 0);

        let err = manager
            .generate("signer", KeyType::Ed25519, USAGE_SIGN, false, "")
            .unwrap_err();
        assert_eq!(err.kind(), "AlreadyExists");
    }

    #[test]
    fn test_sign_verify_both_curves() {
        let manager = manager();
        for (id, key_type) in [("k1", KeyType::Secp256k1), ("ed", KeyType::Ed25519)] {
            manager
                .generate(id, key_type, USAGE_SIGN | USAGE_VERIFY, false, "")
                .unwrap();
            let signature = manager.sign(id, b"payload").unwrap();
            assert!(manager.verify(id, b"payload", &signature).unwrap());
            assert!(!manager.verify(id, b"other", &signature).unwrap());
            assert!(!manager.verify(id, b"payload", &[0u8; 5]).unwrap());
        }
    }

    #[test]
    fn test_usage_flags_enforced() {
        let manager = manager();
        manager.generate("enc", KeyType::Aes256, USAGE_ENCRYPT | USAGE_DECRYPT, false, "").unwrap();
        assert_eq!(manager.sign("enc", b"x").unwrap_err().kind(), "InvalidArgument");

        manager.generate("sig", KeyType::Ed25519, USAGE_SIGN, false, "").unwrap();
        assert_eq!(manager.verify("sig", b"x", &[0u8; 64]).unwrap_err().kind(), "InvalidArgument");
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let manager = manager();
        manager.generate("enc", KeyType::Aes256, USAGE_ENCRYPT | USAGE_DECRYPT, false, "").unwrap();

        let sealed = manager.encrypt("enc", b"plaintext").unwrap();
        assert_eq!(manager.decrypt("enc", &sealed).unwrap(), b"plaintext");

        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert_eq!(manager.decrypt("enc", &tampered).unwrap_err().kind(), "Corruption");
    }

    #[test]
    fn test_export_requires_flag() {
        let manager = manager();
        manager.generate("open", KeyType::Aes256, USAGE_ENCRYPT, true, "").unwrap();
        manager.generate("closed", KeyType::Aes256, USAGE_ENCRYPT, false, "").unwrap();

        assert_eq!(manager.export("open").unwrap().len(), 32);
        assert_eq!(manager.export("closed").unwrap_err().kind(), "InvalidArgument");
        assert_eq!(manager.export("absent").unwrap_err().kind(), "NotFound");
    }

    #[test]
    fn test_usage_counters_advance() {
        let manager = manager();
        manager.generate("sig", KeyType::Ed25519, USAGE_SIGN, false, "").unwrap();
        manager.sign("sig", b"a").unwrap();
        manager.sign("sig", b"b").unwrap();

        let metadata = manager.metadata("sig").unwrap();
        assert_eq!(metadata.usage_count, 2);
        assert!(metadata.last_used_at >= metadata.created_at);
    }

    #[test]
    fn test_keys_survive_restart() {
        let io = Arc::new(MemBlobIo::new());
        let signature = {
            let manager = build([22u8; 32], io.clone());
            manager.generate("sig", KeyType::Ed25519, USAGE_SIGN | USAGE_VERIFY, false, "").unwrap();
            manager.sign("sig", b"payload").unwrap()
        };

        let manager = build([22u8; 32], io);
        manager.initialize().unwrap();
        assert!(manager.verify("sig", b"payload", &signature).unwrap());
        assert_eq!(manager.list().unwrap().len(), 1);

        assert!(manager.delete("sig").unwrap());
        assert!(!manager.delete("sig").unwrap());
        assert_eq!(manager.metadata("sig").unwrap_err().kind(), "NotFound");
    }
}
