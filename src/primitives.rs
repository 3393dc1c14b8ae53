//! Deterministic cryptography over the enclave platform.
//!
//! Wraps [`TeePlatform`] with the primitives the rest of the runtime
//! uses: purpose-bound sealing keys, SHA-256, AES-128-GCM with the fixed
//! `iv(12) ‖ tag(16) ‖ ciphertext` layout, and the ECDSA enclave identity
//! key. The identity key is derived from the sealing material, so
//! signatures stay verifiable across restarts of the same signed enclave.

use std::sync::Arc;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes128Gcm;
use hkdf::Hkdf;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::platform::TeePlatform;

/// AES-GCM IV length in bytes.
pub const IV_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Minimum length of a sealed blob: IV and tag with empty ciphertext.
pub const SEALED_OVERHEAD: usize = IV_LEN + TAG_LEN;

/// Version mixed into the sealing-key salt; bump to rotate every derived key.
const SEAL_KEY_VERSION: u32 = 1;

/// Component A: platform primitives adapter.
pub struct Primitives {
    platform: Arc<dyn TeePlatform>,
    identity: SigningKey,
}

impl Primitives {
    pub fn new(platform: Arc<dyn TeePlatform>) -> Result<Self> {
        let identity = derive_identity(platform.as_ref())?;
        Ok(Self { platform, identity })
    }

    pub fn platform(&self) -> &dyn TeePlatform {
        self.platform.as_ref()
    }

    /// Derive a 16-byte AES-GCM key bound to the enclave signer and the
    /// sealing-key version. Deterministic across restarts of the same
    /// signed enclave.
    pub fn seal_key(&self, purpose: &str) -> Result<[u8; 16]> {
        let mut material = self.platform.sealing_material()?;
        let salt = format!("{}:v{}", self.platform.mrsigner(), SEAL_KEY_VERSION);
        let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), &material);
        material.zeroize();

        let mut okm = [0u8; 16];
        hk.expand(purpose.as_bytes(), &mut okm)
            .map_err(|e| Error::Platform(format!("seal key derivation: {}", e)))?;
        Ok(okm)
    }

    /// `n` bytes of hardware-backed entropy.
    pub fn random(&self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.platform.fill_random(&mut buf)?;
        Ok(buf)
    }

    pub fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    /// AES-GCM encrypt under `key` with a fresh random 96-bit IV.
    pub fn aes_gcm_encrypt(&self, key: &[u8; 16], plaintext: &[u8]) -> Result<([u8; IV_LEN], Vec<u8>, [u8; TAG_LEN])> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| Error::Platform("invalid AES key length".to_string()))?;

        let mut iv = [0u8; IV_LEN];
        self.platform.fill_random(&mut iv)?;

        let mut buf = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), &[], &mut buf)
            .map_err(|_| Error::Platform("encryption failed".to_string()))?;

        Ok((iv, buf, tag.into()))
    }

    /// AES-GCM decrypt. Tag mismatch is [`Error::Corruption`]: the blob
    /// either opens to the original plaintext or fails, never silently.
    pub fn aes_gcm_decrypt(
        &self,
        key: &[u8; 16],
        iv: &[u8; IV_LEN],
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<Vec<u8>> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| Error::Platform("invalid AES key length".to_string()))?;

        let mut buf = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(iv),
                &[],
                &mut buf,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| Error::Corruption("authentication tag mismatch".to_string()))?;
        Ok(buf)
    }

    /// Encrypt `plaintext` into the fixed `iv ‖ tag ‖ ciphertext` layout.
    pub fn seal_with(&self, key: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>> {
        let (iv, ciphertext, tag) = self.aes_gcm_encrypt(key, plaintext)?;
        let mut sealed = Vec::with_capacity(SEALED_OVERHEAD + ciphertext.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&tag);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a blob produced by [`seal_with`]. Blobs shorter than the
    /// IV + tag overhead are [`Error::Corruption`].
    pub fn open_with(&self, key: &[u8; 16], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEALED_OVERHEAD {
            return Err(Error::Corruption(format!(
                "sealed blob too short: {} bytes",
                sealed.len()
            )));
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&sealed[..IV_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&sealed[IV_LEN..SEALED_OVERHEAD]);
        self.aes_gcm_decrypt(key, &iv, &sealed[SEALED_OVERHEAD..], &tag)
    }

    /// Seal bytes under the general-purpose sealing key.
    pub fn seal(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut key = self.seal_key("seal")?;
        let sealed = self.seal_with(&key, data);
        key.zeroize();
        sealed
    }

    /// Unseal bytes previously produced by [`seal`].
    pub fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let mut key = self.seal_key("seal")?;
        let opened = self.open_with(&key, sealed);
        key.zeroize();
        opened
    }

    /// ECDSA signature over `message` with the enclave identity key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature: Signature = self.identity.sign(message);
        Ok(signature.to_bytes().to_vec())
    }

    /// Verify a signature produced by [`sign`]. Malformed signatures
    /// verify as false rather than erroring.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool> {
        let signature = match Signature::from_slice(signature) {
            Ok(sig) => sig,
            Err(_) => return Ok(false),
        };
        Ok(self.identity.verifying_key().verify(message, &signature).is_ok())
    }

    pub fn attestation_quote(&self, report_data: &[u8]) -> Result<Vec<u8>> {
        self.platform.quote(report_data)
    }

    pub fn mrenclave(&self) -> String {
        self.platform.mrenclave()
    }

    pub fn mrsigner(&self) -> String {
        self.platform.mrsigner()
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.platform.timestamp_ms()
    }

    pub fn epc_usage(&self) -> u64 {
        self.platform.epc_usage()
    }
}

/// Derive the secp256k1 identity key from the sealing material. A
/// non-zero in-range scalar is required; step the counter until the
/// output lands in range.
fn derive_identity(platform: &dyn TeePlatform) -> Result<SigningKey> {
    let mut material = platform.sealing_material()?;
    let hk = Hkdf::<Sha256>::new(Some(platform.mrsigner().as_bytes()), &material);
    material.zeroize();

    for counter in 0u8..=255 {
        let mut okm = [0u8; 32];
        let info = [b"identity-key".as_slice(), &[counter]].concat();
        hk.expand(&info, &mut okm)
            .map_err(|e| Error::Platform(format!("identity key derivation: {}", e)))?;
        let parsed = SigningKey::from_slice(&okm);
        okm.zeroize();
        if let Ok(key) = parsed {
            return Ok(key);
        }
    }
    Err(Error::Platform("identity key derivation exhausted".to_string()))
}
