//! Hardware platform collaborator.
//!
//! The runtime reaches the enclave hardware (sealing material, quotes,
//! entropy, measurements) only through [`TeePlatform`]. In production the
//! trait is backed by the platform SDK; [`SoftwarePlatform`] is the
//! simulation-mode implementation used outside real hardware and in
//! tests. It can be seeded so sealing material survives a restart the
//! way a real enclave's does.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub trait TeePlatform: Send + Sync {
    /// Root sealing material, deterministic across restarts of the same
    /// signed enclave.
    fn sealing_material(&self) -> Result<[u8; 32]>;

    /// Fill `buf` with hardware-backed entropy.
    fn fill_random(&self, buf: &mut [u8]) -> Result<()>;

    /// Produce an attestation quote binding `report_data` to the enclave
    /// identity. The bit layout belongs to the platform, not to us.
    fn quote(&self, report_data: &[u8]) -> Result<Vec<u8>>;

    /// Hash of the enclave code image, hex-encoded.
    fn mrenclave(&self) -> String;

    /// Hash of the enclave signing key, hex-encoded.
    fn mrsigner(&self) -> String;

    /// Milliseconds since the Unix epoch.
    fn timestamp_ms(&self) -> u64;

    /// Bytes of enclave page cache currently in use.
    fn epc_usage(&self) -> u64;
}

/// Software platform for simulation mode and tests.
pub struct SoftwarePlatform {
    seed: [u8; 32],
    mrenclave: String,
    mrsigner: String,
}

impl SoftwarePlatform {
    /// Platform with a caller-provided seed; the same seed reproduces the
    /// same sealing material and measurements across restarts.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        let mrenclave = measurement(&seed, b"mrenclave");
        let mrsigner = measurement(&seed, b"mrsigner");
        Self { seed, mrenclave, mrsigner }
    }

    /// Platform with a random seed. Sealed data written through it does
    /// not survive the process.
    pub fn ephemeral() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::with_seed(seed)
    }
}

fn measurement(seed: &[u8; 32], label: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(label);
    hex::encode(hasher.finalize())
}

impl TeePlatform for SoftwarePlatform {
    fn sealing_material(&self) -> Result<[u8; 32]> {
        Ok(self.seed)
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| Error::Platform(format!("rng: {}", e)))
    }

    fn quote(&self, report_data: &[u8]) -> Result<Vec<u8>> {
        // Simulation-mode report, shaped like the JSON reports the
        // attestation tooling emits.
        let report = serde_json::json!({
            "version": 3,
            "sign_type": 1,
            "mr_enclave": self.mrenclave,
            "mr_signer": self.mrsigner,
            "report_data": hex::encode(report_data),
            "timestamp": self.timestamp_ms(),
        });
        Ok(report.to_string().into_bytes())
    }

    fn mrenclave(&self) -> String {
        self.mrenclave.clone()
    }

    fn mrsigner(&self) -> String {
        self.mrsigner.clone()
    }

    fn timestamp_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn epc_usage(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_platform_is_deterministic() {
        let a = SoftwarePlatform::with_seed([7u8; 32]);
        let b = SoftwarePlatform::with_seed([7u8; 32]);
        assert_eq!(a.sealing_material().unwrap(), b.sealing_material().unwrap());
        assert_eq!(a.mrenclave(), b.mrenclave());
        assert_eq!(a.mrsigner(), b.mrsigner());
        assert_ne!(a.mrenclave(), a.mrsigner());
    }

    #[test]
    fn test_ephemeral_platforms_differ() {
        let a = SoftwarePlatform::ephemeral();
        let b = SoftwarePlatform::ephemeral();
        assert_ne!(a.sealing_material().unwrap(), b.sealing_material().unwrap());
    }

    #[test]
    fn test_quote_binds_report_data() {
        let platform = SoftwarePlatform::with_seed([1u8; 32]);
        let quote = platform.quote(b"bound-data").unwrap();
        let report: serde_json::Value = serde_json::from_slice(&quote).unwrap();
        assert_eq!(report["report_data"].as_str().unwrap(), hex::encode(b"bound-data"));
        assert_eq!(report["mr_enclave"].as_str().unwrap(), platform.mrenclave());
    }

    #[test]
    fn test_fill_random_fills() {
        let platform = SoftwarePlatform::ephemeral();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        platform.fill_random(&mut a).unwrap();
        platform.fill_random(&mut b).unwrap();
        assert_ne!(a, b);
    }
}
