//! Capability bridge.
//!
//! Implements [`CapabilityHost`] for one invocation: every call charges
//! the gauge first, storage is confined to the namespace derived from
//! `(user_id, function_id)`, secrets to the invoking user, and crypto
//! routes through the platform primitives. The bridge owns the
//! invocation's gas gauge; the executor reads the final figure back out
//! of it.

#[cfg(test)]
use std::sync::Arc;

use tracing::{debug, error, info};
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::executor::evaluator::CapabilityHost;
use crate::gas::{CostClass, GasGauge};
use crate::primitives::Primitives;
use crate::secrets::SecretVault;
use crate::storage::KvStore;

/// Namespace holding an invocation's storage, unique per
/// `(user_id, function_id)`. The length prefix keeps distinct pairs from
/// colliding.
pub(crate) fn invocation_namespace(user_id: &str, function_id: &str) -> String {
    format!("state:{}:{}:{}", user_id.len(), user_id, function_id)
}

pub struct CapabilityBridge<'a> {
    gauge: GasGauge,
    kv: &'a KvStore,
    vault: &'a SecretVault,
    primitives: &'a Primitives,
    namespace: String,
    user_id: String,
    function_id: String,
    /// AES key for the `crypto.encrypt`/`crypto.decrypt` capability,
    /// derived per user so one user cannot open another's ciphertexts.
    crypto_key: [u8; 16],
}

impl<'a> CapabilityBridge<'a> {
    pub fn new(
        gauge: GasGauge,
        kv: &'a KvStore,
        vault: &'a SecretVault,
        primitives: &'a Primitives,
        user_id: &str,
        function_id: &str,
    ) -> Result<Self> {
        let crypto_key = primitives.seal_key(&format!("crypto:{}", user_id))?;
        Ok(Self {
            gauge,
            kv,
            vault,
            primitives,
            namespace: invocation_namespace(user_id, function_id),
            user_id: user_id.to_string(),
            function_id: function_id.to_string(),
            crypto_key,
        })
    }

    pub fn gas_used(&self) -> u64 {
        self.gauge.used()
    }
}

impl Drop for CapabilityBridge<'_> {
    fn drop(&mut self) {
        self.crypto_key.zeroize();
    }
}

impl CapabilityHost for CapabilityBridge<'_> {
    fn charge(&mut self, class: CostClass, size: u64) -> Result<()> {
        self.gauge.charge(class, size)
    }

    fn storage_get(&mut self, key: &str) -> Result<Option<String>> {
        debug!(key, namespace = %self.namespace, "storage.get");
        let value = self.kv.get(&self.namespace, key)?;
        let size = value.as_ref().map(|v| v.len() as u64).unwrap_or(0);
        self.gauge.charge(CostClass::StorageRead, size)?;
        match value {
            Some(bytes) => Ok(Some(String::from_utf8(bytes).map_err(|_| {
                Error::Corruption(format!("stored value for {} is not valid UTF-8", key))
            })?)),
            None => Ok(None),
        }
    }

    fn storage_set(&mut self, key: &str, value: &str) -> Result<()> {
        debug!(key, namespace = %self.namespace, size = value.len(), "storage.set");
        self.gauge.charge(CostClass::StorageWrite, value.len() as u64)?;
        self.kv.put(&self.namespace, key, value.as_bytes())
    }

    fn storage_remove(&mut self, key: &str) -> Result<bool> {
        debug!(key, namespace = %self.namespace, "storage.remove");
        self.gauge.charge(CostClass::StorageWrite, 0)?;
        self.kv.del(&self.namespace, key)
    }

    fn storage_clear(&mut self) -> Result<()> {
        debug!(namespace = %self.namespace, "storage.clear");
        self.gauge.charge(CostClass::StorageWrite, 0)?;
        self.kv.clear(&self.namespace)
    }

    fn secret_get(&mut self, name: &str) -> Result<Option<String>> {
        debug!(name, user_id = %self.user_id, "secrets.get");
        self.gauge.charge(CostClass::StorageRead, 0)?;
        self.vault.get(&self.user_id, name)
    }

    fn secret_set(&mut self, name: &str, value: &str) -> Result<()> {
        debug!(name, user_id = %self.user_id, "secrets.set");
        self.gauge.charge(CostClass::StorageWrite, value.len() as u64)?;
        self.vault.put(&self.user_id, name, value)
    }

    fn secret_remove(&mut self, name: &str) -> Result<bool> {
        debug!(name, user_id = %self.user_id, "secrets.remove");
        self.gauge.charge(CostClass::StorageWrite, 0)?;
        self.vault.delete(&self.user_id, name)
    }

    fn random_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.gauge.charge(CostClass::CryptoOp, len as u64)?;
        self.primitives.random(len)
    }

    fn hash(&mut self, data: &[u8]) -> Result<[u8; 32]> {
        self.gauge.charge(CostClass::CryptoOp, data.len() as u64)?;
        Ok(self.primitives.sha256(data))
    }

    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.gauge.charge(CostClass::CryptoOp, data.len() as u64)?;
        self.primitives.sign(data)
    }

    fn verify(&mut self, data: &[u8], signature: &[u8]) -> Result<bool> {
        self.gauge.charge(CostClass::CryptoOp, data.len() as u64)?;
        self.primitives.verify(data, signature)
    }

    fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.gauge.charge(CostClass::CryptoOp, data.len() as u64)?;
        self.primitives.seal_with(&self.crypto_key, data)
    }

    fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.gauge.charge(CostClass::CryptoOp, data.len() as u64)?;
        self.primitives.open_with(&self.crypto_key, data)
    }

    fn log(&mut self, line: &str) {
        info!(target: "script", user_id = %self.user_id, function_id = %self.function_id, "{}", line);
    }

    fn log_error(&mut self, line: &str) {
        error!(target: "script", user_id = %self.user_id, function_id = %self.function_id, "{}", line);
    }

    fn attestation(&mut self) -> Result<Vec<u8>> {
        self.gauge.charge(CostClass::Attestation, 0)?;
        // Bind the quote to the invocation identity.
        let report_data =
            self.primitives.sha256(format!("{}:{}", self.user_id, self.function_id).as_bytes());
        self.primitives.attestation_quote(&report_data)
    }

    fn seal(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.gauge.charge(CostClass::Sealing, data.len() as u64)?;
        self.primitives.seal(data)
    }

    fn timestamp_ms(&mut self) -> u64 {
        self.primitives.timestamp_ms()
    }

    fn epc_usage(&mut self) -> u64 {
        self.primitives.epc_usage()
    }
}
