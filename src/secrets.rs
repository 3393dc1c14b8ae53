//! Per-user secret vault.
//!
//! Secrets live in an in-memory `user → (name → sealed value)` map
//! mirrored into the `secrets` namespace of the KV store. Values are
//! encrypted individually under the `secrets` sealing key before they
//! ever reach the KV layer, so plaintext never rests on disk; it leaves
//! the enclave only inside the snapshot handed to an invocation owned by
//! the same user.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::primitives::Primitives;
use crate::record;
use crate::storage::KvStore;

const NAMESPACE: &str = "secrets";

/// Persisted form of one secret.
#[derive(Debug, Serialize, Deserialize)]
struct SecretRecord {
    user_id: String,
    name: String,
    /// Sealed value (`iv ‖ tag ‖ ciphertext`), base64.
    sealed_b64: String,
}

/// KV key for one secret. The user length prefix keeps
/// `("a:b", "c")` and `("a", "b:c")` from colliding.
fn secret_key(user_id: &str, name: &str) -> String {
    format!("{}:{}:{}", user_id.len(), user_id, name)
}

#[derive(Default)]
struct VaultState {
    loaded: bool,
    users: HashMap<String, BTreeMap<String, Vec<u8>>>,
}

pub struct SecretVault {
    kv: Arc<KvStore>,
    primitives: Arc<Primitives>,
    state: Mutex<VaultState>,
}

impl SecretVault {
    pub fn new(kv: Arc<KvStore>, primitives: Arc<Primitives>) -> Self {
        Self {
            kv,
            primitives,
            state: Mutex::new(VaultState::default()),
        }
    }

    fn vault_key(&self) -> Result<[u8; 16]> {
        self.primitives.seal_key("secrets")
    }

    /// Rehydrate the in-memory map from the `secrets` namespace.
    /// Idempotent; undecodable records are logged and skipped.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().loaded
    }

    fn ensure_loaded(&self, state: &mut VaultState) -> Result<()> {
        if state.loaded {
            return Ok(());
        }

        let mut restored = 0usize;
        for key in self.kv.list(NAMESPACE)? {
            let bytes = match self.kv.get(NAMESPACE, &key) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key, error = %e, "skipping unreadable secret record");
                    continue;
                }
            };
            let record: SecretRecord = match record::decode(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key, error = %e, "skipping undecodable secret record");
                    continue;
                }
            };
            let sealed = match BASE64.decode(&record.sealed_b64) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(key, error = %e, "skipping secret record with bad base64");
                    continue;
                }
            };
            state
                .users
                .entry(record.user_id)
                .or_default()
                .insert(record.name, sealed);
            restored += 1;
        }

        state.loaded = true;
        debug!(restored, "secret vault rehydrated");
        Ok(())
    }

    /// Store or overwrite a secret for `user_id`.
    pub fn put(&self, user_id: &str, name: &str, value: &str) -> Result<()> {
        if user_id.is_empty() || name.is_empty() {
            return Err(Error::InvalidArgument(
                "user id and secret name must be non-empty".to_string(),
            ));
        }

        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        let mut key = self.vault_key()?;
        let sealed = self.primitives.seal_with(&key, value.as_bytes());
        key.zeroize();
        let sealed = sealed?;

        let record = SecretRecord {
            user_id: user_id.to_string(),
            name: name.to_string(),
            sealed_b64: BASE64.encode(&sealed),
        };
        self.kv
            .put(NAMESPACE, &secret_key(user_id, name), &record::encode(&record)?)?;

        if let Some(mut old) = state
            .users
            .entry(user_id.to_string())
            .or_default()
            .insert(name.to_string(), sealed)
        {
            old.zeroize();
        }
        debug!(user_id, name, "secret stored");
        Ok(())
    }

    /// Decrypt one secret. Absent secrets are `Ok(None)`, failures `Err`.
    pub fn get(&self, user_id: &str, name: &str) -> Result<Option<String>> {
        if user_id.is_empty() || name.is_empty() {
            return Err(Error::InvalidArgument(
                "user id and secret name must be non-empty".to_string(),
            ));
        }

        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        let sealed = match state.users.get(user_id).and_then(|m| m.get(name)) {
            Some(sealed) => sealed.clone(),
            None => return Ok(None),
        };

        let mut key = self.vault_key()?;
        let opened = self.primitives.open_with(&key, &sealed);
        key.zeroize();
        let mut plaintext = opened?;
        let value = String::from_utf8(plaintext.clone())
            .map_err(|_| Error::Corruption(format!("secret {} is not valid UTF-8", name)))?;
        plaintext.zeroize();
        Ok(Some(value))
    }

    /// Remove a secret; `Ok(false)` when absent. The stored ciphertext is
    /// zeroed before it is dropped and empty user nodes are pruned.
    pub fn delete(&self, user_id: &str, name: &str) -> Result<bool> {
        if user_id.is_empty() || name.is_empty() {
            return Err(Error::InvalidArgument(
                "user id and secret name must be non-empty".to_string(),
            ));
        }

        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        let user = match state.users.get_mut(user_id) {
            Some(user) => user,
            None => return Ok(false),
        };
        let mut sealed = match user.remove(name) {
            Some(sealed) => sealed,
            None => return Ok(false),
        };
        sealed.zeroize();
        if user.is_empty() {
            state.users.remove(user_id);
        }

        self.kv.del(NAMESPACE, &secret_key(user_id, name))?;
        debug!(user_id, name, "secret deleted");
        Ok(true)
    }

    /// Names of the user's secrets, sorted. Never values.
    pub fn list(&self, user_id: &str) -> Result<Vec<String>> {
        if user_id.is_empty() {
            return Err(Error::InvalidArgument("user id must be non-empty".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        Ok(state
            .users
            .get(user_id)
            .map(|user| user.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// JSON object `{name: plaintext}` of all the user's secrets, for
    /// injection into an invocation owned by the same user. Callers must
    /// never pass anything but the invocation's own `user_id`.
    pub fn snapshot_for_user(&self, user_id: &str) -> Result<String> {
        if user_id.is_empty() {
            return Err(Error::InvalidArgument("user id must be non-empty".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state)?;

        let user = match state.users.get(user_id) {
            Some(user) => user,
            None => return Ok("{}".to_string()),
        };

        let mut key = self.vault_key()?;
        let mut snapshot = serde_json::Map::new();
        for (name, sealed) in user {
            let mut plaintext = match self.primitives.open_with(&key, sealed) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    key.zeroize();
                    return Err(e);
                }
            };
            let value = String::from_utf8(plaintext.clone()).map_err(|_| {
                Error::Corruption(format!("secret {} is not valid UTF-8", name))
            });
            plaintext.zeroize();
            match value {
                Ok(value) => {
                    snapshot.insert(name.clone(), serde_json::Value::String(value));
                }
                Err(e) => {
                    key.zeroize();
                    return Err(e);
                }
            }
        }
        key.zeroize();

        serde_json::to_string(&serde_json::Value::Object(snapshot))
            .map_err(|e| Error::Unknown(format!("snapshot encode: {}", e)))
    }
}
