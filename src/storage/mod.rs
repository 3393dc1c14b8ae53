//! Namespaced persistent KV on top of the sealed blob store.
//!
//! Namespaces are created implicitly on first write and serialized by a
//! single lock each. Every namespace supports at most one open
//! transaction at a time; while one is open, reads consult the staging
//! area first (staged deletions read as absent, staged changes return
//! their value) before falling through to the blobs on disk.

pub mod blob_io;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sealed::SealedBlobStore;

/// Characters replaced by `_` in blob file names.
const RESERVED: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Map a storage key to a blob file name.
///
/// The mapping is deterministic and injective: keys that survive
/// sanitization unchanged are their own file name; anything else gains a
/// `.k<16-hex sha256>` suffix and relies on the sidecar to recover the
/// original key in listings.
pub(crate) fn encode_key(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if RESERVED.contains(&c) || (i == 0 && c == '.') {
                '_'
            } else {
                c
            }
        })
        .collect();

    if sanitized == key {
        sanitized
    } else {
        let digest = Sha256::digest(key.as_bytes());
        format!("{}.k{}", sanitized, &hex::encode(digest)[..16])
    }
}

/// True when a file name carries the injectivity suffix.
fn has_key_suffix(file: &str) -> bool {
    file.len() > 18 && {
        let (_, tail) = file.split_at(file.len() - 18);
        tail.starts_with(".k") && tail[2..].chars().all(|c| c.is_ascii_hexdigit())
    }
}

struct OpenTransaction {
    id: u64,
    changes: BTreeMap<String, Vec<u8>>,
    deletions: BTreeSet<String>,
}

#[derive(Default)]
struct NamespaceState {
    tx: Option<OpenTransaction>,
}

pub struct KvStore {
    sealed: Arc<SealedBlobStore>,
    namespaces: Mutex<HashMap<String, Arc<Mutex<NamespaceState>>>>,
    /// tx id → owning namespace. Always locked before any namespace lock.
    tx_index: Mutex<HashMap<u64, String>>,
    next_tx_id: AtomicU64,
}

impl KvStore {
    pub fn new(sealed: Arc<SealedBlobStore>) -> Self {
        Self {
            sealed,
            namespaces: Mutex::new(HashMap::new()),
            tx_index: Mutex::new(HashMap::new()),
            next_tx_id: AtomicU64::new(1),
        }
    }

    fn namespace(&self, name: &str) -> Result<Arc<Mutex<NamespaceState>>> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty namespace".to_string()));
        }
        let mut namespaces = self.namespaces.lock().unwrap();
        Ok(namespaces
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(NamespaceState::default())))
            .clone())
    }

    pub fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".to_string()));
        }
        let ns = self.namespace(namespace)?;
        let _guard = ns.lock().unwrap();
        self.sealed.put(namespace, &encode_key(key), key, value)
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Ok(None);
        }
        let ns = self.namespace(namespace)?;
        let state = ns.lock().unwrap();

        if let Some(tx) = &state.tx {
            if tx.deletions.contains(key) {
                return Ok(None);
            }
            if let Some(staged) = tx.changes.get(key) {
                return Ok(Some(staged.clone()));
            }
        }
        self.sealed.get(namespace, &encode_key(key))
    }

    pub fn del(&self, namespace: &str, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let ns = self.namespace(namespace)?;
        let _guard = ns.lock().unwrap();
        self.sealed.remove(namespace, &encode_key(key))
    }

    pub fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let ns = self.namespace(namespace)?;
        let state = ns.lock().unwrap();

        if let Some(tx) = &state.tx {
            if tx.deletions.contains(key) {
                return Ok(false);
            }
            if tx.changes.contains_key(key) {
                return Ok(true);
            }
        }
        self.sealed.exists(namespace, &encode_key(key))
    }

    /// Keys in the namespace, lexicographically sorted and deduplicated,
    /// with transaction staging merged in.
    pub fn list(&self, namespace: &str) -> Result<Vec<String>> {
        let ns = self.namespace(namespace)?;
        let state = ns.lock().unwrap();

        let mut keys = BTreeSet::new();
        for file in self.sealed.list(namespace)? {
            match self.sealed.read_metadata(namespace, &file)? {
                Some(metadata) => {
                    keys.insert(metadata.key);
                }
                None if has_key_suffix(&file) => {
                    // Without the sidecar the original key is gone.
                    warn!(namespace, file, "sidecar missing for suffixed blob, skipping");
                }
                None => {
                    keys.insert(file);
                }
            }
        }

        if let Some(tx) = &state.tx {
            for key in tx.changes.keys() {
                keys.insert(key.clone());
            }
            for key in &tx.deletions {
                keys.remove(key);
            }
        }

        Ok(keys.into_iter().collect())
    }

    /// Delete every key in the namespace. Staged transaction state, if
    /// any, is left untouched.
    pub fn clear(&self, namespace: &str) -> Result<()> {
        let ns = self.namespace(namespace)?;
        let _guard = ns.lock().unwrap();
        for file in self.sealed.list(namespace)? {
            self.sealed.remove(namespace, &file)?;
        }
        Ok(())
    }

    /// Open a transaction on the namespace. At most one may be open per
    /// namespace at a time.
    pub fn begin(&self, namespace: &str) -> Result<u64> {
        let mut tx_index = self.tx_index.lock().unwrap();
        let ns = self.namespace(namespace)?;
        let mut state = ns.lock().unwrap();

        if let Some(tx) = &state.tx {
            return Err(Error::AlreadyExists(format!(
                "transaction {} already open in namespace {}",
                tx.id, namespace
            )));
        }

        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        state.tx = Some(OpenTransaction {
            id,
            changes: BTreeMap::new(),
            deletions: BTreeSet::new(),
        });
        tx_index.insert(id, namespace.to_string());
        debug!(namespace, tx_id = id, "transaction opened");
        Ok(id)
    }

    fn tx_namespace(&self, tx_id: u64) -> Result<String> {
        let tx_index = self.tx_index.lock().unwrap();
        tx_index
            .get(&tx_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transaction {}", tx_id)))
    }

    /// Stage a change; any staged deletion of the same key is superseded.
    pub fn put_tx(&self, tx_id: u64, key: &str, value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".to_string()));
        }
        let namespace = self.tx_namespace(tx_id)?;
        let ns = self.namespace(&namespace)?;
        let mut state = ns.lock().unwrap();

        let tx = match &mut state.tx {
            Some(tx) if tx.id == tx_id => tx,
            _ => return Err(Error::NotFound(format!("transaction {}", tx_id))),
        };
        tx.deletions.remove(key);
        tx.changes.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Stage a deletion; any staged change of the same key is superseded.
    pub fn del_tx(&self, tx_id: u64, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".to_string()));
        }
        let namespace = self.tx_namespace(tx_id)?;
        let ns = self.namespace(&namespace)?;
        let mut state = ns.lock().unwrap();

        let tx = match &mut state.tx {
            Some(tx) if tx.id == tx_id => tx,
            _ => return Err(Error::NotFound(format!("transaction {}", tx_id))),
        };
        tx.changes.remove(key);
        tx.deletions.insert(key.to_string());
        Ok(())
    }

    /// Apply all staged operations, changes before deletions, in key
    /// order. The first write error aborts the commit and drops the
    /// transaction; writes applied before the failure stay visible
    /// (individual blobs are never torn). Deletion failures are logged
    /// and skipped.
    pub fn commit(&self, tx_id: u64) -> Result<()> {
        let mut tx_index = self.tx_index.lock().unwrap();
        let namespace = tx_index
            .get(&tx_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transaction {}", tx_id)))?;
        let ns = self.namespace(&namespace)?;
        let mut state = ns.lock().unwrap();

        let tx = match state.tx.take() {
            Some(tx) if tx.id == tx_id => tx,
            other => {
                state.tx = other;
                return Err(Error::NotFound(format!("transaction {}", tx_id)));
            }
        };
        tx_index.remove(&tx_id);

        for (key, value) in &tx.changes {
            if let Err(e) = self.sealed.put(&namespace, &encode_key(key), key, value) {
                warn!(namespace, tx_id, key, error = %e, "commit aborted mid-apply");
                return Err(e);
            }
        }
        for key in &tx.deletions {
            if let Err(e) = self.sealed.remove(&namespace, &encode_key(key)) {
                warn!(namespace, tx_id, key, error = %e, "commit could not delete key");
            }
        }

        debug!(namespace, tx_id, "transaction committed");
        Ok(())
    }

    /// Discard all staged operations.
    pub fn rollback(&self, tx_id: u64) -> Result<()> {
        let mut tx_index = self.tx_index.lock().unwrap();
        let namespace = tx_index
            .get(&tx_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transaction {}", tx_id)))?;
        let ns = self.namespace(&namespace)?;
        let mut state = ns.lock().unwrap();

        match state.tx.take() {
            Some(tx) if tx.id == tx_id => {
                tx_index.remove(&tx_id);
                debug!(namespace, tx_id, "transaction rolled back");
                Ok(())
            }
            other => {
                state.tx = other;
                Err(Error::NotFound(format!("transaction {}", tx_id)))
            }
        }
    }
}
