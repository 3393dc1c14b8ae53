//! Untrusted-filesystem collaborator.
//!
//! The KV store never touches the host filesystem directly; everything
//! goes through [`BlobIo`] so the sealed layers can be exercised against
//! an in-memory implementation. `file` is a path relative to the
//! namespace directory and may name a sidecar under `.metadata/`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

pub trait BlobIo: Send + Sync {
    fn write(&self, namespace: &str, file: &str, bytes: &[u8]) -> Result<()>;
    fn read(&self, namespace: &str, file: &str) -> Result<Option<Vec<u8>>>;
    fn remove(&self, namespace: &str, file: &str) -> Result<bool>;
    fn exists(&self, namespace: &str, file: &str) -> Result<bool>;
    /// Top-level files in the namespace, hidden entries excluded,
    /// unsorted.
    fn list(&self, namespace: &str) -> Result<Vec<String>>;
}

/// Host filesystem implementation. Directories are created on first
/// write with owner-only permissions.
pub struct FsBlobIo {
    root: PathBuf,
}

impl FsBlobIo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, namespace: &str, file: &str) -> PathBuf {
        self.root.join(namespace).join(file)
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        };
        fs::create_dir_all(parent)
            .map_err(|e| Error::Platform(format!("create {}: {}", parent.display(), e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(parent, perms)
                .map_err(|e| Error::Platform(format!("chmod {}: {}", parent.display(), e)))?;
        }
        Ok(())
    }
}

impl BlobIo for FsBlobIo {
    fn write(&self, namespace: &str, file: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(namespace, file);
        self.ensure_parent(&path)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut handle = options
            .open(&path)
            .map_err(|e| Error::Platform(format!("open {}: {}", path.display(), e)))?;
        handle
            .write_all(bytes)
            .map_err(|e| Error::Platform(format!("write {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn read(&self, namespace: &str, file: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(namespace, file);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Platform(format!("read {}: {}", path.display(), e))),
        }
    }

    fn remove(&self, namespace: &str, file: &str) -> Result<bool> {
        let path = self.path_for(namespace, file);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Platform(format!("remove {}: {}", path.display(), e))),
        }
    }

    fn exists(&self, namespace: &str, file: &str) -> Result<bool> {
        Ok(self.path_for(namespace, file).is_file())
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>> {
        let dir = self.root.join(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Platform(format!("list {}: {}", dir.display(), e))),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Platform(format!("list {}: {}", dir.display(), e)))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if entry.path().is_file() {
                files.push(name);
            }
        }
        Ok(files)
    }
}

/// In-memory implementation for unit tests.
#[derive(Default)]
pub struct MemBlobIo {
    blobs: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemBlobIo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobIo for MemBlobIo {
    fn write(&self, namespace: &str, file: &str, bytes: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.insert((namespace.to_string(), file.to_string()), bytes.to_vec());
        Ok(())
    }

    fn read(&self, namespace: &str, file: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.get(&(namespace.to_string(), file.to_string())).cloned())
    }

    fn remove(&self, namespace: &str, file: &str) -> Result<bool> {
        let mut blobs = self.blobs.lock().unwrap();
        Ok(blobs.remove(&(namespace.to_string(), file.to_string())).is_some())
    }

    fn exists(&self, namespace: &str, file: &str) -> Result<bool> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.contains_key(&(namespace.to_string(), file.to_string())))
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs
            .keys()
            .filter(|(ns, file)| ns == namespace && !file.starts_with('.') && !file.contains('/'))
            .map(|(_, file)| file.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(io: &dyn BlobIo) {
        io.write("ns", "a", b"one").unwrap();
        io.write("ns", ".metadata/a.metadata", b"{}").unwrap();
        io.write("other", "b", b"two").unwrap();

        assert_eq!(io.read("ns", "a").unwrap().unwrap(), b"one");
        assert!(io.read("ns", "missing").unwrap().is_none());
        assert!(io.exists("ns", "a").unwrap());
        assert!(!io.exists("ns", "b").unwrap());

        // Hidden sidecar directory never shows up in listings.
        assert_eq!(io.list("ns").unwrap(), vec!["a".to_string()]);
        assert_eq!(io.list("nope").unwrap(), Vec::<String>::new());

        assert!(io.remove("ns", "a").unwrap());
        assert!(!io.remove("ns", "a").unwrap());
        assert!(io.read("ns", "a").unwrap().is_none());
    }

    #[test]
    fn test_mem_blob_io() {
        exercise(&MemBlobIo::new());
    }

    #[test]
    fn test_fs_blob_io() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsBlobIo::new(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_fs_blob_io_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let io = FsBlobIo::new(dir.path());
        io.write("ns", "a", b"secret").unwrap();

        let mode = std::fs::metadata(dir.path().join("ns").join("a"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
