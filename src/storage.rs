//! Storage Layer for the PKI Backend
//!
//! The backend treats its host's storage as a byte-blob store keyed by
//! string: atomic single-key `get`/`put`/`delete`, nothing more. Multi-key
//! writes are not atomic; callers that write several keys order them so a
//! crash mid-sequence leaves the authoritative entry correct (see the CA
//! write path in `protocol.rs`).
//!
//! # Persistent layout
//!
//! | Key | Value |
//! |---|---|
//! | `role/<name>` | JSON-serialized role |
//! | `config/ca_bundle` | JSON of PEM strings: certificate, issuing CA, private key |
//! | `ca` | DER bytes of the active CA certificate |
//! | `crl` | DER bytes of the current CRL (may be empty) |
//! | `certs/<serial>` | DER bytes of an issued certificate |
//! | `revoked/<serial>` | DER bytes of a revoked certificate |
//!
//! Serial numbers are normalized before use as key components: lowercase
//! hex, colon-separated pairs; dashes from user input become colons.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::errors::{PkiError, Result};

pub const ROLE_PREFIX: &str = "role/";
pub const CA_BUNDLE_KEY: &str = "config/ca_bundle";
pub const CA_KEY: &str = "ca";
pub const CRL_KEY: &str = "crl";
pub const CERT_PREFIX: &str = "certs/";
pub const REVOKED_PREFIX: &str = "revoked/";

/// Normalize a user-supplied serial number for storage lookup: lowercase
/// hex with colon separators. Dash-separated input is accepted.
pub fn normalize_serial(serial: &str) -> String {
    serial.to_lowercase().replace('-', ":")
}

/// Byte-blob store keyed by string. Single-key operations are atomic;
/// `get` of an absent key is `Ok(None)` and `delete` of an absent key
/// succeeds.
pub trait Storage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store. The default for tests and embedding hosts that manage
/// durability themselves.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| PkiError::internal("storage lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| PkiError::internal("storage lock poisoned"))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| PkiError::internal("storage lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

/// File-backed store: one file per key beneath a root directory. Key
/// components map directly to path components, so the layout on disk is
/// browsable (`<root>/certs/ab:cd:...`).
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
