//! Encrypted key-value store
//!
//! All entries live in memory and are written out as one encrypted snapshot on
//! every commit:
//! ```text
//! [ 12 bytes: nonce ][ AES-256-GCM ciphertext of the framed StoreRecord list ]
//! ```
//! The 32-byte key sits next to the snapshot in `<path>.key`. Snapshots are
//! written to a temporary file and renamed into place.

use aes_gcm::{aead::Aead, Aes256Gcm, Key, KeyInit, Nonce};
use lockagent_shared::codec::{self, StoreRecord};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::error::PersistenceError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

type Entries = BTreeMap<String, Vec<u8>>;

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Where committed snapshots go
struct Sink {
    path: Option<PathBuf>,
    cipher: Aes256Gcm,
}

impl Sink {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, PersistenceError> {
        let nonce_bytes = rand::random::<[u8; NONCE_LEN]>();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| PersistenceError::Crypto("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
        if data.len() < NONCE_LEN {
            return Err(PersistenceError::Crypto("snapshot too short".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PersistenceError::Crypto("decryption failed".into()))
    }

    fn write(&self, entries: &Entries) -> Result<(), PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let records: Vec<StoreRecord> = entries
            .iter()
            .map(|(key, value)| StoreRecord::new(key.clone(), value.clone()))
            .collect();
        let plaintext = codec::encode_all(&records)?;
        let sealed = self.encrypt(&plaintext)?;

        let tmp = with_suffix(path, ".tmp");
        fs::write(&tmp, sealed)?;
        fs::rename(&tmp, path)?;
        debug!("[STORE] Wrote {} local entries to {}", entries.len(), path.display());
        Ok(())
    }

    fn read(&self) -> Result<Entries, PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(Entries::new());
        };
        if !path.exists() {
            return Ok(Entries::new());
        }

        let plaintext = self.decrypt(&fs::read(path)?)?;
        Ok(codec::decode_all(&plaintext)?
            .into_iter()
            .map(|record| (record.key, record.value))
            .collect())
    }
}

fn load_or_create_key(path: &Path) -> Result<[u8; KEY_LEN], PersistenceError> {
    let key_path = with_suffix(path, ".key");
    if key_path.exists() {
        let bytes = fs::read(&key_path)?;
        return bytes
            .try_into()
            .map_err(|_| PersistenceError::Crypto(format!("{} is not a {KEY_LEN}-byte key", key_path.display())));
    }

    let key = rand::random::<[u8; KEY_LEN]>();
    fs::write(&key_path, key)?;
    Ok(key)
}

/// Local key-value store with encrypted, atomic snapshots
pub struct EncryptedKvStore {
    sink: Sink,
    entries: Mutex<Entries>,
}

impl EncryptedKvStore {
    /// Open (or create) a file-backed store
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let key = load_or_create_key(path)?;
        let sink = Sink {
            path: Some(path.to_path_buf()),
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        };
        let entries = sink.read()?;

        Ok(Self {
            sink,
            entries: Mutex::new(entries),
        })
    }

    /// A store that never touches the disk
    pub fn in_memory() -> Self {
        let key = rand::random::<[u8; KEY_LEN]>();
        Self {
            sink: Sink {
                path: None,
                cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            },
            entries: Mutex::new(Entries::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        self.entries()
            .get(key)
            .map(|raw| serde_json::from_slice(raw))
            .transpose()
            .map_err(PersistenceError::from)
    }

    /// Write a single entry in its own transaction
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PersistenceError> {
        let mut txn = self.transaction();
        txn.put(key, value)?;
        txn.commit()
    }

    /// Begin a write transaction.
    ///
    /// The transaction holds the store lock until it is committed or dropped;
    /// readers never see a partially applied transaction. Dropping without
    /// `commit` discards the staged writes.
    pub fn transaction(&self) -> WriteTxn<'_> {
        WriteTxn {
            guard: self.entries(),
            sink: &self.sink,
            staged: BTreeMap::new(),
        }
    }
}

/// Scoped write transaction over [`EncryptedKvStore`]
pub struct WriteTxn<'a> {
    guard: MutexGuard<'a, Entries>,
    sink: &'a Sink,
    staged: BTreeMap<String, Vec<u8>>,
}

impl WriteTxn<'_> {
    /// Read through the staged writes
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        self.staged
            .get(key)
            .or_else(|| self.guard.get(key))
            .map(|raw| serde_json::from_slice(raw))
            .transpose()
            .map_err(PersistenceError::from)
    }

    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), PersistenceError> {
        let raw = serde_json::to_vec(value)?;
        self.staged.insert(key.to_string(), raw);
        Ok(())
    }

    /// Persist the staged writes; on error nothing is applied
    pub fn commit(mut self) -> Result<(), PersistenceError> {
        if self.staged.is_empty() {
            return Ok(());
        }

        let mut next = self.guard.clone();
        next.extend(std::mem::take(&mut self.staged));

        self.sink.write(&next)?;
        *self.guard = next;
        Ok(())
    }
}
