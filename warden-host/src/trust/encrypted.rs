//! Encrypted-at-rest trust store
//!
//! The whole store is one file:
//!
//! ```text
//! ┌──────┬──────────┬───────────┬──────────────────────────────────────┐
//! │ WTS1 │ salt(16) │ nonce(12) │ AES-256-GCM(msgpack {version, entries})│
//! └──────┴──────────┴───────────┴──────────────────────────────────────┘
//! ```
//!
//! The file key is derived per write from a 32-byte master key and a fresh
//! salt. The master key comes from `WARDEN_TRUST_KEY` (hex) or from a key
//! file generated next to the store on first use.
//!
//! Mutations are persisted by a background writer thread; bursts of writes
//! collapse into a single file rewrite. A file that cannot be decrypted or
//! decoded is moved aside and the store starts empty.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::JoinHandle;

use super::store::{DecisionMap, StoreError, TrustStore};

/// Environment variable holding a hex-encoded master key
pub const MASTER_KEY_ENV: &str = "WARDEN_TRUST_KEY";

const MAGIC: &[u8; 4] = b"WTS1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const FILE_VERSION: u32 = 1;
const KDF_CONTEXT: &str = "warden-host trust store v1 file key";

#[derive(Debug, Serialize, Deserialize)]
struct TrustFileData {
    version: u32,
    entries: Vec<(String, bool)>,
}

/// Generate a random 32-byte master key
pub fn generate_master_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, StoreError> {
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return Err(StoreError::InvalidKey("invalid hex string".to_string()));
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| StoreError::InvalidKey("invalid hex character".to_string()))
        })
        .collect()
}

/// Seals and opens trust store blobs
#[derive(Clone)]
pub struct TrustCipher {
    master: [u8; KEY_LEN],
}

impl TrustCipher {
    pub fn new(master: [u8; KEY_LEN]) -> Self {
        Self { master }
    }

    /// Parse a hex-encoded 32-byte master key
    pub fn from_hex(hex: &str) -> Result<Self, StoreError> {
        let bytes = hex_to_bytes(hex.trim())?;
        let master: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            StoreError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, b.len()))
        })?;
        Ok(Self::new(master))
    }

    /// Master key from `WARDEN_TRUST_KEY`, else from `key_path`
    ///
    /// A missing key file is generated with owner-only permissions.
    pub fn from_env_or_file(key_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Ok(hex) = std::env::var(MASTER_KEY_ENV) {
            return Self::from_hex(&hex);
        }

        let key_path = key_path.as_ref();
        if key_path.exists() {
            return Self::from_hex(&fs::read_to_string(key_path)?);
        }

        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let master = generate_master_key();
        fs::write(key_path, bytes_to_hex(&master))?;
        restrict_permissions(key_path)?;
        tracing::info!(path = %key_path.display(), "Generated trust store key");
        Ok(Self::new(master))
    }

    fn file_key(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut material = Vec::with_capacity(KEY_LEN + salt.len());
        material.extend_from_slice(&self.master);
        material.extend_from_slice(salt);
        blake3::derive_key(KDF_CONTEXT, &material)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = self.file_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StoreError::Corrupt("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(MAGIC.len() + SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        let header = MAGIC.len() + SALT_LEN + NONCE_LEN;
        if blob.len() < header || &blob[..MAGIC.len()] != MAGIC {
            return Err(StoreError::Corrupt("unrecognized file header".to_string()));
        }

        let salt = &blob[MAGIC.len()..MAGIC.len() + SALT_LEN];
        let nonce = &blob[MAGIC.len() + SALT_LEN..header];
        let key = self.file_key(salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(nonce), &blob[header..])
            .map_err(|_| StoreError::Corrupt("authentication failed".to_string()))
    }
}

impl std::fmt::Debug for TrustCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustCipher").finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// ============================================================================
// Store
// ============================================================================

enum WriterMsg {
    Dirty,
    Shutdown,
}

struct Shared {
    path: PathBuf,
    cipher: TrustCipher,
    data: RwLock<DecisionMap>,
    loaded: OnceLock<()>,
    generation: AtomicU64,
    /// Generation last written to disk; also serializes file writes
    persisted: Mutex<u64>,
}

impl Shared {
    fn ensure_loaded(&self) {
        self.loaded.get_or_init(|| {
            let map = self.load();
            *self.data.write().unwrap_or_else(|e| e.into_inner()) = map;
        });
    }

    fn load(&self) -> DecisionMap {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "No trust store yet, starting empty");
            return DecisionMap::default();
        }

        match self.read_file() {
            Ok(entries) => {
                tracing::debug!(
                    path = %self.path.display(),
                    count = entries.len(),
                    "Loaded trust store"
                );
                DecisionMap::from_entries(entries)
            }
            Err(e) => {
                let aside = corrupt_path(&self.path);
                tracing::warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Trust store unreadable, starting empty"
                );
                if let Err(e) = fs::rename(&self.path, &aside) {
                    tracing::warn!(error = %e, "Failed to move corrupt trust store aside");
                }
                DecisionMap::default()
            }
        }
    }

    fn read_file(&self) -> Result<Vec<(String, bool)>, StoreError> {
        let blob = fs::read(&self.path)?;
        let plaintext = self.cipher.open(&blob)?;
        let data: TrustFileData = rmp_serde::from_slice(&plaintext)?;
        if data.version != FILE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported version {}",
                data.version
            )));
        }
        Ok(data.entries)
    }

    fn mark_dirty(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn persist_if_dirty(&self) -> Result<(), StoreError> {
        let mut persisted = self.persisted.lock().unwrap_or_else(|e| e.into_inner());
        let generation = self.generation.load(Ordering::SeqCst);
        if *persisted == generation {
            return Ok(());
        }

        let entries = self
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ordered();
        self.write_file(entries)?;
        *persisted = generation;
        Ok(())
    }

    fn write_file(&self, entries: Vec<(String, bool)>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let count = entries.len();
        let plaintext = rmp_serde::to_vec(&TrustFileData {
            version: FILE_VERSION,
            entries,
        })?;
        let blob = self.cipher.seal(&plaintext)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, blob)?;
        restrict_permissions(&tmp)?;
        fs::rename(&tmp, &self.path)?;

        tracing::trace!(path = %self.path.display(), count, "Persisted trust store");
        Ok(())
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

fn run_writer(shared: Arc<Shared>, rx: Receiver<WriterMsg>) {
    while let Ok(msg) = rx.recv() {
        let mut shutdown = matches!(msg, WriterMsg::Shutdown);
        while let Ok(next) = rx.try_recv() {
            shutdown |= matches!(next, WriterMsg::Shutdown);
        }

        if let Err(e) = shared.persist_if_dirty() {
            tracing::warn!(
                path = %shared.path.display(),
                error = %e,
                "Failed to persist trust store"
            );
        }

        if shutdown {
            break;
        }
    }
}

/// Trust store persisted as a single encrypted file
pub struct EncryptedFileTrustStore {
    shared: Arc<Shared>,
    tx: Mutex<Sender<WriterMsg>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl EncryptedFileTrustStore {
    /// Store at `path`, sealed with `cipher`
    ///
    /// Nothing is read until first use.
    pub fn new(path: impl AsRef<Path>, cipher: TrustCipher) -> Result<Self, StoreError> {
        let shared = Arc::new(Shared {
            path: path.as_ref().to_path_buf(),
            cipher,
            data: RwLock::new(DecisionMap::default()),
            loaded: OnceLock::new(),
            generation: AtomicU64::new(0),
            persisted: Mutex::new(0),
        });

        let (tx, rx) = mpsc::channel();
        let writer_shared = Arc::clone(&shared);
        let writer = std::thread::Builder::new()
            .name("warden-trust-writer".to_string())
            .spawn(move || run_writer(writer_shared, rx))?;

        Ok(Self {
            shared,
            tx: Mutex::new(tx),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Store at `path` with the master key from the environment or `key_path`
    pub fn open(path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let cipher = TrustCipher::from_env_or_file(key_path)?;
        Self::new(path, cipher)
    }

    /// Store in the platform data directory for an application
    pub fn default_for_app(app_name: &str) -> Result<Self, StoreError> {
        let dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(app_name);
        Self::open(dir.join("trust.bin"), dir.join("trust.key"))
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Where an unreadable store file is moved to
    pub fn corrupt_path(&self) -> PathBuf {
        corrupt_path(&self.shared.path)
    }

    fn mutated(&self) {
        self.shared.mark_dirty();
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if tx.send(WriterMsg::Dirty).is_err() {
            tracing::warn!("Trust store writer is gone, decision kept in memory only");
        }
    }
}

impl TrustStore for EncryptedFileTrustStore {
    fn init(&self) -> Result<(), StoreError> {
        self.shared.ensure_loaded();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<bool>, StoreError> {
        self.shared.ensure_loaded();
        Ok(self
            .shared
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key))
    }

    fn set(&self, key: &str, allowed: bool) -> Result<(), StoreError> {
        self.shared.ensure_loaded();
        self.shared
            .data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), allowed);
        self.mutated();
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.shared.ensure_loaded();
        let removed = self
            .shared
            .data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        if removed {
            self.mutated();
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, bool)>, StoreError> {
        self.shared.ensure_loaded();
        Ok(self
            .shared
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ordered())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.shared.ensure_loaded();
        self.shared
            .data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.mutated();
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.shared.ensure_loaded();
        self.shared.persist_if_dirty()
    }
}

impl Drop for EncryptedFileTrustStore {
    fn drop(&mut self) {
        let _ = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(WriterMsg::Shutdown);
        if let Some(handle) = self
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for EncryptedFileTrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileTrustStore")
            .field("path", &self.shared.path)
            .finish()
    }
}
