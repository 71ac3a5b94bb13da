//! file: core/src/cache.rs
//! description: content-addressed `.yakc` cache.
//!
//! Entries are keyed by the SHA-256 of the source text, the engine version
//! and the optional encryption key. The in-memory map is authoritative for
//! the process; the optional directory mirrors it as `<hash>.yakc` plus a
//! `<hash>.yakc.sha256` integrity file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::glob;
use log::{debug, warn};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::vm::bytecode::ENGINE_VERSION;

const BLOB_EXT: &str = "yakc";
const HASH_EXT: &str = "yakc.sha256";

pub struct CodeCache {
    dir: Option<PathBuf>,
    min_len: usize,
    memory: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl CodeCache {
    pub fn new(dir: Option<PathBuf>, min_len: usize) -> Self {
        CodeCache { dir, min_len, memory: Mutex::new(HashMap::new()) }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn min_len(&self) -> usize {
        self.min_len
    }

    /// Whether `source` is long enough to be worth caching.
    pub fn accepts(&self, source: &str) -> bool {
        source.len() >= self.min_len
    }

    pub fn key_for(source: &str, key: Option<&[u8; 16]>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update(ENGINE_VERSION.as_bytes());
        if let Some(key) = key {
            hasher.update(key);
        }
        hex::encode(hasher.finalize())
    }

    pub fn load(&self, source: &str, key: Option<&[u8; 16]>) -> Option<Vec<u8>> {
        if !self.accepts(source) {
            return None;
        }
        let hash = Self::key_for(source, key);
        if let Some(blob) = self.memory.lock().get(&hash) {
            debug!("yakc cache hit (memory) {}", hash);
            return Some(blob.as_ref().clone());
        }
        let blob = self.load_from_disk(&hash)?;
        debug!("yakc cache hit (disk) {}", hash);
        self.memory.lock().insert(hash, Arc::new(blob.clone()));
        Some(blob)
    }

    /// Returns false when the source is too short to cache. Re-storing an
    /// existing entry leaves it untouched.
    pub fn store(&self, source: &str, key: Option<&[u8; 16]>, blob: &[u8]) -> bool {
        if !self.accepts(source) {
            return false;
        }
        let hash = Self::key_for(source, key);
        {
            let mut memory = self.memory.lock();
            if memory.contains_key(&hash) {
                return true;
            }
            memory.insert(hash.clone(), Arc::new(blob.to_vec()));
        }
        if let Some(dir) = &self.dir {
            if let Err(e) = write_entry(dir, &hash, blob) {
                warn!("cannot persist yakc cache entry {}: {}", hash, e);
            }
        }
        true
    }

    /// Forgets one entry in memory and on disk.
    pub fn invalidate(&self, source: &str, key: Option<&[u8; 16]>) {
        let hash = Self::key_for(source, key);
        self.memory.lock().remove(&hash);
        if let Some(dir) = &self.dir {
            let _ = fs::remove_file(dir.join(format!("{}.{}", hash, BLOB_EXT)));
            let _ = fs::remove_file(dir.join(format!("{}.{}", hash, HASH_EXT)));
        }
    }

    /// Drops the memory map and removes every cache file on disk. Returns
    /// the number of files removed.
    pub fn clear(&self) -> usize {
        self.memory.lock().clear();
        let mut removed = 0;
        for path in self.disk_entries() {
            let sidecar = sidecar_of(&path);
            for p in [path, sidecar] {
                match fs::remove_file(&p) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("cannot remove {}: {}", p.display(), e),
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.memory.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `.yakc` blobs currently present in the cache directory.
    pub fn disk_entries(&self) -> Vec<PathBuf> {
        let Some(dir) = &self.dir else {
            return Vec::new();
        };
        let pattern = format!("{}/*.{}", glob::Pattern::escape(&dir.to_string_lossy()), BLOB_EXT);
        match glob(&pattern) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                warn!("bad cache pattern {}: {}", pattern, e);
                Vec::new()
            }
        }
    }

    fn load_from_disk(&self, hash: &str) -> Option<Vec<u8>> {
        let dir = self.dir.as_ref()?;
        let blob_path = dir.join(format!("{}.{}", hash, BLOB_EXT));
        let hash_path = dir.join(format!("{}.{}", hash, HASH_EXT));
        let blob = match fs::read(&blob_path) {
            Ok(b) => b,
            Err(_) => {
                debug!("yakc cache miss {}", hash);
                return None;
            }
        };
        let expected = fs::read_to_string(&hash_path).unwrap_or_default();
        if expected.trim() != digest(&blob) {
            warn!("yakc cache entry {} failed its integrity check; removing it", hash);
            let _ = fs::remove_file(&blob_path);
            let _ = fs::remove_file(&hash_path);
            return None;
        }
        Some(blob)
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("dir", &self.dir)
            .field("min_len", &self.min_len)
            .field("entries", &self.len())
            .finish()
    }
}

fn digest(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

fn sidecar_of(blob: &Path) -> PathBuf {
    let mut name = blob.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

fn write_entry(dir: &Path, hash: &str, blob: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(format!("{}.{}", hash, BLOB_EXT)), blob)?;
    fs::write(dir.join(format!("{}.{}", hash, HASH_EXT)), digest(blob))
}
