//! Key-value backends for durable checkpoint stores
//!
//! Keys are `:`-separated paths such as `rule1:cp:42`. Several checkpoint
//! stores share one backend, each under its own rule namespace.

use super::StoreError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

/// Trait for key-value storage backends
pub trait KvBackend: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a key. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, sorted by key. `prefix`
    /// must end with `:`.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Delete every key under `<namespace>:`.
    fn clear_namespace(&self, namespace: &str) -> Result<(), StoreError>;

    /// Flush all pending writes to disk
    fn flush(&self) -> Result<(), StoreError>;
}

/// In-memory backend. Sharing one instance between store instances
/// simulates a process restart in tests.
#[derive(Default)]
pub struct MemoryKv {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvBackend for MemoryKv {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        let prefix = format!("{}:", namespace);
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(()) // No-op for memory store
    }
}

/// File-system backend
///
/// Stores key-value pairs as files in a directory. Keys containing ":"
/// are mapped to subdirectories (e.g., "rule1:cp:7" → "rule1/cp/7").
/// Writes are atomic via temp file + rename.
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    /// Open or create a file-based backend at the given directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        info!("Opened file state backend at {}", dir.display());
        Ok(Self { dir })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        // Map ":" separators to directory separators
        let path_str = key.replace(':', std::path::MAIN_SEPARATOR_STR);
        self.dir.join(path_str)
    }
}

impl KvBackend for FileKv {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.key_to_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);
        std::fs::write(&tmp_path, value).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.key_to_path(key);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.key_to_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let Some(dir_key) = prefix.strip_suffix(':') else {
            return Err(StoreError::Io(format!(
                "scan prefix '{}' must end with ':'",
                prefix
            )));
        };
        let dir = self.key_to_path(dir_key);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            let is_file = entry
                .file_type()
                .map_err(|e| StoreError::Io(e.to_string()))?
                .is_file();
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_file || name.ends_with(".tmp") {
                continue;
            }
            let data = std::fs::read(entry.path()).map_err(|e| StoreError::Io(e.to_string()))?;
            found.push((format!("{}{}", prefix, name), data));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    fn clear_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        match std::fs::remove_dir_all(self.key_to_path(namespace)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(()) // File writes are already flushed on close
    }
}

/// RocksDB-based backend
#[cfg(feature = "persistence")]
pub struct RocksDbKv {
    db: rocksdb::DB,
}

#[cfg(feature = "persistence")]
impl RocksDbKv {
    /// Open or create a RocksDB backend at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = rocksdb::DB::open(&opts, path).map_err(|e| StoreError::Io(e.to_string()))?;

        info!("Opened RocksDB state backend");
        Ok(Self { db })
    }
}

#[cfg(feature = "persistence")]
impl KvBackend for RocksDbKv {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db
            .delete(key.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut found = Vec::new();
        for item in self.db.prefix_iterator(prefix.as_bytes()) {
            let (key, value) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            // prefix_iterator seeks to the prefix but does not stop after it
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            found.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(found)
    }

    fn clear_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        let prefix = format!("{}:", namespace);
        for (key, _) in self.scan(&prefix)? {
            self.delete(&key)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(kv: &dyn KvBackend) {
        kv.put("r1:cp:1", b"one").unwrap();
        kv.put("r1:cp:2", b"two").unwrap();
        kv.put("r1:checkpoints", b"[1]").unwrap();
        kv.put("r2:cp:1", b"other").unwrap();

        assert_eq!(kv.get("r1:cp:1").unwrap(), Some(b"one".to_vec()));
        assert!(kv.get("r1:cp:9").unwrap().is_none());

        let scanned = kv.scan("r1:cp:").unwrap();
        let keys: Vec<&str> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["r1:cp:1", "r1:cp:2"]);

        kv.delete("r1:cp:1").unwrap();
        kv.delete("r1:cp:1").unwrap();
        assert!(kv.get("r1:cp:1").unwrap().is_none());

        kv.clear_namespace("r1").unwrap();
        assert!(kv.get("r1:checkpoints").unwrap().is_none());
        assert!(kv.scan("r1:cp:").unwrap().is_empty());
        assert_eq!(kv.get("r2:cp:1").unwrap(), Some(b"other".to_vec()));
        kv.flush().unwrap();
    }

    #[test]
    fn test_memory_kv() {
        exercise(&MemoryKv::new());
    }

    #[test]
    fn test_file_kv() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileKv::open(dir.path()).unwrap());
    }

    #[test]
    fn test_file_kv_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::open(dir.path()).unwrap();

        kv.put("r:cp:1", b"version 1").unwrap();
        kv.put("r:cp:1", b"version 2").unwrap();
        assert_eq!(kv.get("r:cp:1").unwrap(), Some(b"version 2".to_vec()));

        for entry in std::fs::read_dir(dir.path().join("r").join("cp")).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.ends_with(".tmp"), "tmp file left behind: {}", name);
        }
    }

    #[test]
    fn test_file_kv_scan_requires_separator() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::open(dir.path()).unwrap();
        assert!(kv.scan("r:cp").is_err());
        assert!(kv.scan("missing:").unwrap().is_empty());
    }

    #[cfg(feature = "persistence")]
    #[test]
    fn test_rocksdb_kv() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&RocksDbKv::open(dir.path()).unwrap());
    }
}
