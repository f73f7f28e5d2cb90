//! On-disk wallet store: a single JSON object of arbitrary keyed values,
//! written to one file, mirroring the legacy `WalletStorage`'s `get`/`put`/
//! `write` contract. Every `put` persists immediately — there is no
//! write-behind buffering, matching the original's `save=True` default.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// A JSON-object-backed key/value store persisted to a single file.
pub struct WalletStore {
    path: PathBuf,
    data: Map<String, Value>,
    /// Whether the file existed (and was successfully parsed) when opened.
    pub file_exists: bool,
}

impl WalletStore {
    /// Opens (or prepares to create) the store at `path`. A missing file is
    /// not an error — it means a fresh wallet is about to be created. An
    /// existing file that fails to parse as a JSON object is `StoreCorrupt`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let value: Value = serde_json::from_str(&contents).map_err(|_| Error::StoreCorrupt)?;
                let data = value.as_object().cloned().ok_or(Error::StoreCorrupt)?;
                Ok(WalletStore { path, data, file_exists: true })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(WalletStore { path, data: Map::new(), file_exists: false })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and deserializes `key`, or `None` if absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data.get(key).cloned().and_then(|v| serde_json::from_value(v).ok())
    }

    /// Reads `key`, falling back to `default` if absent or undeserializable.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Sets `key` and writes the whole store to disk.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), Error> {
        self.put_no_save(key, value)?;
        self.write()
    }

    /// Sets `key` without persisting; callers that issue a batch of `put`s
    /// can follow up with a single `write()`.
    pub fn put_no_save<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), Error> {
        self.data.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<(), Error> {
        self.data.remove(key);
        self.write()
    }

    /// Serializes the whole store and writes it to `path`, then restricts
    /// permissions to owner read/write only (best-effort outside unix).
    pub fn write(&mut self) -> Result<(), Error> {
        let serialized = serde_json::to_string(&Value::Object(self.data.clone()))?;
        fs::write(&self.path, serialized)?;
        self.file_exists = true;
        restrict_permissions(&self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    let permissions = fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_opens_empty_and_unmarked() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::open(dir.path().join("wallet.dat")).unwrap();
        assert!(!store.file_exists);
        assert_eq!(store.get::<String>("seed"), None);
    }

    #[test]
    fn put_then_reopen_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.dat");
        {
            let mut store = WalletStore::open(&path).unwrap();
            store.put("gap_limit", &5u32).unwrap();
            store.put("use_change", &true).unwrap();
        }
        let reopened = WalletStore::open(&path).unwrap();
        assert!(reopened.file_exists);
        assert_eq!(reopened.get::<u32>("gap_limit"), Some(5));
        assert_eq!(reopened.get::<bool>("use_change"), Some(true));
    }

    #[test]
    fn corrupt_file_is_reported_as_store_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.dat");
        fs::write(&path, "not json at all {").unwrap();
        let err = WalletStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::StoreCorrupt));
    }

    #[test]
    fn get_or_falls_back_on_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::open(dir.path().join("wallet.dat")).unwrap();
        assert_eq!(store.get_or("gap_limit", 5u32), 5);
    }

    #[cfg(unix)]
    #[test]
    fn written_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.dat");
        let mut store = WalletStore::open(&path).unwrap();
        store.put("seed", &"abc").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
