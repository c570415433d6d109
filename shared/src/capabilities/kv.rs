use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// Validated key into the device key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KvKey(String);

impl KvKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(key: &str) -> Result<(), KvError> {
        let reject = |reason: &str| {
            Err(KvError::InvalidKey {
                key: key.chars().take(50).collect(),
                reason: reason.to_string(),
            })
        };

        if key.trim().is_empty() {
            return reject("key cannot be empty");
        }
        if key.len() > MAX_KEY_LENGTH {
            return reject(&format!(
                "key exceeds maximum length of {MAX_KEY_LENGTH} bytes"
            ));
        }
        if key.chars().any(|c| c.is_control()) {
            return reject("key contains control characters");
        }
        Ok(())
    }
}

impl TryFrom<String> for KvKey {
    type Error = KvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<KvKey> for String {
    fn from(key: KvKey) -> Self {
        key.0
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?})")]
    Storage {
        code: StorageErrorCode,
        message: String,
    },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Busy,
    Locked,
    Corrupted,
    DiskFull,
    PermissionDenied,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

/// Synchronous string store; the offline persistence medium.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &KvKey) -> Result<Option<String>, KvError>;
    fn set(&self, key: &KvKey, value: &str) -> Result<(), KvError>;
    fn delete(&self, key: &KvKey) -> Result<(), KvError>;
}

fn check_size(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<KvKey, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<KvKey, String>>, KvError> {
        self.entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "memory store poisoned"))
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &KvKey, value: &str) -> Result<(), KvError> {
        check_size(value)?;
        self.lock()?.insert(key.clone(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &KvKey) -> Result<(), KvError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKv;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::Mutex;

    use super::{check_size, KeyValueStore, KvError, KvKey, StorageErrorCode};

    /// Key-value store in a single SQLite table.
    pub struct SqliteKv {
        conn: Mutex<Connection>,
    }

    fn map_err(e: rusqlite::Error) -> KvError {
        let code = match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                rusqlite::ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                rusqlite::ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                rusqlite::ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                rusqlite::ErrorCode::SystemIoFailure => StorageErrorCode::IoError,
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }

    impl SqliteKv {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            Self::init(Connection::open(path).map_err(map_err)?)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            Self::init(Connection::open_in_memory().map_err(map_err)?)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_entries (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                "#,
            )
            .map_err(map_err)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn with_conn<T>(
            &self,
            f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
        ) -> Result<T, KvError> {
            let conn = self
                .conn
                .lock()
                .map_err(|_| KvError::storage(StorageErrorCode::Locked, "connection poisoned"))?;
            f(&conn).map_err(map_err)
        }
    }

    impl KeyValueStore for SqliteKv {
        fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
            self.with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM kv_entries WHERE key = ?1",
                    params![key.as_str()],
                    |row| row.get(0),
                )
                .optional()
            })
        }

        fn set(&self, key: &KvKey, value: &str) -> Result<(), KvError> {
            check_size(value)?;
            let now = chrono::Utc::now().to_rfc3339();
            self.with_conn(|conn| {
                conn.execute(
                    r#"
                    INSERT INTO kv_entries (key, value, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                    params![key.as_str(), value, now],
                )
                .map(|_| ())
            })
        }

        fn delete(&self, key: &KvKey) -> Result<(), KvError> {
            self.with_conn(|conn| {
                conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key.as_str()])
                    .map(|_| ())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(matches!(KvKey::new(""), Err(KvError::InvalidKey { .. })));
        assert!(matches!(KvKey::new("   "), Err(KvError::InvalidKey { .. })));
        assert!(matches!(KvKey::new("a\0b"), Err(KvError::InvalidKey { .. })));
        assert!(KvKey::new("x".repeat(MAX_KEY_LENGTH + 1)).is_err());
        assert_eq!(KvKey::new("medicalData").unwrap().as_str(), "medicalData");
    }

    #[test]
    fn test_key_deserialization_validates() {
        assert!(serde_json::from_str::<KvKey>("\"\"").is_err());
        let key: KvKey = serde_json::from_str("\"missingRequests\"").unwrap();
        assert_eq!(key.as_str(), "missingRequests");
    }

    #[test]
    fn test_error_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
        assert!(!KvError::ValueTooLarge { size: 1, max: 0 }.is_retryable());
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let kv = MemoryKv::new();
        let key = KvKey::new("k").unwrap();
        assert_eq!(kv.get(&key).unwrap(), None);
        kv.set(&key, "v1").unwrap();
        kv.set(&key, "v2").unwrap();
        assert_eq!(kv.get(&key).unwrap().as_deref(), Some("v2"));
        kv.delete(&key).unwrap();
        assert_eq!(kv.get(&key).unwrap(), None);
    }

    #[test]
    fn test_value_size_limit() {
        let kv = MemoryKv::new();
        let key = KvKey::new("big").unwrap();
        let value = "x".repeat(MAX_VALUE_SIZE + 1);
        assert!(matches!(
            kv.set(&key, &value),
            Err(KvError::ValueTooLarge { .. })
        ));
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        let key = KvKey::new("prescriptionRequests").unwrap();

        {
            let kv = SqliteKv::open(&path).unwrap();
            kv.set(&key, "[]").unwrap();
            kv.set(&key, "[1]").unwrap();
        }

        let kv = SqliteKv::open(&path).unwrap();
        assert_eq!(kv.get(&key).unwrap().as_deref(), Some("[1]"));
        kv.delete(&key).unwrap();
        assert_eq!(kv.get(&key).unwrap(), None);
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_sqlite_in_memory() {
        let kv = SqliteKv::open_in_memory().unwrap();
        let key = KvKey::new("medicalData").unwrap();
        assert_eq!(kv.get(&key).unwrap(), None);
        kv.set(&key, "{}").unwrap();
        assert_eq!(kv.get(&key).unwrap().as_deref(), Some("{}"));
    }
}
