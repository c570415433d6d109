//! Offline persistence: each collection is one JSON document under a fixed
//! key in the device key-value store.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::advice::default_advice;
use crate::capabilities::{KeyValueStore, KvError, KvKey};
use crate::model::{AdviceMap, Collections, MissingMedicationRequest, PrescriptionRequest};

pub const PRESCRIPTIONS_KEY: &str = "prescriptionRequests";
pub const MISSING_KEY: &str = "missingRequests";
pub const ADVICE_KEY: &str = "medicalData";

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("failed to encode '{key}': {message}")]
    Encode { key: &'static str, message: String },
}

impl LocalStoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LocalStoreError::Kv(e) => e.is_retryable(),
            LocalStoreError::Encode { .. } => false,
        }
    }
}

#[derive(Clone)]
pub struct LocalStore {
    kv: Arc<dyn KeyValueStore>,
}

impl LocalStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Reads all three collections. Absent or unreadable documents fall back
    /// to empty lists, and to the built-in advice set for the advice map.
    #[must_use]
    pub fn load(&self) -> Collections {
        Collections {
            prescriptions: self.read(PRESCRIPTIONS_KEY).unwrap_or_default(),
            missing: self.read(MISSING_KEY).unwrap_or_default(),
            advice: self.read(ADVICE_KEY).unwrap_or_else(default_advice),
        }
    }

    pub fn save_prescriptions(
        &self,
        prescriptions: &[PrescriptionRequest],
    ) -> Result<(), LocalStoreError> {
        self.write(PRESCRIPTIONS_KEY, &prescriptions)
    }

    pub fn save_missing(&self, missing: &[MissingMedicationRequest]) -> Result<(), LocalStoreError> {
        self.write(MISSING_KEY, &missing)
    }

    pub fn save_advice(&self, advice: &AdviceMap) -> Result<(), LocalStoreError> {
        self.write(ADVICE_KEY, advice)
    }

    fn read<T: DeserializeOwned>(&self, key: &'static str) -> Option<T> {
        let kv_key = KvKey::new(key).ok()?;
        let raw = match self.kv.get(&kv_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read offline collection");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Ignoring corrupted offline collection");
                None
            }
        }
    }

    fn write<T: Serialize + ?Sized>(&self, key: &'static str, value: &T) -> Result<(), LocalStoreError> {
        let raw = serde_json::to_string(value).map_err(|e| LocalStoreError::Encode {
            key,
            message: e.to_string(),
        })?;
        self.kv.set(&KvKey::new(key)?, &raw)?;
        debug!(key, bytes = raw.len(), "Persisted offline collection");
        Ok(())
    }
}
