//! The persistence seam. A session picks exactly one implementation at
//! startup; callers never branch on mode.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::advice::AdviceKey;
use crate::capabilities::RemoteError;
use crate::event::{Event, RequestId};
use crate::ingest::encode_data_url;
use crate::local::LocalStore;
use crate::model::{
    AdviceMap, AttachedFile, Collections, ConditionAdvice, ConnectionMode,
    MissingMedicationRequest, PrescriptionRequest, RecordKind, RequestStatus,
};
use crate::remote::RemoteStore;
use crate::PersistError;

/// Every mutation answers with the event that brings session state up to
/// date. Implementations own whatever consistency their store needs; callers
/// hold no locks.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    fn mode(&self) -> ConnectionMode;

    async fn load(&self) -> Result<Collections, PersistError>;

    async fn insert_prescription(&self, record: PrescriptionRequest) -> Result<Event, PersistError>;

    async fn insert_missing(&self, record: MissingMedicationRequest) -> Result<Event, PersistError>;

    async fn update_status(
        &self,
        kind: RecordKind,
        id: &RequestId,
        status: RequestStatus,
    ) -> Result<Event, PersistError>;

    async fn delete_request(&self, kind: RecordKind, id: &RequestId) -> Result<Event, PersistError>;

    async fn insert_advice(
        &self,
        key: &AdviceKey,
        advice: ConditionAdvice,
    ) -> Result<Event, PersistError>;

    async fn update_advice(
        &self,
        key: &AdviceKey,
        advice: ConditionAdvice,
    ) -> Result<Event, PersistError>;

    async fn delete_advice(&self, key: &AdviceKey) -> Result<Event, PersistError>;

    /// Turns an attached file into a storable reference, or `None` when
    /// the file cannot be stored.
    async fn store_image(&self, object_name: &str, file: &AttachedFile) -> Option<String>;
}

// --- Remote ---

pub struct RemoteBackend {
    store: RemoteStore,
}

impl RemoteBackend {
    pub fn new(store: RemoteStore) -> Self {
        Self { store }
    }

    /// Logs a failed write and re-fetches regardless.
    async fn settle(
        &self,
        operation: &'static str,
        result: Result<(), RemoteError>,
    ) -> Result<Event, PersistError> {
        if let Err(e) = result {
            warn!(operation, error = %e, retryable = e.is_retryable(), "Remote write failed");
        }
        Ok(Event::Refreshed(self.store.fetch_all().await?))
    }
}

#[async_trait]
impl PersistenceBackend for RemoteBackend {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Online
    }

    async fn load(&self) -> Result<Collections, PersistError> {
        Ok(self.store.fetch_all().await?)
    }

    async fn insert_prescription(&self, record: PrescriptionRequest) -> Result<Event, PersistError> {
        let result = self.store.insert_prescription(&record).await;
        self.settle("insert_prescription", result).await
    }

    async fn insert_missing(&self, record: MissingMedicationRequest) -> Result<Event, PersistError> {
        let result = self.store.insert_missing(&record).await;
        self.settle("insert_missing", result).await
    }

    async fn update_status(
        &self,
        kind: RecordKind,
        id: &RequestId,
        status: RequestStatus,
    ) -> Result<Event, PersistError> {
        let result = self.store.update_status(kind, id, status).await;
        self.settle("update_status", result).await
    }

    async fn delete_request(&self, kind: RecordKind, id: &RequestId) -> Result<Event, PersistError> {
        let result = self.store.delete_request(kind, id).await;
        self.settle("delete_request", result).await
    }

    async fn insert_advice(
        &self,
        key: &AdviceKey,
        advice: ConditionAdvice,
    ) -> Result<Event, PersistError> {
        let result = self.store.insert_advice(key, &advice).await;
        self.settle("insert_advice", result).await
    }

    async fn update_advice(
        &self,
        key: &AdviceKey,
        advice: ConditionAdvice,
    ) -> Result<Event, PersistError> {
        let result = self.store.update_advice(key, &advice).await;
        self.settle("update_advice", result).await
    }

    async fn delete_advice(&self, key: &AdviceKey) -> Result<Event, PersistError> {
        let result = self.store.delete_advice(key).await;
        self.settle("delete_advice", result).await
    }

    async fn store_image(&self, object_name: &str, file: &AttachedFile) -> Option<String> {
        match self.store.upload_image(object_name, file).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(object = object_name, error = %e, "Image upload failed, dropping image");
                None
            }
        }
    }
}

// --- Local ---

/// Offline backend. Every write derives the next collection from the last
/// persisted one under a short synchronous lock, saves it, and only then
/// adopts it.
pub struct LocalBackend {
    store: LocalStore,
    persisted: Mutex<Option<Collections>>,
}

impl LocalBackend {
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            persisted: Mutex::new(None),
        }
    }

    fn persisted(&self) -> MutexGuard<'_, Option<Collections>> {
        self.persisted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_prescriptions(
        &self,
        edit: impl FnOnce(&mut Vec<PrescriptionRequest>),
    ) -> Result<Event, PersistError> {
        let mut persisted = self.persisted();
        let current = persisted.get_or_insert_with(|| self.store.load());
        let mut next = current.prescriptions.clone();
        edit(&mut next);
        self.store.save_prescriptions(&next)?;
        current.prescriptions.clone_from(&next);
        Ok(Event::PrescriptionsWritten(next))
    }

    fn write_missing(
        &self,
        edit: impl FnOnce(&mut Vec<MissingMedicationRequest>),
    ) -> Result<Event, PersistError> {
        let mut persisted = self.persisted();
        let current = persisted.get_or_insert_with(|| self.store.load());
        let mut next = current.missing.clone();
        edit(&mut next);
        self.store.save_missing(&next)?;
        current.missing.clone_from(&next);
        Ok(Event::MissingWritten(next))
    }

    fn write_advice(&self, edit: impl FnOnce(&mut AdviceMap)) -> Result<Event, PersistError> {
        let mut persisted = self.persisted();
        let current = persisted.get_or_insert_with(|| self.store.load());
        let mut next = current.advice.clone();
        edit(&mut next);
        self.store.save_advice(&next)?;
        current.advice.clone_from(&next);
        Ok(Event::AdviceWritten(next))
    }
}

#[async_trait]
impl PersistenceBackend for LocalBackend {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Offline
    }

    async fn load(&self) -> Result<Collections, PersistError> {
        let collections = self.store.load();
        *self.persisted() = Some(collections.clone());
        Ok(collections)
    }

    async fn insert_prescription(&self, record: PrescriptionRequest) -> Result<Event, PersistError> {
        self.write_prescriptions(|all| all.insert(0, record))
    }

    async fn insert_missing(&self, record: MissingMedicationRequest) -> Result<Event, PersistError> {
        self.write_missing(|all| all.insert(0, record))
    }

    async fn update_status(
        &self,
        kind: RecordKind,
        id: &RequestId,
        status: RequestStatus,
    ) -> Result<Event, PersistError> {
        match kind {
            RecordKind::Prescription => self.write_prescriptions(|all| {
                all.iter_mut()
                    .filter(|r| &r.id == id)
                    .for_each(|r| r.status = status);
            }),
            RecordKind::Missing => self.write_missing(|all| {
                all.iter_mut()
                    .filter(|r| &r.id == id)
                    .for_each(|r| r.status = status);
            }),
        }
    }

    async fn delete_request(&self, kind: RecordKind, id: &RequestId) -> Result<Event, PersistError> {
        match kind {
            RecordKind::Prescription => self.write_prescriptions(|all| all.retain(|r| &r.id != id)),
            RecordKind::Missing => self.write_missing(|all| all.retain(|r| &r.id != id)),
        }
    }

    async fn insert_advice(
        &self,
        key: &AdviceKey,
        advice: ConditionAdvice,
    ) -> Result<Event, PersistError> {
        self.write_advice(|map| {
            map.insert(key.clone(), advice);
        })
    }

    async fn update_advice(
        &self,
        key: &AdviceKey,
        advice: ConditionAdvice,
    ) -> Result<Event, PersistError> {
        self.insert_advice(key, advice).await
    }

    async fn delete_advice(&self, key: &AdviceKey) -> Result<Event, PersistError> {
        self.write_advice(|map| {
            map.remove(key);
        })
    }

    async fn store_image(&self, object_name: &str, file: &AttachedFile) -> Option<String> {
        debug!(object = object_name, bytes = file.len(), "Inlining image as data URL");
        Some(encode_data_url(file))
    }
}

/// Builds the backend matching a settled mode.
pub fn for_mode(
    mode: ConnectionMode,
    remote: Option<RemoteStore>,
    local: LocalStore,
) -> Arc<dyn PersistenceBackend> {
    match (mode, remote) {
        (ConnectionMode::Online, Some(remote)) => Arc::new(RemoteBackend::new(remote)),
        _ => Arc::new(LocalBackend::new(local)),
    }
}
