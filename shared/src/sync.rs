//! Session orchestration: the coordinator every mutation goes through, the
//! realtime listener feeding it change notices, and the session that wires
//! probe, backend and listener together.

use secrecy::SecretString;
use std::sync::Arc;
use crux_core::Core;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::advice::{AdviceError, AdviceKey};
use crate::app::{App, Capabilities, Effect, ViewModel};
use crate::auth::{AuthError, AuthProvider};
use crate::backend::{self, PersistenceBackend};
use crate::capabilities::{ChangeSource, KeyValueStore, RemoteTables, Subscription, Table};
use crate::event::{Event, RequestId};
use crate::ingest::ingest_medications;
use crate::local::LocalStore;
use crate::model::{
    ConditionAdvice, ConnectionMode, MissingMedicationRequest, PrescriptionSubmission,
    RecordKind, StatusChange,
};
use crate::probe::probe;
use crate::remote::RemoteStore;
use crate::PersistError;

/// Outcome of the yes/no prompt shown before a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Declined,
}

/// Runs the app core for one session. Backend calls are made without any
/// coordinator-side lock; results come back as events.
pub struct SyncCoordinator {
    backend: Arc<dyn PersistenceBackend>,
    core: Core<Effect, App>,
    state: watch::Sender<ViewModel>,
}

impl SyncCoordinator {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        let core: Core<Effect, App> = Core::new::<Capabilities>();
        let (state, _) = watch::channel(core.view());
        let coordinator = Self {
            backend,
            core,
            state,
        };
        coordinator.apply(Event::ModeResolved(coordinator.backend.mode()));
        coordinator
    }

    pub fn mode(&self) -> ConnectionMode {
        self.backend.mode()
    }

    /// Receiver that observes every render; readers see the latest view
    /// only.
    pub fn subscribe(&self) -> watch::Receiver<ViewModel> {
        self.state.subscribe()
    }

    pub fn view(&self) -> ViewModel {
        self.state.borrow().clone()
    }

    fn has_advice(&self, key: &AdviceKey) -> bool {
        self.state.borrow().advice.contains_key(key)
    }

    fn apply(&self, event: Event) {
        for effect in self.core.process_event(event) {
            match effect {
                Effect::Render(_) => {
                    self.state.send_replace(self.core.view());
                }
            }
        }
    }

    fn settle(&self, operation: &'static str, result: Result<Event, PersistError>) {
        match result {
            Ok(event) => self.apply(event),
            Err(e) => warn!(
                operation,
                error = %e,
                retryable = e.is_retryable(),
                "Persistence failed, state left unchanged"
            ),
        }
    }

    /// Applies an event. A change notice additionally triggers a re-fetch.
    pub async fn dispatch(&self, event: Event) {
        let refetch = matches!(event, Event::RemoteChanged { .. });
        self.apply(event);
        if refetch {
            self.refresh().await;
        }
    }

    #[instrument(skip(self), fields(mode = %self.mode()))]
    pub async fn refresh(&self) {
        match self.backend.load().await {
            Ok(collections) => self.apply(Event::Refreshed(collections)),
            Err(e) => warn!(error = %e, "Refresh failed, keeping previous state"),
        }
    }

    /// Ingests every medication image, then persists the request.
    #[instrument(skip_all, fields(id = %submission.id, medications = submission.medications.len()))]
    pub async fn submit_prescription(&self, mut submission: PrescriptionSubmission) {
        let drafts = std::mem::take(&mut submission.medications);
        let items =
            ingest_medications(self.backend.as_ref(), submission.submission_date, drafts).await;
        let record = submission.into_request(items);

        let result = self.backend.insert_prescription(record).await;
        self.settle("submit_prescription", result);
    }

    #[instrument(skip_all, fields(id = %request.id))]
    pub async fn submit_missing(&self, request: MissingMedicationRequest) {
        let result = self.backend.insert_missing(request).await;
        self.settle("submit_missing", result);
    }

    /// No transition guard: a closed request can be closed again.
    #[instrument(skip(self))]
    pub async fn update_status(&self, kind: RecordKind, id: &RequestId, change: StatusChange) {
        let result = self.backend.update_status(kind, id, change.into()).await;
        self.settle("update_status", result);
    }

    /// Returns whether a deletion was issued.
    #[instrument(skip(self))]
    pub async fn delete(
        &self,
        kind: RecordKind,
        id: &RequestId,
        confirmation: Confirmation,
    ) -> bool {
        if confirmation == Confirmation::Declined {
            debug!("Deletion declined");
            return false;
        }
        let result = self.backend.delete_request(kind, id).await;
        self.settle("delete_request", result);
        true
    }

    /// Creates (`is_new`) or replaces an advice entry under the normalized
    /// key. Key problems are reported; store failures are not.
    #[instrument(skip(self, advice))]
    pub async fn upsert_advice(
        &self,
        raw_key: &str,
        advice: ConditionAdvice,
        is_new: bool,
    ) -> Result<AdviceKey, AdviceError> {
        let key = AdviceKey::normalize(raw_key)?;

        let exists = self.has_advice(&key);
        if is_new && exists {
            return Err(AdviceError::DuplicateKey { key });
        }
        if !is_new && !exists {
            return Err(AdviceError::UnknownKey { key });
        }

        let result = if is_new {
            self.backend.insert_advice(&key, advice).await
        } else {
            self.backend.update_advice(&key, advice).await
        };
        self.settle("upsert_advice", result);
        Ok(key)
    }

    #[instrument(skip(self))]
    pub async fn delete_advice(&self, key: &AdviceKey) -> Result<(), AdviceError> {
        if !self.has_advice(key) {
            return Err(AdviceError::UnknownKey { key: key.clone() });
        }
        let result = self.backend.delete_advice(key).await;
        self.settle("delete_advice", result);
        Ok(())
    }

    pub fn select_advice(&self, key: Option<AdviceKey>) {
        self.apply(Event::AdviceSelected(key));
    }

    pub fn sign_in(
        &self,
        auth: &dyn AuthProvider,
        passphrase: &SecretString,
    ) -> Result<(), AuthError> {
        auth.verify(passphrase)?;
        info!("Admin signed in");
        self.apply(Event::AdminSignedIn);
        Ok(())
    }

    pub fn sign_out(&self) {
        self.apply(Event::AdminSignedOut);
    }
}

// --- Realtime listener ---

/// Turns change notices into `RemoteChanged` events, one at a time.
pub struct RealtimeListener;

impl RealtimeListener {
    pub fn spawn(mut subscription: Subscription, coordinator: Arc<SyncCoordinator>) -> ListenerHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    notice = subscription.next() => match notice {
                        Some(notice) => {
                            debug!(table = %notice.table, kind = ?notice.kind, "Remote change");
                            coordinator
                                .dispatch(Event::RemoteChanged { table: notice.table })
                                .await;
                        }
                        None => {
                            warn!("Change feed ended");
                            break;
                        }
                    },
                }
            }
            subscription.close().await;
        });

        ListenerHandle {
            task: Some(task),
            stop: Some(stop_tx),
        }
    }
}

/// Owns the listener task. Dropping it aborts the task and releases the
/// subscription; `shutdown` does so gracefully.
pub struct ListenerHandle {
    task: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

impl ListenerHandle {
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// --- Session ---

/// Collaborators a session is assembled from.
pub struct SessionParts {
    pub remote: Option<Arc<dyn RemoteTables>>,
    pub changes: Option<Arc<dyn ChangeSource>>,
    pub kv: Arc<dyn KeyValueStore>,
    pub bucket: String,
}

pub struct Session {
    coordinator: Arc<SyncCoordinator>,
    listener: Option<ListenerHandle>,
}

impl Session {
    /// Probes once, commits to a backend for the lifetime of the session,
    /// loads the initial state and, when online, starts the listener.
    #[instrument(skip_all)]
    pub async fn start(parts: SessionParts) -> Self {
        let mode = probe(parts.remote.as_deref()).await;

        let remote = parts
            .remote
            .map(|tables| RemoteStore::new(tables, parts.bucket.clone()));
        let backend = backend::for_mode(mode, remote, LocalStore::new(parts.kv));
        let coordinator = Arc::new(SyncCoordinator::new(backend));

        let listener = match (coordinator.mode(), parts.changes) {
            (ConnectionMode::Online, Some(changes)) => match changes.subscribe(&Table::ALL).await {
                Ok(subscription) => Some(RealtimeListener::spawn(subscription, coordinator.clone())),
                Err(e) => {
                    warn!(error = %e, "Realtime unavailable, changes from other clients won't appear until the next mutation");
                    None
                }
            },
            _ => None,
        };

        coordinator.refresh().await;
        info!(mode = %coordinator.mode(), realtime = listener.is_some(), "Session started");

        Self {
            coordinator,
            listener,
        }
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn mode(&self) -> ConnectionMode {
        self.coordinator.mode()
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Releases the realtime subscription, if any.
    pub async fn shutdown(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.shutdown().await;
        }
        info!("Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Argon2AuthProvider;
    use crate::backend::LocalBackend;
    use crate::capabilities::MemoryKv;
    use crate::model::RequestStatus;

    fn offline() -> SyncCoordinator {
        let kv = Arc::new(MemoryKv::new());
        SyncCoordinator::new(Arc::new(LocalBackend::new(LocalStore::new(kv))))
    }

    #[tokio::test]
    async fn coordinator_starts_in_backend_mode() {
        let coordinator = offline();
        assert_eq!(coordinator.view().mode, ConnectionMode::Offline);
    }

    #[tokio::test]
    async fn declined_delete_does_nothing() {
        let coordinator = offline();
        let request = MissingMedicationRequest::new("A", "1", "X", None);
        let id = request.id.clone();
        coordinator.submit_missing(request).await;

        assert!(!coordinator
            .delete(RecordKind::Missing, &id, Confirmation::Declined)
            .await);
        assert_eq!(coordinator.view().missing.len(), 1);

        assert!(coordinator
            .delete(RecordKind::Missing, &id, Confirmation::Confirmed)
            .await);
        assert!(coordinator.view().missing.is_empty());
    }

    #[tokio::test]
    async fn status_can_be_set_repeatedly() {
        let coordinator = offline();
        let request = MissingMedicationRequest::new("A", "1", "X", None);
        let id = request.id.clone();
        coordinator.submit_missing(request).await;

        coordinator
            .update_status(RecordKind::Missing, &id, StatusChange::Completed)
            .await;
        coordinator
            .update_status(RecordKind::Missing, &id, StatusChange::Cancelled)
            .await;
        assert_eq!(
            coordinator.view().missing[0].status,
            RequestStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn advice_upsert_validates_key() {
        let coordinator = offline();
        coordinator.refresh().await;

        let key = coordinator
            .upsert_advice(" Flu ", ConditionAdvice::blank("Flu"), true)
            .await
            .unwrap();
        assert_eq!(key.as_str(), "flu");

        let dup = coordinator
            .upsert_advice("FLU", ConditionAdvice::blank("Other"), true)
            .await;
        assert_eq!(dup, Err(AdviceError::DuplicateKey { key: key.clone() }));
        assert_eq!(coordinator.view().advice[&key].condition, "Flu");

        let unknown = coordinator
            .upsert_advice("measles", ConditionAdvice::blank("Measles"), false)
            .await;
        assert!(matches!(unknown, Err(AdviceError::UnknownKey { .. })));
        assert_eq!(
            coordinator.upsert_advice("  ", ConditionAdvice::blank("x"), true).await,
            Err(AdviceError::EmptyKey)
        );
    }

    #[tokio::test]
    async fn advice_delete_requires_existing_key() {
        let coordinator = offline();
        coordinator.refresh().await;
        let gout = AdviceKey::normalize("gout").unwrap();
        coordinator.delete_advice(&gout).await.unwrap();
        assert!(!coordinator.view().advice.contains_key(&gout));
        assert!(coordinator.delete_advice(&gout).await.is_err());
    }

    #[test]
    fn sign_in_requires_valid_passphrase() {
        let coordinator = offline();
        let hash = crate::auth::hash_passphrase(&SecretString::new("s3cret".into())).unwrap();
        let auth = Argon2AuthProvider::new(hash).unwrap();

        assert!(coordinator
            .sign_in(&auth, &SecretString::new("wrong".into()))
            .is_err());
        assert!(!coordinator.view().is_admin);

        coordinator
            .sign_in(&auth, &SecretString::new("s3cret".into()))
            .unwrap();
        assert!(coordinator.view().is_admin);
        coordinator.sign_out();
        assert!(!coordinator.view().is_admin);
    }
}
