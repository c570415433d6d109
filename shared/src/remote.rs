//! Typed access to the hosted tables.
//!
//! Rows use snake_case column names and nullable text columns; the domain
//! records use camelCase and plain strings. The private row types below are
//! the only place the two shapes meet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::advice::{default_advice, AdviceKey};
use crate::capabilities::{Filter, RemoteError, RemoteTables, SelectQuery, Table};
use crate::event::RequestId;
use crate::model::{
    AdviceMap, AttachedFile, Collections, ConditionAdvice, MedicationItem,
    MissingMedicationRequest, PrescriptionRequest, RecordKind, RequestStatus,
};

const ORDER_COLUMN: &str = "submission_date";

#[derive(Debug, Serialize, Deserialize)]
struct PrescriptionRow {
    id: RequestId,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    refill_date: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    medications: Option<Vec<MedicationItem>>,
    submission_date: DateTime<Utc>,
    #[serde(default)]
    status: RequestStatus,
}

impl From<&PrescriptionRequest> for PrescriptionRow {
    fn from(r: &PrescriptionRequest) -> Self {
        Self {
            id: r.id.clone(),
            full_name: Some(r.full_name.clone()),
            phone_number: Some(r.phone_number.clone()),
            refill_date: Some(r.refill_date.clone()),
            notes: Some(r.notes.clone()),
            medications: Some(r.medications.clone()),
            submission_date: r.submission_date,
            status: r.status,
        }
    }
}

impl From<PrescriptionRow> for PrescriptionRequest {
    fn from(row: PrescriptionRow) -> Self {
        Self {
            id: row.id,
            full_name: row.full_name.unwrap_or_default(),
            phone_number: row.phone_number.unwrap_or_default(),
            refill_date: row.refill_date.unwrap_or_default(),
            notes: row.notes.unwrap_or_default(),
            medications: row.medications.unwrap_or_default(),
            submission_date: row.submission_date,
            status: row.status,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MissingRow {
    id: RequestId,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    medicine_name: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    submission_date: DateTime<Utc>,
    #[serde(default)]
    status: RequestStatus,
}

impl From<&MissingMedicationRequest> for MissingRow {
    fn from(r: &MissingMedicationRequest) -> Self {
        Self {
            id: r.id.clone(),
            full_name: Some(r.full_name.clone()),
            phone_number: Some(r.phone_number.clone()),
            medicine_name: Some(r.medicine_name.clone()),
            notes: r.notes.clone(),
            submission_date: r.submission_date,
            status: r.status,
        }
    }
}

impl From<MissingRow> for MissingMedicationRequest {
    fn from(row: MissingRow) -> Self {
        Self {
            id: row.id,
            full_name: row.full_name.unwrap_or_default(),
            phone_number: row.phone_number.unwrap_or_default(),
            medicine_name: row.medicine_name.unwrap_or_default(),
            notes: row.notes.filter(|n| !n.is_empty()),
            submission_date: row.submission_date,
            status: row.status,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AdviceRow {
    key_id: AdviceKey,
    data: ConditionAdvice,
}

fn encode<T: Serialize>(row: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(row).map_err(|e| RemoteError::InvalidRequest {
        reason: e.to_string(),
    })
}

/// Decodes rows one by one; a bad row is logged and dropped, never fatal.
fn decode_rows<R, T>(table: Table, rows: Vec<Value>) -> Vec<T>
where
    R: for<'de> Deserialize<'de>,
    T: From<R>,
{
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<R>(row) {
            Ok(row) => Some(T::from(row)),
            Err(e) => {
                warn!(%table, error = %e, "Skipping undecodable row");
                None
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct RemoteStore {
    tables: Arc<dyn RemoteTables>,
    bucket: String,
}

impl RemoteStore {
    pub fn new(tables: Arc<dyn RemoteTables>, bucket: impl Into<String>) -> Self {
        Self {
            tables,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Newest first.
    pub async fn list_prescriptions(&self) -> Result<Vec<PrescriptionRequest>, RemoteError> {
        let table = Table::PrescriptionRequests;
        let rows = self
            .tables
            .select(table, &SelectQuery::all().order_desc(ORDER_COLUMN))
            .await?;
        Ok(decode_rows::<PrescriptionRow, _>(table, rows))
    }

    /// Newest first.
    pub async fn list_missing(&self) -> Result<Vec<MissingMedicationRequest>, RemoteError> {
        let table = Table::MissingRequests;
        let rows = self
            .tables
            .select(table, &SelectQuery::all().order_desc(ORDER_COLUMN))
            .await?;
        Ok(decode_rows::<MissingRow, _>(table, rows))
    }

    /// Reads the advice table. An empty table is seeded with the built-in
    /// set, one row per entry, and the built-in set is returned.
    pub async fn list_advice(&self) -> Result<AdviceMap, RemoteError> {
        let table = Table::MedicalAdvice;
        let rows = self.tables.select(table, &SelectQuery::all()).await?;
        if rows.is_empty() {
            return Ok(self.seed_advice().await);
        }

        Ok(decode_rows::<AdviceRow, AdviceEntry>(table, rows)
            .into_iter()
            .map(|AdviceEntry(key, advice)| (key, advice))
            .collect())
    }

    async fn seed_advice(&self) -> AdviceMap {
        let defaults = default_advice();
        info!(entries = defaults.len(), "Seeding empty advice table");
        for (key, advice) in &defaults {
            match self.insert_advice(key, advice).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    debug!(%key, "Advice entry already seeded");
                }
                Err(e) => warn!(%key, error = %e, "Failed to seed advice entry"),
            }
        }
        defaults
    }

    #[instrument(skip(self))]
    pub async fn fetch_all(&self) -> Result<Collections, RemoteError> {
        let (prescriptions, missing, advice) = tokio::try_join!(
            self.list_prescriptions(),
            self.list_missing(),
            self.list_advice(),
        )?;
        debug!(
            prescriptions = prescriptions.len(),
            missing = missing.len(),
            advice = advice.len(),
            "Fetched remote collections"
        );
        Ok(Collections {
            prescriptions,
            missing,
            advice,
        })
    }

    pub async fn insert_prescription(&self, request: &PrescriptionRequest) -> Result<(), RemoteError> {
        let row = encode(&PrescriptionRow::from(request))?;
        self.tables.insert(Table::PrescriptionRequests, row).await
    }

    pub async fn insert_missing(&self, request: &MissingMedicationRequest) -> Result<(), RemoteError> {
        let row = encode(&MissingRow::from(request))?;
        self.tables.insert(Table::MissingRequests, row).await
    }

    pub async fn update_status(
        &self,
        kind: RecordKind,
        id: &RequestId,
        status: RequestStatus,
    ) -> Result<(), RemoteError> {
        self.tables
            .update(
                kind.table(),
                &Filter::eq("id", id.as_str()),
                json!({ "status": status.as_str() }),
            )
            .await
    }

    pub async fn delete_request(&self, kind: RecordKind, id: &RequestId) -> Result<(), RemoteError> {
        self.tables
            .delete(kind.table(), &Filter::eq("id", id.as_str()))
            .await
    }

    pub async fn insert_advice(
        &self,
        key: &AdviceKey,
        advice: &ConditionAdvice,
    ) -> Result<(), RemoteError> {
        let row = encode(&AdviceRow {
            key_id: key.clone(),
            data: advice.clone(),
        })?;
        self.tables.insert(Table::MedicalAdvice, row).await
    }

    pub async fn update_advice(
        &self,
        key: &AdviceKey,
        advice: &ConditionAdvice,
    ) -> Result<(), RemoteError> {
        self.tables
            .update(
                Table::MedicalAdvice,
                &Filter::eq("key_id", key.as_str()),
                json!({ "data": encode(advice)? }),
            )
            .await
    }

    pub async fn delete_advice(&self, key: &AdviceKey) -> Result<(), RemoteError> {
        self.tables
            .delete(Table::MedicalAdvice, &Filter::eq("key_id", key.as_str()))
            .await
    }

    /// Uploads into the configured bucket and returns the object's public URL.
    pub async fn upload_image(
        &self,
        object_name: &str,
        file: &AttachedFile,
    ) -> Result<String, RemoteError> {
        self.tables.upload(&self.bucket, object_name, file).await?;
        Ok(self.tables.public_url(&self.bucket, object_name))
    }
}

struct AdviceEntry(AdviceKey, ConditionAdvice);

impl From<AdviceRow> for AdviceEntry {
    fn from(row: AdviceRow) -> Self {
        Self(row.key_id, row.data)
    }
}
