use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::advice::AdviceKey;
use crate::capabilities::Table;
use crate::event::{MedicationId, RequestId};

/// Session-wide persistence mode. `Checking` only exists until the probe
/// settles; after that the value never changes for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    Checking,
    Online,
    Offline,
}

impl ConnectionMode {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    #[must_use]
    pub const fn is_settled(self) -> bool {
        !matches!(self, Self::Checking)
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    Completed,
    Cancelled,
}

impl RequestStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of an admin status update. `Pending` is deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusChange {
    Completed,
    Cancelled,
}

impl From<StatusChange> for RequestStatus {
    fn from(change: StatusChange) -> Self {
        match change {
            StatusChange::Completed => Self::Completed,
            StatusChange::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Prescription,
    Missing,
}

impl RecordKind {
    #[must_use]
    pub const fn table(self) -> Table {
        match self {
            Self::Prescription => Table::PrescriptionRequests,
            Self::Missing => Table::MissingRequests,
        }
    }
}

// --- Attachments ---

/// A file picked in the prescription form, not yet uploaded or encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct AttachedFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl AttachedFile {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// Redact debug output: attachments are patient photos.
impl fmt::Debug for AttachedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedFile")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    /// Already a URL or data URL; passes through ingestion untouched.
    Resolved(String),
    File(AttachedFile),
}

// --- Prescription requests ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationItem {
    pub id: MedicationId,
    pub name: String,
    pub concentration: String,
    pub usage: String,
    #[serde(default)]
    pub image: Option<String>,
}

/// A medication line as submitted, before its image has been ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MedicationDraft {
    pub id: MedicationId,
    pub name: String,
    pub concentration: String,
    pub usage: String,
    pub image: Option<ImageInput>,
}

impl MedicationDraft {
    pub fn new(
        name: impl Into<String>,
        concentration: impl Into<String>,
        usage: impl Into<String>,
    ) -> Self {
        Self {
            id: MedicationId::generate(),
            name: name.into(),
            concentration: concentration.into(),
            usage: usage.into(),
            image: None,
        }
    }

    #[must_use]
    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.image = Some(image);
        self
    }

    pub(crate) fn take_image(&mut self) -> Option<ImageInput> {
        self.image.take()
    }

    #[must_use]
    pub fn resolve(self, image: Option<String>) -> MedicationItem {
        MedicationItem {
            id: self.id,
            name: self.name,
            concentration: self.concentration,
            usage: self.usage,
            image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrescriptionRequest {
    pub id: RequestId,
    pub full_name: String,
    pub phone_number: String,
    pub refill_date: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub medications: Vec<MedicationItem>,
    pub submission_date: DateTime<Utc>,
    #[serde(default)]
    pub status: RequestStatus,
}

/// Form output for a refill request. Becomes a [`PrescriptionRequest`]
/// once every medication image has been ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrescriptionSubmission {
    pub id: RequestId,
    pub full_name: String,
    pub phone_number: String,
    pub refill_date: String,
    pub notes: String,
    pub medications: Vec<MedicationDraft>,
    pub submission_date: DateTime<Utc>,
}

impl PrescriptionSubmission {
    pub fn new(
        full_name: impl Into<String>,
        phone_number: impl Into<String>,
        refill_date: impl Into<String>,
        notes: impl Into<String>,
        medications: Vec<MedicationDraft>,
    ) -> Self {
        Self {
            id: RequestId::generate(),
            full_name: full_name.into(),
            phone_number: phone_number.into(),
            refill_date: refill_date.into(),
            notes: notes.into(),
            medications,
            submission_date: Utc::now(),
        }
    }

    #[must_use]
    pub fn into_request(self, medications: Vec<MedicationItem>) -> PrescriptionRequest {
        PrescriptionRequest {
            id: self.id,
            full_name: self.full_name,
            phone_number: self.phone_number,
            refill_date: self.refill_date,
            notes: self.notes,
            medications,
            submission_date: self.submission_date,
            status: RequestStatus::Pending,
        }
    }
}

// --- Missing medication requests ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingMedicationRequest {
    pub id: RequestId,
    pub full_name: String,
    pub phone_number: String,
    pub medicine_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub submission_date: DateTime<Utc>,
    #[serde(default)]
    pub status: RequestStatus,
}

impl MissingMedicationRequest {
    pub fn new(
        full_name: impl Into<String>,
        phone_number: impl Into<String>,
        medicine_name: impl Into<String>,
        notes: Option<String>,
    ) -> Self {
        Self {
            id: RequestId::generate(),
            full_name: full_name.into(),
            phone_number: phone_number.into(),
            medicine_name: medicine_name.into(),
            notes: notes.filter(|n| !n.trim().is_empty()),
            submission_date: Utc::now(),
            status: RequestStatus::Pending,
        }
    }
}

// --- Condition advice ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionAdvice {
    pub condition: String,
    pub allowed_foods: Vec<String>,
    pub forbidden_foods: Vec<String>,
    pub tips: Vec<String>,
    pub disclaimer: String,
}

pub type AdviceMap = BTreeMap<AdviceKey, ConditionAdvice>;

/// The three persisted collections as one value. This is the shape a
/// remote re-fetch produces and what the offline store mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Collections {
    pub prescriptions: Vec<PrescriptionRequest>,
    pub missing: Vec<MissingMedicationRequest>,
    pub advice: AdviceMap,
}

impl Collections {
    #[must_use]
    pub fn pending_prescriptions(&self) -> usize {
        self.prescriptions
            .iter()
            .filter(|r| r.status.is_pending())
            .count()
    }

    #[must_use]
    pub fn pending_missing(&self) -> usize {
        self.missing.iter().filter(|r| r.status.is_pending()).count()
    }

    #[must_use]
    pub fn contains_request(&self, kind: RecordKind, id: &RequestId) -> bool {
        match kind {
            RecordKind::Prescription => self.prescriptions.iter().any(|r| &r.id == id),
            RecordKind::Missing => self.missing.iter().any(|r| &r.id == id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(RequestStatus::Cancelled).unwrap(),
            json!("cancelled")
        );
        assert_eq!(RequestStatus::parse("completed"), Some(RequestStatus::Completed));
        assert_eq!(RequestStatus::parse("archived"), None);
    }

    #[test]
    fn unknown_status_is_rejected_on_decode() {
        let raw = json!({
            "id": "1",
            "fullName": "A",
            "phoneNumber": "1",
            "medicineName": "X",
            "submissionDate": "2024-01-01T00:00:00Z",
            "status": "archived"
        });
        assert!(serde_json::from_value::<MissingMedicationRequest>(raw).is_err());
    }

    #[test]
    fn prescription_uses_camel_case_fields() {
        let request = PrescriptionSubmission::new("Sara", "0500", "2024-05-01", "", vec![])
            .into_request(vec![]);
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("fullName").is_some());
        assert!(value.get("submissionDate").is_some());
        assert_eq!(value["status"], json!("pending"));
    }

    #[test]
    fn submission_starts_pending_and_keeps_medication_order() {
        let drafts = vec![
            MedicationDraft::new("A", "5mg", "daily"),
            MedicationDraft::new("B", "10mg", "twice"),
        ];
        let ids: Vec<_> = drafts.iter().map(|d| d.id.clone()).collect();
        let submission = PrescriptionSubmission::new("Sara", "0500", "2024-05-01", "", drafts);
        let items = submission
            .medications
            .iter()
            .cloned()
            .map(|d| d.resolve(None))
            .collect();
        let request = submission.into_request(items);
        assert_eq!(request.status, RequestStatus::Pending);
        let got: Vec<_> = request.medications.iter().map(|m| m.id.clone()).collect();
        assert_eq!(got, ids);
    }

    #[test]
    fn blank_missing_notes_are_dropped() {
        let req = MissingMedicationRequest::new("A", "1", "Insulin", Some("  ".into()));
        assert!(req.notes.is_none());
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("notes").is_none());
    }

    #[test]
    fn attachment_debug_hides_bytes() {
        let file = AttachedFile::new("scan.jpg", vec![1u8, 2, 3]);
        let rendered = format!("{file:?}");
        assert!(rendered.contains("len: 3"));
        assert!(!rendered.contains("[1, 2, 3]"));
    }

    #[test]
    fn pending_counts_ignore_closed_requests() {
        let mut collections = Collections::default();
        let mut a = MissingMedicationRequest::new("A", "1", "X", None);
        let b = MissingMedicationRequest::new("B", "2", "Y", None);
        a.status = RequestStatus::Completed;
        collections.missing = vec![a, b];
        assert_eq!(collections.pending_missing(), 1);
    }
}
