//! Table-oriented remote backend: the query surface, its error type and an
//! in-process implementation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use super::realtime::{BroadcastSource, ChangeKind, ChangeNotice};
use crate::model::AttachedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    PrescriptionRequests,
    MissingRequests,
    MedicalAdvice,
}

impl Table {
    pub const ALL: [Table; 3] = [
        Table::PrescriptionRequests,
        Table::MissingRequests,
        Table::MedicalAdvice,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PrescriptionRequests => "prescription_requests",
            Self::MissingRequests => "missing_requests",
            Self::MedicalAdvice => "medical_advice",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    #[must_use]
    pub const fn primary_key(self) -> &'static str {
        match self {
            Self::MedicalAdvice => "key_id",
            _ => "id",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    pub columns: String,
    pub order_desc: Option<String>,
    pub limit: Option<usize>,
}

impl SelectQuery {
    #[must_use]
    pub fn all() -> Self {
        Self {
            columns: "*".to_string(),
            order_desc: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    #[must_use]
    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order_desc = Some(column.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Equality filter on one column; the only row selector writes need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    fn matches(&self, row: &Value) -> bool {
        row.get(&self.column).and_then(Value::as_str) == Some(self.value.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("request timed out")]
    Timeout,

    #[error("HTTP error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Connection { .. } | RemoteError::Timeout => true,
            RemoteError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Status { status: 409, .. })
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }
}

/// Row-level access to the hosted tables plus the object bucket.
#[async_trait]
pub trait RemoteTables: Send + Sync {
    async fn select(&self, table: Table, query: &SelectQuery) -> Result<Vec<Value>, RemoteError>;

    async fn insert(&self, table: Table, row: Value) -> Result<(), RemoteError>;

    async fn update(&self, table: Table, filter: &Filter, patch: Value)
        -> Result<(), RemoteError>;

    async fn delete(&self, table: Table, filter: &Filter) -> Result<(), RemoteError>;

    async fn upload(
        &self,
        bucket: &str,
        object: &str,
        file: &AttachedFile,
    ) -> Result<(), RemoteError>;

    fn public_url(&self, bucket: &str, object: &str) -> String;
}

pub(crate) fn storage_public_url(base: &str, bucket: &str, object: &str) -> String {
    format!(
        "{}/storage/v1/object/public/{bucket}/{object}",
        base.trim_end_matches('/')
    )
}

// --- In-process tables ---

const MEMORY_BASE_URL: &str = "memory://clinic";

#[derive(Default)]
struct MemoryState {
    rows: HashMap<Table, Vec<Value>>,
    objects: HashMap<String, Bytes>,
    offline: bool,
    fail_writes: bool,
    fail_uploads: bool,
}

/// Tables held in memory with the same observable semantics as the hosted
/// backend: duplicate keys conflict, ordering is by parsed timestamp, and
/// every successful mutation is broadcast to subscribers.
#[derive(Default)]
pub struct MemoryTables {
    state: Mutex<MemoryState>,
    changes: Option<BroadcastSource>,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_changes(mut self, changes: BroadcastSource) -> Self {
        self.changes = Some(changes);
        self
    }

    /// Every call fails with a connection error while set.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    /// Inserts rows directly, bypassing conflict checks and notifications.
    pub fn seed(&self, table: Table, rows: impl IntoIterator<Item = Value>) {
        self.lock().rows.entry(table).or_default().extend(rows);
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.lock().rows.get(&table).cloned().unwrap_or_default()
    }

    pub fn object(&self, bucket: &str, object: &str) -> Option<Bytes> {
        self.lock().objects.get(&format!("{bucket}/{object}")).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked mid-mutation.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_reachable(state: &MemoryState) -> Result<(), RemoteError> {
        if state.offline {
            return Err(RemoteError::Connection {
                message: "backend unreachable".to_string(),
            });
        }
        Ok(())
    }

    fn check_writable(state: &MemoryState) -> Result<(), RemoteError> {
        Self::check_reachable(state)?;
        if state.fail_writes {
            return Err(RemoteError::status(503, "writes unavailable"));
        }
        Ok(())
    }

    fn notify(&self, table: Table, kind: ChangeKind) {
        if let Some(changes) = &self.changes {
            changes.notify(ChangeNotice { table, kind });
        }
    }
}

fn compare_desc(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
        value
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    match (timestamp(a), timestamp(b)) {
        (Some(a), Some(b)) => b.cmp(&a),
        _ => {
            let text = |v: Option<&Value>| v.map(ToString::to_string).unwrap_or_default();
            text(b).cmp(&text(a))
        }
    }
}

fn project(row: &Value, columns: &str) -> Value {
    if columns.trim() == "*" {
        return row.clone();
    }
    let projected: Map<String, Value> = columns
        .split(',')
        .map(str::trim)
        .filter_map(|c| row.get(c).map(|v| (c.to_string(), v.clone())))
        .collect();
    Value::Object(projected)
}

#[async_trait]
impl RemoteTables for MemoryTables {
    async fn select(&self, table: Table, query: &SelectQuery) -> Result<Vec<Value>, RemoteError> {
        let state = self.lock();
        Self::check_reachable(&state)?;

        let mut rows = state.rows.get(&table).cloned().unwrap_or_default();
        if let Some(column) = &query.order_desc {
            rows.sort_by(|a, b| compare_desc(a.get(column), b.get(column)));
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows.iter().map(|r| project(r, &query.columns)).collect())
    }

    async fn insert(&self, table: Table, row: Value) -> Result<(), RemoteError> {
        {
            let mut state = self.lock();
            Self::check_writable(&state)?;

            let key = row
                .get(table.primary_key())
                .and_then(Value::as_str)
                .ok_or_else(|| RemoteError::status(400, "missing primary key"))?
                .to_string();
            let rows = state.rows.entry(table).or_default();
            let exists = rows
                .iter()
                .any(|r| r.get(table.primary_key()).and_then(Value::as_str) == Some(&key));
            if exists {
                return Err(RemoteError::status(
                    409,
                    format!("duplicate key value violates unique constraint on {table}"),
                ));
            }
            rows.push(row);
        }
        self.notify(table, ChangeKind::Insert);
        Ok(())
    }

    async fn update(
        &self,
        table: Table,
        filter: &Filter,
        patch: Value,
    ) -> Result<(), RemoteError> {
        let Value::Object(patch) = patch else {
            return Err(RemoteError::InvalidRequest {
                reason: "update patch must be an object".to_string(),
            });
        };
        {
            let mut state = self.lock();
            Self::check_writable(&state)?;

            for row in state.rows.entry(table).or_default().iter_mut() {
                if !filter.matches(row) {
                    continue;
                }
                if let Value::Object(fields) = row {
                    for (k, v) in &patch {
                        fields.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        self.notify(table, ChangeKind::Update);
        Ok(())
    }

    async fn delete(&self, table: Table, filter: &Filter) -> Result<(), RemoteError> {
        {
            let mut state = self.lock();
            Self::check_writable(&state)?;
            state
                .rows
                .entry(table)
                .or_default()
                .retain(|row| !filter.matches(row));
        }
        self.notify(table, ChangeKind::Delete);
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        object: &str,
        file: &AttachedFile,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        Self::check_reachable(&state)?;
        if state.fail_uploads {
            return Err(RemoteError::status(413, "payload too large"));
        }

        let path = format!("{bucket}/{object}");
        if state.objects.contains_key(&path) {
            return Err(RemoteError::status(409, "the resource already exists"));
        }
        state.objects.insert(path, file.bytes.clone());
        Ok(())
    }

    fn public_url(&self, bucket: &str, object: &str) -> String {
        storage_public_url(MEMORY_BASE_URL, bucket, object)
    }
}
