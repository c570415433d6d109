// lib.rs - Clinic pharmacy persistence and sync core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod advice;
pub mod app;
pub mod auth;
pub mod backend;
pub mod capabilities;
pub mod config;
pub mod event;
pub mod ingest;
pub mod local;
pub mod model;
pub mod probe;
pub mod remote;
pub mod sync;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{KvError, RealtimeError, RemoteError};
use crate::local::LocalStoreError;

pub use advice::{AdviceError, AdviceKey};
pub use app::{App, Capabilities, Effect, Model, ViewModel};
pub use backend::PersistenceBackend;
pub use event::{Event, MedicationId, RequestId};
pub use model::{
    AdviceMap, AttachedFile, Collections, ConditionAdvice, ConnectionMode, ImageInput,
    MedicationDraft, MedicationItem, MissingMedicationRequest, PrescriptionRequest,
    PrescriptionSubmission, RecordKind, RequestStatus, StatusChange,
};
pub use sync::{Confirmation, Session, SessionParts, SyncCoordinator};

pub const DEFAULT_STORAGE_BUCKET: &str = "medication-images";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Validation,
    NotFound,
    Conflict,
    Storage,
    Serialization,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::Storage | Self::Conflict
        )
    }

    #[must_use]
    pub const fn user_facing_message(self) -> &'static str {
        match self {
            Self::Network | Self::Timeout => "Could not reach the server. Please try again.",
            Self::Authentication => "Sign-in failed.",
            Self::Validation => "Some of the entered details are not valid.",
            Self::NotFound => "That record no longer exists.",
            Self::Conflict => "That record was changed elsewhere. Refresh and try again.",
            Self::Storage => "Could not save on this device.",
            Self::Serialization | Self::Internal => "Something went wrong.",
        }
    }
}

/// Failure of a persistence backend operation.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("remote store: {0}")]
    Remote(#[from] RemoteError),

    #[error("local store: {0}")]
    Local(#[from] LocalStoreError),

    #[error("realtime: {0}")]
    Realtime(#[from] RealtimeError),
}

impl PersistError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(e) => match e {
                RemoteError::Connection { .. } => ErrorKind::Network,
                RemoteError::Timeout => ErrorKind::Timeout,
                RemoteError::Status { status, .. } => match status {
                    401 | 403 => ErrorKind::Authentication,
                    404 => ErrorKind::NotFound,
                    409 => ErrorKind::Conflict,
                    400..=499 => ErrorKind::Validation,
                    _ => ErrorKind::Network,
                },
                RemoteError::InvalidUrl { .. } | RemoteError::InvalidRequest { .. } => {
                    ErrorKind::Validation
                }
                RemoteError::InvalidResponse { .. } => ErrorKind::Serialization,
            },
            Self::Local(e) => match e {
                LocalStoreError::Kv(KvError::InvalidKey { .. } | KvError::ValueTooLarge { .. }) => {
                    ErrorKind::Validation
                }
                LocalStoreError::Kv(KvError::Storage { .. }) => ErrorKind::Storage,
                LocalStoreError::Encode { .. } => ErrorKind::Serialization,
            },
            Self::Realtime(_) => ErrorKind::Network,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_retryable(),
            Self::Local(e) => e.is_retryable(),
            Self::Realtime(e) => e.is_retryable(),
        }
    }

    #[must_use]
    pub fn user_facing_message(&self) -> &'static str {
        self.kind().user_facing_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::StorageErrorCode;

    #[test]
    fn remote_status_maps_to_kind() {
        let conflict = PersistError::from(RemoteError::Status {
            status: 409,
            message: "duplicate key".into(),
        });
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert_eq!(conflict.kind().code(), "CONFLICT");

        let server = PersistError::from(RemoteError::Status {
            status: 503,
            message: String::new(),
        });
        assert_eq!(server.kind(), ErrorKind::Network);
        assert!(server.is_retryable());
    }

    #[test]
    fn local_errors_map_to_storage_or_serialization() {
        let busy = PersistError::from(LocalStoreError::Kv(KvError::storage(
            StorageErrorCode::Busy,
            "locked",
        )));
        assert_eq!(busy.kind(), ErrorKind::Storage);

        let encode = PersistError::from(LocalStoreError::Encode {
            key: "medicalData",
            message: "bad".into(),
        });
        assert_eq!(encode.kind(), ErrorKind::Serialization);
        assert!(!encode.is_retryable());
        assert_eq!(encode.user_facing_message(), "Something went wrong.");
    }
}
