use serde::{Deserialize, Serialize};
use std::fmt;

use crate::advice::AdviceKey;
use crate::capabilities::Table;
use crate::model::{
    AdviceMap, Collections, ConnectionMode, MissingMedicationRequest, PrescriptionRequest,
};

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(RequestId);
typed_id!(MedicationId);

// --- Events ---

/// Everything that changes session state goes through one of these.
///
/// Backends answer a mutation with the event describing its effect, the
/// realtime listener produces `RemoteChanged`, and UI-only interactions
/// (advice selection, admin gate) are plain events as well. The
/// coordinator applies all of them through [`crate::app::App::update`].
#[derive(Debug, Clone)]
pub enum Event {
    ModeResolved(ConnectionMode),

    /// Authoritative full snapshot (remote re-fetch or initial local load).
    Refreshed(Collections),

    // Offline path: a collection was recomputed and persisted.
    PrescriptionsWritten(Vec<PrescriptionRequest>),
    MissingWritten(Vec<MissingMedicationRequest>),
    AdviceWritten(AdviceMap),

    /// A change notification arrived; carries no diff.
    RemoteChanged { table: Table },

    AdviceSelected(Option<AdviceKey>),
    AdminSignedIn,
    AdminSignedOut,
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ModeResolved(_) => "mode_resolved",
            Self::Refreshed(_) => "refreshed",
            Self::PrescriptionsWritten(_) => "prescriptions_written",
            Self::MissingWritten(_) => "missing_written",
            Self::AdviceWritten(_) => "advice_written",
            Self::RemoteChanged { .. } => "remote_changed",
            Self::AdviceSelected(_) => "advice_selected",
            Self::AdminSignedIn => "admin_signed_in",
            Self::AdminSignedOut => "admin_signed_out",
        }
    }

    /// Whether applying this event replaces persisted collections.
    #[must_use]
    pub const fn touches_collections(&self) -> bool {
        matches!(
            self,
            Self::Refreshed(_)
                | Self::PrescriptionsWritten(_)
                | Self::MissingWritten(_)
                | Self::AdviceWritten(_)
        )
    }
}
