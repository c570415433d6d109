//! Session state and its single update path.
//!
//! `App` is a Crux app: backend results, realtime notices and UI interactions
//! all arrive as [`Event`]s, `update` is the only code that mutates a
//! [`Model`], and every change asks the shell to re-render from `view`.

use crux_core::render::Render;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::advice::AdviceKey;
use crate::event::Event;
use crate::model::{
    AdviceMap, Collections, ConditionAdvice, ConnectionMode, MissingMedicationRequest,
    PrescriptionRequest,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Model {
    pub mode: ConnectionMode,
    pub collections: Collections,
    pub selected_advice: Option<AdviceKey>,
    pub is_admin: bool,
    /// Set by a change notice, cleared by the next authoritative snapshot.
    pub remote_dirty: bool,
    /// Bumped on every applied event that replaces collection data.
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdviceIndexEntry {
    pub key: AdviceKey,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedAdvice {
    pub key: AdviceKey,
    pub advice: ConditionAdvice,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewModel {
    pub mode: ConnectionMode,
    pub mode_label: String,
    pub pending_prescriptions: usize,
    pub pending_missing: usize,
    pub prescriptions: Vec<PrescriptionRequest>,
    pub missing: Vec<MissingMedicationRequest>,
    pub advice: AdviceMap,
    pub advice_index: Vec<AdviceIndexEntry>,
    pub selected_advice: Option<SelectedAdvice>,
    pub is_admin: bool,
    pub revision: u64,
}

impl ViewModel {
    #[must_use]
    pub fn contains_request(&self, id: &crate::event::RequestId) -> bool {
        self.prescriptions.iter().any(|r| &r.id == id) || self.missing.iter().any(|r| &r.id == id)
    }
}

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub render: Render<Event>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct App;

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = ViewModel;
    type Capabilities = Capabilities;

    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        debug!(event = event.name(), "Applying event");
        let replaces_data = event.touches_collections();

        match event {
            Event::ModeResolved(mode) => {
                // The first settled mode sticks for the session.
                if model.mode.is_settled() {
                    return;
                }
                model.mode = mode;
            }
            Event::Refreshed(collections) => {
                model.collections = collections;
                model.remote_dirty = false;
            }
            Event::PrescriptionsWritten(prescriptions) => {
                model.collections.prescriptions = prescriptions;
            }
            Event::MissingWritten(missing) => {
                model.collections.missing = missing;
            }
            Event::AdviceWritten(advice) => {
                model.collections.advice = advice;
            }
            Event::RemoteChanged { .. } => {
                model.remote_dirty = true;
            }
            Event::AdviceSelected(key) => {
                model.selected_advice = key;
            }
            Event::AdminSignedIn => model.is_admin = true,
            Event::AdminSignedOut => model.is_admin = false,
        }

        if replaces_data {
            if let Some(key) = &model.selected_advice {
                if !model.collections.advice.contains_key(key) {
                    model.selected_advice = None;
                }
            }
            model.revision += 1;
        }

        caps.render.render();
    }

    fn view(&self, model: &Model) -> ViewModel {
        let collections = &model.collections;

        let mut advice_index: Vec<AdviceIndexEntry> = collections
            .advice
            .iter()
            .map(|(key, advice)| AdviceIndexEntry {
                key: key.clone(),
                condition: advice.condition.clone(),
            })
            .collect();
        advice_index.sort_by(|a, b| {
            a.condition
                .to_lowercase()
                .cmp(&b.condition.to_lowercase())
                .then_with(|| a.key.cmp(&b.key))
        });

        let selected_advice = model.selected_advice.as_ref().and_then(|key| {
            collections.advice.get(key).map(|advice| SelectedAdvice {
                key: key.clone(),
                advice: advice.clone(),
            })
        });

        ViewModel {
            mode: model.mode,
            mode_label: model.mode.label().to_string(),
            pending_prescriptions: collections.pending_prescriptions(),
            pending_missing: collections.pending_missing(),
            prescriptions: collections.prescriptions.clone(),
            missing: collections.missing.clone(),
            advice: collections.advice.clone(),
            advice_index,
            selected_advice,
            is_admin: model.is_admin,
            revision: model.revision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advice::default_advice;
    use crate::capabilities::Table;
    use crate::model::RequestStatus;
    use crux_core::testing::AppTester;

    fn renders(effects: &[Effect]) -> bool {
        effects.iter().any(|e| matches!(e, Effect::Render(_)))
    }

    #[test]
    fn mode_settles_once() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();
        assert_eq!(model.mode, ConnectionMode::Checking);

        let update = app.update(Event::ModeResolved(ConnectionMode::Offline), &mut model);
        assert!(renders(&update.effects));

        let update = app.update(Event::ModeResolved(ConnectionMode::Online), &mut model);
        assert!(update.effects.is_empty());
        assert_eq!(model.mode, ConnectionMode::Offline);
        assert_eq!(app.view(&model).mode_label, "offline");
    }

    #[test]
    fn change_notice_marks_dirty_until_refresh() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();
        app.update(
            Event::RemoteChanged {
                table: Table::MissingRequests,
            },
            &mut model,
        );
        assert!(model.remote_dirty);
        assert_eq!(model.revision, 0);

        let update = app.update(Event::Refreshed(Collections::default()), &mut model);
        assert!(renders(&update.effects));
        assert!(!model.remote_dirty);
        assert_eq!(app.view(&model).revision, 1);
    }

    #[test]
    fn removed_advice_clears_selection() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();
        app.update(Event::AdviceWritten(default_advice()), &mut model);
        let key = AdviceKey::normalize("gout").unwrap();
        app.update(Event::AdviceSelected(Some(key.clone())), &mut model);
        assert_eq!(app.view(&model).selected_advice.unwrap().key, key);

        let mut without = default_advice();
        without.remove(&key);
        app.update(Event::AdviceWritten(without), &mut model);
        assert_eq!(model.selected_advice, None);
        assert!(app.view(&model).selected_advice.is_none());
    }

    #[test]
    fn view_counts_pending_and_sorts_index_by_name() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();
        let open = MissingMedicationRequest::new("A", "1", "X", None);
        let mut closed = MissingMedicationRequest::new("B", "2", "Y", None);
        closed.status = RequestStatus::Cancelled;
        let closed_id = closed.id.clone();
        app.update(Event::MissingWritten(vec![open, closed]), &mut model);
        app.update(Event::AdviceWritten(default_advice()), &mut model);

        let view = app.view(&model);
        assert_eq!(view.pending_missing, 1);
        assert_eq!(view.pending_prescriptions, 0);
        assert!(view.contains_request(&closed_id));
        assert_eq!(view.advice, default_advice());
        let names: Vec<_> = view.advice_index.iter().map(|e| e.condition.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort_by_key(|n| n.to_lowercase());
        assert_eq!(names, sorted);
    }

    #[test]
    fn admin_flag_follows_sign_in_events() {
        let app = AppTester::<App, Effect>::default();
        let mut model = Model::default();
        let update = app.update(Event::AdminSignedIn, &mut model);
        assert!(renders(&update.effects));
        assert!(app.view(&model).is_admin);
        app.update(Event::AdminSignedOut, &mut model);
        assert!(!model.is_admin);
    }
}
