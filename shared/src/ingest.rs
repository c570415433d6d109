//! Medication image ingestion: turns an attached file into something a
//! record can hold, either a public URL or an inline data URL.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, instrument};

use crate::backend::PersistenceBackend;
use crate::event::MedicationId;
use crate::model::{AttachedFile, ImageInput, MedicationDraft, MedicationItem};

pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Storage object name: submission time in epoch millis, then the medication id.
#[must_use]
pub fn object_name(stamp: DateTime<Utc>, medication: &MedicationId) -> String {
    format!("{}_{}", stamp.timestamp_millis(), medication)
}

/// Declared type first, then a sniff of the leading bytes.
#[must_use]
pub fn detect_content_type(file: &AttachedFile) -> String {
    if let Some(declared) = file.content_type.as_deref().filter(|c| !c.trim().is_empty()) {
        return declared.to_string();
    }
    image::guess_format(&file.bytes)
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|_| FALLBACK_CONTENT_TYPE.to_string())
}

#[must_use]
pub fn encode_data_url(file: &AttachedFile) -> String {
    format!(
        "data:{};base64,{}",
        detect_content_type(file),
        STANDARD.encode(&file.bytes)
    )
}

/// Resolves one medication's image. Never fails: a file the backend cannot
/// store yields `None`.
pub async fn ingest_image(
    backend: &dyn PersistenceBackend,
    stamp: DateTime<Utc>,
    medication: &MedicationId,
    input: Option<ImageInput>,
) -> Option<String> {
    match input? {
        ImageInput::Resolved(url) => Some(url),
        ImageInput::File(file) => {
            let content_type = detect_content_type(&file);
            let file = file.with_content_type(content_type);
            let name = object_name(stamp, medication);
            let stored = backend.store_image(&name, &file).await;
            debug!(%medication, object = %name, stored = stored.is_some(), "Ingested image");
            stored
        }
    }
}

/// Ingests every draft concurrently and waits for all of them. The output
/// keeps input order regardless of completion order. `stamp` is the
/// submission time and prefixes every object name.
#[instrument(skip_all, fields(count = drafts.len()))]
pub async fn ingest_medications(
    backend: &dyn PersistenceBackend,
    stamp: DateTime<Utc>,
    drafts: Vec<MedicationDraft>,
) -> Vec<MedicationItem> {
    join_all(drafts.into_iter().map(|mut draft| async move {
        let input = draft.take_image();
        let image = ingest_image(backend, stamp, &draft.id, input).await;
        draft.resolve(image)
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::advice::AdviceKey;
    use crate::event::{Event, RequestId};
    use crate::model::{
        Collections, ConditionAdvice, ConnectionMode, MissingMedicationRequest,
        PrescriptionRequest, RecordKind, RequestStatus,
    };
    use crate::PersistError;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn object_name_is_millis_then_id() {
        let stamp = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let id = MedicationId::new("med-1");
        assert_eq!(object_name(stamp, &id), "1700000000123_med-1");
    }

    #[test]
    fn content_type_prefers_declared_then_sniffs() {
        let declared = AttachedFile::new("x", vec![1u8]).with_content_type("image/heic");
        assert_eq!(detect_content_type(&declared), "image/heic");

        let png = AttachedFile::new("x.png", PNG_MAGIC.to_vec());
        assert_eq!(detect_content_type(&png), "image/png");

        let unknown = AttachedFile::new("x.bin", vec![0u8, 1, 2]);
        assert_eq!(detect_content_type(&unknown), FALLBACK_CONTENT_TYPE);
    }

    #[test]
    fn data_url_embeds_type_and_base64() {
        let file = AttachedFile::new("x.png", PNG_MAGIC.to_vec());
        let url = encode_data_url(&file);
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(url, format!("data:image/png;base64,{}", STANDARD.encode(PNG_MAGIC)));
    }

    /// Stores files named `<n>.png` after a delay that shrinks with `n`, so
    /// the last draft settles first.
    struct SlowStore {
        inline: bool,
        settled: Mutex<Vec<String>>,
    }

    impl SlowStore {
        fn new(inline: bool) -> Self {
            Self {
                inline,
                settled: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PersistenceBackend for SlowStore {
        fn mode(&self) -> ConnectionMode {
            if self.inline {
                ConnectionMode::Offline
            } else {
                ConnectionMode::Online
            }
        }

        async fn load(&self) -> Result<Collections, PersistError> {
            Ok(Collections::default())
        }

        async fn insert_prescription(&self, _: PrescriptionRequest) -> Result<Event, PersistError> {
            unreachable!("ingestion never writes records")
        }

        async fn insert_missing(&self, _: MissingMedicationRequest) -> Result<Event, PersistError> {
            unreachable!("ingestion never writes records")
        }

        async fn update_status(
            &self,
            _: RecordKind,
            _: &RequestId,
            _: RequestStatus,
        ) -> Result<Event, PersistError> {
            unreachable!("ingestion never writes records")
        }

        async fn delete_request(&self, _: RecordKind, _: &RequestId) -> Result<Event, PersistError> {
            unreachable!("ingestion never writes records")
        }

        async fn insert_advice(&self, _: &AdviceKey, _: ConditionAdvice) -> Result<Event, PersistError> {
            unreachable!("ingestion never writes records")
        }

        async fn update_advice(&self, _: &AdviceKey, _: ConditionAdvice) -> Result<Event, PersistError> {
            unreachable!("ingestion never writes records")
        }

        async fn delete_advice(&self, _: &AdviceKey) -> Result<Event, PersistError> {
            unreachable!("ingestion never writes records")
        }

        async fn store_image(&self, object_name: &str, file: &AttachedFile) -> Option<String> {
            let index: u64 = file.file_name.trim_end_matches(".png").parse().ok()?;
            tokio::time::sleep(Duration::from_millis((3 - index) * 50)).await;
            self.settled.lock().unwrap().push(file.file_name.clone());
            if self.inline {
                Some(encode_data_url(file))
            } else {
                Some(format!("https://cdn.example/{object_name}"))
            }
        }
    }

    fn three_drafts() -> Vec<MedicationDraft> {
        (0..3)
            .map(|n| {
                MedicationDraft::new(format!("Med {n}"), "1mg", "daily").with_image(
                    ImageInput::File(AttachedFile::new(format!("{n}.png"), PNG_MAGIC.to_vec())),
                )
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_uploads_keep_input_order() {
        let store = SlowStore::new(false);
        let stamp = Utc.timestamp_millis_opt(1_714_550_400_000).unwrap();
        let drafts = three_drafts();
        let ids: Vec<_> = drafts.iter().map(|d| d.id.clone()).collect();

        let items = ingest_medications(&store, stamp, drafts).await;

        assert_eq!(*store.settled.lock().unwrap(), ["2.png", "1.png", "0.png"]);
        assert_eq!(items.iter().map(|m| m.id.clone()).collect::<Vec<_>>(), ids);
        for (item, id) in items.iter().zip(&ids) {
            assert_eq!(
                item.image.as_deref(),
                Some(format!("https://cdn.example/1714550400000_{id}").as_str())
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_inlining_keeps_input_order() {
        let store = SlowStore::new(true);
        let drafts = three_drafts();
        let names: Vec<_> = drafts.iter().map(|d| d.name.clone()).collect();

        let items = ingest_medications(&store, Utc::now(), drafts).await;

        assert_eq!(*store.settled.lock().unwrap(), ["2.png", "1.png", "0.png"]);
        assert_eq!(items.iter().map(|m| m.name.clone()).collect::<Vec<_>>(), names);
        let expected = format!("data:image/png;base64,{}", STANDARD.encode(PNG_MAGIC));
        assert!(items.iter().all(|m| m.image.as_deref() == Some(expected.as_str())));
    }
}
