use chrono::{DateTime, Duration, Utc};
use shared::{
    Annotation, BatchClassificationResponse, BatchResponse, ClassificationResponse,
    CorrectionRequest, CreateBatchRequest, ModelInfoResponse, StatisticsResponse,
};
use std::sync::Arc;
use uuid::Uuid;

use super::batch::BatchOrchestrator;
use super::validator::{ImageValidator, UploadedImage};
use super::writer::{RecordWriter, RequestContext};
use crate::config::UploadConfig;
use crate::db::{BatchRecord, ClassificationRecord, RepositoryError};
use crate::error::ClassifyError;
use crate::model::{InferenceEngine, InferenceError, ModelCache, ModelError};

const MAX_NOTES_CHARS: usize = 2000;
const MAX_LOCATION_CHARS: usize = 255;

/// Upload to stored result: validate, infer, persist.
pub struct ClassificationService {
    validator: Arc<ImageValidator>,
    models: Arc<ModelCache>,
    engine: InferenceEngine,
    writer: RecordWriter,
    orchestrator: BatchOrchestrator,
}

impl ClassificationService {
    pub fn new(
        upload: &UploadConfig,
        models: Arc<ModelCache>,
        engine: InferenceEngine,
        writer: RecordWriter,
    ) -> Self {
        Self {
            validator: Arc::new(ImageValidator::new(upload)),
            orchestrator: BatchOrchestrator::new(upload.max_batch_images, engine.max_concurrent()),
            models,
            engine,
            writer,
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.validator.max_bytes()
    }

    pub fn max_batch_images(&self) -> usize {
        self.orchestrator.max_images()
    }

    pub async fn classify(
        &self,
        context: &RequestContext,
        upload: UploadedImage,
    ) -> Result<ClassificationResponse, ClassifyError> {
        let context = self.writer.check_batch(context).await?;
        self.process(&context, upload).await
    }

    pub async fn classify_batch(
        &self,
        context: &RequestContext,
        uploads: Vec<UploadedImage>,
    ) -> Result<BatchClassificationResponse, ClassifyError> {
        let context = self.writer.check_batch(context).await?;
        let outcome = self
            .orchestrator
            .run(uploads, |upload| self.process(&context, upload))
            .await?;

        if let Some(batch_id) = context.batch_id {
            if let Err(e) = self
                .writer
                .record_batch_failures(batch_id, outcome.summary.failed as u64)
                .await
            {
                log::error!("Failed to record batch failures for {}: {}", batch_id, e);
            }
        }

        Ok(BatchClassificationResponse {
            batch_id: context.batch_id,
            results: outcome.results,
            summary: outcome.summary,
        })
    }

    async fn process(
        &self,
        context: &RequestContext,
        upload: UploadedImage,
    ) -> Result<ClassificationResponse, ClassifyError> {
        let file_name = upload.file_name.clone().unwrap_or_default();
        let validator = self.validator.clone();
        let validated = tokio::task::spawn_blocking(move || validator.validate(upload))
            .await
            .map_err(|e| {
                InferenceError::Preprocessing(format!("validation task failed: {}", e))
            })?
            .map_err(|e| {
                log::warn!("Rejected upload '{}': {}", file_name, e);
                e
            })?;

        let handle = self.models.get().await?;
        let inference = self
            .engine
            .classify(handle.clone(), validated.image.clone(), context.tta)
            .await
            .map_err(|e| {
                log::error!("Inference failed for '{}': {}", file_name, e);
                e
            })?;

        let record = self
            .writer
            .write(context, &inference, &handle.metadata.version, &validated)
            .await?;

        log::info!(
            "Classified {} as {} ({:.3}) in {:.1} ms{}",
            record.id,
            record.class_name,
            record.confidence,
            record.processing_time_ms,
            if record.tta_used { " with TTA" } else { "" }
        );
        Ok(record.to_response())
    }

    pub async fn get_result(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<ClassificationResponse, ClassifyError> {
        match self.writer.repository().get_result(id).await? {
            Some(record) if record.user_id == user_id => Ok(record.to_response()),
            _ => Err(ClassifyError::NotFound(format!("Classification {}", id))),
        }
    }

    pub async fn list_results(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ClassificationResponse>, ClassifyError> {
        let records = self.writer.repository().list_results_for_user(user_id).await?;
        Ok(records.iter().map(ClassificationRecord::to_response).collect())
    }

    pub async fn statistics(&self, user_id: Uuid) -> Result<StatisticsResponse, ClassifyError> {
        let records = self.writer.repository().list_results_for_user(user_id).await?;
        Ok(statistics(&records, Utc::now()))
    }

    pub async fn create_batch(
        &self,
        user_id: Uuid,
        request: CreateBatchRequest,
    ) -> Result<BatchResponse, ClassifyError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(ClassifyError::bad_field("name", "must not be empty"));
        }
        let batch = BatchRecord::new(request.farm_id, user_id, name.to_string());
        self.writer.repository().create_batch(&batch).await?;
        log::info!("Created batch {} '{}' for farm {}", batch.id, batch.name, batch.farm_id);
        Ok(batch.to_response())
    }

    pub async fn get_batch(&self, user_id: Uuid, id: Uuid) -> Result<BatchResponse, ClassifyError> {
        match self.writer.repository().get_batch(id).await? {
            Some(batch) if batch.user_id == user_id => Ok(batch.to_response()),
            _ => Err(ClassifyError::BatchNotFound(id)),
        }
    }

    pub fn model_info(&self) -> ModelInfoResponse {
        self.models.info()
    }

    pub fn model_loaded(&self) -> bool {
        self.models.loaded().is_some()
    }

    pub async fn reload_model(&self) -> Result<ModelInfoResponse, ClassifyError> {
        let handle = self.models.reload().await?;
        Ok(handle.info())
    }

    pub async fn switch_model(&self, file: &str) -> Result<ModelInfoResponse, ClassifyError> {
        match self.models.switch(file).await {
            Ok(handle) => Ok(handle.info()),
            Err(ModelError::UnknownArtifact(name)) => {
                Err(ClassifyError::NotFound(format!("Model artifact '{}'", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Merges an administrator's correction into the stored annotation.
    /// Blank text clears a field; omitted fields keep their value.
    pub async fn correct_result(
        &self,
        admin_id: Uuid,
        id: Uuid,
        request: CorrectionRequest,
    ) -> Result<ClassificationResponse, ClassifyError> {
        if request == CorrectionRequest::default() {
            return Err(ClassifyError::bad_field("correction", "no field to update"));
        }
        let not_found = || ClassifyError::NotFound(format!("Classification {}", id));
        let record = self
            .writer
            .repository()
            .get_result(id)
            .await?
            .ok_or_else(not_found)?;

        let previous = record.annotation.as_ref();
        let annotation = Annotation {
            ground_truth: request
                .ground_truth
                .or_else(|| previous.and_then(|a| a.ground_truth)),
            notes: merge_text(
                "notes",
                request.notes,
                previous.and_then(|a| a.notes.clone()),
                MAX_NOTES_CHARS,
            )?,
            location: merge_text(
                "location",
                request.location,
                previous.and_then(|a| a.location.clone()),
                MAX_LOCATION_CHARS,
            )?,
            corrected_by: admin_id,
            corrected_at: Utc::now(),
        };

        let updated = match self.writer.repository().annotate_result(id, &annotation).await {
            Err(RepositoryError::NotFound) => return Err(not_found()),
            other => other?,
        };
        log::info!(
            "Result {} corrected by {} (predicted {}, ground truth {})",
            id,
            admin_id,
            updated.class_name,
            annotation
                .ground_truth
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unset".to_string())
        );
        Ok(updated.to_response())
    }
}

fn merge_text(
    field: &str,
    update: Option<String>,
    previous: Option<String>,
    max_chars: usize,
) -> Result<Option<String>, ClassifyError> {
    let Some(text) = update else {
        return Ok(previous);
    };
    let text = text.trim();
    if text.chars().count() > max_chars {
        return Err(ClassifyError::bad_field(
            field,
            format!("longer than {} characters", max_chars),
        ));
    }
    Ok((!text.is_empty()).then(|| text.to_string()))
}

/// Totals over a user's results; week and month counts are relative to `now`.
pub fn statistics(records: &[ClassificationRecord], now: DateTime<Utc>) -> StatisticsResponse {
    let week_ago = now - Duration::days(7);
    let month_ago = now - Duration::days(30);

    let mut class_distribution = std::collections::BTreeMap::new();
    let mut confidence_sum = 0.0f64;
    let mut weekly_count = 0;
    let mut monthly_count = 0;
    for record in records {
        *class_distribution.entry(record.class_name).or_insert(0) += 1;
        confidence_sum += f64::from(record.confidence);
        if record.created_at >= week_ago {
            weekly_count += 1;
        }
        if record.created_at >= month_ago {
            monthly_count += 1;
        }
    }

    let avg_confidence = if records.is_empty() {
        0.0
    } else {
        (confidence_sum / records.len() as f64) as f32
    };

    StatisticsResponse {
        total_count: records.len(),
        class_distribution,
        weekly_count,
        monthly_count,
        avg_confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::test_support::record;
    use crate::db::InMemoryRepository;
    use crate::model::cache::test_support::CountingLoader;
    use crate::pipeline::validator::test_images::jpeg_10x10;
    use crate::pipeline::writer::test_support::MemoryImageStore;
    use shared::PlumCategory;
    use std::sync::atomic::Ordering;

    struct Fixture {
        service: ClassificationService,
        loader: Arc<CountingLoader>,
        store: Arc<MemoryImageStore>,
    }

    fn fixture(loader: CountingLoader) -> Fixture {
        let loader = Arc::new(loader);
        let store = Arc::new(MemoryImageStore::default());
        let writer = RecordWriter::new(store.clone(), Arc::new(InMemoryRepository::new()));
        let service = ClassificationService::new(
            &UploadConfig::default(),
            Arc::new(ModelCache::new(loader.clone())),
            InferenceEngine::new(2),
            writer,
        );
        Fixture {
            service,
            loader,
            store,
        }
    }

    fn jpeg(name: &str) -> UploadedImage {
        UploadedImage::new(
            Some(name.to_string()),
            Some("image/jpeg".to_string()),
            jpeg_10x10(),
        )
    }

    #[tokio::test]
    async fn classifies_and_stores_one_image() {
        let fx = fixture(CountingLoader::new(std::time::Duration::ZERO));
        let user = Uuid::new_v4();
        let response = fx
            .service
            .classify(&RequestContext::for_user(user), jpeg("plum.jpg"))
            .await
            .unwrap();

        assert_eq!(response.class_name, PlumCategory::BonneQualite);
        assert!((0.0..=1.0).contains(&response.confidence));
        assert_eq!(response.probabilities.len(), PlumCategory::COUNT);
        assert_eq!(fx.store.len(), 1);
        assert_eq!(fx.service.get_result(user, response.id).await.unwrap(), response);
        assert!(fx.service.get_result(Uuid::new_v4(), response.id).await.is_err());
    }

    #[tokio::test]
    async fn oversized_upload_never_reaches_the_model() {
        let fx = fixture(CountingLoader::new(std::time::Duration::ZERO));
        let big = UploadedImage::new(
            Some("big.jpg".to_string()),
            Some("image/jpeg".to_string()),
            vec![0u8; 6 * 1024 * 1024],
        );
        let err = fx
            .service
            .classify(&RequestContext::for_user(Uuid::new_v4()), big)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some("too_large"));
        assert_eq!(fx.loader.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_model_is_unavailable() {
        let fx = fixture(CountingLoader::failing());
        let err = fx
            .service
            .classify(&RequestContext::for_user(Uuid::new_v4()), jpeg("plum.jpg"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "model_unavailable");
        assert_eq!(fx.store.len(), 0);
    }

    #[tokio::test]
    async fn batch_updates_counters_for_successes_and_failures() {
        let fx = fixture(CountingLoader::new(std::time::Duration::ZERO));
        let user = Uuid::new_v4();
        let farm = Uuid::new_v4();
        let batch = fx
            .service
            .create_batch(
                user,
                CreateBatchRequest {
                    farm_id: farm,
                    name: "Orchard A".to_string(),
                },
            )
            .await
            .unwrap();
        let context = RequestContext {
            farm_id: Some(farm),
            batch_id: Some(batch.id),
            ..RequestContext::for_user(user)
        };

        let uploads = vec![
            jpeg("1.jpg"),
            UploadedImage::new(Some("2.jpg".to_string()), None, b"plain text".to_vec()),
            jpeg("3.jpg"),
        ];
        let response = fx.service.classify_batch(&context, uploads).await.unwrap();
        assert_eq!(response.summary.succeeded, 2);
        assert_eq!(response.summary.failed, 1);

        let stored = fx.service.get_batch(user, batch.id).await.unwrap();
        assert_eq!(stored.success_count, 2);
        assert_eq!(stored.error_count, 1);
        assert_eq!(stored.class_distribution[&PlumCategory::BonneQualite], 2);
    }

    #[tokio::test]
    async fn results_take_the_farm_of_their_batch() {
        let fx = fixture(CountingLoader::new(std::time::Duration::ZERO));
        let user = Uuid::new_v4();
        let farm = Uuid::new_v4();
        let batch = fx
            .service
            .create_batch(
                user,
                CreateBatchRequest {
                    farm_id: farm,
                    name: "Orchard B".to_string(),
                },
            )
            .await
            .unwrap();
        let context = RequestContext {
            batch_id: Some(batch.id),
            ..RequestContext::for_user(user)
        };

        let single = fx.service.classify(&context, jpeg("1.jpg")).await.unwrap();
        assert_eq!(single.farm_id, Some(farm));
        let batched = fx
            .service
            .classify_batch(&context, vec![jpeg("2.jpg")])
            .await
            .unwrap();
        assert_eq!(batched.results[0].result.as_ref().unwrap().farm_id, Some(farm));
    }

    #[tokio::test]
    async fn foreign_batch_rejects_whole_request() {
        let fx = fixture(CountingLoader::new(std::time::Duration::ZERO));
        let batch = fx
            .service
            .create_batch(
                Uuid::new_v4(),
                CreateBatchRequest {
                    farm_id: Uuid::new_v4(),
                    name: "theirs".to_string(),
                },
            )
            .await
            .unwrap();
        let context = RequestContext {
            batch_id: Some(batch.id),
            ..RequestContext::for_user(Uuid::new_v4())
        };
        let err = fx
            .service
            .classify_batch(&context, vec![jpeg("1.jpg")])
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::BatchNotFound(_)));
        assert_eq!(fx.loader.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_batch_name_is_rejected() {
        let fx = fixture(CountingLoader::new(std::time::Duration::ZERO));
        let err = fx
            .service
            .create_batch(
                Uuid::new_v4(),
                CreateBatchRequest {
                    farm_id: Uuid::new_v4(),
                    name: "  ".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::BadField { .. }));
    }

    #[test]
    fn statistics_count_recent_results() {
        let now = Utc::now();
        let user = Uuid::new_v4();
        let mut fresh = record(user, None, PlumCategory::Pourrie);
        fresh.created_at = now - Duration::days(1);
        fresh.confidence = 0.6;
        let mut recent = record(user, None, PlumCategory::Pourrie);
        recent.created_at = now - Duration::days(10);
        recent.confidence = 0.8;
        let mut old = record(user, None, PlumCategory::NonMure);
        old.created_at = now - Duration::days(90);
        old.confidence = 1.0;

        let stats = statistics(&[fresh, recent, old], now);
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.weekly_count, 1);
        assert_eq!(stats.monthly_count, 2);
        assert_eq!(stats.class_distribution[&PlumCategory::Pourrie], 2);
        assert!((stats.avg_confidence - 0.8).abs() < 1e-6);

        let empty = statistics(&[], now);
        assert_eq!(empty.total_count, 0);
        assert_eq!(empty.avg_confidence, 0.0);
    }

    #[tokio::test]
    async fn correction_merges_into_previous_annotation() {
        let fx = fixture(CountingLoader::new(std::time::Duration::ZERO));
        let user = Uuid::new_v4();
        let admin = Uuid::new_v4();
        let result = fx
            .service
            .classify(&RequestContext::for_user(user), jpeg("plum.jpg"))
            .await
            .unwrap();

        let first = fx
            .service
            .correct_result(
                admin,
                result.id,
                CorrectionRequest {
                    ground_truth: Some(PlumCategory::Meurtrie),
                    notes: Some("  bruise near the stem ".to_string()),
                    location: None,
                },
            )
            .await
            .unwrap();
        let annotation = first.annotation.as_ref().unwrap();
        assert_eq!(annotation.ground_truth, Some(PlumCategory::Meurtrie));
        assert_eq!(annotation.notes.as_deref(), Some("bruise near the stem"));
        assert_eq!(annotation.corrected_by, admin);
        assert_eq!(first.class_name, result.class_name);

        let second = fx
            .service
            .correct_result(
                admin,
                result.id,
                CorrectionRequest {
                    notes: Some(" ".to_string()),
                    location: Some("Row 4".to_string()),
                    ..CorrectionRequest::default()
                },
            )
            .await
            .unwrap();
        let annotation = second.annotation.as_ref().unwrap();
        assert_eq!(annotation.ground_truth, Some(PlumCategory::Meurtrie));
        assert_eq!(annotation.notes, None);
        assert_eq!(annotation.location.as_deref(), Some("Row 4"));
        assert_eq!(fx.service.get_result(user, result.id).await.unwrap(), second);
    }

    #[tokio::test]
    async fn correction_rejects_empty_long_and_unknown() {
        let fx = fixture(CountingLoader::new(std::time::Duration::ZERO));
        let admin = Uuid::new_v4();
        let result = fx
            .service
            .classify(&RequestContext::for_user(Uuid::new_v4()), jpeg("plum.jpg"))
            .await
            .unwrap();

        let empty = fx
            .service
            .correct_result(admin, result.id, CorrectionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(empty, ClassifyError::BadField { .. }));

        let long = CorrectionRequest {
            location: Some("x".repeat(MAX_LOCATION_CHARS + 1)),
            ..CorrectionRequest::default()
        };
        let err = fx.service.correct_result(admin, result.id, long).await.unwrap_err();
        assert!(matches!(err, ClassifyError::BadField { ref field, .. } if field == "location"));

        let unknown = CorrectionRequest {
            ground_truth: Some(PlumCategory::Pourrie),
            ..CorrectionRequest::default()
        };
        let err = fx
            .service
            .correct_result(admin, Uuid::new_v4(), unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::NotFound(_)));
    }

    #[tokio::test]
    async fn switching_to_unknown_artifact_is_not_found() {
        let fx = fixture(CountingLoader::new(std::time::Duration::ZERO));
        let info = fx.service.switch_model("plum_v2.pt").await.unwrap();
        assert_eq!(info.model_path.as_deref(), Some("test/plum_v2.pt"));

        let err = fx.service.switch_model("missing.pt").await.unwrap_err();
        assert!(matches!(err, ClassifyError::NotFound(_)));
        assert_eq!(
            fx.service.model_info().model_path.as_deref(),
            Some("test/plum_v2.pt")
        );
    }
}
