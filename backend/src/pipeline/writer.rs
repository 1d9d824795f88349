use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::validator::ValidatedImage;
use crate::db::{ClassificationRecord, RepositoryError, ResultRepository};
use crate::error::{ClassifyError, PersistenceError};
use crate::model::Inference;
use crate::storage::{self, ImageStore};

/// Who is asking, and where results should be filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Uuid,
    pub farm_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub tta: bool,
}

impl RequestContext {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id,
            farm_id: None,
            batch_id: None,
            tta: false,
        }
    }
}

/// Persists one classification: image first, then the record together with
/// its batch counters. A record is only ever visible with its image in place.
#[derive(Clone)]
pub struct RecordWriter {
    store: Arc<dyn ImageStore>,
    repository: Arc<dyn ResultRepository>,
}

impl RecordWriter {
    pub fn new(store: Arc<dyn ImageStore>, repository: Arc<dyn ResultRepository>) -> Self {
        Self { store, repository }
    }

    pub fn repository(&self) -> &Arc<dyn ResultRepository> {
        &self.repository
    }

    /// Fails with `BatchNotFound` unless the batch exists and belongs to the
    /// caller (and to the farm, when one is given). The returned context
    /// carries the batch's farm.
    pub async fn check_batch(
        &self,
        context: &RequestContext,
    ) -> Result<RequestContext, ClassifyError> {
        let Some(batch_id) = context.batch_id else {
            return Ok(*context);
        };
        match self.repository.get_batch(batch_id).await? {
            Some(batch) if batch.accepts(context.user_id, context.farm_id) => Ok(RequestContext {
                farm_id: Some(batch.farm_id),
                ..*context
            }),
            _ => Err(ClassifyError::BatchNotFound(batch_id)),
        }
    }

    pub async fn write(
        &self,
        context: &RequestContext,
        inference: &Inference,
        model_version: &str,
        image: &ValidatedImage,
    ) -> Result<ClassificationRecord, ClassifyError> {
        let prediction = &inference.prediction;
        let id = Uuid::new_v4();
        let key = storage::image_key(context.user_id, id, &image.bytes, image.extension());

        let image_path = self
            .store
            .put(&key, &image.bytes, image.mime_type())
            .await
            .map_err(|e| {
                log::error!("Failed to store image {}: {}", key, e);
                ClassifyError::Persistence {
                    source: PersistenceError::Storage(e),
                    prediction: Box::new(prediction.summary()),
                }
            })?;

        let record = ClassificationRecord {
            id,
            user_id: context.user_id,
            image_key: key,
            image_path,
            class_name: prediction.category,
            confidence: prediction.confidence,
            is_plum: prediction.is_plum,
            low_confidence: prediction.low_confidence,
            probabilities: prediction.probabilities.clone(),
            processing_time_ms: inference.elapsed.as_secs_f64() * 1000.0,
            tta_used: inference.tta_used,
            model_version: model_version.to_string(),
            farm_id: context.farm_id,
            batch_id: context.batch_id,
            created_at: Utc::now(),
            annotation: None,
        };

        match self.repository.insert_result(&record).await {
            Ok(()) => Ok(record),
            Err(e) => {
                self.discard_image(&record.image_key).await;
                match (e, context.batch_id) {
                    (RepositoryError::NotFound, Some(batch_id)) => {
                        Err(ClassifyError::BatchNotFound(batch_id))
                    }
                    (e, _) => {
                        log::error!("Failed to save classification {}: {}", record.id, e);
                        Err(ClassifyError::Persistence {
                            source: PersistenceError::Repository(e),
                            prediction: Box::new(prediction.summary()),
                        })
                    }
                }
            }
        }
    }

    pub async fn record_batch_failures(
        &self,
        batch_id: Uuid,
        failures: u64,
    ) -> Result<(), ClassifyError> {
        if failures == 0 {
            return Ok(());
        }
        self.repository
            .record_batch_failures(batch_id, failures)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => ClassifyError::BatchNotFound(batch_id),
                other => ClassifyError::Repository(other),
            })
    }

    async fn discard_image(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            log::error!("Failed to remove orphaned image {}: {}", key, e);
        }
    }
}
