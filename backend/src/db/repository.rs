use async_trait::async_trait;
use shared::Annotation;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use super::models::{BatchRecord, ClassificationRecord};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("DynamoDB error: {0}")]
    DynamoDb(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Item not found")]
    NotFound,
    #[error("Invalid data format: {0}")]
    InvalidData(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

#[async_trait]
pub trait ResultRepository: Send + Sync {
    /// Inserts the record and, when it names a batch, bumps that batch's
    /// counters in the same step. Nothing is written if either part fails;
    /// a missing batch yields `NotFound`.
    async fn insert_result(&self, record: &ClassificationRecord) -> Result<(), RepositoryError>;

    async fn record_batch_failures(&self, batch_id: Uuid, failures: u64)
    -> Result<(), RepositoryError>;

    async fn get_result(&self, id: Uuid) -> Result<Option<ClassificationRecord>, RepositoryError>;

    /// Replaces the annotation of an existing result and returns the updated
    /// record; `NotFound` if there is no such result.
    async fn annotate_result(
        &self,
        id: Uuid,
        annotation: &Annotation,
    ) -> Result<ClassificationRecord, RepositoryError>;

    /// Newest first.
    async fn list_results_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ClassificationRecord>, RepositoryError>;

    async fn create_batch(&self, batch: &BatchRecord) -> Result<(), RepositoryError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchRecord>, RepositoryError>;
}

#[derive(Default)]
struct Tables {
    results: HashMap<Uuid, ClassificationRecord>,
    batches: HashMap<Uuid, BatchRecord>,
}

/// Keeps everything in process memory behind one lock.
#[derive(Default)]
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tables)
    }
}

#[async_trait]
impl ResultRepository for InMemoryRepository {
    async fn insert_result(&self, record: &ClassificationRecord) -> Result<(), RepositoryError> {
        self.with_tables(|tables| {
            if tables.results.contains_key(&record.id) {
                return Err(RepositoryError::Conflict(format!(
                    "result {} already exists",
                    record.id
                )));
            }
            if let Some(batch_id) = record.batch_id {
                let batch = tables
                    .batches
                    .get_mut(&batch_id)
                    .ok_or(RepositoryError::NotFound)?;
                batch.record_success(record.class_name);
            }
            tables.results.insert(record.id, record.clone());
            Ok(())
        })
    }

    async fn record_batch_failures(
        &self,
        batch_id: Uuid,
        failures: u64,
    ) -> Result<(), RepositoryError> {
        self.with_tables(|tables| {
            let batch = tables
                .batches
                .get_mut(&batch_id)
                .ok_or(RepositoryError::NotFound)?;
            batch.record_failures(failures);
            Ok(())
        })
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<ClassificationRecord>, RepositoryError> {
        Ok(self.with_tables(|tables| tables.results.get(&id).cloned()))
    }

    async fn annotate_result(
        &self,
        id: Uuid,
        annotation: &Annotation,
    ) -> Result<ClassificationRecord, RepositoryError> {
        self.with_tables(|tables| {
            let record = tables.results.get_mut(&id).ok_or(RepositoryError::NotFound)?;
            record.annotation = Some(annotation.clone());
            Ok(record.clone())
        })
    }

    async fn list_results_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ClassificationRecord>, RepositoryError> {
        let mut records: Vec<ClassificationRecord> = self.with_tables(|tables| {
            tables
                .results
                .values()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect()
        });
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn create_batch(&self, batch: &BatchRecord) -> Result<(), RepositoryError> {
        self.with_tables(|tables| {
            if tables.batches.contains_key(&batch.id) {
                return Err(RepositoryError::Conflict(format!(
                    "batch {} already exists",
                    batch.id
                )));
            }
            tables.batches.insert(batch.id, batch.clone());
            Ok(())
        })
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<BatchRecord>, RepositoryError> {
        Ok(self.with_tables(|tables| tables.batches.get(&id).cloned()))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::super::models::ClassificationRecord;
    use chrono::Utc;
    use shared::PlumCategory;
    use uuid::Uuid;

    pub fn record(user_id: Uuid, batch_id: Option<Uuid>, class_name: PlumCategory) -> ClassificationRecord {
        ClassificationRecord {
            id: Uuid::new_v4(),
            user_id,
            image_key: "plum_images/k.jpg".to_string(),
            image_path: "plum_images/k.jpg".to_string(),
            class_name,
            confidence: 0.9,
            is_plum: true,
            low_confidence: false,
            probabilities: PlumCategory::all().map(|c| (c, 0.0)).collect(),
            processing_time_ms: 12.0,
            tta_used: false,
            model_version: "1.0.0".to_string(),
            farm_id: None,
            batch_id,
            created_at: Utc::now(),
            annotation: None,
        }
    }
}
