use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{Annotation, BatchResponse, ClassificationResponse, PlumCategory};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One persisted classification. The prediction is written once; only an
/// administrator's annotation may change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_key: String,
    pub image_path: String,
    pub class_name: PlumCategory,
    pub confidence: f32,
    pub is_plum: bool,
    pub low_confidence: bool,
    pub probabilities: BTreeMap<PlumCategory, f32>,
    pub processing_time_ms: f64,
    pub tta_used: bool,
    pub model_version: String,
    pub farm_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub annotation: Option<Annotation>,
}

impl ClassificationRecord {
    pub fn to_response(&self) -> ClassificationResponse {
        ClassificationResponse {
            id: self.id,
            image_path: self.image_path.clone(),
            class_name: self.class_name,
            class_label: self.class_name.label().to_string(),
            confidence: self.confidence,
            is_plum: self.is_plum,
            low_confidence: self.low_confidence,
            probabilities: self.probabilities.clone(),
            processing_time_ms: self.processing_time_ms,
            tta_used: self.tta_used,
            model_version: self.model_version.clone(),
            farm_id: self.farm_id,
            batch_id: self.batch_id,
            created_at: self.created_at,
            annotation: self.annotation.clone(),
        }
    }
}

/// A named group of results under one farm, with running totals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRecord {
    pub id: Uuid,
    pub farm_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub success_count: u64,
    pub error_count: u64,
    pub class_distribution: BTreeMap<PlumCategory, u64>,
}

impl BatchRecord {
    pub fn new(farm_id: Uuid, user_id: Uuid, name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            farm_id,
            user_id,
            name,
            created_at: Utc::now(),
            success_count: 0,
            error_count: 0,
            class_distribution: BTreeMap::new(),
        }
    }

    pub fn record_success(&mut self, category: PlumCategory) {
        self.success_count += 1;
        *self.class_distribution.entry(category).or_insert(0) += 1;
    }

    pub fn record_failures(&mut self, count: u64) {
        self.error_count += count;
    }

    /// Whether `user_id` may attach results to this batch, optionally for `farm_id`.
    pub fn accepts(&self, user_id: Uuid, farm_id: Option<Uuid>) -> bool {
        self.user_id == user_id && farm_id.is_none_or(|f| f == self.farm_id)
    }

    pub fn to_response(&self) -> BatchResponse {
        BatchResponse {
            id: self.id,
            farm_id: self.farm_id,
            name: self.name.clone(),
            created_at: self.created_at,
            success_count: self.success_count,
            error_count: self.error_count,
            class_distribution: self.class_distribution.clone(),
        }
    }
}
