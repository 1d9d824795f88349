use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Plum quality categories. The declaration order is the model's output index order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlumCategory {
    BonneQualite,
    NonMure,
    Tachetee,
    Fissuree,
    Meurtrie,
    Pourrie,
}

impl PlumCategory {
    pub const COUNT: usize = 6;

    pub fn from_index(index: usize) -> Option<Self> {
        Self::iter().nth(index)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Human readable label shown next to the internal name.
    pub fn label(self) -> &'static str {
        match self {
            PlumCategory::BonneQualite => "Good quality",
            PlumCategory::NonMure => "Unripe",
            PlumCategory::Tachetee => "Spotted",
            PlumCategory::Fissuree => "Cracked",
            PlumCategory::Meurtrie => "Bruised",
            PlumCategory::Pourrie => "Rotten",
        }
    }

    pub fn all() -> impl Iterator<Item = PlumCategory> {
        Self::iter()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClassificationResponse {
    pub id: Uuid,
    pub image_path: String,
    pub class_name: PlumCategory,
    pub class_label: String,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
}

/// Administrator's correction of a stored result. Omitted fields keep their
/// previous value.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct CorrectionRequest {
    pub ground_truth: Option<PlumCategory>,
    pub notes: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Annotation {
    pub ground_truth: Option<PlumCategory>,
    pub notes: Option<String>,
    pub location: Option<String>,
    pub corrected_by: Uuid,
    pub corrected_at: DateTime<Utc>,
}

/// A computed prediction that could not be stored. Returned so the caller can retry.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PredictionSummary {
    pub class_name: PlumCategory,
    pub class_label: String,
    pub confidence: f32,
    pub is_plum: bool,
    pub low_confidence: bool,
    pub probabilities: BTreeMap<PlumCategory, f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ItemError {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BatchItemResult {
    pub index: usize,
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ClassificationResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub class_distribution: BTreeMap<PlumCategory, usize>,
    pub mean_confidence: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BatchClassificationResponse {
    pub batch_id: Option<Uuid>,
    pub results: Vec<BatchItemResult>,
    pub summary: BatchSummary,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateBatchRequest {
    pub farm_id: Uuid,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BatchResponse {
    pub id: Uuid,
    pub farm_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub success_count: u64,
    pub error_count: u64,
    pub class_distribution: BTreeMap<PlumCategory, u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StatisticsResponse {
    pub total_count: usize,
    pub class_distribution: BTreeMap<PlumCategory, usize>,
    pub weekly_count: usize,
    pub monthly_count: usize,
    pub avg_confidence: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ModelInfoResponse {
    pub loaded: bool,
    pub model_name: Option<String>,
    pub version: Option<String>,
    pub num_classes: Option<usize>,
    pub confidence_threshold: Option<f32>,
    pub input_shape: Option<Vec<i64>>,
    pub idx_to_class: Option<BTreeMap<usize, String>>,
    pub device: Option<String>,
    pub model_path: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub accuracy: Option<f32>,
    pub f1_score: Option<f32>,
}

/// Names a model artifact inside the configured model directory.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SwitchModelRequest {
    pub file: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<PredictionSummary>,
}
