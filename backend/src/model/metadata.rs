use serde::{Deserialize, Serialize};
use shared::PlumCategory;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::loader::ModelError;

pub const DEFAULT_IMAGE_SIZE: u32 = 320;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Sidecar metadata shipped next to a model artifact as `<stem>_metadata.json`.
/// Every key is optional; absent keys fall back to the built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelMetadata {
    pub model_name: String,
    pub version: String,
    pub num_classes: usize,
    pub confidence_threshold: f32,
    pub input_shape: Vec<i64>,
    /// Older sidecars only carry the square edge length. Read only when the
    /// sidecar has no `input_shape`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_size: Option<u32>,
    pub idx_to_class: BTreeMap<usize, String>,
    pub accuracy: Option<f32>,
    pub f1_score: Option<f32>,
    pub precision: Option<f32>,
    pub recall: Option<f32>,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self::with_defaults(DEFAULT_IMAGE_SIZE, DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl ModelMetadata {
    pub fn with_defaults(image_size: u32, confidence_threshold: f32) -> Self {
        Self {
            model_name: "plum_classifier".to_string(),
            version: "1.0.0".to_string(),
            num_classes: PlumCategory::COUNT,
            confidence_threshold,
            input_shape: vec![1, 3, image_size as i64, image_size as i64],
            input_size: None,
            idx_to_class: PlumCategory::all()
                .map(|c| (c.index(), c.to_string()))
                .collect(),
            accuracy: None,
            f1_score: None,
            precision: None,
            recall: None,
        }
    }

    pub fn sidecar_path(artifact: &Path) -> PathBuf {
        let stem = artifact
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        artifact.with_file_name(format!("{}_metadata.json", stem))
    }

    /// Parses a sidecar document, filling unspecified keys from `fallback`.
    pub fn from_json(contents: &str, fallback: &ModelMetadata) -> Result<Self, ModelError> {
        let value: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| ModelError::InvalidMetadata(e.to_string()))?;
        let mut merged = serde_json::to_value(fallback)
            .map_err(|e| ModelError::InvalidMetadata(e.to_string()))?;
        if let (Some(target), Some(source)) = (merged.as_object_mut(), value.as_object()) {
            for (key, v) in source {
                if !v.is_null() {
                    target.insert(key.clone(), v.clone());
                }
            }
        } else {
            return Err(ModelError::InvalidMetadata(
                "metadata must be a JSON object".to_string(),
            ));
        }
        let mut metadata: ModelMetadata = serde_json::from_value(merged)
            .map_err(|e| ModelError::InvalidMetadata(e.to_string()))?;
        match value.get("input_shape") {
            Some(shape) if !shape.is_null() => metadata.input_size = None,
            _ => {
                if let Some(size) = metadata.input_size {
                    metadata.input_shape = vec![1, 3, size as i64, size as i64];
                }
            }
        }
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ModelError::InvalidMetadata(format!(
                "confidence_threshold {} is outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.num_classes == 0 {
            return Err(ModelError::InvalidMetadata(
                "num_classes must be positive".to_string(),
            ));
        }
        if self.image_size() == 0 {
            return Err(ModelError::InvalidMetadata(format!(
                "unusable input shape {:?}",
                self.input_shape
            )));
        }
        let in_domain = (0..self.num_classes)
            .filter(|&i| self.category_for(i).is_some())
            .count();
        if in_domain == 0 {
            return Err(ModelError::InvalidMetadata(
                "no output index maps to a plum category".to_string(),
            ));
        }
        Ok(())
    }

    /// Square edge length the preprocessor resizes to, taken from `input_shape`.
    pub fn image_size(&self) -> u32 {
        match self.input_shape.as_slice() {
            [.., h, w] if h == w && *w > 0 => *w as u32,
            _ => 0,
        }
    }

    pub fn label_for(&self, index: usize) -> Option<&str> {
        self.idx_to_class.get(&index).map(String::as_str)
    }

    /// Category for an output index, or `None` for an out-of-domain output.
    pub fn category_for(&self, index: usize) -> Option<PlumCategory> {
        match self.label_for(index) {
            Some(label) => PlumCategory::from_str(label).ok(),
            None => PlumCategory::from_index(index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_six_class_model() {
        let metadata = ModelMetadata::default();
        assert_eq!(metadata.num_classes, 6);
        assert_eq!(metadata.image_size(), 320);
        assert_eq!(metadata.input_shape, vec![1, 3, 320, 320]);
        assert_eq!(metadata.category_for(5), Some(PlumCategory::Pourrie));
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn sidecar_path_uses_stem() {
        let path = ModelMetadata::sidecar_path(Path::new("/models/plum_classifier.pt"));
        assert_eq!(path, PathBuf::from("/models/plum_classifier_metadata.json"));
    }

    #[test]
    fn partial_sidecar_keeps_defaults() {
        let json = r#"{"version": "2.1.0", "confidence_threshold": 0.55, "accuracy": 0.93}"#;
        let metadata = ModelMetadata::from_json(json, &ModelMetadata::default()).unwrap();
        assert_eq!(metadata.version, "2.1.0");
        assert!((metadata.confidence_threshold - 0.55).abs() < f32::EPSILON);
        assert_eq!(metadata.accuracy, Some(0.93));
        assert_eq!(metadata.num_classes, 6);
        assert_eq!(metadata.image_size(), 320);
    }

    #[test]
    fn string_indexed_class_mapping_is_accepted() {
        let json = r#"{
            "num_classes": 7,
            "idx_to_class": {"0": "bonne_qualite", "1": "non_mure", "2": "tachetee",
                             "3": "fissuree", "4": "meurtrie", "5": "pourrie", "6": "not_plum"}
        }"#;
        let metadata = ModelMetadata::from_json(json, &ModelMetadata::default()).unwrap();
        assert_eq!(metadata.category_for(0), Some(PlumCategory::BonneQualite));
        assert_eq!(metadata.category_for(6), None);
        assert_eq!(metadata.label_for(6), Some("not_plum"));
    }

    #[test]
    fn legacy_input_size_key_sets_shape() {
        let json = r#"{"input_size": 224}"#;
        let metadata = ModelMetadata::from_json(json, &ModelMetadata::default()).unwrap();
        assert_eq!(metadata.image_size(), 224);
        assert_eq!(metadata.input_shape, vec![1, 3, 224, 224]);
    }

    #[test]
    fn explicit_input_shape_beats_input_size() {
        let json = r#"{"input_shape": [1, 3, 384, 384], "input_size": 224}"#;
        let metadata = ModelMetadata::from_json(json, &ModelMetadata::default()).unwrap();
        assert_eq!(metadata.image_size(), 384);
        assert_eq!(metadata.input_shape, vec![1, 3, 384, 384]);
        assert_eq!(metadata.input_size, None);

        let preprocessor = crate::pipeline::preprocess::Preprocessor::new(metadata.image_size());
        assert_eq!(preprocessor.input_shape(), [1, 3, 384, 384]);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let json = r#"{"confidence_threshold": 1.5}"#;
        assert!(matches!(
            ModelMetadata::from_json(json, &ModelMetadata::default()),
            Err(ModelError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn non_object_sidecar_is_rejected() {
        assert!(ModelMetadata::from_json("[1, 2]", &ModelMetadata::default()).is_err());
    }
}
