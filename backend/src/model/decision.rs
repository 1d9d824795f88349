use shared::{PlumCategory, PredictionSummary};
use std::collections::BTreeMap;

use super::classifier::InferenceError;
use super::metadata::ModelMetadata;

/// Final verdict for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub category: PlumCategory,
    pub confidence: f32,
    pub is_plum: bool,
    pub low_confidence: bool,
    /// Always holds every category, in index order.
    pub probabilities: BTreeMap<PlumCategory, f32>,
    /// Arg-max over all model outputs, in-domain or not.
    pub top_index: usize,
}

impl Prediction {
    pub fn summary(&self) -> PredictionSummary {
        PredictionSummary {
            class_name: self.category,
            class_label: self.category.label().to_string(),
            confidence: self.confidence,
            is_plum: self.is_plum,
            low_confidence: self.low_confidence,
            probabilities: self.probabilities.clone(),
        }
    }
}

pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Element-wise mean of equally sized distributions.
pub fn average(distributions: &[Vec<f32>]) -> Result<Vec<f32>, InferenceError> {
    let first = distributions
        .first()
        .ok_or_else(|| InferenceError::Output("no distributions to average".to_string()))?;
    let mut total = vec![0.0f32; first.len()];
    for dist in distributions {
        if dist.len() != total.len() {
            return Err(InferenceError::Output(format!(
                "distribution length {} does not match {}",
                dist.len(),
                total.len()
            )));
        }
        for (acc, p) in total.iter_mut().zip(dist) {
            *acc += p;
        }
    }
    let n = distributions.len() as f32;
    Ok(total.into_iter().map(|p| p / n).collect())
}

/// Turns a probability distribution over the model's outputs into a prediction.
/// Pure: depends only on its arguments.
pub fn decide(
    probabilities: &[f32],
    objectness: Option<f32>,
    metadata: &ModelMetadata,
) -> Result<Prediction, InferenceError> {
    if probabilities.len() != metadata.num_classes {
        return Err(InferenceError::Output(format!(
            "model returned {} scores, metadata declares {} classes",
            probabilities.len(),
            metadata.num_classes
        )));
    }
    if probabilities.iter().any(|p| !p.is_finite()) {
        return Err(InferenceError::Output(
            "non-finite probability in model output".to_string(),
        ));
    }
    if objectness.is_some_and(|o| !o.is_finite()) {
        return Err(InferenceError::Output(
            "non-finite objectness in model output".to_string(),
        ));
    }

    let top_index = arg_max(probabilities.iter().copied().enumerate())
        .ok_or_else(|| InferenceError::Output("empty model output".to_string()))?;

    let mut by_category: BTreeMap<PlumCategory, f32> =
        PlumCategory::all().map(|c| (c, 0.0)).collect();
    let mut in_domain = Vec::with_capacity(probabilities.len());
    for (index, &p) in probabilities.iter().enumerate() {
        if let Some(category) = metadata.category_for(index) {
            *by_category.entry(category).or_insert(0.0) += p;
            in_domain.push((index, p));
        }
    }

    let best_index = arg_max(in_domain.into_iter()).ok_or_else(|| {
        InferenceError::Output("no output index maps to a plum category".to_string())
    })?;
    let category = metadata
        .category_for(best_index)
        .ok_or_else(|| InferenceError::Output(format!("unmapped index {}", best_index)))?;

    let scale = objectness.map(|o| o.clamp(0.0, 1.0)).unwrap_or(1.0);
    let confidence = (probabilities[best_index] * scale).clamp(0.0, 1.0);
    for p in by_category.values_mut() {
        *p = p.clamp(0.0, 1.0);
    }

    Ok(Prediction {
        category,
        confidence,
        is_plum: metadata.category_for(top_index).is_some(),
        low_confidence: confidence < metadata.confidence_threshold,
        probabilities: by_category,
        top_index,
    })
}

/// First index holding the largest value.
fn arg_max(values: impl Iterator<Item = (usize, f32)>) -> Option<usize> {
    values
        .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ => Some((i, p)),
        })
        .map(|(i, _)| i)
}
