use image::DynamicImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::classifier::InferenceError;
use super::decision::{self, Prediction};
use super::loader::ModelHandle;
use crate::pipeline::preprocess::Preprocessor;

/// Number of views evaluated when test-time augmentation is requested.
pub const TTA_VIEWS: usize = 5;

#[derive(Debug, Clone)]
pub struct Inference {
    pub prediction: Prediction,
    pub tta_used: bool,
    pub passes: usize,
    /// Preprocessing plus forward passes, excluding time spent waiting for a permit.
    pub elapsed: Duration,
}

/// Runs forward passes on the blocking pool, at most `max_concurrent` at a time.
#[derive(Clone)]
pub struct InferenceEngine {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl InferenceEngine {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub async fn classify(
        &self,
        handle: Arc<ModelHandle>,
        image: Arc<DynamicImage>,
        tta: bool,
    ) -> Result<Inference, InferenceError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| InferenceError::Model(format!("inference pool closed: {}", e)))?;

        tokio::task::spawn_blocking(move || run(&handle, &image, tta))
            .await
            .map_err(|e| InferenceError::Model(format!("inference task failed: {}", e)))?
    }
}

/// Identity, horizontal flip, vertical flip, rotate 90, rotate 270.
pub fn tta_views(image: &DynamicImage) -> Vec<DynamicImage> {
    vec![
        image.clone(),
        image.fliph(),
        image.flipv(),
        image.rotate90(),
        image.rotate270(),
    ]
}

fn run(handle: &ModelHandle, image: &DynamicImage, tta: bool) -> Result<Inference, InferenceError> {
    let started = Instant::now();
    let preprocessor = Preprocessor::new(handle.metadata.image_size());

    let augmented;
    let views: Vec<&DynamicImage> = if tta {
        augmented = tta_views(image);
        augmented.iter().collect()
    } else {
        vec![image]
    };

    let mut distributions = Vec::with_capacity(views.len());
    let mut objectness = Vec::new();
    for view in views.iter().copied() {
        let input = preprocessor.preprocess(view);
        let output = handle.classifier.forward(&input)?;
        distributions.push(decision::softmax(&output.scores));
        if let Some(o) = output.objectness {
            objectness.push(o);
        }
    }

    let probabilities = decision::average(&distributions)?;
    let objectness = if objectness.is_empty() {
        None
    } else {
        Some(objectness.iter().sum::<f32>() / objectness.len() as f32)
    };
    let prediction = decision::decide(&probabilities, objectness, &handle.metadata)?;

    Ok(Inference {
        prediction,
        tta_used: tta,
        passes: views.len(),
        elapsed: started.elapsed(),
    })
}
