use chrono::{DateTime, Utc};
use shared::ModelInfoResponse;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::classifier::{Classifier, TorchClassifier};
use super::metadata::ModelMetadata;
use crate::config::ModelConfig;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model unavailable: {0}")]
    Unavailable(String),
    #[error("Unknown model artifact: {0}")]
    UnknownArtifact(String),
    #[error("Invalid model metadata: {0}")]
    InvalidMetadata(String),
    #[error("Torch error: {0}")]
    Torch(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A loaded model plus everything needed to interpret its output.
/// Never mutated after construction.
pub struct ModelHandle {
    pub classifier: Arc<dyn Classifier>,
    pub metadata: ModelMetadata,
    pub model_path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

impl ModelHandle {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        metadata: ModelMetadata,
        model_path: PathBuf,
    ) -> Self {
        Self {
            classifier,
            metadata,
            model_path,
            loaded_at: Utc::now(),
        }
    }

    pub fn info(&self) -> ModelInfoResponse {
        ModelInfoResponse {
            loaded: true,
            model_name: Some(self.metadata.model_name.clone()),
            version: Some(self.metadata.version.clone()),
            num_classes: Some(self.metadata.num_classes),
            confidence_threshold: Some(self.metadata.confidence_threshold),
            input_shape: Some(self.metadata.input_shape.clone()),
            idx_to_class: Some(self.metadata.idx_to_class.clone()),
            device: Some(self.classifier.device()),
            model_path: Some(self.model_path.display().to_string()),
            loaded_at: Some(self.loaded_at),
            accuracy: self.metadata.accuracy,
            f1_score: self.metadata.f1_score,
        }
    }
}

pub trait ModelLoader: Send + Sync {
    /// Loads the default artifact, or the named one when `artifact` is given.
    fn load(&self, artifact: Option<&str>) -> Result<ModelHandle, ModelError>;
}

/// Loads a TorchScript artifact and its optional JSON sidecar from disk.
pub struct TorchScriptLoader {
    model_dir: PathBuf,
    model_file: Option<PathBuf>,
    defaults: ModelMetadata,
}

impl TorchScriptLoader {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            model_dir: config.model_dir.clone(),
            model_file: config.model_file.clone(),
            defaults: ModelMetadata::with_defaults(
                config.image_size,
                config.confidence_threshold,
            ),
        }
    }

    /// The configured file, or else the first `*.pt` in the model directory.
    pub fn locate_artifact(&self) -> Result<PathBuf, ModelError> {
        if let Some(file) = &self.model_file {
            if file.is_file() {
                return Ok(file.clone());
            }
            return Err(ModelError::Unavailable(format!(
                "model file {} does not exist",
                file.display()
            )));
        }

        let entries = std::fs::read_dir(&self.model_dir).map_err(|e| {
            ModelError::Unavailable(format!(
                "cannot read model directory {}: {}",
                self.model_dir.display(),
                e
            ))
        })?;
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "pt"))
            .collect();
        candidates.sort();
        candidates.into_iter().next().ok_or_else(|| {
            ModelError::Unavailable(format!(
                "no .pt model found in {}",
                self.model_dir.display()
            ))
        })
    }

    /// A `*.pt` file directly inside the model directory.
    pub fn named_artifact(&self, name: &str) -> Result<PathBuf, ModelError> {
        let relative = Path::new(name);
        let plain_file = matches!(
            relative.components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        );
        if !plain_file || relative.extension().and_then(|ext| ext.to_str()) != Some("pt") {
            return Err(ModelError::UnknownArtifact(name.to_string()));
        }
        let path = self.model_dir.join(relative);
        if !path.is_file() {
            return Err(ModelError::UnknownArtifact(name.to_string()));
        }
        Ok(path)
    }

    pub fn read_metadata(&self, artifact: &Path) -> Result<ModelMetadata, ModelError> {
        let sidecar = ModelMetadata::sidecar_path(artifact);
        if !sidecar.is_file() {
            log::warn!(
                "No metadata sidecar at {}, using built-in defaults",
                sidecar.display()
            );
            return Ok(self.defaults.clone());
        }
        let contents = std::fs::read_to_string(&sidecar)?;
        ModelMetadata::from_json(&contents, &self.defaults)
    }
}

impl ModelLoader for TorchScriptLoader {
    fn load(&self, artifact: Option<&str>) -> Result<ModelHandle, ModelError> {
        let artifact = match artifact {
            Some(name) => self.named_artifact(name)?,
            None => self.locate_artifact()?,
        };
        let metadata = self.read_metadata(&artifact)?;
        log::info!(
            "Loading model {} v{} from {}",
            metadata.model_name,
            metadata.version,
            artifact.display()
        );
        let classifier = TorchClassifier::load(&artifact)?;
        log::info!(
            "Model loaded on {} (classes: {}, threshold: {})",
            classifier.device(),
            metadata.num_classes,
            metadata.confidence_threshold
        );
        Ok(ModelHandle::new(Arc::new(classifier), metadata, artifact))
    }
}
