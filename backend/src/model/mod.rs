pub mod cache;
pub mod classifier;
pub mod decision;
pub mod inference;
pub mod loader;
pub mod metadata;

pub use cache::ModelCache;
pub use classifier::{Classifier, InferenceError, InputTensor, ModelOutput, TorchClassifier};
pub use decision::{decide, Prediction};
pub use inference::{Inference, InferenceEngine};
pub use loader::{ModelError, ModelHandle, ModelLoader, TorchScriptLoader};
pub use metadata::ModelMetadata;
