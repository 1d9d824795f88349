use ndarray::Array4;
use std::path::Path;
use std::sync::Mutex;
use tch::{CModule, Device, IValue, Kind, Tensor};

use super::loader::ModelError;

/// Preprocessed NCHW input batch.
pub type InputTensor = Array4<f32>;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Preprocessing error: {0}")]
    Preprocessing(String),
    #[error("Model error: {0}")]
    Model(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
}

/// Raw output of one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    /// Unnormalized class scores, one per output index.
    pub scores: Vec<f32>,
    /// Present when the model also returns a plum-vs-other score.
    pub objectness: Option<f32>,
}

impl ModelOutput {
    pub fn logits(scores: Vec<f32>) -> Self {
        Self {
            scores,
            objectness: None,
        }
    }
}

pub trait Classifier: Send + Sync {
    fn forward(&self, input: &InputTensor) -> Result<ModelOutput, InferenceError>;

    fn device(&self) -> String;
}

/// TorchScript module loaded through libtorch.
pub struct TorchClassifier {
    module: Mutex<CModule>,
    device: Device,
}

impl TorchClassifier {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let device = Device::cuda_if_available();
        let mut module = CModule::load_on_device(path, device)
            .map_err(|e| ModelError::Torch(format!("{}: {}", path.display(), e)))?;
        module.set_eval();
        Ok(Self {
            module: Mutex::new(module),
            device,
        })
    }

    fn to_tensor(&self, input: &InputTensor) -> Result<Tensor, InferenceError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let data = input.as_slice().ok_or_else(|| {
            InferenceError::Preprocessing("input tensor is not contiguous".to_string())
        })?;
        Ok(Tensor::from_slice(data)
            .reshape(shape.as_slice())
            .to_device(self.device))
    }
}

impl Classifier for TorchClassifier {
    fn forward(&self, input: &InputTensor) -> Result<ModelOutput, InferenceError> {
        let tensor = self.to_tensor(input)?;
        let output = {
            let module = self
                .module
                .lock()
                .map_err(|_| InferenceError::Model("model mutex poisoned".to_string()))?;
            tch::no_grad(|| module.forward_is(&[IValue::Tensor(tensor)]))
                .map_err(|e| InferenceError::Model(e.to_string()))?
        };

        match output {
            IValue::Tensor(logits) => Ok(ModelOutput::logits(tensor_to_vec(&logits)?)),
            IValue::Tuple(values) => {
                let mut tensors = values.into_iter();
                let logits = match tensors.next() {
                    Some(IValue::Tensor(t)) => t,
                    _ => {
                        return Err(InferenceError::Output(
                            "tuple output without a logits tensor".to_string(),
                        ));
                    }
                };
                let objectness = match tensors.next() {
                    Some(IValue::Tensor(t)) => Some(scalar_of(&t)?),
                    _ => None,
                };
                Ok(ModelOutput {
                    scores: tensor_to_vec(&logits)?,
                    objectness,
                })
            }
            other => Err(InferenceError::Output(format!(
                "unsupported output {:?}",
                other
            ))),
        }
    }

    fn device(&self) -> String {
        format!("{:?}", self.device)
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<f32>, InferenceError> {
    let flat = tensor
        .to_kind(Kind::Float)
        .to_device(Device::Cpu)
        .reshape([-1]);
    Vec::<f32>::try_from(&flat).map_err(|e| InferenceError::Output(e.to_string()))
}

fn scalar_of(tensor: &Tensor) -> Result<f32, InferenceError> {
    let values = tensor_to_vec(tensor)?;
    values
        .first()
        .copied()
        .ok_or_else(|| InferenceError::Output("empty objectness tensor".to_string()))
}
