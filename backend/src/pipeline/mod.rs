pub mod batch;
pub mod preprocess;
pub mod service;
pub mod validator;
pub mod writer;

pub use batch::{BatchOrchestrator, BatchOutcome, SummaryAccumulator};
pub use preprocess::Preprocessor;
pub use service::ClassificationService;
pub use validator::{ImageValidator, UploadedImage, ValidatedImage, ValidationError};
pub use writer::{RecordWriter, RequestContext};
