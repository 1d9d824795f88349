use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use shared::{ErrorResponse, ItemError, PredictionSummary};
use uuid::Uuid;

use crate::db::RepositoryError;
use crate::model::{InferenceError, ModelError};
use crate::pipeline::validator::ValidationError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Image storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("Result repository failed: {0}")]
    Repository(#[from] RepositoryError),
}

/// Everything that can go wrong while serving a classification request.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Batch {0} not found")]
    BatchNotFound(Uuid),
    #[error("Invalid field '{field}': {message}")]
    BadField { field: String, message: String },
    #[error("Model unavailable: {0}")]
    ModelUnavailable(#[from] ModelError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("Result could not be saved: {source}")]
    Persistence {
        source: PersistenceError,
        prediction: Box<PredictionSummary>,
    },
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Administrator role required")]
    Forbidden,
}

impl ClassifyError {
    pub fn bad_field(field: &str, message: impl Into<String>) -> Self {
        ClassifyError::BadField {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClassifyError::Validation(_)
            | ClassifyError::BatchNotFound(_)
            | ClassifyError::BadField { .. } => "validation",
            ClassifyError::ModelUnavailable(_) => "model_unavailable",
            ClassifyError::Inference(_) => "inference",
            ClassifyError::Persistence { .. } | ClassifyError::Repository(_) => "persistence",
            ClassifyError::NotFound(_) => "not_found",
            ClassifyError::Forbidden => "forbidden",
        }
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            ClassifyError::Validation(e) => Some(e.reason()),
            ClassifyError::BatchNotFound(_) => Some("batch_not_found"),
            ClassifyError::BadField { .. } => Some("bad_field"),
            _ => None,
        }
    }

    pub fn prediction(&self) -> Option<&PredictionSummary> {
        match self {
            ClassifyError::Persistence { prediction, .. } => Some(prediction),
            _ => None,
        }
    }

    pub fn to_item_error(&self) -> ItemError {
        ItemError {
            kind: self.kind().to_string(),
            reason: self.reason().map(str::to_string),
            message: self.to_string(),
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.to_string(),
            kind: self.kind().to_string(),
            reason: self.reason().map(str::to_string),
            prediction: self.prediction().cloned(),
        }
    }
}

impl ResponseError for ClassifyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ClassifyError::Validation(ValidationError::TooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ClassifyError::Validation(ValidationError::BadType(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ClassifyError::Validation(_) | ClassifyError::BadField { .. } => StatusCode::BAD_REQUEST,
            ClassifyError::BatchNotFound(_) | ClassifyError::NotFound(_) => StatusCode::NOT_FOUND,
            ClassifyError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ClassifyError::Forbidden => StatusCode::FORBIDDEN,
            ClassifyError::Inference(_)
            | ClassifyError::Persistence { .. }
            | ClassifyError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_error_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PlumCategory;

    #[test]
    fn validation_errors_map_to_client_statuses() {
        let too_large = ClassifyError::from(ValidationError::TooLarge { size: 10, max: 5 });
        assert_eq!(too_large.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(too_large.reason(), Some("too_large"));

        let bad_type = ClassifyError::from(ValidationError::BadType("text/plain".to_string()));
        assert_eq!(bad_type.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let corrupt = ClassifyError::from(ValidationError::Corrupt("eof".to_string()));
        assert_eq!(corrupt.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(corrupt.kind(), "validation");

        let missing = ClassifyError::BatchNotFound(Uuid::nil());
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(missing.kind(), "validation");
    }

    #[test]
    fn infrastructure_errors_map_to_server_statuses() {
        let unavailable = ClassifyError::from(ModelError::Unavailable("gone".to_string()));
        assert_eq!(unavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let inference = ClassifyError::from(InferenceError::Model("boom".to_string()));
        assert_eq!(inference.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn persistence_error_carries_prediction() {
        let prediction = PredictionSummary {
            class_name: PlumCategory::NonMure,
            class_label: "Unripe".to_string(),
            confidence: 0.8,
            is_plum: true,
            low_confidence: false,
            probabilities: PlumCategory::all().map(|c| (c, 0.0)).collect(),
        };
        let error = ClassifyError::Persistence {
            source: PersistenceError::Repository(RepositoryError::DynamoDb("down".to_string())),
            prediction: Box::new(prediction.clone()),
        };
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = error.to_error_response();
        assert_eq!(body.kind, "persistence");
        assert_eq!(body.prediction, Some(prediction));
    }
}
