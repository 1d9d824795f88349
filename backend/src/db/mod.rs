pub mod dynamodb_repository;
pub mod models;
pub mod repository;

pub use dynamodb_repository::DynamoDbRepository;
pub use models::{BatchRecord, ClassificationRecord};
pub use repository::{InMemoryRepository, RepositoryError, ResultRepository};
