use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod local;
pub mod s3_service;

pub use local::LocalImageStore;
pub use s3_service::S3ImageStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("S3 error: {0}")]
    S3(String),
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

/// Where uploaded image bytes end up.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Stores the bytes under `key` and returns the path recorded on the result.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

pub fn calculate_image_hash(image_data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_data);
    hex::encode(hasher.finalize())
}

/// `plum_images/{user}/{record}_{hash prefix}.{ext}`. The record id keeps two
/// uploads of the same bytes from sharing (and later deleting) one object.
pub fn image_key(user_id: Uuid, record_id: Uuid, image_data: &[u8], extension: &str) -> String {
    let hash = calculate_image_hash(image_data);
    format!(
        "plum_images/{}/{}_{}.{}",
        user_id,
        record_id,
        &hash[..16],
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_hex_sha256() {
        assert_eq!(
            calculate_image_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn key_is_scoped_by_user_and_record() {
        let user = Uuid::new_v4();
        let first = image_key(user, Uuid::new_v4(), b"abc", "jpg");
        let second = image_key(user, Uuid::new_v4(), b"abc", "jpg");
        assert!(first.starts_with(&format!("plum_images/{}/", user)));
        assert!(first.ends_with("_ba7816bf8f01cfea.jpg"));
        assert_ne!(first, second);
    }
}
