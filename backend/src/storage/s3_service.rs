use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;

use super::{ImageStore, StorageError};

#[derive(Clone)]
pub struct S3ImageStore {
    client: Client,
    bucket_name: String,
}

impl S3ImageStore {
    pub fn new(client: Client, bucket_name: String) -> Self {
        Self {
            client,
            bucket_name,
        }
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket_name, key)
    }
}

#[async_trait]
impl ImageStore for S3ImageStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError> {
        let body = ByteStream::from(bytes.to_vec());

        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        log::debug!("Uploaded {} to bucket {}", key, self.bucket_name);
        Ok(self.object_url(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        Ok(())
    }
}
