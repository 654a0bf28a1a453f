//! Abstractions over S3-compatible storage backends used for imported files.
//!
//! The delivery agent retries uploads and deletes for the same object name,
//! so every operation here must tolerate duplicate calls: re-uploading a key
//! overwrites the same object, and deleting a missing key is not an error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "boxoffice-imports".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("object not found: {0}")]
    NotFound(String),
}

impl BucketError {
    fn from_sdk(err: impl fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Object-store seam used by the outbox delivery agent.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), BucketError>;

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError>;

    /// Removes the object. Deleting a key that does not exist succeeds.
    async fn delete_object(&self, key: &str) -> Result<(), BucketError>;
}

#[derive(Clone)]
pub struct S3BucketStore {
    client: Client,
    bucket: String,
}

impl S3BucketStore {
    pub async fn new(config: S3Config) -> Result<Self, BucketError> {
        if config.bucket.is_empty() {
            return Err(BucketError::Configuration(
                "bucket name cannot be empty".into(),
            ));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(access_key, secret_key, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(credentials));
        }

        let shared_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = Client::from_conf(builder.build());
        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }
}

#[async_trait]
impl BucketStore for S3BucketStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), BucketError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(content_type);

        for (name, value) in metadata {
            request = request.metadata(name, value);
        }

        request.send().await.map_err(BucketError::from_sdk)?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match err {
                SdkError::ServiceError(service_err) => {
                    let message = service_err.err().to_string();
                    if message.contains("NoSuchKey") {
                        BucketError::NotFound(key.to_string())
                    } else {
                        BucketError::from_sdk(message)
                    }
                }
                other => BucketError::from_sdk(other),
            })?;

        let data = output.body.collect().await.map_err(BucketError::from_sdk)?;
        Ok(Bytes::from(data.into_bytes()))
    }

    async fn delete_object(&self, key: &str) -> Result<(), BucketError> {
        // S3 DeleteObject already succeeds for missing keys.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(BucketError::from_sdk)?;
        Ok(())
    }
}

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct MemoryBucketStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().expect("bucket lock poisoned").len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .expect("bucket lock poisoned")
            .contains_key(key)
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
        _metadata: &HashMap<String, String>,
    ) -> Result<(), BucketError> {
        self.objects
            .lock()
            .expect("bucket lock poisoned")
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        self.objects
            .lock()
            .expect("bucket lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| BucketError::NotFound(key.to_string()))
    }

    async fn delete_object(&self, key: &str) -> Result<(), BucketError> {
        self.objects
            .lock()
            .expect("bucket lock poisoned")
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_upload_leaves_one_object() {
        let store = MemoryBucketStore::new();
        let metadata = HashMap::new();

        store
            .put_object("imports/a.json", Bytes::from_static(b"[]"), "application/json", &metadata)
            .await
            .unwrap();
        store
            .put_object("imports/a.json", Bytes::from_static(b"[]"), "application/json", &metadata)
            .await
            .unwrap();

        assert_eq!(store.object_count(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryBucketStore::new();
        let metadata = HashMap::new();

        store
            .put_object("imports/b.json", Bytes::from_static(b"[]"), "application/json", &metadata)
            .await
            .unwrap();

        store.delete_object("imports/b.json").await.unwrap();
        store.delete_object("imports/b.json").await.unwrap();

        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let store = MemoryBucketStore::new();
        let err = store.get_object("imports/missing.json").await.unwrap_err();
        assert!(matches!(err, BucketError::NotFound(_)));
    }
}
