use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use std::fmt;
use std::str::FromStr;

/// Locator for an object: bucket plus key, written `s3://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl FromStr for ObjectRef {
    type Err = StorageError;

    /// Accepts any `<scheme>://bucket/key` form; only bucket and key are kept.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StorageError::InvalidRef(s.to_string());
        let (_, rest) = s.split_once("://").ok_or_else(invalid)?;
        let (bucket, key) = rest.split_once('/').ok_or_else(invalid)?;
        let key = key.trim_start_matches('/');
        if bucket.is_empty() || key.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(bucket, key))
    }
}

/// Byte storage for input and output images.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(false)` when the object is absent; errors are reserved for the
    /// store itself misbehaving.
    async fn exists(&self, object: &ObjectRef) -> Result<bool, StorageError>;

    async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, object: &ObjectRef, data: &[u8], content_type: &str)
        -> Result<(), StorageError>;
}

/// Client for S3-compatible object storage (AWS S3, R2, LocalStack).
pub struct S3ObjectStore {
    region: Region,
    credentials: Credentials,
    path_style: bool,
}

impl S3ObjectStore {
    pub fn new(
        region: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        path_style: bool,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
            path_style,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(if self.path_style {
            bucket.with_path_style()
        } else {
            bucket
        })
    }
}

fn check_status(object: &ObjectRef, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(object.to_string())),
        other => Err(StorageError::Status {
            object: object.to_string(),
            status: other,
        }),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn exists(&self, object: &ObjectRef) -> Result<bool, StorageError> {
        let bucket = self.bucket(&object.bucket)?;
        match bucket.head_object(&object.key).await {
            Ok((_, 404)) | Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Ok((head, status)) => {
                check_status(object, status)?;
                tracing::debug!(
                    object = %object,
                    size = head.content_length.unwrap_or_default(),
                    "Object exists"
                );
                Ok(true)
            }
            Err(e) => Err(StorageError::S3(e)),
        }
    }

    async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError> {
        let bucket = self.bucket(&object.bucket)?;
        let response = bucket.get_object(&object.key).await.map_err(|e| match e {
            S3Error::HttpFailWithBody(404, _) => StorageError::NotFound(object.to_string()),
            other => StorageError::S3(other),
        })?;
        check_status(object, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn put(
        &self,
        object: &ObjectRef,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let bucket = self.bucket(&object.bucket)?;
        let response = bucket
            .put_object_with_content_type(&object.key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        check_status(object, response.status_code())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("S3 returned status {status} for {object}")]
    Status { object: String, status: u16 },

    #[error("invalid object reference: {0}")]
    InvalidRef(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
