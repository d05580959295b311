use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info};

use crate::{StorageAdapter, StorageError};

#[derive(Debug, Clone)]
pub struct S3StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Optional key prefix every path is placed under.
    pub prefix: Option<String>,
    /// Custom endpoint for MinIO/LocalStack.
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

/// Object-store backend. A single `PutObject` replaces the whole object,
/// so readers never observe a partial write.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: S3Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Storage {
    pub async fn new(config: &S3StorageConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);
        if let Some(endpoint_url) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        info!(bucket = %config.bucket, region = %config.region, "s3 storage initialized");
        Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config
                .prefix
                .as_deref()
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    fn key(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{path}"),
            None => path.to_string(),
        }
    }

    /// Listing prefix scoped to a directory, so `raw-data` never matches `raw-data-old/`.
    fn list_prefix(&self, prefix: &str) -> String {
        let key = self.key(prefix.trim_end_matches('/'));
        if key.is_empty() || key.ends_with('/') {
            key
        } else {
            format!("{key}/")
        }
    }

    fn strip_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .map(|rest| rest.trim_start_matches('/').to_string())
                .unwrap_or_else(|| key.to_string()),
            None => key.to_string(),
        }
    }

    fn backend(path: &str, err: impl std::fmt::Display) -> StorageError {
        StorageError::Backend {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl StorageAdapter for S3Storage {
    fn describe(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("s3://{}/{}", self.bucket, prefix),
            None => format!("s3://{}", self.bucket),
        }
    }

    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::NotFound(path.to_string())
                } else {
                    Self::backend(path, aws_sdk_s3::error::DisplayErrorContext(&err))
                }
            })?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|err| Self::backend(path, err))?;
        Ok(data.into_bytes())
    }

    async fn write(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| Self::backend(path, aws_sdk_s3::error::DisplayErrorContext(&err)))?;
        debug!(path, bytes = size, "uploaded object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut out = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.list_prefix(prefix))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|err| {
                    Self::backend(prefix, aws_sdk_s3::error::DisplayErrorContext(&err))
                })?;
            out.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(|key| self.strip_key(key)),
            );
            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        out.sort();
        Ok(out)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false) =>
            {
                Ok(false)
            }
            Err(err) => Err(Self::backend(
                path,
                aws_sdk_s3::error::DisplayErrorContext(&err),
            )),
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, self.key(from)))
            .key(self.key(to))
            .send()
            .await
            .map_err(|err| Self::backend(from, aws_sdk_s3::error::DisplayErrorContext(&err)))?;
        Ok(())
    }
}
