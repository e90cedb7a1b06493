//! S3-compatible object store holding template archives.

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::get_object::GetObjectError;
use tracing::debug;

use super::{ArtifactFuture, ArtifactStore};
use crate::config::ObjectStoreConfig;
use crate::error::ArtifactError;

/// Template archive store backed by an S3 bucket.
#[derive(Debug, Clone)]
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
}

impl S3ArtifactStore {
    /// Build a client from configuration.
    ///
    /// Static credentials are used when both keys are configured; otherwise
    /// the default AWS provider chain applies. A custom endpoint switches the
    /// client to path-style addressing for S3-compatible services.
    pub async fn connect(config: &ObjectStoreConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "cestx-config",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.endpoint.is_some())
            .build();
        Self::from_client(Client::from_conf(s3_config), config.bucket.clone())
    }

    /// Wrap an existing client.
    #[must_use]
    pub const fn from_client(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| {
                if error
                    .as_service_error()
                    .is_some_and(GetObjectError::is_no_such_key)
                {
                    ArtifactError::NotFound {
                        bucket: self.bucket.clone(),
                        key: key.to_owned(),
                    }
                } else {
                    ArtifactError::DownloadFailed {
                        key: key.to_owned(),
                        message: DisplayErrorContext(&error).to_string(),
                    }
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|error| ArtifactError::DownloadFailed {
                key: key.to_owned(),
                message: error.to_string(),
            })?;
        let bytes = body.into_bytes().to_vec();
        debug!(bucket = %self.bucket, key, size = bytes.len(), "downloaded template artifact");
        Ok(bytes)
    }
}

impl ArtifactStore for S3ArtifactStore {
    fn fetch<'a>(&'a self, key: &'a str) -> ArtifactFuture<'a, Vec<u8>> {
        Box::pin(self.download(key))
    }
}
