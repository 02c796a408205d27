use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use reqwest::StatusCode;
use thiserror::Error;

use crate::core::config::Settings;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("invalid document locator: {0}")]
    InvalidLocator(String),
    #[error("document download failed: {0}")]
    Http(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque-locator document storage. Locators may be storage-internal keys or
/// stable public URLs.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError>;

    /// Removes a document; deleting a missing document succeeds. The grading
    /// pipeline only reads, so this is for callers that own document lifecycles,
    /// such as the submission upload layer.
    async fn delete(&self, locator: &str) -> Result<(), StorageError>;
}

pub(crate) async fn document_store_from_settings(
    settings: &Settings,
) -> anyhow::Result<std::sync::Arc<dyn DocumentStore>> {
    let http = public_http_client()?;

    if let Some(store) = S3DocumentStore::from_settings(settings, http.clone()).await? {
        tracing::info!(bucket = %settings.s3().bucket, "Using S3 document store");
        return Ok(std::sync::Arc::new(store));
    }

    tracing::info!(root = %settings.storage().root.display(), "Using filesystem document store");
    Ok(std::sync::Arc::new(FilesystemDocumentStore::new(settings.storage().root.clone(), http)))
}

fn public_http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|err| anyhow::anyhow!(err).context("Failed to build document HTTP client"))
}

fn is_public_url(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

async fn fetch_public_url(http: &reqwest::Client, url: &str) -> Result<Vec<u8>, StorageError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|err| StorageError::Http(format!("{url}: {err}")))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(StorageError::NotFound(url.to_string()));
    }
    if !status.is_success() {
        return Err(StorageError::Http(format!("{url}: status {status}")));
    }

    let bytes = response.bytes().await.map_err(|err| StorageError::Http(format!("{url}: {err}")))?;
    Ok(bytes.to_vec())
}

#[derive(Debug, Clone)]
pub(crate) struct S3DocumentStore {
    client: Client,
    bucket: String,
    endpoint: String,
    http: reqwest::Client,
}

impl S3DocumentStore {
    pub(crate) async fn from_settings(
        settings: &Settings,
        http: reqwest::Client,
    ) -> anyhow::Result<Option<Self>> {
        if !settings.s3().is_configured() {
            return Ok(None);
        }

        let creds = Credentials::new(
            settings.s3().access_key.clone(),
            settings.s3().secret_key.clone(),
            None,
            None,
            "grader-static",
        );

        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(settings.s3().endpoint.clone())
            .region(aws_config::Region::new(settings.s3().region.clone()))
            .credentials_provider(creds)
            .load()
            .await;

        Ok(Some(Self {
            client: Client::new(&config),
            bucket: settings.s3().bucket.clone(),
            endpoint: settings.s3().endpoint.trim_end_matches('/').to_string(),
            http,
        }))
    }

    /// Maps a locator to an object key in this bucket. Public URLs that point at
    /// some other host return `None`.
    fn object_key(&self, locator: &str) -> Result<Option<String>, StorageError> {
        let s3_prefix = format!("s3://{}/", self.bucket);
        let url_prefix = format!("{}/{}/", self.endpoint, self.bucket);

        let key = if let Some(key) = locator.strip_prefix(&s3_prefix) {
            key
        } else if let Some(key) = locator.strip_prefix(&url_prefix) {
            key
        } else if locator.starts_with("s3://") {
            return Err(StorageError::InvalidLocator(locator.to_string()));
        } else if is_public_url(locator) {
            return Ok(None);
        } else {
            locator.trim_start_matches('/')
        };

        let key = key.split('?').next().unwrap_or_default();
        if key.is_empty() {
            return Err(StorageError::InvalidLocator(locator.to_string()));
        }
        Ok(Some(key.to_string()))
    }
}

#[async_trait]
impl DocumentStore for S3DocumentStore {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        let Some(key) = self.object_key(locator)? else {
            return fetch_public_url(&self.http, locator).await;
        };

        let output =
            self.client.get_object().bucket(&self.bucket).key(&key).send().await.map_err(
                |err| {
                    if err.as_service_error().is_some_and(|service| service.is_no_such_key()) {
                        StorageError::NotFound(key.clone())
                    } else {
                        StorageError::Backend(format!("get_object {key}: {err}"))
                    }
                },
            )?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Backend(format!("read body {key}: {err}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        let Some(key) = self.object_key(locator)? else {
            return Err(StorageError::InvalidLocator(locator.to_string()));
        };

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| StorageError::Backend(format!("delete_object {key}: {err}")))?;
        Ok(())
    }
}

/// Stores documents under a local root directory; used when S3 is not configured.
#[derive(Debug, Clone)]
pub(crate) struct FilesystemDocumentStore {
    root: PathBuf,
    http: reqwest::Client,
}

impl FilesystemDocumentStore {
    pub(crate) fn new(root: PathBuf, http: reqwest::Client) -> Self {
        Self { root, http }
    }

    fn resolve(&self, locator: &str) -> Result<PathBuf, StorageError> {
        let relative = sanitize_relative_path(locator)
            .ok_or_else(|| StorageError::InvalidLocator(locator.to_string()))?;
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl DocumentStore for FilesystemDocumentStore {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        if is_public_url(locator) {
            return fetch_public_url(&self.http, locator).await;
        }

        let path = self.resolve(locator)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(locator.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        let path = self.resolve(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

fn sanitize_relative_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.trim().replace('\\', "/").trim_start_matches('/').to_string();
    if normalized.is_empty() {
        return None;
    }

    let path = Path::new(&normalized);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(path.to_path_buf())
}
