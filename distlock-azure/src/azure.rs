//! Azure Blob Storage backend.

use async_trait::async_trait;
use azure_core::request_options::{IfMatchCondition, LeaseDuration, LeaseId, Metadata};
use azure_storage::prelude::*;
use azure_storage::CloudLocation;
use azure_storage_blobs::blob::LeaseState;
use azure_storage_blobs::prelude::*;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{BlobStoreError, BlobStoreResult};
use crate::store::{BlobInfo, BlobMetadata, BlobStore};

/// Azurite development account key.
const EMULATOR_ACCOUNT: &str = "devstoreaccount1";
const EMULATOR_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// Azure Blob Storage connection settings.
#[derive(Debug, Clone, Default)]
pub struct AzureBlobStoreConfig {
    /// Storage account name.
    pub account: String,
    /// Container name.
    pub container: String,
    /// Access key.
    pub access_key: Option<String>,
    /// Custom blob service endpoint.
    pub endpoint: Option<String>,
    /// Use the Azurite emulator.
    pub use_emulator: bool,
}

impl AzureBlobStoreConfig {
    /// Create configuration for a container.
    pub fn new(account: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            ..Default::default()
        }
    }

    /// Set the access key.
    pub fn access_key(mut self, key: impl Into<String>) -> Self {
        self.access_key = Some(key.into());
        self
    }

    /// Set a custom endpoint.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Use Azurite emulator.
    pub fn emulator(mut self) -> Self {
        self.use_emulator = true;
        self
    }
}

/// [`BlobStore`] over an Azure Blob Storage container.
pub struct AzureBlobStore {
    container_client: ContainerClient,
}

impl AzureBlobStore {
    /// Connect to the configured container.
    pub fn new(config: AzureBlobStoreConfig) -> BlobStoreResult<Self> {
        let builder = if config.use_emulator {
            ClientBuilder::emulator()
        } else {
            let key = config.access_key.clone().ok_or_else(|| {
                BlobStoreError::Other("an access key is required outside the emulator".into())
            })?;
            let credentials = StorageCredentials::access_key(config.account.clone(), key);
            match &config.endpoint {
                Some(uri) => ClientBuilder::with_location(
                    CloudLocation::Custom {
                        account: config.account.clone(),
                        uri: uri.clone(),
                    },
                    credentials,
                ),
                None => ClientBuilder::new(config.account.clone(), credentials),
            }
        };

        let account = if config.use_emulator {
            EMULATOR_ACCOUNT
        } else {
            config.account.as_str()
        };
        info!(account = %account, container = %config.container, "Initialized Azure blob lease store");

        Ok(Self {
            container_client: builder.container_client(config.container.clone()),
        })
    }

    /// Wrap an existing container client.
    pub fn from_container_client(container_client: ContainerClient) -> Self {
        Self { container_client }
    }

    /// Credentials for the Azurite emulator.
    pub fn emulator_credentials() -> StorageCredentials {
        StorageCredentials::access_key(EMULATOR_ACCOUNT, EMULATOR_KEY)
    }

    fn blob_client(&self, blob: &str) -> BlobClient {
        self.container_client.blob_client(blob)
    }
}

fn parse_lease_id(lease_id: &str) -> BlobStoreResult<LeaseId> {
    lease_id
        .parse::<LeaseId>()
        .map_err(|e| BlobStoreError::Other(format!("invalid lease id '{}': {}", lease_id, e)))
}

fn lease_duration(duration: Option<Duration>) -> LeaseDuration {
    match duration {
        Some(d) => LeaseDuration::Seconds(d.as_secs().min(u64::from(u8::MAX)) as u8),
        None => LeaseDuration::Infinite,
    }
}

/// Translate an SDK error into the store's error vocabulary.
fn map_error(blob: &str, err: azure_core::Error) -> BlobStoreError {
    let Some(http) = err.as_http_error() else {
        return BlobStoreError::Other(err.to_string());
    };
    match http.error_code() {
        Some("LeaseAlreadyPresent") => BlobStoreError::LeaseAlreadyPresent,
        Some("BlobNotFound") | Some("ContainerNotFound") => {
            BlobStoreError::BlobNotFound(blob.to_string())
        }
        Some("BlobAlreadyExists") => BlobStoreError::BlobAlreadyExists(blob.to_string()),
        Some("ConditionNotMet") => BlobStoreError::ConditionNotMet,
        Some("LeaseIdMismatchWithLeaseOperation")
        | Some("LeaseIdMismatchWithBlobOperation")
        | Some("LeaseIdMismatchWithContainerOperation") => BlobStoreError::LeaseIdMismatch,
        Some("LeaseNotPresentWithLeaseOperation")
        | Some("LeaseNotPresentWithBlobOperation")
        | Some("LeaseLost") => BlobStoreError::LeaseNotPresent,
        Some("LeaseIdMissing") => BlobStoreError::LeaseIdMissing,
        _ if u16::from(http.status()) == 404 => BlobStoreError::BlobNotFound(blob.to_string()),
        _ => BlobStoreError::Other(err.to_string()),
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn acquire_lease(
        &self,
        blob: &str,
        duration: Option<Duration>,
    ) -> BlobStoreResult<String> {
        let response = self
            .blob_client(blob)
            .acquire_lease(lease_duration(duration))
            .await
            .map_err(|e| map_error(blob, e))?;
        Ok(response.lease_id.to_string())
    }

    async fn renew_lease(&self, blob: &str, lease_id: &str) -> BlobStoreResult<()> {
        self.blob_client(blob)
            .blob_lease_client(parse_lease_id(lease_id)?)
            .renew()
            .await
            .map_err(|e| map_error(blob, e))?;
        Ok(())
    }

    async fn release_lease(&self, blob: &str, lease_id: &str) -> BlobStoreResult<()> {
        self.blob_client(blob)
            .blob_lease_client(parse_lease_id(lease_id)?)
            .release()
            .await
            .map_err(|e| map_error(blob, e))?;
        Ok(())
    }

    async fn create_if_absent(&self, blob: &str, metadata: BlobMetadata) -> BlobStoreResult<()> {
        let mut azure_metadata = Metadata::new();
        for (key, value) in metadata {
            azure_metadata.insert(key, value);
        }

        self.blob_client(blob)
            .put_block_blob(Vec::<u8>::new())
            .metadata(azure_metadata)
            .if_match(IfMatchCondition::NotMatch("*".to_string()))
            .await
            .map_err(|e| map_error(blob, e))?;

        debug!(blob = %blob, "Created lock blob");
        Ok(())
    }

    async fn get_metadata(
        &self,
        blob: &str,
        lease_id: Option<&str>,
    ) -> BlobStoreResult<BlobMetadata> {
        let mut request = self.blob_client(blob).get_metadata();
        if let Some(lease_id) = lease_id {
            request = request.lease_id(parse_lease_id(lease_id)?);
        }
        let response = request.await.map_err(|e| map_error(blob, e))?;
        Ok(response.metadata.into_iter().collect())
    }

    async fn delete_if_exists(&self, blob: &str, lease_id: Option<&str>) -> BlobStoreResult<bool> {
        let mut request = self.blob_client(blob).delete();
        if let Some(lease_id) = lease_id {
            request = request.lease_id(parse_lease_id(lease_id)?);
        }
        match request.await.map_err(|e| map_error(blob, e)) {
            Ok(_) => Ok(true),
            Err(BlobStoreError::BlobNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_blobs(&self, prefix: &str) -> BlobStoreResult<Vec<BlobInfo>> {
        let mut results = Vec::new();
        let mut stream = self
            .container_client
            .list_blobs()
            .prefix(prefix.to_string())
            .include_metadata(true)
            .into_stream();

        while let Some(response) = stream.next().await {
            let response = response.map_err(|e| map_error(prefix, e))?;
            for blob in response.blobs.blobs() {
                results.push(BlobInfo {
                    name: blob.name.clone(),
                    metadata: blob.metadata.clone().unwrap_or_default().into_iter().collect(),
                    leased: matches!(blob.properties.lease_state, LeaseState::Leased),
                });
            }
        }

        Ok(results)
    }
}
