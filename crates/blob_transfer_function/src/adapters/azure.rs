use std::sync::Arc;

use async_trait::async_trait;
use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};
use object_store::RetryConfig;

use crate::adapters::client_cache::StoreFactory;
use crate::adapters::object_store::{BlobStore, ObjectStoreBlobStore};
use crate::runtime::credentials::{AuthConfig, ConnectionString, SharedCredential};

/// Connects to Azure Blob Storage through `object_store`'s Azure backend.
#[derive(Debug, Clone)]
pub struct AzureStoreFactory {
    max_retries: usize,
    upload_max_concurrency: usize,
    msi_endpoint: Option<String>,
}

impl AzureStoreFactory {
    pub fn new(max_retries: usize, upload_max_concurrency: usize) -> Self {
        Self {
            max_retries,
            upload_max_concurrency,
            msi_endpoint: None,
        }
    }

    /// Token endpoint for managed identity. Functions and App Service hosts
    /// publish it as `IDENTITY_ENDPOINT`; without it the VM metadata endpoint is used.
    pub fn with_msi_endpoint(mut self, msi_endpoint: Option<String>) -> Self {
        self.msi_endpoint = msi_endpoint;
        self
    }
}

#[async_trait]
impl StoreFactory for AzureStoreFactory {
    async fn connect(
        &self,
        auth: &AuthConfig,
        container: &str,
    ) -> Result<Arc<dyn BlobStore>, String> {
        let retry = RetryConfig {
            max_retries: self.max_retries,
            ..Default::default()
        };
        let store = azure_builder(auth, container, self.msi_endpoint.as_deref())
            .with_retry(retry)
            .build()
            .map_err(|error| error.to_string())?;

        Ok(Arc::new(
            ObjectStoreBlobStore::new(Arc::new(store))
                .with_max_concurrency(self.upload_max_concurrency),
        ))
    }
}

/// Maps a resolved strategy onto builder settings. Managed identity modes set no
/// secret; tokens come from `msi_endpoint` when given, else instance metadata.
pub fn azure_builder(
    auth: &AuthConfig,
    container: &str,
    msi_endpoint: Option<&str>,
) -> MicrosoftAzureBuilder {
    let builder = MicrosoftAzureBuilder::new().with_container_name(container);

    match auth {
        AuthConfig::ConnectionString(ConnectionString::DevelopmentStorage) => builder
            .with_use_emulator(true)
            .with_allow_http(true),
        AuthConfig::ConnectionString(ConnectionString::Account(account)) => {
            let builder = with_endpoint(builder, &account.blob_endpoint)
                .with_account(account.account_name.as_str());
            match &account.credential {
                SharedCredential::AccountKey(key) => builder.with_access_key(key.as_str()),
                SharedCredential::SharedAccessSignature(sas) => {
                    builder.with_config(AzureConfigKey::SasKey, sas.as_str())
                }
            }
        }
        AuthConfig::ManagedIdentityWithAccountName {
            account_name,
            endpoint,
            client_id,
        } => with_managed_identity(
            with_endpoint(builder, endpoint).with_account(account_name.as_str()),
            client_id.as_deref(),
            msi_endpoint,
        ),
        AuthConfig::ManagedIdentityWithServiceUri {
            service_uri,
            account_name,
            client_id,
        } => with_managed_identity(
            with_endpoint(builder, service_uri).with_account(account_name.as_str()),
            client_id.as_deref(),
            msi_endpoint,
        ),
    }
}

fn with_endpoint(builder: MicrosoftAzureBuilder, endpoint: &str) -> MicrosoftAzureBuilder {
    builder
        .with_endpoint(endpoint.to_string())
        .with_allow_http(endpoint.starts_with("http://"))
}

fn with_managed_identity(
    builder: MicrosoftAzureBuilder,
    client_id: Option<&str>,
    msi_endpoint: Option<&str>,
) -> MicrosoftAzureBuilder {
    let builder = match client_id {
        Some(client_id) => builder.with_client_id(client_id),
        None => builder,
    };
    match msi_endpoint {
        Some(msi_endpoint) => builder.with_msi_endpoint(msi_endpoint),
        None => builder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::credentials::{parse_connection_string, AccountConnection};

    #[test]
    fn account_key_connection_string_builds_client() {
        let connection = parse_connection_string(
            "DefaultEndpointsProtocol=https;AccountName=pdfstore;AccountKey=a2V5PT0=;EndpointSuffix=core.windows.net",
        )
        .expect("connection string should parse");

        azure_builder(&AuthConfig::ConnectionString(connection), "processed-pdf", None)
            .build()
            .expect("account key client should build");
    }

    #[test]
    fn sas_connection_string_builds_client() {
        let auth = AuthConfig::ConnectionString(ConnectionString::Account(AccountConnection {
            account_name: "pdfstore".to_string(),
            blob_endpoint: "https://pdfstore.blob.core.windows.net".to_string(),
            credential: SharedCredential::SharedAccessSignature(
                "sv=2022-11-02&ss=b&sig=abc".to_string(),
            ),
        }));

        azure_builder(&auth, "unprocessed-pdf", None)
            .build()
            .expect("sas client should build");
    }

    #[test]
    fn managed_identity_builds_without_secret() {
        let auth = AuthConfig::ManagedIdentityWithAccountName {
            account_name: "pdfstore".to_string(),
            endpoint: "https://pdfstore.blob.core.windows.net".to_string(),
            client_id: Some("client-123".to_string()),
        };

        azure_builder(&auth, "processed-pdf", None)
            .build()
            .expect("managed identity client should build");
    }

    #[test]
    fn managed_identity_uses_host_token_endpoint() {
        let auth = AuthConfig::ManagedIdentityWithAccountName {
            account_name: "pdfstore".to_string(),
            endpoint: "https://pdfstore.blob.core.windows.net".to_string(),
            client_id: None,
        };

        let builder = azure_builder(
            &auth,
            "processed-pdf",
            Some("http://localhost:8081/msi/token"),
        );

        assert_eq!(
            builder.get_config_value(&AzureConfigKey::MsiEndpoint),
            Some("http://localhost:8081/msi/token".to_string())
        );
        builder.build().expect("managed identity client should build");
    }

    #[test]
    fn connection_string_ignores_token_endpoint() {
        let connection = parse_connection_string(
            "DefaultEndpointsProtocol=https;AccountName=pdfstore;AccountKey=a2V5PT0=;EndpointSuffix=core.windows.net",
        )
        .expect("connection string should parse");

        let builder = azure_builder(
            &AuthConfig::ConnectionString(connection),
            "processed-pdf",
            Some("http://localhost:8081/msi/token"),
        );

        assert_eq!(builder.get_config_value(&AzureConfigKey::MsiEndpoint), None);
    }

    #[tokio::test]
    async fn factory_wraps_client_in_blob_store() {
        let auth = AuthConfig::ManagedIdentityWithServiceUri {
            service_uri: "http://127.0.0.1:10000/pdfstore".to_string(),
            account_name: "pdfstore".to_string(),
            client_id: None,
        };

        let factory = AzureStoreFactory::new(0, 2)
            .with_msi_endpoint(Some("http://127.0.0.1:8081/msi/token".to_string()));
        assert!(factory.connect(&auth, "processed-pdf").await.is_ok());
    }
}
