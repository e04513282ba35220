//! Authentication strategy selection for the blob store.
//!
//! Resolution is a pure function of an [`EnvSnapshot`]. The first matching
//! form of the connection setting wins:
//!
//! 1. `<setting>` holding a connection string (or the development storage sentinel)
//! 2. `<setting>__accountName` for managed identity against the default blob host
//! 3. `<setting>__serviceUri` (or `<setting>__blobServiceUri`) for managed identity
//!    against an explicit endpoint
//!
//! Credential material that is present but unusable fails resolution instead of
//! falling through to a later form.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use url::Url;

pub const DEFAULT_CONNECTION_SETTING: &str = "PDFProcessorSTORAGE";
pub const DEVELOPMENT_STORAGE_SENTINEL: &str = "UseDevelopmentStorage=true";
pub const DEFAULT_SERVICE_HOST: &str = "blob.core.windows.net";
pub const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

pub const ACCOUNT_NAME_SUFFIX: &str = "__accountName";
pub const SERVICE_URI_SUFFIX: &str = "__serviceUri";
pub const BLOB_SERVICE_URI_SUFFIX: &str = "__blobServiceUri";
pub const CLIENT_ID_SUFFIX: &str = "__clientId";

/// Point-in-time copy of the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current process environment, skipping non-UTF-8 entries.
    pub fn from_process() -> Self {
        std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Returns the value for `key`; blank values count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

impl FromIterator<(String, String)> for EnvSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    ConnectionString,
    ManagedIdentityWithAccountName,
    ManagedIdentityWithServiceUri,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionString => "connection_string",
            Self::ManagedIdentityWithAccountName => "managed_identity_account_name",
            Self::ManagedIdentityWithServiceUri => "managed_identity_service_uri",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum SharedCredential {
    AccountKey(String),
    SharedAccessSignature(String),
}

impl fmt::Debug for SharedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccountKey(_) => f.write_str("AccountKey(<redacted>)"),
            Self::SharedAccessSignature(_) => f.write_str("SharedAccessSignature(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConnection {
    pub account_name: String,
    pub blob_endpoint: String,
    pub credential: SharedCredential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionString {
    /// Local emulator (Azurite) with its well-known account.
    DevelopmentStorage,
    Account(AccountConnection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    ConnectionString(ConnectionString),
    ManagedIdentityWithAccountName {
        account_name: String,
        endpoint: String,
        client_id: Option<String>,
    },
    ManagedIdentityWithServiceUri {
        service_uri: String,
        account_name: String,
        client_id: Option<String>,
    },
}

impl AuthConfig {
    pub fn mode(&self) -> AuthMode {
        match self {
            Self::ConnectionString(_) => AuthMode::ConnectionString,
            Self::ManagedIdentityWithAccountName { .. } => AuthMode::ManagedIdentityWithAccountName,
            Self::ManagedIdentityWithServiceUri { .. } => AuthMode::ManagedIdentityWithServiceUri,
        }
    }

    /// Blob service endpoint, when it is known without consulting the emulator settings.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::ConnectionString(ConnectionString::DevelopmentStorage) => None,
            Self::ConnectionString(ConnectionString::Account(account)) => {
                Some(&account.blob_endpoint)
            }
            Self::ManagedIdentityWithAccountName { endpoint, .. } => Some(endpoint),
            Self::ManagedIdentityWithServiceUri { service_uri, .. } => Some(service_uri),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no storage configuration found for '{setting}'; expected one of: {}", .expected.join(", "))]
    ConfigMissing {
        setting: String,
        expected: Vec<String>,
    },

    #[error("storage configuration '{setting}' is unusable: {reason}")]
    AuthResolutionFailed { setting: String, reason: String },
}

pub fn expected_variables(setting: &str) -> Vec<String> {
    vec![
        setting.to_string(),
        format!("{setting}{ACCOUNT_NAME_SUFFIX}"),
        format!("{setting}{SERVICE_URI_SUFFIX}"),
    ]
}

pub fn resolve(setting: &str, env: &EnvSnapshot) -> Result<AuthConfig, ResolutionError> {
    let failed = |reason: String| ResolutionError::AuthResolutionFailed {
        setting: setting.to_string(),
        reason,
    };

    if let Some(raw) = env.get(setting) {
        return parse_connection_string(raw)
            .map(AuthConfig::ConnectionString)
            .map_err(failed);
    }

    let client_id = env
        .get(&format!("{setting}{CLIENT_ID_SUFFIX}"))
        .map(str::to_string);

    if let Some(account_name) = env.get(&format!("{setting}{ACCOUNT_NAME_SUFFIX}")) {
        validate_account_name(account_name).map_err(failed)?;
        return Ok(AuthConfig::ManagedIdentityWithAccountName {
            account_name: account_name.to_string(),
            endpoint: format!("https://{account_name}.{DEFAULT_SERVICE_HOST}"),
            client_id,
        });
    }

    let service_uri = env
        .get(&format!("{setting}{SERVICE_URI_SUFFIX}"))
        .or_else(|| env.get(&format!("{setting}{BLOB_SERVICE_URI_SUFFIX}")));
    if let Some(raw) = service_uri {
        let (service_uri, account_name) = parse_service_uri(raw).map_err(failed)?;
        return Ok(AuthConfig::ManagedIdentityWithServiceUri {
            service_uri,
            account_name,
            client_id,
        });
    }

    Err(ResolutionError::ConfigMissing {
        setting: setting.to_string(),
        expected: expected_variables(setting),
    })
}

pub fn parse_connection_string(raw: &str) -> Result<ConnectionString, String> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case(DEVELOPMENT_STORAGE_SENTINEL) {
        return Ok(ConnectionString::DevelopmentStorage);
    }

    let mut fields = BTreeMap::new();
    for (position, segment) in trimmed.split(';').enumerate() {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        // Values (keys, signatures) may themselves contain '='.
        let Some((key, value)) = segment.split_once('=') else {
            return Err(format!(
                "connection string segment {position} is not a Key=Value pair"
            ));
        };
        fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    if fields.is_empty() {
        return Err("connection string is empty".to_string());
    }

    if fields
        .get("usedevelopmentstorage")
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    {
        return Ok(ConnectionString::DevelopmentStorage);
    }

    let field = |name: &str| {
        fields
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    };

    let credential = match (field("accountkey"), field("sharedaccesssignature")) {
        (Some(key), _) => SharedCredential::AccountKey(key.to_string()),
        (None, Some(sas)) => {
            SharedCredential::SharedAccessSignature(sas.trim_start_matches('?').to_string())
        }
        (None, None) => {
            return Err(
                "connection string has neither AccountKey nor SharedAccessSignature".to_string(),
            )
        }
    };

    let (blob_endpoint, account_name) = match field("blobendpoint") {
        Some(endpoint) => {
            let (endpoint, host_account) = parse_service_uri(endpoint)?;
            let account_name = field("accountname").unwrap_or(&host_account).to_string();
            (endpoint, account_name)
        }
        None => {
            let Some(account_name) = field("accountname") else {
                return Err("connection string is missing AccountName".to_string());
            };
            let protocol = field("defaultendpointsprotocol").unwrap_or("https");
            if protocol != "https" && protocol != "http" {
                return Err(format!(
                    "DefaultEndpointsProtocol must be http or https, got '{protocol}'"
                ));
            }
            let suffix = field("endpointsuffix").unwrap_or(DEFAULT_ENDPOINT_SUFFIX);
            (
                format!("{protocol}://{account_name}.blob.{suffix}"),
                account_name.to_string(),
            )
        }
    };

    if matches!(credential, SharedCredential::AccountKey(_)) && field("accountname").is_none() {
        return Err("AccountKey requires AccountName".to_string());
    }
    validate_account_name(&account_name)?;

    Ok(ConnectionString::Account(AccountConnection {
        account_name,
        blob_endpoint,
        credential,
    }))
}

/// Normalizes a blob service URI and derives the account from its first host label.
pub fn parse_service_uri(raw: &str) -> Result<(String, String), String> {
    let url = Url::parse(raw.trim()).map_err(|error| format!("invalid service URI: {error}"))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(format!(
            "service URI must use http or https, got '{}'",
            url.scheme()
        ));
    }

    let Some(host) = url.host_str() else {
        return Err("service URI has no host".to_string());
    };
    let account_name = host.split('.').next().unwrap_or_default().to_string();
    if account_name.is_empty() {
        return Err("service URI host does not name a storage account".to_string());
    }

    Ok((url.as_str().trim_end_matches('/').to_string(), account_name))
}

fn validate_account_name(account_name: &str) -> Result<(), String> {
    let valid_length = (3..=24).contains(&account_name.len());
    let valid_chars = account_name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if valid_length && valid_chars {
        Ok(())
    } else {
        Err(format!(
            "storage account name '{account_name}' must be 3-24 lowercase letters or digits"
        ))
    }
}
