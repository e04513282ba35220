use crate::adapters::object_store::DEFAULT_UPLOAD_MAX_CONCURRENCY;
use crate::runtime::contract::ValidationError;
use crate::runtime::credentials::{EnvSnapshot, DEFAULT_CONNECTION_SETTING};
use crate::runtime::naming::{DESTINATION_CONTAINER, SOURCE_CONTAINER};

pub const DEFAULT_HANDLER_PORT: u16 = 8080;

/// Managed identity token endpoint published by Functions and App Service hosts.
pub const IDENTITY_ENDPOINT_VAR: &str = "IDENTITY_ENDPOINT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    pub connection_setting: String,
    pub source_container: String,
    pub destination_container: String,
    pub store_max_retries: usize,
    pub upload_max_concurrency: usize,
    pub port: u16,
    pub msi_endpoint: Option<String>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            connection_setting: DEFAULT_CONNECTION_SETTING.to_string(),
            source_container: SOURCE_CONTAINER.to_string(),
            destination_container: DESTINATION_CONTAINER.to_string(),
            store_max_retries: 0,
            upload_max_concurrency: DEFAULT_UPLOAD_MAX_CONCURRENCY,
            port: DEFAULT_HANDLER_PORT,
            msi_endpoint: None,
        }
    }
}

impl HandlerConfig {
    /// Storage credentials are not read here; they resolve on first use.
    pub fn from_env(env: &EnvSnapshot) -> Result<Self, ValidationError> {
        let defaults = Self::default();
        let config = Self {
            connection_setting: string_or(
                env,
                "BLOB_CONNECTION_SETTING",
                defaults.connection_setting,
            ),
            source_container: string_or(env, "SOURCE_CONTAINER", defaults.source_container),
            destination_container: string_or(
                env,
                "DESTINATION_CONTAINER",
                defaults.destination_container,
            ),
            store_max_retries: parse_or(env, "STORE_MAX_RETRIES", defaults.store_max_retries)?,
            upload_max_concurrency: parse_or(
                env,
                "UPLOAD_MAX_CONCURRENCY",
                defaults.upload_max_concurrency,
            )?,
            port: parse_or(env, "FUNCTIONS_CUSTOMHANDLER_PORT", defaults.port)?,
            msi_endpoint: env
                .get(IDENTITY_ENDPOINT_VAR)
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string),
        };

        if config.upload_max_concurrency == 0 {
            return Err(ValidationError::new("UPLOAD_MAX_CONCURRENCY must be at least 1"));
        }
        if config.source_container == config.destination_container {
            return Err(ValidationError::new(
                "SOURCE_CONTAINER and DESTINATION_CONTAINER must differ",
            ));
        }
        Ok(config)
    }
}

fn string_or(env: &EnvSnapshot, key: &str, default: String) -> String {
    env.get(key).map(str::to_string).unwrap_or(default)
}

fn parse_or<T: std::str::FromStr>(
    env: &EnvSnapshot,
    key: &str,
    default: T,
) -> Result<T, ValidationError> {
    match env.get(key) {
        Some(raw) => raw.parse().map_err(|_| {
            ValidationError::new(format!("{key} must be a non-negative integer, got '{raw}'"))
        }),
        None => Ok(default),
    }
}
