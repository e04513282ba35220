use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::adapters::object_store::BlobStore;
use crate::runtime::credentials::{resolve, AuthConfig, EnvSnapshot, ResolutionError};

/// Builds the concrete store client for a resolved authentication strategy.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn connect(
        &self,
        auth: &AuthConfig,
        container: &str,
    ) -> Result<Arc<dyn BlobStore>, String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("failed to construct {mode} client for container '{container}': {message}")]
    Construction {
        mode: &'static str,
        container: String,
        message: String,
    },
}

/// Lazily constructed, shared handle to one container's store client.
///
/// Concurrent first callers wait on the same construction; at most one client
/// is ever retained. A failed construction is returned to every caller that was
/// already waiting on it. Only a call that starts after the failure retries.
pub struct ClientCache {
    setting: String,
    container: String,
    env: EnvSnapshot,
    factory: Arc<dyn StoreFactory>,
    client: OnceCell<Arc<dyn BlobStore>>,
    attempts: AtomicU64,
    last_failure: Mutex<Option<(u64, ClientError)>>,
}

impl ClientCache {
    pub fn new(
        setting: impl Into<String>,
        container: impl Into<String>,
        env: EnvSnapshot,
        factory: Arc<dyn StoreFactory>,
    ) -> Self {
        Self {
            setting: setting.into(),
            container: container.into(),
            env,
            factory,
            client: OnceCell::new(),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn is_initialized(&self) -> bool {
        self.client.initialized()
    }

    pub async fn get_client(&self) -> Result<Arc<dyn BlobStore>, ClientError> {
        if let Some(client) = self.client.get() {
            return Ok(Arc::clone(client));
        }

        let observed = self.attempts.load(Ordering::Acquire);
        let mut last_failure = self.last_failure.lock().await;
        if let Some(client) = self.client.get() {
            return Ok(Arc::clone(client));
        }
        // An attempt finished while this caller waited for the lock.
        if let Some((attempt, error)) = last_failure.as_ref() {
            if *attempt > observed {
                return Err(error.clone());
            }
        }

        let result = self.construct().await;
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        match result {
            Ok(client) => {
                *last_failure = None;
                let client = self.client.get_or_init(|| async { client }).await;
                Ok(Arc::clone(client))
            }
            Err(error) => {
                *last_failure = Some((attempt, error.clone()));
                Err(error)
            }
        }
    }

    async fn construct(&self) -> Result<Arc<dyn BlobStore>, ClientError> {
        let auth = resolve(&self.setting, &self.env).inspect_err(|error| {
            warn!(
                setting = %self.setting,
                container = %self.container,
                error = %error,
                "blob store credential resolution failed"
            );
        })?;

        let mode = auth.mode().as_str();
        info!(
            setting = %self.setting,
            container = %self.container,
            auth_mode = mode,
            endpoint = auth.endpoint().unwrap_or("emulator"),
            "constructing blob store client"
        );

        self.factory
            .connect(&auth, &self.container)
            .await
            .map_err(|message| ClientError::Construction {
                mode,
                container: self.container.clone(),
                message,
            })
    }
}
