use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::adapters::client_cache::{ClientCache, ClientError};
use crate::adapters::object_store::StoreError;
use crate::runtime::naming::DestinationDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Answers whether a destination object has already been written.
#[derive(Clone)]
pub struct IdempotencyGate {
    cache: Arc<ClientCache>,
}

impl IdempotencyGate {
    pub fn new(cache: Arc<ClientCache>) -> Self {
        Self { cache }
    }

    /// Only a confirmed absence yields `false`; every other failure propagates.
    pub async fn already_processed(
        &self,
        destination: &DestinationDescriptor,
    ) -> Result<bool, GateError> {
        let client = self.cache.get_client().await?;
        let exists = client.exists(&destination.object_name).await?;
        debug!(
            event = "existence_checked",
            destination = %destination.location(),
            exists
        );
        Ok(exists)
    }
}
