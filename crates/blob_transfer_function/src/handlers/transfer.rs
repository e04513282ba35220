use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::adapters::client_cache::{ClientCache, ClientError};
use crate::adapters::object_store::{
    BlobStore, BlobUpload, ByteChunkStream, StoreError, UploadMetadata,
};
use crate::handlers::idempotency::{GateError, IdempotencyGate};
use crate::runtime::contract::{content_sha256, ContentDigest, TransferResult, ValidationError};
use crate::runtime::credentials::ResolutionError;
use crate::runtime::naming::{destination_in, DestinationDescriptor};

pub enum PayloadSource {
    Buffered(Bytes),
    Streamed(ByteChunkStream),
}

impl PayloadSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Buffered(_) => "buffered",
            Self::Streamed(_) => "streamed",
        }
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(body) => f.debug_tuple("Buffered").field(&body.len()).finish(),
            Self::Streamed(_) => f.write_str("Streamed(..)"),
        }
    }
}

/// One invocation's worth of work; consumed by [`TransferExecutor::execute`].
#[derive(Debug)]
pub struct TransferRequest {
    pub source_name: String,
    pub payload: PayloadSource,
    pub size_hint: Option<u64>,
}

impl TransferRequest {
    pub fn buffered(source_name: impl Into<String>, body: Bytes) -> Self {
        let size_hint = Some(body.len() as u64);
        Self {
            source_name: source_name.into(),
            payload: PayloadSource::Buffered(body),
            size_hint,
        }
    }

    pub fn streamed(
        source_name: impl Into<String>,
        stream: ByteChunkStream,
        size_hint: Option<u64>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            payload: PayloadSource::Streamed(stream),
            size_hint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("invalid source name '{source_name}': {cause}")]
    InvalidSourceName {
        source_name: String,
        #[source]
        cause: ValidationError,
    },

    #[error("storage is not configured for {source_name}: {cause}")]
    ConfigMissing {
        source_name: String,
        #[source]
        cause: ResolutionError,
    },

    #[error("could not obtain a storage client for {source_name}: {cause}")]
    AuthResolutionFailed {
        source_name: String,
        #[source]
        cause: ClientError,
    },

    #[error("existence check failed for {source_name}: {cause}")]
    ExistenceCheckFailed {
        source_name: String,
        #[source]
        cause: StoreError,
    },

    #[error("reading {source_name} failed: {cause}")]
    SourceReadFailed {
        source_name: String,
        #[source]
        cause: StoreError,
    },

    #[error("upload of {source_name} failed: {cause}")]
    UploadFailed {
        source_name: String,
        #[source]
        cause: StoreError,
    },

    #[error("{source_name} declared {expected} bytes but {actual} were read")]
    LengthMismatch {
        source_name: String,
        expected: u64,
        actual: u64,
    },
}

impl TransferError {
    pub fn source_name(&self) -> &str {
        match self {
            Self::InvalidSourceName { source_name, .. }
            | Self::ConfigMissing { source_name, .. }
            | Self::AuthResolutionFailed { source_name, .. }
            | Self::ExistenceCheckFailed { source_name, .. }
            | Self::SourceReadFailed { source_name, .. }
            | Self::UploadFailed { source_name, .. }
            | Self::LengthMismatch { source_name, .. } => source_name,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSourceName { .. } => "invalid_source_name",
            Self::ConfigMissing { .. } => "config_missing",
            Self::AuthResolutionFailed { .. } => "auth_resolution_failed",
            Self::ExistenceCheckFailed { .. } => "existence_check_failed",
            Self::SourceReadFailed { .. } => "source_read_failed",
            Self::UploadFailed { .. } => "upload_failed",
            Self::LengthMismatch { .. } => "length_mismatch",
        }
    }

    /// Whether redelivering the same invocation can succeed without an operator
    /// changing configuration or the source object.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExistenceCheckFailed { .. }
                | Self::SourceReadFailed { .. }
                | Self::UploadFailed { .. }
        )
    }

    pub(crate) fn from_client(source_name: &str, cause: ClientError) -> Self {
        match cause {
            ClientError::Resolution(cause @ ResolutionError::ConfigMissing { .. }) => {
                Self::ConfigMissing {
                    source_name: source_name.to_string(),
                    cause,
                }
            }
            cause => Self::AuthResolutionFailed {
                source_name: source_name.to_string(),
                cause,
            },
        }
    }

    fn from_gate(source_name: &str, cause: GateError) -> Self {
        match cause {
            GateError::Client(cause) => Self::from_client(source_name, cause),
            GateError::Store(cause) => Self::ExistenceCheckFailed {
                source_name: source_name.to_string(),
                cause,
            },
        }
    }

    fn upload(source_name: &str, cause: StoreError) -> Self {
        Self::UploadFailed {
            source_name: source_name.to_string(),
            cause,
        }
    }
}

/// Moves one source object into the processed container at most once.
pub struct TransferExecutor {
    cache: Arc<ClientCache>,
    gate: IdempotencyGate,
}

impl TransferExecutor {
    pub fn new(cache: Arc<ClientCache>) -> Self {
        Self {
            gate: IdempotencyGate::new(cache.clone()),
            cache,
        }
    }

    pub async fn execute(&self, request: TransferRequest) -> Result<TransferResult, TransferError> {
        let TransferRequest {
            source_name,
            payload,
            size_hint,
        } = request;
        let started_at = Instant::now();
        info!(
            event = "transfer_started",
            source_name = %source_name,
            payload = payload.kind(),
            size_hint
        );

        let result = self.run(&source_name, payload, size_hint).await;
        let duration_ms = started_at.elapsed().as_millis() as u64;
        match &result {
            Ok(outcome) => info!(
                event = "transfer_completed",
                source_name = %source_name,
                outcome = outcome.outcome.as_str(),
                destination = %outcome.destination,
                bytes_written = outcome.bytes_written,
                content_sha256 = outcome.content_sha256.as_deref(),
                duration_ms
            ),
            Err(failure) => error!(
                event = "transfer_failed",
                source_name = %source_name,
                error_code = failure.code(),
                retryable = failure.is_retryable(),
                error = %failure,
                duration_ms
            ),
        }
        result
    }

    async fn run(
        &self,
        source_name: &str,
        payload: PayloadSource,
        size_hint: Option<u64>,
    ) -> Result<TransferResult, TransferError> {
        let destination = destination_in(self.cache.container(), source_name).map_err(|cause| {
            TransferError::InvalidSourceName {
                source_name: source_name.to_string(),
                cause,
            }
        })?;

        let processed = self
            .gate
            .already_processed(&destination)
            .await
            .map_err(|cause| TransferError::from_gate(source_name, cause))?;
        if processed {
            info!(
                event = "transfer_skipped",
                source_name = %source_name,
                destination = %destination.location()
            );
            return Ok(TransferResult::skipped(destination.location()));
        }

        let metadata = UploadMetadata::for_source(source_name);
        match payload {
            PayloadSource::Buffered(body) => {
                self.upload_buffered(source_name, &destination, body, size_hint, &metadata)
                    .await
            }
            PayloadSource::Streamed(stream) => {
                self.upload_streamed(source_name, &destination, stream, size_hint, &metadata)
                    .await
            }
        }
    }

    async fn client(&self, source_name: &str) -> Result<Arc<dyn BlobStore>, TransferError> {
        self.cache
            .get_client()
            .await
            .map_err(|cause| TransferError::from_client(source_name, cause))
    }

    async fn upload_buffered(
        &self,
        source_name: &str,
        destination: &DestinationDescriptor,
        body: Bytes,
        size_hint: Option<u64>,
        metadata: &UploadMetadata,
    ) -> Result<TransferResult, TransferError> {
        let actual = body.len() as u64;
        if let Some(expected) = size_hint.filter(|expected| *expected != actual) {
            return Err(TransferError::LengthMismatch {
                source_name: source_name.to_string(),
                expected,
                actual,
            });
        }

        let client = self.client(source_name).await?;
        let digest = content_sha256(&body);
        match client
            .put_if_absent(&destination.object_name, body, metadata)
            .await
        {
            Ok(()) => Ok(TransferResult::uploaded(
                destination.location(),
                actual,
                digest,
            )),
            // Another invocation committed first.
            Err(StoreError::AlreadyExists { .. }) => {
                info!(
                    event = "transfer_skipped",
                    source_name = %source_name,
                    destination = %destination.location(),
                    reason = "lost_create_race"
                );
                Ok(TransferResult::skipped(destination.location()))
            }
            Err(cause) => Err(TransferError::upload(source_name, cause)),
        }
    }

    async fn upload_streamed(
        &self,
        source_name: &str,
        destination: &DestinationDescriptor,
        stream: ByteChunkStream,
        size_hint: Option<u64>,
        metadata: &UploadMetadata,
    ) -> Result<TransferResult, TransferError> {
        let client = self.client(source_name).await?;
        let mut upload = client
            .begin_upload(&destination.object_name, metadata)
            .await
            .map_err(|cause| TransferError::upload(source_name, cause))?;

        let mut digest = ContentDigest::new();
        let piped = pipe_chunks(source_name, stream, &mut *upload, &mut digest, size_hint)
            .await
            .and_then(|()| check_length(source_name, size_hint, digest.bytes_seen()));
        if let Err(failure) = piped {
            abort_upload(source_name, &mut *upload).await;
            return Err(failure);
        }

        upload
            .complete()
            .await
            .map_err(|cause| TransferError::upload(source_name, cause))?;

        let bytes_written = digest.bytes_seen();
        Ok(TransferResult::uploaded(
            destination.location(),
            bytes_written,
            digest.finalize_hex(),
        ))
    }
}

async fn pipe_chunks(
    source_name: &str,
    mut stream: ByteChunkStream,
    upload: &mut dyn BlobUpload,
    digest: &mut ContentDigest,
    size_hint: Option<u64>,
) -> Result<(), TransferError> {
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|cause| TransferError::SourceReadFailed {
            source_name: source_name.to_string(),
            cause,
        })?;
        digest.update(&chunk);

        // Stop before sending bytes past the declared length.
        if let Some(expected) = size_hint.filter(|expected| digest.bytes_seen() > *expected) {
            return Err(TransferError::LengthMismatch {
                source_name: source_name.to_string(),
                expected,
                actual: digest.bytes_seen(),
            });
        }

        upload
            .write(chunk)
            .await
            .map_err(|cause| TransferError::upload(source_name, cause))?;
    }
    Ok(())
}

fn check_length(
    source_name: &str,
    size_hint: Option<u64>,
    actual: u64,
) -> Result<(), TransferError> {
    match size_hint {
        Some(expected) if expected != actual => Err(TransferError::LengthMismatch {
            source_name: source_name.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

async fn abort_upload(source_name: &str, upload: &mut dyn BlobUpload) {
    if let Err(abort_error) = upload.abort().await {
        warn!(
            event = "upload_abort_failed",
            source_name = %source_name,
            error = %abort_error
        );
    }
}
