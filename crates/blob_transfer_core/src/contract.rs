use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const TRANSFER_RESULT_SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Uploaded,
    SkippedAlreadyExists,
}

impl TransferOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::SkippedAlreadyExists => "skipped_already_exists",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferResult {
    pub outcome: TransferOutcome,
    pub bytes_written: u64,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
    pub schema_version: String,
}

impl TransferResult {
    pub fn uploaded(destination: String, bytes_written: u64, content_sha256: String) -> Self {
        Self {
            outcome: TransferOutcome::Uploaded,
            bytes_written,
            destination,
            content_sha256: Some(content_sha256),
            schema_version: TRANSFER_RESULT_SCHEMA_VERSION.to_string(),
        }
    }

    pub fn skipped(destination: String) -> Self {
        Self {
            outcome: TransferOutcome::SkippedAlreadyExists,
            bytes_written: 0,
            destination,
            content_sha256: None,
            schema_version: TRANSFER_RESULT_SCHEMA_VERSION.to_string(),
        }
    }
}

/// Incremental SHA-256 over the bytes handed to the destination.
#[derive(Debug, Clone, Default)]
pub struct ContentDigest {
    hasher: Sha256,
    bytes_seen: u64,
}

impl ContentDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_seen += chunk.len() as u64;
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

pub fn content_sha256(body: &[u8]) -> String {
    let mut digest = ContentDigest::new();
    digest.update(body);
    digest.finalize_hex()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
