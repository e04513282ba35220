use serde::{Deserialize, Serialize};

use crate::contract::ValidationError;

pub const SOURCE_CONTAINER: &str = "unprocessed-pdf";
pub const DESTINATION_CONTAINER: &str = "processed-pdf";
pub const PROCESSED_PREFIX: &str = "processed";
/// Part of the contract with readers of the processed container.
pub const PROCESSED_SEPARATOR: char = '-';

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestinationDescriptor {
    pub container_name: String,
    pub object_name: String,
}

impl DestinationDescriptor {
    pub fn location(&self) -> String {
        format!("{}/{}", self.container_name, self.object_name)
    }
}

pub fn processed_object_name(source_name: &str) -> Result<String, ValidationError> {
    let trimmed = source_name.trim_matches('/');
    if trimmed.trim().is_empty() {
        return Err(ValidationError::new("source object name cannot be empty"));
    }

    Ok(format!("{PROCESSED_PREFIX}{PROCESSED_SEPARATOR}{trimmed}"))
}

pub fn destination_for(source_name: &str) -> Result<DestinationDescriptor, ValidationError> {
    destination_in(DESTINATION_CONTAINER, source_name)
}

pub fn destination_in(
    container_name: &str,
    source_name: &str,
) -> Result<DestinationDescriptor, ValidationError> {
    let container_name = container_name.trim();
    if container_name.is_empty() {
        return Err(ValidationError::new("destination container cannot be empty"));
    }

    Ok(DestinationDescriptor {
        container_name: container_name.to_string(),
        object_name: processed_object_name(source_name)?,
    })
}

/// Blob name from an Event Grid subject such as
/// `/blobServices/default/containers/unprocessed-pdf/blobs/a.pdf`.
pub fn blob_name_from_subject<'a>(subject: &'a str, container_name: &str) -> Option<&'a str> {
    let (_, tail) = subject.split_once("/containers/")?;
    let (container, name) = tail.split_once("/blobs/")?;
    if container != container_name || name.is_empty() {
        return None;
    }
    Some(name)
}
