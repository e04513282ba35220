use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{
    Attribute, Attributes, ObjectStore, PutMode, PutMultipartOptions, PutOptions, PutPayload,
    WriteMultipart,
};
use thiserror::Error;

pub type ByteChunkStream = BoxStream<'static, Result<Bytes, StoreError>>;

pub const DEFAULT_UPLOAD_MAX_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("object not found: {name}")]
    NotFound { name: String },

    #[error("object already exists: {name}")]
    AlreadyExists { name: String },

    #[error("object store {operation} failed for {name}: {message}")]
    Backend {
        operation: &'static str,
        name: String,
        message: String,
    },
}

impl StoreError {
    pub fn backend(operation: &'static str, name: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Provenance recorded on every processed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub source_name: String,
    pub content_type: Option<String>,
    pub processed_at: String,
}

impl UploadMetadata {
    pub fn for_source(source_name: &str) -> Self {
        let content_type = source_name
            .to_ascii_lowercase()
            .ends_with(".pdf")
            .then(|| "application/pdf".to_string());
        Self {
            source_name: source_name.to_string(),
            content_type,
            processed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub struct SourceObject {
    pub size: u64,
    pub stream: ByteChunkStream,
}

/// Container-scoped blob operations used by the transfer handlers.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `Ok(false)` only when the store confirms the object is absent.
    async fn exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Writes `body` unless an object named `name` already exists, in which case
    /// [`StoreError::AlreadyExists`] is returned and nothing is written.
    async fn put_if_absent(
        &self,
        name: &str,
        body: Bytes,
        metadata: &UploadMetadata,
    ) -> Result<(), StoreError>;

    /// Starts a chunked upload. Nothing is visible under `name` until
    /// [`BlobUpload::complete`] succeeds.
    async fn begin_upload(
        &self,
        name: &str,
        metadata: &UploadMetadata,
    ) -> Result<Box<dyn BlobUpload>, StoreError>;

    async fn read(&self, name: &str) -> Result<SourceObject, StoreError>;
}

#[async_trait]
pub trait BlobUpload: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StoreError>;

    async fn complete(&mut self) -> Result<(), StoreError>;

    async fn abort(&mut self) -> Result<(), StoreError>;
}

pub struct ObjectStoreBlobStore {
    store: Arc<dyn ObjectStore>,
    max_concurrency: usize,
}

impl ObjectStoreBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            max_concurrency: DEFAULT_UPLOAD_MAX_CONCURRENCY,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        match self.store.head(&Path::from(name)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(error) => Err(StoreError::backend("head", name, error.to_string())),
        }
    }

    async fn put_if_absent(
        &self,
        name: &str,
        body: Bytes,
        metadata: &UploadMetadata,
    ) -> Result<(), StoreError> {
        let options = PutOptions {
            mode: PutMode::Create,
            attributes: upload_attributes(metadata),
            ..Default::default()
        };

        match self
            .store
            .put_opts(&Path::from(name), PutPayload::from(body), options)
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => Err(StoreError::AlreadyExists {
                name: name.to_string(),
            }),
            Err(error) => Err(StoreError::backend("put", name, error.to_string())),
        }
    }

    async fn begin_upload(
        &self,
        name: &str,
        metadata: &UploadMetadata,
    ) -> Result<Box<dyn BlobUpload>, StoreError> {
        let options = PutMultipartOptions {
            attributes: upload_attributes(metadata),
            ..Default::default()
        };
        let upload = self
            .store
            .put_multipart_opts(&Path::from(name), options)
            .await
            .map_err(|error| StoreError::backend("put_multipart", name, error.to_string()))?;

        Ok(Box::new(MultipartBlobUpload {
            name: name.to_string(),
            writer: Some(WriteMultipart::new(upload)),
            max_concurrency: self.max_concurrency,
        }))
    }

    async fn read(&self, name: &str) -> Result<SourceObject, StoreError> {
        let result = match self.store.get(&Path::from(name)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StoreError::NotFound {
                    name: name.to_string(),
                })
            }
            Err(error) => return Err(StoreError::backend("get", name, error.to_string())),
        };

        let size = result.meta.size;
        let object_name = name.to_string();
        let stream = result
            .into_stream()
            .map_err(move |error| StoreError::backend("get", &object_name, error.to_string()))
            .boxed();

        Ok(SourceObject { size, stream })
    }
}

struct MultipartBlobUpload {
    name: String,
    writer: Option<WriteMultipart>,
    max_concurrency: usize,
}

impl MultipartBlobUpload {
    fn writer(&mut self) -> Result<&mut WriteMultipart, StoreError> {
        let name = &self.name;
        self.writer
            .as_mut()
            .ok_or_else(|| StoreError::backend("put_multipart", name, "upload already finished"))
    }

    fn take_writer(&mut self) -> Result<WriteMultipart, StoreError> {
        self.writer.take().ok_or_else(|| {
            StoreError::backend("put_multipart", &self.name, "upload already finished")
        })
    }
}

#[async_trait]
impl BlobUpload for MultipartBlobUpload {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StoreError> {
        let max_concurrency = self.max_concurrency;
        let name = self.name.clone();
        let writer = self.writer()?;
        writer
            .wait_for_capacity(max_concurrency)
            .await
            .map_err(|error| StoreError::backend("put_block", &name, error.to_string()))?;
        writer.write(&chunk);
        Ok(())
    }

    async fn complete(&mut self) -> Result<(), StoreError> {
        let writer = self.take_writer()?;
        writer
            .finish()
            .await
            .map(|_| ())
            .map_err(|error| StoreError::backend("put_block_list", &self.name, error.to_string()))
    }

    async fn abort(&mut self) -> Result<(), StoreError> {
        let writer = self.take_writer()?;
        writer
            .abort()
            .await
            .map_err(|error| StoreError::backend("abort_upload", &self.name, error.to_string()))
    }
}

fn upload_attributes(metadata: &UploadMetadata) -> Attributes {
    let mut attributes = Attributes::new();
    if let Some(content_type) = &metadata.content_type {
        attributes.insert(Attribute::ContentType, content_type.clone().into());
    }
    // Blob metadata travels as HTTP headers, which only carry ASCII.
    if metadata.source_name.is_ascii() {
        attributes.insert(
            Attribute::Metadata("source_name".into()),
            metadata.source_name.clone().into(),
        );
    }
    attributes.insert(
        Attribute::Metadata("processed_at".into()),
        metadata.processed_at.clone().into(),
    );
    attributes
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    fn store() -> (Arc<InMemory>, ObjectStoreBlobStore) {
        let memory = Arc::new(InMemory::new());
        let adapter = ObjectStoreBlobStore::new(memory.clone());
        (memory, adapter)
    }

    async fn stored_bytes(memory: &InMemory, name: &str) -> Bytes {
        memory
            .get(&Path::from(name))
            .await
            .expect("object should exist")
            .bytes()
            .await
            .expect("object body should be readable")
    }

    #[tokio::test]
    async fn exists_reports_absent_object_as_false() {
        let (_, adapter) = store();
        assert!(!adapter.exists("processed-a.pdf").await.expect("head should succeed"));
    }

    #[tokio::test]
    async fn put_if_absent_refuses_to_overwrite() {
        let (memory, adapter) = store();
        let metadata = UploadMetadata::for_source("a.pdf");

        adapter
            .put_if_absent("processed-a.pdf", Bytes::from_static(b"first"), &metadata)
            .await
            .expect("first write should succeed");
        let error = adapter
            .put_if_absent("processed-a.pdf", Bytes::from_static(b"second"), &metadata)
            .await
            .expect_err("second write should be rejected");

        assert_eq!(
            error,
            StoreError::AlreadyExists {
                name: "processed-a.pdf".to_string()
            }
        );
        assert_eq!(stored_bytes(&memory, "processed-a.pdf").await, "first");
        assert!(adapter.exists("processed-a.pdf").await.expect("head should succeed"));
    }

    #[tokio::test]
    async fn chunked_upload_is_invisible_until_complete() {
        let (memory, adapter) = store();
        let metadata = UploadMetadata::for_source("big.pdf");

        let mut upload = adapter
            .begin_upload("processed-big.pdf", &metadata)
            .await
            .expect("upload should start");
        upload
            .write(Bytes::from_static(b"%PDF-"))
            .await
            .expect("chunk should be accepted");
        upload
            .write(Bytes::from_static(b"1.7"))
            .await
            .expect("chunk should be accepted");

        assert!(!adapter
            .exists("processed-big.pdf")
            .await
            .expect("head should succeed"));

        upload.complete().await.expect("upload should complete");
        assert_eq!(stored_bytes(&memory, "processed-big.pdf").await, "%PDF-1.7");
    }

    #[tokio::test]
    async fn aborted_upload_leaves_no_object() {
        let (_, adapter) = store();
        let metadata = UploadMetadata::for_source("big.pdf");

        let mut upload = adapter
            .begin_upload("processed-big.pdf", &metadata)
            .await
            .expect("upload should start");
        upload
            .write(Bytes::from_static(b"partial"))
            .await
            .expect("chunk should be accepted");
        upload.abort().await.expect("abort should succeed");

        assert!(!adapter
            .exists("processed-big.pdf")
            .await
            .expect("head should succeed"));
        assert!(upload.complete().await.is_err());
    }

    #[tokio::test]
    async fn read_streams_existing_object_with_size() {
        let (memory, adapter) = store();
        memory
            .put(&Path::from("a.pdf"), PutPayload::from(Bytes::from_static(b"0123456789")))
            .await
            .expect("seed should succeed");

        let source = adapter.read("a.pdf").await.expect("read should succeed");
        assert_eq!(source.size, 10);

        let chunks: Vec<Bytes> = source
            .stream
            .try_collect()
            .await
            .expect("stream should succeed");
        assert_eq!(chunks.concat(), b"0123456789");
    }

    #[tokio::test]
    async fn read_of_missing_object_is_not_found() {
        let (_, adapter) = store();
        let error = match adapter.read("missing.pdf").await {
            Ok(_) => panic!("missing object should not be readable"),
            Err(error) => error,
        };

        assert_eq!(
            error,
            StoreError::NotFound {
                name: "missing.pdf".to_string()
            }
        );
    }

    #[test]
    fn metadata_sets_pdf_content_type() {
        assert_eq!(
            UploadMetadata::for_source("Invoice.PDF").content_type.as_deref(),
            Some("application/pdf")
        );
        assert_eq!(UploadMetadata::for_source("notes.txt").content_type, None);
    }

    #[test]
    fn attributes_skip_non_ascii_source_names() {
        let metadata = UploadMetadata {
            source_name: "réçu.pdf".to_string(),
            content_type: Some("application/pdf".to_string()),
            processed_at: "2026-10-15T00:00:00+00:00".to_string(),
        };

        let attributes = upload_attributes(&metadata);
        assert!(attributes
            .get(&Attribute::Metadata("source_name".into()))
            .is_none());
        assert!(attributes
            .get(&Attribute::Metadata("processed_at".into()))
            .is_some());
        assert_eq!(attributes.len(), 2);
    }
}
