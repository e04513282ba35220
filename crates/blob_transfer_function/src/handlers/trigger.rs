//! Custom handler invocation parsing and response shaping.
//!
//! The Functions host posts `{ "Data": {...}, "Metadata": {...} }` for every
//! blob trigger delivery and treats any non-2xx response as a failed
//! invocation that it will redeliver.

use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::adapters::client_cache::ClientCache;
use crate::adapters::object_store::{BlobStore, ByteChunkStream};
use crate::handlers::transfer::{TransferError, TransferExecutor, TransferRequest};
use crate::runtime::naming::blob_name_from_subject;

pub const TRIGGER_SOURCE_BLOB_METADATA: &str = "blob_trigger";
pub const TRIGGER_SOURCE_EVENT_GRID: &str = "event_grid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInvocation {
    pub source_name: String,
    pub size_hint: Option<u64>,
    pub trigger_source: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResponse {
    pub status_code: u16,
    pub body: Value,
}

pub fn parse_invocation(
    event: &Value,
    source_container: &str,
) -> Result<TriggerInvocation, String> {
    let Some(object) = event.as_object() else {
        return Err("Invocation payload must be a JSON object".to_string());
    };
    let metadata = object.get("Metadata").and_then(Value::as_object);
    let data = object.get("Data");

    let event_grid = data.and_then(find_event_grid_event);
    let event_grid = event_grid.as_ref();

    let from_metadata = metadata
        .and_then(|metadata| metadata.get("name"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty());
    let (source_name, trigger_source) = match from_metadata {
        Some(name) => (name.to_string(), TRIGGER_SOURCE_BLOB_METADATA),
        None => {
            let subject = event_grid
                .and_then(|event| event.get("subject"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    "Invocation has neither Metadata.name nor an Event Grid subject".to_string()
                })?;
            let name = blob_name_from_subject(subject, source_container).ok_or_else(|| {
                format!("Event Grid subject '{subject}' is not a blob in '{source_container}'")
            })?;
            (name.to_string(), TRIGGER_SOURCE_EVENT_GRID)
        }
    };

    let size_hint = metadata
        .and_then(|metadata| metadata.get("Properties"))
        .and_then(|properties| properties.get("ContentLength"))
        .or_else(|| {
            event_grid
                .and_then(|event| event.get("data"))
                .and_then(|data| data.get("contentLength"))
        })
        .and_then(as_length);

    Ok(TriggerInvocation {
        source_name,
        size_hint,
        trigger_source,
    })
}

/// Runs one delivery end to end: parse, open the source lazily, transfer.
pub async fn handle_invocation(
    event: &Value,
    source_cache: &ClientCache,
    executor: &TransferExecutor,
) -> FunctionResponse {
    let invocation = match parse_invocation(event, source_cache.container()) {
        Ok(value) => value,
        Err(message) => return validation_error_response(&message),
    };

    let source = match source_cache.get_client().await {
        Ok(client) => client,
        Err(cause) => {
            let failure = TransferError::from_client(&invocation.source_name, cause);
            error!(
                event = "transfer_failed",
                source_name = %invocation.source_name,
                container = %source_cache.container(),
                error_code = failure.code(),
                retryable = failure.is_retryable(),
                error = %failure
            );
            return transfer_error_response(&failure);
        }
    };

    let request = TransferRequest::streamed(
        invocation.source_name.clone(),
        lazy_source_stream(source, invocation.source_name.clone()),
        invocation.size_hint,
    );

    let result = match executor.execute(request).await {
        Ok(value) => value,
        Err(error) => return transfer_error_response(&error),
    };

    let log_line = format!(
        "{} {} -> {} ({} bytes, via {})",
        result.outcome.as_str(),
        invocation.source_name,
        result.destination,
        result.bytes_written,
        invocation.trigger_source,
    );
    match serde_json::to_value(&result) {
        Ok(return_value) => success_response(vec![log_line], return_value),
        Err(error) => error_response(
            500,
            json!({
                "error": "serialization_error",
                "message": error.to_string(),
                "source_name": invocation.source_name,
            }),
        ),
    }
}

/// Defers the GET until the first chunk is polled so skipped transfers never
/// read the source.
pub fn lazy_source_stream(source: Arc<dyn BlobStore>, name: String) -> ByteChunkStream {
    stream::once(async move { source.read(&name).await.map(|object| object.stream) })
        .try_flatten()
        .boxed()
}

fn find_event_grid_event(value: &Value) -> Option<Value> {
    match value {
        Value::Object(object) if object.contains_key("subject") => Some(value.clone()),
        Value::Object(object) => object.values().find_map(find_event_grid_event),
        Value::Array(items) => items.iter().find_map(find_event_grid_event),
        // Bindings sometimes arrive as serialized JSON text.
        Value::String(text) => serde_json::from_str::<Value>(text)
            .ok()
            .as_ref()
            .and_then(find_event_grid_event),
        _ => None,
    }
}

fn as_length(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn validation_error_response(message: &str) -> FunctionResponse {
    warn!(event = "invalid_invocation", reason = %message);
    error_response(
        400,
        json!({
            "error": "invalid_invocation",
            "message": message,
        }),
    )
}

fn transfer_error_response(error: &TransferError) -> FunctionResponse {
    error_response(
        500,
        json!({
            "error": error.code(),
            "message": error.to_string(),
            "source_name": error.source_name(),
            "retryable": error.is_retryable(),
        }),
    )
}

fn success_response(logs: Vec<String>, return_value: Value) -> FunctionResponse {
    FunctionResponse {
        status_code: 200,
        body: json!({
            "Outputs": {},
            "Logs": logs,
            "ReturnValue": return_value,
        }),
    }
}

fn error_response(status_code: u16, body: Value) -> FunctionResponse {
    FunctionResponse { status_code, body }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::{ObjectStore, PutPayload};

    use super::*;
    use crate::adapters::client_cache::StoreFactory;
    use crate::adapters::object_store::ObjectStoreBlobStore;
    use crate::runtime::credentials::{AuthConfig, EnvSnapshot, DEFAULT_CONNECTION_SETTING};

    struct ContainerFactory {
        containers: HashMap<String, Arc<InMemory>>,
    }

    #[async_trait]
    impl StoreFactory for ContainerFactory {
        async fn connect(
            &self,
            _auth: &AuthConfig,
            container: &str,
        ) -> Result<Arc<dyn BlobStore>, String> {
            let memory = self
                .containers
                .get(container)
                .cloned()
                .ok_or_else(|| format!("unknown container {container}"))?;
            Ok(Arc::new(ObjectStoreBlobStore::new(memory)))
        }
    }

    struct Harness {
        source: Arc<InMemory>,
        destination: Arc<InMemory>,
        source_cache: ClientCache,
        executor: TransferExecutor,
    }

    fn harness() -> Harness {
        let source = Arc::new(InMemory::new());
        let destination = Arc::new(InMemory::new());
        let factory = Arc::new(ContainerFactory {
            containers: HashMap::from([
                ("unprocessed-pdf".to_string(), source.clone()),
                ("processed-pdf".to_string(), destination.clone()),
            ]),
        });
        let env = EnvSnapshot::new().with(DEFAULT_CONNECTION_SETTING, "UseDevelopmentStorage=true");

        let source_cache = ClientCache::new(
            DEFAULT_CONNECTION_SETTING,
            "unprocessed-pdf",
            env.clone(),
            factory.clone(),
        );
        let destination_cache =
            ClientCache::new(DEFAULT_CONNECTION_SETTING, "processed-pdf", env, factory);

        Harness {
            source,
            destination,
            source_cache,
            executor: TransferExecutor::new(Arc::new(destination_cache)),
        }
    }

    fn blob_trigger_event(name: &str, length: u64) -> Value {
        json!({
            "Data": { "blob": "" },
            "Metadata": {
                "name": name,
                "Uri": format!("https://pdfstore.blob.core.windows.net/unprocessed-pdf/{name}"),
                "Properties": { "ContentLength": length },
                "sys": { "MethodName": "processBlobUpload" }
            }
        })
    }

    #[test]
    fn parses_name_and_length_from_metadata() {
        let invocation = parse_invocation(&blob_trigger_event("a.pdf", 10), "unprocessed-pdf")
            .expect("invocation should parse");

        assert_eq!(
            invocation,
            TriggerInvocation {
                source_name: "a.pdf".to_string(),
                size_hint: Some(10),
                trigger_source: TRIGGER_SOURCE_BLOB_METADATA,
            }
        );
    }

    #[test]
    fn falls_back_to_event_grid_subject_in_serialized_binding() {
        let event_grid = json!({
            "subject": "/blobServices/default/containers/unprocessed-pdf/blobs/reports/b.pdf",
            "eventType": "Microsoft.Storage.BlobCreated",
            "data": { "contentLength": "2048", "blobType": "BlockBlob" }
        });
        let event = json!({
            "Data": { "event": event_grid.to_string() },
            "Metadata": {}
        });

        let invocation =
            parse_invocation(&event, "unprocessed-pdf").expect("event grid payload should parse");

        assert_eq!(invocation.source_name, "reports/b.pdf");
        assert_eq!(invocation.size_hint, Some(2048));
        assert_eq!(invocation.trigger_source, TRIGGER_SOURCE_EVENT_GRID);
    }

    #[test]
    fn rejects_subject_from_another_container() {
        let event = json!({
            "Data": [{ "subject": "/blobServices/default/containers/other/blobs/a.pdf" }]
        });

        let error = parse_invocation(&event, "unprocessed-pdf").expect_err("should reject");
        assert!(error.contains("is not a blob in 'unprocessed-pdf'"));
    }

    #[test]
    fn keeps_surrounding_spaces_in_blob_name() {
        let invocation =
            parse_invocation(&blob_trigger_event(" a.pdf ", 10), "unprocessed-pdf")
                .expect("invocation should parse");

        assert_eq!(invocation.source_name, " a.pdf ");
    }

    #[test]
    fn rejects_payload_without_name() {
        let nameless = json!({ "Data": {}, "Metadata": {} });
        assert!(parse_invocation(&nameless, "unprocessed-pdf").is_err());
        assert!(parse_invocation(&json!("a.pdf"), "unprocessed-pdf").is_err());
    }

    #[tokio::test]
    async fn successful_invocation_returns_custom_handler_envelope() {
        let harness = harness();
        harness
            .source
            .put(&Path::from("a.pdf"), PutPayload::from(Bytes::from_static(b"0123456789")))
            .await
            .expect("seed should succeed");

        let response = handle_invocation(
            &blob_trigger_event("a.pdf", 10),
            &harness.source_cache,
            &harness.executor,
        )
        .await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body["ReturnValue"]["outcome"], "uploaded");
        assert_eq!(response.body["ReturnValue"]["bytes_written"], 10);
        assert_eq!(response.body["Outputs"], json!({}));
        let copied = harness
            .destination
            .get(&Path::from("processed-a.pdf"))
            .await
            .expect("copy should exist")
            .bytes()
            .await
            .expect("copy should be readable");
        assert_eq!(copied, Bytes::from_static(b"0123456789"));
    }

    #[tokio::test]
    async fn redelivery_is_acknowledged_as_skip() {
        let harness = harness();
        harness
            .destination
            .put(&Path::from("processed-a.pdf"), PutPayload::from(Bytes::from_static(b"done")))
            .await
            .expect("seed should succeed");

        // The source is absent, so any read would fail the invocation.
        let response = handle_invocation(
            &blob_trigger_event("a.pdf", 10),
            &harness.source_cache,
            &harness.executor,
        )
        .await;

        assert_eq!(response.status_code, 200);
        assert_eq!(
            response.body["ReturnValue"]["outcome"],
            "skipped_already_exists"
        );
    }

    #[tokio::test]
    async fn missing_source_fails_with_retryable_error() {
        let harness = harness();

        let response = handle_invocation(
            &blob_trigger_event("gone.pdf", 10),
            &harness.source_cache,
            &harness.executor,
        )
        .await;

        assert_eq!(response.status_code, 500);
        assert_eq!(response.body["error"], "source_read_failed");
        assert_eq!(response.body["source_name"], "gone.pdf");
        assert_eq!(response.body["retryable"], true);
        assert!(harness
            .destination
            .head(&Path::from("processed-gone.pdf"))
            .await
            .is_err());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("poisoned mutex").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("poisoned mutex")).into_owned()
        }
    }

    #[tokio::test]
    async fn unconfigured_source_client_is_logged_with_object_name() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let factory = Arc::new(ContainerFactory {
            containers: HashMap::new(),
        });
        let source_cache = ClientCache::new(
            DEFAULT_CONNECTION_SETTING,
            "unprocessed-pdf",
            EnvSnapshot::new(),
            factory.clone(),
        );
        let executor = TransferExecutor::new(Arc::new(ClientCache::new(
            DEFAULT_CONNECTION_SETTING,
            "processed-pdf",
            EnvSnapshot::new(),
            factory,
        )));

        let response =
            handle_invocation(&blob_trigger_event("a.pdf", 10), &source_cache, &executor).await;

        assert_eq!(response.status_code, 500);
        assert_eq!(response.body["error"], "config_missing");
        assert_eq!(response.body["source_name"], "a.pdf");
        let captured = logs.contents();
        let failure = captured
            .lines()
            .find(|line| line.contains("transfer_failed"))
            .expect("failure should be logged");
        assert!(failure.contains("\"source_name\":\"a.pdf\""));
        assert!(failure.contains("\"error_code\":\"config_missing\""));
    }

    #[tokio::test]
    async fn malformed_invocation_is_bad_request() {
        let harness = harness();

        let response =
            handle_invocation(&json!([]), &harness.source_cache, &harness.executor).await;

        assert_eq!(response.status_code, 400);
        assert_eq!(response.body["error"], "invalid_invocation");
    }
}
