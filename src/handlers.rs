//! Action handlers executed by the worker stage.
//!
//! A handler turns a dispatch [`Request`] into a [`Response`]; business
//! failures are carried in `Response.error`, never raised, so they flow
//! through the normal result path and pick up backoff and critical-error
//! handling in the store. Both handlers thread the `attempt` key from the
//! request into their outcome for end-to-end observability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::chaos::ChaosInjector;
use crate::envelope::{Request, Response};
use crate::store::{ObjectStore, StoreError, StoreResult};
use crate::task::{KvMap, TaskAction};

#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, request: &Request) -> Response;
}

pub type HandlerRegistry = HashMap<TaskAction, Arc<dyn Handler>>;

/// Registry over the closed action set.
pub fn handler_registry<O>(objects: Arc<O>, chaos: ChaosInjector) -> HandlerRegistry
where
    O: ObjectStore + 'static,
{
    let mut handlers: HandlerRegistry = HashMap::new();
    handlers.insert(TaskAction::Dummy, Arc::new(DummyHandler::new(chaos.clone())));
    handlers.insert(TaskAction::Export, Arc::new(ExportHandler::new(objects, chaos)));
    handlers
}

fn attempt_of(request: &Request) -> String {
    request.params.get("attempt").cloned().unwrap_or_default()
}

fn error_map(code: &str, message: String, attempt: String) -> KvMap {
    KvMap::from([
        ("code".to_string(), code.to_string()),
        ("message".to_string(), message),
        ("attempt".to_string(), attempt),
    ])
}

fn success_map(attempt: String) -> KvMap {
    KvMap::from([
        ("result".to_string(), "success".to_string()),
        ("attempt".to_string(), attempt),
    ])
}

/// No-op stand-in for arbitrary business logic.
pub struct DummyHandler {
    chaos: ChaosInjector,
}

impl DummyHandler {
    pub fn new(chaos: ChaosInjector) -> Self {
        Self { chaos }
    }
}

#[async_trait]
impl Handler for DummyHandler {
    async fn execute(&self, request: &Request) -> Response {
        let attempt = attempt_of(request);
        info!(
            task_id = %request.id,
            attempt = %attempt,
            "processing dummy task"
        );
        match self.chaos.inject::<(), StoreError>(Ok(())) {
            Ok(()) => Response::success(&request.id, success_map(attempt)),
            Err(err) => Response::failure(
                &request.id,
                error_map("5050", err.to_string(), attempt),
            ),
        }
    }
}

/// Copies the referenced business object into the export store. Exporting
/// the same object twice is success, not an error.
pub struct ExportHandler<O> {
    objects: Arc<O>,
    chaos: ChaosInjector,
}

impl<O: ObjectStore> ExportHandler<O> {
    pub fn new(objects: Arc<O>, chaos: ChaosInjector) -> Self {
        Self { objects, chaos }
    }

    async fn export(&self, object_id: i64) -> StoreResult<()> {
        let object = self
            .chaos
            .inject(self.objects.fetch_object(object_id).await)?;
        match self.chaos.inject(self.objects.export_object(&object).await) {
            Ok(()) | Err(StoreError::DuplicateObject) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl<O: ObjectStore> Handler for ExportHandler<O> {
    async fn execute(&self, request: &Request) -> Response {
        let attempt = attempt_of(request);
        let object_id = match request.params.get("objectID").and_then(|v| v.parse().ok()) {
            Some(id) => id,
            None => {
                warn!(task_id = %request.id, "export request without a valid objectID");
                return Response::failure(
                    &request.id,
                    error_map("1", "missing or invalid objectID".to_string(), attempt),
                );
            }
        };

        match self.export(object_id).await {
            Ok(()) => {
                info!(
                    task_id = %request.id,
                    object_id,
                    attempt = %attempt,
                    "object exported"
                );
                Response::success(&request.id, success_map(attempt))
            }
            Err(err @ StoreError::ObjectNotFound(_)) => {
                warn!(task_id = %request.id, object_id, error = %err, "object lookup failed");
                Response::failure(&request.id, error_map("1", err.to_string(), attempt))
            }
            Err(err) => {
                warn!(task_id = %request.id, object_id, error = %err, "object export failed");
                Response::failure(&request.id, error_map("2", err.to_string(), attempt))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;

    fn export_request(object_id: &str, attempt: &str) -> Request {
        Request::new(
            "7",
            "EXPORT",
            KvMap::from([
                ("objectID".to_string(), object_id.to_string()),
                ("attempt".to_string(), attempt.to_string()),
            ]),
        )
    }

    #[tokio::test]
    async fn export_copies_object_and_reports_success() {
        let objects = Arc::new(MemoryObjectStore::new());
        let id = objects.insert_object(KvMap::from([("k".to_string(), "v".to_string())]));
        let handler = ExportHandler::new(Arc::clone(&objects), ChaosInjector::disabled());

        let response = handler
            .execute(&export_request(&id.to_string(), "1"))
            .await;
        let result = response.result.expect("result present");
        assert_eq!(result.get("result").map(String::as_str), Some("success"));
        assert_eq!(result.get("attempt").map(String::as_str), Some("1"));
        assert!(response.error.is_none());
        assert_eq!(objects.exported(id), objects.fetch_object(id).await.ok().map(|o| o.data));
    }

    #[tokio::test]
    async fn export_twice_is_success() {
        let objects = Arc::new(MemoryObjectStore::new());
        let id = objects.insert_object(KvMap::new());
        let handler = ExportHandler::new(Arc::clone(&objects), ChaosInjector::disabled());
        let request = export_request(&id.to_string(), "1");

        assert!(handler.execute(&request).await.result.is_some());
        assert!(handler.execute(&request).await.result.is_some());
        assert_eq!(objects.exported_count(), 1);
    }

    #[tokio::test]
    async fn missing_object_is_a_business_failure() {
        let objects = Arc::new(MemoryObjectStore::new());
        let handler = ExportHandler::new(objects, ChaosInjector::disabled());

        let response = handler.execute(&export_request("999", "2")).await;
        assert!(response.result.is_none());
        let error = response.error.expect("error present");
        assert_eq!(error.get("code").map(String::as_str), Some("1"));
        assert_eq!(error.get("attempt").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn dummy_succeeds_without_chaos_and_fails_under_it() {
        let request = Request::new(
            "1",
            "DUMMY",
            KvMap::from([("attempt".to_string(), "1".to_string())]),
        );
        let quiet = DummyHandler::new(ChaosInjector::disabled());
        assert!(quiet.execute(&request).await.result.is_some());

        let noisy = DummyHandler::new(ChaosInjector::new(1.0));
        let response = noisy.execute(&request).await;
        let error = response.error.expect("error present");
        assert_eq!(error.get("code").map(String::as_str), Some("5050"));
    }

    #[tokio::test]
    async fn registry_covers_the_closed_action_set() {
        let registry = handler_registry(
            Arc::new(MemoryObjectStore::new()),
            ChaosInjector::disabled(),
        );
        assert!(registry.contains_key(&TaskAction::Dummy));
        assert!(registry.contains_key(&TaskAction::Export));
        assert_eq!(registry.len(), 2);
    }
}
