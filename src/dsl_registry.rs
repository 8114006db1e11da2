//! DSL registry: the process-wide, single-instance index by which
//! step-definition code inside `CucumberExecution` addresses the
//! producer/consumer workers for a given `(testId, topic)` without ever
//! holding a reference to the actors themselves.
//!
//! Holds `producers`/`consumers` maps plus an optional runtime marker that
//! must be set before any step-facing call succeeds. Maps are
//! `parking_lot::RwLock`-guarded rather than `tokio::sync::RwLock`, since
//! every mutation here is a synchronous map operation with no `.await`
//! inside the critical section.

use crate::codec::SchemaCodec;
use crate::error::{Error, Result};
use crate::model::{CloudEvent, CorrelationId, FetchOutcome, PayloadFormat, ProduceOutcome, RecordHeaders, TestId, Topic};
use crate::test_execution::kafka_consumer::{ConsumerHandle, ConsumerMsg};
use crate::test_execution::kafka_producer::{ProducerHandle, ProducerMsg};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Process-wide singleton handle, installed once by the assembly layer's
/// `ActorRuntimeModule::initialize` step and read by step-definition code
/// that has no other way to reach the registry.
static INSTANCE: OnceCell<Arc<DslRegistry>> = OnceCell::new();

/// Install the process-wide registry. Called exactly once during assembly;
/// a second call is a programmer error.
pub fn install(registry: Arc<DslRegistry>) {
    let _ = INSTANCE.set(registry);
}

/// Fetch the process-wide registry installed by `install`. Panics if the
/// assembly layer has not run yet — this is a programmer error, not a
/// recoverable condition, since step code only ever runs after assembly
/// completes.
pub fn instance() -> Arc<DslRegistry> {
    INSTANCE
        .get()
        .cloned()
        .expect("DslRegistry::install must run during assembly before any step code executes")
}

/// Opaque marker standing in for the actor-runtime handle needed to address
/// registered handles. Mailboxes are addressed directly via their
/// `mpsc::Sender`, so there is no separate "runtime object" to hold — this
/// only records *that* the runtime has been wired up by the assembly layer.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeRoot;

/// Per-execution context read by step code to find its own `(testId,
/// evidencePath)` without being passed it explicitly. Established via
/// `ExecutionContext::scope` before `StartTest`
/// and guaranteed to clear on every exit path — success, scenario failure,
/// or panic unwind — because it rides a `tokio::task_local!`, not a literal
/// OS thread-local that could leak across pooled worker threads.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub test_id: TestId,
    pub evidence_path: String,
}

tokio::task_local! {
    static CURRENT_CONTEXT: ExecutionContext;
}

impl ExecutionContext {
    /// Run `fut` with `self` installed as the current execution context.
    /// Clears automatically when `fut` resolves, including on panic unwind.
    pub async fn scope<F, T>(self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        CURRENT_CONTEXT.scope(self, fut).await
    }
}

/// Read the `testId` of the execution context currently installed on this
/// task, if any. Step code calls this instead of threading `testId`
/// through every step function signature.
pub fn current_test_id() -> Option<TestId> {
    CURRENT_CONTEXT.try_with(|ctx| ctx.test_id).ok()
}

/// Read the full execution context currently installed on this task.
pub fn current_context() -> Option<ExecutionContext> {
    CURRENT_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Process-wide DSL registry (C12). One instance per process, held behind
/// `Arc` and reached through `once_cell::sync::OnceCell` from `main.rs`.
pub struct DslRegistry {
    producers: RwLock<HashMap<(TestId, Topic), ProducerHandle>>,
    consumers: RwLock<HashMap<(TestId, Topic), ConsumerHandle>>,
    runtime: RwLock<Option<RuntimeRoot>>,
    codec: Arc<SchemaCodec>,
    call_timeout: Duration,
}

impl DslRegistry {
    pub fn new(codec: Arc<SchemaCodec>, call_timeout: Duration) -> Self {
        Self {
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            runtime: RwLock::new(None),
            codec,
            call_timeout,
        }
    }

    pub fn set_runtime(&self) {
        *self.runtime.write() = Some(RuntimeRoot);
    }

    pub fn clear_runtime(&self) {
        *self.runtime.write() = None;
    }

    fn require_runtime(&self) -> Result<()> {
        if self.runtime.read().is_some() {
            Ok(())
        } else {
            Err(Error::DslNotInitialized)
        }
    }

    /// Registers overwrite atomically: at most one producer handle per
    /// `(testId, topic)` exists at any moment.
    pub async fn register_producer(&self, test_id: TestId, topic: Topic, handle: ProducerHandle) {
        self.producers.write().insert((test_id, topic), handle);
    }

    pub async fn unregister_producer(&self, test_id: TestId, topic: &str) {
        self.producers.write().remove(&(test_id, topic.to_string()));
    }

    pub async fn register_consumer(&self, test_id: TestId, topic: Topic, handle: ConsumerHandle) {
        self.consumers.write().insert((test_id, topic), handle);
    }

    pub async fn unregister_consumer(&self, test_id: TestId, topic: &str) {
        self.consumers.write().remove(&(test_id, topic.to_string()));
    }

    fn producer_for(&self, test_id: TestId, topic: &str) -> Result<ProducerHandle> {
        self.producers
            .read()
            .get(&(test_id, topic.to_string()))
            .cloned()
            .ok_or(Error::ActorNotRegistered {
                kind: "producer",
                test_id: test_id.to_string(),
                topic: topic.to_string(),
            })
    }

    fn consumer_for(&self, test_id: TestId, topic: &str) -> Result<ConsumerHandle> {
        self.consumers
            .read()
            .get(&(test_id, topic.to_string()))
            .cloned()
            .ok_or(Error::ActorNotRegistered {
                kind: "consumer",
                test_id: test_id.to_string(),
                topic: topic.to_string(),
            })
    }

    /// Encode a CloudEvent key + payload under `topic-RecordName`, send to
    /// the registered producer, and translate its reply.
    pub async fn produce_event<T: Serialize>(
        &self,
        test_id: TestId,
        topic: &str,
        record_name: &str,
        format: PayloadFormat,
        cloud_event: &CloudEvent,
        payload: &T,
        headers: RecordHeaders,
    ) -> Result<()> {
        self.require_runtime()?;
        let handle = self.producer_for(test_id, topic)?;

        let key = self.codec.serialize_key(topic, cloud_event).await?;
        let value = self
            .codec
            .serialize_value(topic, record_name, format, payload)
            .await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .send(ProducerMsg::ProduceEvent {
                key,
                value,
                headers,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ActorNotRegistered {
                kind: "producer",
                test_id: test_id.to_string(),
                topic: topic.to_string(),
            })?;

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(ProduceOutcome::Ack)) => {
                debug!(test_id = %test_id, topic, "produceEvent acked");
                Ok(())
            }
            Ok(Ok(ProduceOutcome::Nack(cause))) => Err(Error::KafkaProducerFailed { cause }),
            Ok(Err(_)) => Err(Error::Fatal {
                message: "producer worker dropped reply channel".into(),
            }),
            Err(_) => Err(Error::Timeout {
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
        }
    }

    /// Blocking variant of `produce_event` for step code invoked from a
    /// synchronous glue function on the Cucumber blocking pool.
    pub fn produce_event_blocking<T: Serialize>(
        &self,
        runtime: &tokio::runtime::Handle,
        test_id: TestId,
        topic: &str,
        record_name: &str,
        format: PayloadFormat,
        cloud_event: &CloudEvent,
        payload: &T,
        headers: RecordHeaders,
    ) -> Result<()> {
        runtime.block_on(self.produce_event(test_id, topic, record_name, format, cloud_event, payload, headers))
    }

    /// Fetch a consumed record by correlation id and decode it; `Nack(404)`
    /// becomes the typed `ConsumerNotAvailable` retry signal.
    pub async fn fetch_consumed_event<T: DeserializeOwned>(
        &self,
        test_id: TestId,
        topic: &str,
        record_name: &str,
        format: PayloadFormat,
        correlation_id: &CorrelationId,
    ) -> Result<(CloudEvent, T)> {
        self.require_runtime()?;
        let handle = self.consumer_for(test_id, topic)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .send(ConsumerMsg::FetchConsumedEvent {
                correlation_id: correlation_id.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ActorNotRegistered {
                kind: "consumer",
                test_id: test_id.to_string(),
                topic: topic.to_string(),
            })?;

        let outcome = match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(Error::Fatal {
                    message: "consumer worker dropped reply channel".into(),
                })
            }
            Err(_) => {
                return Err(Error::Timeout {
                    timeout_ms: self.call_timeout.as_millis() as u64,
                })
            }
        };

        match outcome {
            FetchOutcome::Ack { key, value, .. } => {
                let cloud_event = self.codec.deserialize_key(topic, &key).await?;
                let decoded = self
                    .codec
                    .deserialize_value(topic, record_name, format, &value)
                    .await?;
                Ok((cloud_event, decoded))
            }
            FetchOutcome::Nack { status } if status == 404 => {
                warn!(test_id = %test_id, topic, correlation_id = %correlation_id, "no consumed event yet");
                Err(Error::ConsumerNotAvailable {
                    correlation_id: correlation_id.to_string(),
                    topic: topic.to_string(),
                })
            }
            FetchOutcome::Nack { status } => Err(Error::KafkaConsumer {
                message: format!("unexpected fetch status {status}").into(),
            }),
        }
    }

    /// Blocking variant of `fetch_consumed_event`.
    pub fn fetch_consumed_event_blocking<T: DeserializeOwned>(
        &self,
        runtime: &tokio::runtime::Handle,
        test_id: TestId,
        topic: &str,
        record_name: &str,
        format: PayloadFormat,
        correlation_id: &CorrelationId,
    ) -> Result<(CloudEvent, T)> {
        runtime.block_on(self.fetch_consumed_event(test_id, topic, record_name, format, correlation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SchemaRegistryClient;
    use std::time::Duration;

    fn test_codec() -> Arc<SchemaCodec> {
        let client = SchemaRegistryClient::new("http://localhost:1", Duration::from_millis(10)).unwrap();
        Arc::new(SchemaCodec::new(client, 10))
    }

    #[tokio::test]
    async fn produce_event_without_runtime_is_dsl_not_initialized() {
        let registry = DslRegistry::new(test_codec(), Duration::from_millis(50));
        let test_id = TestId::random();
        let cloud_event = CloudEvent {
            id: "1".into(),
            source: "test".into(),
            specversion: "1.0".into(),
            event_type: "Order".into(),
            time: "now".into(),
            subject: "orders".into(),
            datacontenttype: "application/json".into(),
            correlationid: "c1".into(),
            payloadversion: "1".into(),
            time_epoch_micro_source: 0,
        };
        let err = registry
            .produce_event(
                test_id,
                "orders",
                "Order",
                PayloadFormat::JsonSchema,
                &cloud_event,
                &serde_json::json!({}),
                RecordHeaders::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DslNotInitialized));
    }

    #[tokio::test]
    async fn fetch_without_registered_consumer_is_actor_not_registered() {
        let registry = DslRegistry::new(test_codec(), Duration::from_millis(50));
        registry.set_runtime();
        let test_id = TestId::random();
        let err = registry
            .fetch_consumed_event::<serde_json::Value>(
                test_id,
                "orders",
                "Order",
                PayloadFormat::JsonSchema,
                &CorrelationId("c1".into()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ActorNotRegistered { .. }));
    }

    #[tokio::test]
    async fn execution_context_is_visible_inside_scope_and_absent_outside() {
        assert!(current_test_id().is_none());
        let test_id = TestId::random();
        let ctx = ExecutionContext {
            test_id,
            evidence_path: "/vfs/x/evidence".into(),
        };
        let observed = ctx
            .scope(async {
                current_test_id()
            })
            .await;
        assert_eq!(observed, Some(test_id));
        assert!(current_test_id().is_none());
    }
}
