//! Admission and dispatch: the single process-wide queue of test
//! executions. Owns every `TestExecutionActor` for its lifetime, admits new
//! tests up to `maxQueueDepth`, and dispatches admitted tests to run up to
//! `maxConcurrent` at a time, FIFO among the ready.
//!
//! Structurally this mirrors `test_execution::fsm`: a single mailbox loop
//! owning all mutable state, `oneshot` replies for request/reply commands,
//! and a side channel (`queue_rx`) fed by every spawned FSM's termination
//! future so slot release doesn't need to poll.

use crate::codec::SchemaCodec;
use crate::config::Config;
use crate::dsl_registry::DslRegistry;
use crate::error::{Error, Result};
use crate::model::{BlockStorageDirective, QueueStatus, TestId, TestStatus};
use crate::object_storage::ObjectStore;
use crate::test_execution::fsm::{self, FsmCmd, FsmDeps, FsmHandle, TerminalOutcome};
use crate::vault_backend::SecretVault;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// The `ServiceFunctions` bundle plus the schema/DSL singletons
/// every `TestExecutionActor` needs, assembled once by the build sequence
/// and handed to the Queue at spawn time.
pub struct QueueDeps {
    pub object_store: Arc<dyn ObjectStore>,
    pub secret_vault: Arc<dyn SecretVault>,
    pub codec: Arc<SchemaCodec>,
    pub registry: Arc<DslRegistry>,
}

pub enum QueueCmd {
    Initialize {
        test_id: TestId,
        feature_files_location: String,
        bucket_name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Start {
        test_id: TestId,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        test_id: TestId,
        reply: oneshot::Sender<Result<()>>,
    },
    GetStatus {
        test_id: TestId,
        reply: oneshot::Sender<Result<TestStatus>>,
    },
    GetQueueStatus {
        reply: oneshot::Sender<QueueStatus>,
    },
}

pub type QueueHandle = mpsc::Sender<QueueCmd>;

/// One admitted test: its FSM handle (`None` until dispatched) plus last
/// known status, so `GetStatus` answers both queued and running tests.
struct Entry {
    status: TestStatus,
    fsm: Option<FsmHandle>,
}

/// Internal event fed back into the Queue's own loop when a dispatched
/// FSM reaches a terminal state. Bridges the FSM's `oneshot<TerminalOutcome>`
/// completion into the Queue's single mailbox rather than spawning a
/// separate watcher the Queue would have to join on.
enum QueueEvent {
    Cmd(QueueCmd),
    TestFinished { test_id: TestId, outcome: TerminalOutcome },
}

pub fn spawn(config: Arc<Config>, deps: QueueDeps) -> QueueHandle {
    let (tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, mut event_rx) = mpsc::channel::<QueueEvent>(256);

    // Bridges external commands into the same mailbox as internal
    // TestFinished events so the Queue has exactly one writer over its
    // state, matching the single-mailbox-owns-all-mutable-state pattern
    // used throughout this crate (fsm.rs, block_storage.rs).
    let forward_tx = event_tx.clone();
    tokio::spawn(async move {
        let mut cmd_rx = cmd_rx;
        while let Some(cmd) = cmd_rx.recv().await {
            if forward_tx.send(QueueEvent::Cmd(cmd)).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut pending: VecDeque<TestId> = VecDeque::new();
        let mut admitted: HashMap<TestId, BlockStorageDirective> = HashMap::new();
        let mut entries: HashMap<TestId, Entry> = HashMap::new();
        let mut in_flight: usize = 0;

        while let Some(event) = event_rx.recv().await {
            match event {
                QueueEvent::Cmd(QueueCmd::Initialize {
                    test_id,
                    feature_files_location,
                    bucket_name,
                    reply,
                }) => {
                    if entries.contains_key(&test_id) {
                        let _ = reply.send(Err(Error::DuplicateTest { test_id: test_id.to_string() }));
                        continue;
                    }
                    if pending.len() >= config.queue.max_queue_depth {
                        let _ = reply.send(Err(Error::QueueFull));
                        continue;
                    }

                    let directive = BlockStorageDirective {
                        bucket: bucket_name,
                        object_path: feature_files_location,
                        mount_path: String::new(),
                        evidence_path: String::new(),
                        topics: Vec::new(),
                        step_definition_packages: Vec::new(),
                        tag_filters: Vec::new(),
                    };
                    admitted.insert(test_id, directive);
                    entries.insert(test_id, Entry { status: TestStatus::Queued, fsm: None });
                    pending.push_back(test_id);
                    info!(%test_id, depth = pending.len(), "test admitted");
                    let _ = reply.send(Ok(()));

                    dispatch_ready(
                        &config,
                        &deps,
                        &mut pending,
                        &mut admitted,
                        &mut entries,
                        &mut in_flight,
                        event_tx.clone(),
                    );
                }
                QueueEvent::Cmd(QueueCmd::Start { test_id, reply }) => {
                    let reply_result = match entries.get(&test_id) {
                        None => Err(Error::UnknownTest(test_id.to_string())),
                        Some(entry) => match &entry.fsm {
                            Some(fsm) => match fsm.send(FsmCmd::Start).await {
                                Ok(()) => Ok(()),
                                Err(_) => Err(Error::UnknownTest(test_id.to_string())),
                            },
                            None => Err(Error::validation(format!(
                                "testId={} has not been dispatched yet",
                                test_id
                            ))),
                        },
                    };
                    let _ = reply.send(reply_result);
                }
                QueueEvent::Cmd(QueueCmd::Cancel { test_id, reply }) => {
                    let reply_result = match entries.get(&test_id) {
                        None => Err(Error::UnknownTest(test_id.to_string())),
                        Some(entry) => match &entry.fsm {
                            Some(fsm) => {
                                let _ = fsm.send(FsmCmd::Cancel).await;
                                Ok(())
                            }
                            None => {
                                // Still queued, never dispatched: cancel is a
                                // pure removal from the pending list.
                                pending.retain(|id| id != &test_id);
                                admitted.remove(&test_id);
                                entries.remove(&test_id);
                                Ok(())
                            }
                        },
                    };
                    let _ = reply.send(reply_result);
                }
                QueueEvent::Cmd(QueueCmd::GetStatus { test_id, reply }) => {
                    let result = entries
                        .get(&test_id)
                        .map(|e| e.status)
                        .ok_or_else(|| Error::UnknownTest(test_id.to_string()));
                    let _ = reply.send(result);
                }
                QueueEvent::Cmd(QueueCmd::GetQueueStatus { reply }) => {
                    let _ = reply.send(QueueStatus { depth: pending.len(), in_flight });
                }
                QueueEvent::TestFinished { test_id, outcome } => {
                    if let Some(entry) = entries.get_mut(&test_id) {
                        entry.status = outcome.status;
                        entry.fsm = None;
                    }
                    in_flight = in_flight.saturating_sub(1);
                    info!(%test_id, status = ?outcome.status, "test reached terminal state, slot released");

                    dispatch_ready(
                        &config,
                        &deps,
                        &mut pending,
                        &mut admitted,
                        &mut entries,
                        &mut in_flight,
                        event_tx.clone(),
                    );
                }
            }
        }
    });

    tx
}

/// Dispatches as many pending tests as the concurrency cap allows, FIFO.
fn dispatch_ready(
    config: &Arc<Config>,
    deps: &QueueDeps,
    pending: &mut VecDeque<TestId>,
    admitted: &mut HashMap<TestId, BlockStorageDirective>,
    entries: &mut HashMap<TestId, Entry>,
    in_flight: &mut usize,
    event_tx: mpsc::Sender<QueueEvent>,
) {
    while *in_flight < config.queue.max_concurrent {
        let Some(test_id) = pending.pop_front() else { break };
        let Some(directive) = admitted.remove(&test_id) else { continue };

        let fsm_deps = FsmDeps {
            test_id,
            default_bucket: directive.bucket.clone(),
            object_store: Arc::clone(&deps.object_store),
            secret_vault: Arc::clone(&deps.secret_vault),
            kafka_config: config.kafka.clone(),
            codec: Arc::clone(&deps.codec),
            registry: Arc::clone(&deps.registry),
            restart_max: config.actor_runtime.restart_max_count,
            restart_window: config.actor_runtime.restart_window,
        };

        let (done_tx, done_rx) = oneshot::channel();
        let (fsm_handle, _term_rx, _join) = fsm::spawn(fsm_deps, done_tx);

        if let Some(entry) = entries.get_mut(&test_id) {
            entry.status = TestStatus::AwaitingSetup;
            entry.fsm = Some(fsm_handle);
        }
        *in_flight += 1;
        info!(%test_id, in_flight = *in_flight, "test dispatched");

        let forward_tx = event_tx.clone();
        tokio::spawn(async move {
            if let Ok(outcome) = done_rx.await {
                let _ = forward_tx.send(QueueEvent::TestFinished { test_id, outcome }).await;
            } else {
                warn!(%test_id, "fsm task dropped without reporting a terminal outcome");
                let _ = forward_tx
                    .send(QueueEvent::TestFinished {
                        test_id,
                        outcome: TerminalOutcome { status: TestStatus::Failure, result: None },
                    })
                    .await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SchemaRegistryClient;
    use crate::config::{
        ActorRuntimeConfig, KafkaConfig, ObjectStorageConfig, QueueConfig, RestConfig,
        SchemaRegistryConfig, VaultConfig,
    };
    use crate::object_storage::fake::FakeObjectStore;
    use crate::vault_backend::fake::FakeSecretVault;
    use std::time::Duration;

    fn test_config(max_concurrent: usize, max_queue_depth: usize) -> Arc<Config> {
        Arc::new(Config {
            actor_runtime: ActorRuntimeConfig {
                system_name: "test-probe".into(),
                shutdown_timeout: Duration::from_secs(5),
                restart_max_count: 3,
                restart_window: Duration::from_secs(60),
                call_timeout: Duration::from_secs(5),
                build_timeout: Duration::from_secs(30),
            },
            queue: QueueConfig { max_concurrent, max_queue_depth },
            kafka: KafkaConfig {
                bootstrap_servers: "localhost:9092".into(),
                group_id_prefix: "test-probe".into(),
                delivery_timeout: Duration::from_secs(30),
                message_timeout: Duration::from_secs(5),
                max_message_bytes: 1024,
                compression: "lz4".into(),
                acks: "all".into(),
                idempotent: true,
                reconnect_backoff_ms: 1000,
                reconnect_backoff_max_ms: 10000,
                rdkafka_debug: None,
            },
            schema_registry: SchemaRegistryConfig {
                url: "http://localhost:1".into(),
                request_timeout: Duration::from_millis(50),
                cache_capacity: 10,
            },
            rest: RestConfig {
                port: 0,
                host: "127.0.0.1".into(),
                request_timeout: Duration::from_secs(5),
                max_body_size: 1024,
                cors_enabled: false,
                cors_origins: vec![],
            },
            object_storage: ObjectStorageConfig {
                bucket: "bucket".into(),
                region: "us-east-1".into(),
                endpoint: None,
            },
            vault: VaultConfig { namespace: "ns".into(), cache_ttl: Duration::from_secs(60) },
        })
    }

    fn test_deps() -> QueueDeps {
        let client = SchemaRegistryClient::new("http://localhost:1", Duration::from_millis(10)).unwrap();
        let codec = Arc::new(SchemaCodec::new(client, 10));
        QueueDeps {
            object_store: Arc::new(FakeObjectStore::default()),
            secret_vault: Arc::new(FakeSecretVault::default()),
            codec: codec.clone(),
            registry: Arc::new(DslRegistry::new(codec, Duration::from_secs(5))),
        }
    }

    #[tokio::test]
    async fn duplicate_test_id_is_rejected() {
        let handle = spawn(test_config(1, 4), test_deps());
        let test_id = TestId::random();

        let (tx1, rx1) = oneshot::channel();
        handle
            .send(QueueCmd::Initialize {
                test_id,
                feature_files_location: "path".into(),
                bucket_name: "bucket".into(),
                reply: tx1,
            })
            .await
            .unwrap();
        rx1.await.unwrap().unwrap();

        let (tx2, rx2) = oneshot::channel();
        handle
            .send(QueueCmd::Initialize {
                test_id,
                feature_files_location: "path".into(),
                bucket_name: "bucket".into(),
                reply: tx2,
            })
            .await
            .unwrap();
        let err = rx2.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::DuplicateTest { .. }));
    }

    #[tokio::test]
    async fn queue_full_is_rejected() {
        let handle = spawn(test_config(1, 1), test_deps());

        let (tx1, rx1) = oneshot::channel();
        handle
            .send(QueueCmd::Initialize {
                test_id: TestId::random(),
                feature_files_location: "path".into(),
                bucket_name: "bucket".into(),
                reply: tx1,
            })
            .await
            .unwrap();
        rx1.await.unwrap().unwrap();

        // First admitted test is immediately dispatched (max_concurrent=1),
        // so the pending queue is empty again; push two more to fill depth.
        let (tx2, rx2) = oneshot::channel();
        handle
            .send(QueueCmd::Initialize {
                test_id: TestId::random(),
                feature_files_location: "path".into(),
                bucket_name: "bucket".into(),
                reply: tx2,
            })
            .await
            .unwrap();
        rx2.await.unwrap().unwrap();

        let (tx3, rx3) = oneshot::channel();
        handle
            .send(QueueCmd::Initialize {
                test_id: TestId::random(),
                feature_files_location: "path".into(),
                bucket_name: "bucket".into(),
                reply: tx3,
            })
            .await
            .unwrap();
        let err = rx3.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::QueueFull));
    }

    #[tokio::test]
    async fn unknown_test_status_is_not_found() {
        let handle = spawn(test_config(1, 4), test_deps());
        let (tx, rx) = oneshot::channel();
        handle.send(QueueCmd::GetStatus { test_id: TestId::random(), reply: tx }).await.unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::UnknownTest(_)));
    }

    #[tokio::test]
    async fn empty_queue_status_reports_zero() {
        let handle = spawn(test_config(1, 4), test_deps());
        let (tx, rx) = oneshot::channel();
        handle.send(QueueCmd::GetQueueStatus { reply: tx }).await.unwrap();
        let status = rx.await.unwrap();
        assert_eq!(status.depth, 0);
        assert_eq!(status.in_flight, 0);
    }
}
