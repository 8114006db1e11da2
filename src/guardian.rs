//! Root supervisor: spawns the single, process-wide `Queue` on
//! `Initialize`. Accepts exactly one `Initialize`; later calls are ignored
//! with a warning. Serves `GetQueueHandle` for the lifetime of the process.
//!
//! The Queue has no validation/usage error path of its own — those are
//! surfaced per-test, never by exiting the task — so in practice its
//! mailbox only closes on process shutdown. `restart_budget` is carried on
//! `GuardianState::Running` so a future restart-on-exit policy (matching
//! the `RestartBudget` token bucket every other supervised unit in this
//! crate already uses) has somewhere to live, but nothing currently
//! monitors the Queue task's `JoinHandle`: one process-wide `QueueHandle`
//! is cloned out to the REST layer once at assembly time, and restarting
//! Queue behind a fresh `mpsc` channel would orphan those already-
//! distributed clones without an indirection layer this crate doesn't have
//! yet. `GuardianState::Degraded` is reserved for when that policy lands.

use crate::actor::RestartBudget;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::{self, QueueHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

pub enum GuardianCmd {
    Initialize {
        reply: oneshot::Sender<Result<()>>,
    },
    GetQueueHandle {
        reply: oneshot::Sender<Result<QueueHandle>>,
    },
}

pub type GuardianHandle = mpsc::Sender<GuardianCmd>;

/// Spawn the Guardian task. It holds no resources of its own until
/// `Initialize` is sent to it; `GetQueueHandle` before that point is a
/// `Validation` error (resumable — the caller is expected to retry after
/// driving the build sequence to completion).
pub fn spawn(config: Arc<Config>, service_functions_ready: ServiceFunctionsFactory) -> GuardianHandle {
    let (tx, mut rx) = mpsc::channel(8);

    tokio::spawn(async move {
        let mut state: GuardianState = GuardianState::Uninitialized;

        while let Some(cmd) = rx.recv().await {
            match cmd {
                GuardianCmd::Initialize { reply } => {
                    match &state {
                        GuardianState::Uninitialized => {
                            let deps = service_functions_ready();
                            let queue_handle = queue::spawn(Arc::clone(&config), deps);
                            info!("guardian initialized, queue spawned");
                            state = GuardianState::Running {
                                queue_handle,
                                restart_budget: RestartBudget::new(
                                    config.actor_runtime.restart_max_count,
                                    config.actor_runtime.restart_window,
                                ),
                            };
                            let _ = reply.send(Ok(()));
                        }
                        GuardianState::Running { .. } | GuardianState::Degraded => {
                            warn!("guardian already initialized, ignoring duplicate Initialize");
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
                GuardianCmd::GetQueueHandle { reply } => match &state {
                    GuardianState::Running { queue_handle, .. } => {
                        let _ = reply.send(Ok(queue_handle.clone()));
                    }
                    GuardianState::Degraded => {
                        let _ = reply.send(Err(Error::Fatal {
                            message: "guardian is in a degraded, non-accepting state".into(),
                        }));
                    }
                    GuardianState::Uninitialized => {
                        let _ = reply.send(Err(Error::validation(
                            "guardian has not been initialized yet",
                        )));
                    }
                },
            }
        }
    });

    tx
}

/// Builds the `QueueDeps` bundle (config plus `ServiceFunctions`) once the
/// assembly layer has wired the concrete object-storage/vault modules.
/// Deferred behind a closure so `guardian::spawn` can be called before
/// those modules' `initialize` steps run, matching the Validate → Initialize
/// ordering (`ActorRuntimeModule` initializes before
/// `ObjectStorageModule`/`SecretVaultModule`).
pub type ServiceFunctionsFactory = Box<dyn FnOnce() -> queue::QueueDeps + Send>;

enum GuardianState {
    Uninitialized,
    Running {
        queue_handle: QueueHandle,
        /// Not yet consumed — reserved for a future restart-on-exit policy.
        /// See the module doc comment.
        #[allow(dead_code)]
        restart_budget: RestartBudget,
    },
    /// Not yet reachable — reserved for the same future policy.
    #[allow(dead_code)]
    Degraded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{SchemaCodec, SchemaRegistryClient};
    use crate::dsl_registry::DslRegistry;
    use crate::object_storage::fake::FakeObjectStore;
    use crate::vault_backend::fake::FakeSecretVault;
    use std::time::Duration as StdDuration;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            actor_runtime: crate::config::ActorRuntimeConfig {
                system_name: "test-probe".into(),
                shutdown_timeout: StdDuration::from_secs(5),
                restart_max_count: 3,
                restart_window: StdDuration::from_secs(60),
                call_timeout: StdDuration::from_secs(5),
                build_timeout: StdDuration::from_secs(30),
            },
            queue: crate::config::QueueConfig {
                max_concurrent: 2,
                max_queue_depth: 4,
            },
            kafka: crate::config::KafkaConfig {
                bootstrap_servers: "localhost:9092".into(),
                group_id_prefix: "test-probe".into(),
                delivery_timeout: StdDuration::from_secs(30),
                message_timeout: StdDuration::from_secs(5),
                max_message_bytes: 1024,
                compression: "lz4".into(),
                acks: "all".into(),
                idempotent: true,
                reconnect_backoff_ms: 1000,
                reconnect_backoff_max_ms: 10000,
                rdkafka_debug: None,
            },
            schema_registry: crate::config::SchemaRegistryConfig {
                url: "http://localhost:1".into(),
                request_timeout: StdDuration::from_millis(50),
                cache_capacity: 10,
            },
            rest: crate::config::RestConfig {
                port: 0,
                host: "127.0.0.1".into(),
                request_timeout: StdDuration::from_secs(5),
                max_body_size: 1024,
                cors_enabled: false,
                cors_origins: vec![],
            },
            object_storage: crate::config::ObjectStorageConfig {
                bucket: "bucket".into(),
                region: "us-east-1".into(),
                endpoint: None,
            },
            vault: crate::config::VaultConfig {
                namespace: "ns".into(),
                cache_ttl: StdDuration::from_secs(60),
            },
        })
    }

    fn test_deps() -> queue::QueueDeps {
        let client = SchemaRegistryClient::new("http://localhost:1", StdDuration::from_millis(10)).unwrap();
        let codec = Arc::new(SchemaCodec::new(client, 10));
        queue::QueueDeps {
            object_store: Arc::new(FakeObjectStore::default()),
            secret_vault: Arc::new(FakeSecretVault::default()),
            codec: codec.clone(),
            registry: Arc::new(DslRegistry::new(codec, StdDuration::from_secs(5))),
        }
    }

    #[tokio::test]
    async fn get_queue_handle_before_initialize_is_validation_error() {
        let handle = spawn(test_config(), Box::new(test_deps));
        let (reply_tx, reply_rx) = oneshot::channel();
        handle.send(GuardianCmd::GetQueueHandle { reply: reply_tx }).await.unwrap();
        let err = reply_rx.await.unwrap().unwrap_err();
        assert!(err.is_resumable());
    }

    #[tokio::test]
    async fn second_initialize_is_idempotent() {
        let handle = spawn(test_config(), Box::new(test_deps));
        let (tx1, rx1) = oneshot::channel();
        handle.send(GuardianCmd::Initialize { reply: tx1 }).await.unwrap();
        rx1.await.unwrap().unwrap();

        let (tx2, rx2) = oneshot::channel();
        handle.send(GuardianCmd::Initialize { reply: tx2 }).await.unwrap();
        rx2.await.unwrap().unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        handle.send(GuardianCmd::GetQueueHandle { reply: reply_tx }).await.unwrap();
        assert!(reply_rx.await.unwrap().is_ok());
    }
}
