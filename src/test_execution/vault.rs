//! Vault child: resolves a `KafkaSecurityDirective` for each
//! topic a test references. Wraps the `SecretVault` service function
//! behind a single-writer mailbox.
//!
//! **Confidentiality contract.** This module must never log or error on a
//! `KafkaSecurityDirective`'s fields; `SecretVault::fetch_security_directives`
//! errors are already test-id-scoped by the backend (`vault_backend.rs`),
//! and this child re-wraps any other failure the same way before it ever
//! reaches a log line.

use crate::error::Error;
use crate::model::TestId;
use crate::test_execution::fsm::{ChildKind, FsmEvent};
use crate::vault_backend::SecretVault;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, instrument};

pub enum VaultCmd {
    /// Resolve security directives for the producer/consumer topics named
    /// in the already-fetched `BlockStorageDirective`.
    Initialize {
        directive: crate::model::BlockStorageDirective,
    },
    Stop,
}

pub type VaultHandle = mpsc::Sender<VaultCmd>;

pub fn spawn(
    test_id: TestId,
    secret_vault: Arc<dyn SecretVault>,
    fsm_tx: mpsc::Sender<FsmEvent>,
) -> (VaultHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(8);

    let handle = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                VaultCmd::Initialize { directive } => {
                    match resolve(test_id, &directive, secret_vault.as_ref()).await {
                        Ok(directives) => {
                            let _ = fsm_tx
                                .send(FsmEvent::SecurityFetched { directives })
                                .await;
                            let _ = fsm_tx
                                .send(FsmEvent::ChildGoodToGo {
                                    child: ChildKind::Vault,
                                })
                                .await;
                        }
                        Err(error) => {
                            // Confidentiality contract: only log/report the
                            // test id, never the underlying vault error or
                            // any directive field.
                            error!(test_id = %test_id, "vault credential resolution failed");
                            let _ = fsm_tx
                                .send(FsmEvent::ChildFailed {
                                    child: ChildKind::Vault,
                                    error,
                                })
                                .await;
                        }
                    }
                }
                VaultCmd::Stop => break,
            }
        }

        secret_vault.shutdown().await;
        info!(test_id = %test_id, "vault child stopped");
    });

    (tx, handle)
}

#[instrument(skip(secret_vault, directive), fields(test_id = %test_id))]
async fn resolve(
    test_id: TestId,
    directive: &crate::model::BlockStorageDirective,
    secret_vault: &dyn SecretVault,
) -> crate::error::Result<Vec<crate::model::KafkaSecurityDirective>> {
    secret_vault
        .fetch_security_directives(test_id, &directive.topics)
        .await
        .map_err(|_| Error::Vault {
            test_id: test_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockStorageDirective, TopicDirective, TopicRole};
    use crate::vault_backend::fake::FakeSecretVault;

    fn directive_with_topics(topics: Vec<TopicDirective>) -> BlockStorageDirective {
        BlockStorageDirective {
            bucket: "b".into(),
            object_path: "p".into(),
            mount_path: "/m".into(),
            evidence_path: "/e".into(),
            topics,
            step_definition_packages: vec![],
            tag_filters: vec![],
        }
    }

    #[tokio::test]
    async fn empty_topic_list_yields_empty_security_fetched() {
        let vault = Arc::new(FakeSecretVault::default());
        let (fsm_tx, mut fsm_rx) = mpsc::channel(8);
        let test_id = TestId::random();

        let (handle, _join) = spawn(test_id, vault, fsm_tx);
        handle
            .send(VaultCmd::Initialize {
                directive: directive_with_topics(vec![]),
            })
            .await
            .unwrap();

        match fsm_rx.recv().await.unwrap() {
            FsmEvent::SecurityFetched { directives } => assert!(directives.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            fsm_rx.recv().await.unwrap(),
            FsmEvent::ChildGoodToGo {
                child: ChildKind::Vault
            }
        ));
    }

    #[tokio::test]
    async fn failure_is_scoped_to_test_id_only() {
        let vault = Arc::new(FakeSecretVault::default());
        vault.fail_topic("orders");
        let (fsm_tx, mut fsm_rx) = mpsc::channel(8);
        let test_id = TestId::random();

        let (handle, _join) = spawn(test_id, vault, fsm_tx);
        handle
            .send(VaultCmd::Initialize {
                directive: directive_with_topics(vec![TopicDirective {
                    topic: "orders".into(),
                    role: TopicRole::Producer,
                    client_principal: "p1".into(),
                    event_filters: vec![],
                }]),
            })
            .await
            .unwrap();

        match fsm_rx.recv().await.unwrap() {
            FsmEvent::ChildFailed { error, .. } => {
                assert!(error.to_string().contains(&test_id.to_string()));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
