//! BlockStorage child: fetches feature artifacts from object
//! storage into an in-memory virtual filesystem and uploads evidence at the
//! end of a run. Wraps the `ObjectStore` service function (extracted once
//! and injected via `ServiceFunctions`) behind a single-writer mailbox so
//! the FSM never touches the backend directly.

use crate::error::{Error, Result};
use crate::model::{BlockStorageDirective, TestExecutionResult, TestId};
use crate::object_storage::{ObjectStore, VirtualFs};
use crate::test_execution::fsm::{ChildKind, FsmEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, instrument};

pub enum BlockStorageCmd {
    Initialize { bucket: Option<String> },
    LoadToBlockStorage { result: TestExecutionResult },
    Stop,
}

pub type BlockStorageHandle = mpsc::Sender<BlockStorageCmd>;

/// Spawn the BlockStorage child for one test. `fsm_tx` is the shared
/// event channel back to the owning `TestExecutionActor`; this child
/// never replies request/reply-style to `Initialize`/`LoadToBlockStorage`
/// because each fans out into two asynchronous events (`*Fetched` then
/// `ChildGoodToGo`, or `BlockStorageUploadComplete`).
pub fn spawn(
    test_id: TestId,
    default_bucket: String,
    object_store: Arc<dyn ObjectStore>,
    fsm_tx: mpsc::Sender<FsmEvent>,
) -> (BlockStorageHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(32);

    let handle = tokio::spawn(async move {
        let mut cached_directive: Option<BlockStorageDirective> = None;
        // Keeps the materialized virtual FS alive on disk for the
        // CucumberExecution child to read feature files from; dropped (and
        // cleaned up) when this child stops or is re-Initialized.
        let mut mount_guard: Option<tempfile::TempDir> = None;

        while let Some(cmd) = rx.recv().await {
            match cmd {
                BlockStorageCmd::Initialize { bucket } => {
                    let bucket = bucket.unwrap_or_else(|| default_bucket.clone());
                    match fetch(test_id, &bucket, object_store.as_ref()).await {
                        Ok((directive, guard)) => {
                            // Idempotent: a second Initialize simply replaces
                            // the cached directive.
                            cached_directive = Some(directive.clone());
                            mount_guard = Some(guard);
                            let _ = fsm_tx
                                .send(FsmEvent::BlockStorageFetched { directive })
                                .await;
                            let _ = fsm_tx
                                .send(FsmEvent::ChildGoodToGo {
                                    child: ChildKind::BlockStorage,
                                })
                                .await;
                        }
                        Err(error) => {
                            error!(test_id = %test_id, %error, "block storage fetch failed");
                            let _ = fsm_tx
                                .send(FsmEvent::ChildFailed {
                                    child: ChildKind::BlockStorage,
                                    error,
                                })
                                .await;
                        }
                    }
                }
                BlockStorageCmd::LoadToBlockStorage { result } => {
                    let Some(directive) = cached_directive.clone() else {
                        // Open question resolved in DESIGN.md: a
                        // pre-Initialize LoadToBlockStorage is a programmer
                        // error surfaced as a recoverable `Validation`
                        // failure to the parent, not a fatal one.
                        let _ = fsm_tx
                            .send(FsmEvent::ChildFailed {
                                child: ChildKind::BlockStorage,
                                error: Error::validation(
                                    "LoadToBlockStorage received before Initialize",
                                ),
                            })
                            .await;
                        continue;
                    };

                    match upload(test_id, &directive, &result, object_store.as_ref()).await {
                        Ok(()) => {
                            let _ = fsm_tx.send(FsmEvent::BlockStorageUploadComplete).await;
                        }
                        Err(error) => {
                            error!(test_id = %test_id, %error, "evidence upload failed");
                            let _ = fsm_tx
                                .send(FsmEvent::ChildFailed {
                                    child: ChildKind::BlockStorage,
                                    error,
                                })
                                .await;
                        }
                    }
                }
                BlockStorageCmd::Stop => break,
            }
        }

        info!(test_id = %test_id, "block storage child stopped");
    });

    (tx, handle)
}

#[instrument(skip(object_store), fields(test_id = %test_id, bucket = bucket))]
async fn fetch(
    test_id: TestId,
    bucket: &str,
    object_store: &dyn ObjectStore,
) -> Result<(BlockStorageDirective, tempfile::TempDir)> {
    let artifacts = object_store.fetch(test_id, bucket).await?;

    let mount_dir = tempfile::Builder::new()
        .prefix(&format!("test-probe-{}-", test_id))
        .tempdir()
        .map_err(|e| Error::ObjectStorage {
            message: format!("failed to materialize virtual FS on disk: {e}").into(),
            source: Some(Box::new(e)),
        })?;

    for path in artifacts.fs.paths_under("") {
        let full_path = mount_dir.path().join(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::ObjectStorage {
                message: format!("failed to create {}: {e}", parent.display()).into(),
                source: Some(Box::new(e)),
            })?;
        }
        std::fs::write(&full_path, artifacts.fs.get(path).unwrap_or(&[])).map_err(|e| {
            Error::ObjectStorage {
                message: format!("failed to write {}: {e}", full_path.display()).into(),
                source: Some(Box::new(e)),
            }
        })?;
    }

    let mount_path = mount_dir.path().to_string_lossy().to_string();

    Ok((
        BlockStorageDirective {
            bucket: bucket.to_string(),
            object_path: format!("tests/{}", test_id),
            mount_path: mount_path.clone(),
            evidence_path: format!("{}/evidence", mount_path),
            topics: artifacts.topics,
            step_definition_packages: artifacts.step_definition_packages,
            tag_filters: artifacts.tag_filters,
        },
        mount_dir,
    ))
}

#[instrument(skip(object_store, result), fields(test_id = %test_id))]
async fn upload(
    test_id: TestId,
    directive: &BlockStorageDirective,
    result: &TestExecutionResult,
    object_store: &dyn ObjectStore,
) -> Result<()> {
    let mut evidence = VirtualFs::default();
    let metadata = serde_json::to_vec_pretty(result).map_err(Error::Json)?;
    evidence.insert("metadata.json", metadata);

    object_store.load(test_id, &directive.bucket, &evidence).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_storage::fake::FakeObjectStore;
    use crate::object_storage::{FetchedArtifacts, VirtualFs as Fs};
    use crate::test_execution::fsm::FsmEvent;

    #[tokio::test]
    async fn initialize_without_artifacts_reports_child_failed() {
        let store = Arc::new(FakeObjectStore::default());
        let (fsm_tx, mut fsm_rx) = mpsc::channel(8);
        let test_id = TestId::random();

        let (handle, _join) = spawn(test_id, "bucket".into(), store, fsm_tx);
        handle
            .send(BlockStorageCmd::Initialize { bucket: None })
            .await
            .unwrap();

        let event = fsm_rx.recv().await.unwrap();
        assert!(matches!(event, FsmEvent::ChildFailed { .. }));
    }

    #[tokio::test]
    async fn initialize_then_good_to_go_on_success() {
        let store = FakeObjectStore::default();
        let test_id = TestId::random();
        let mut fs = Fs::default();
        fs.insert("feature-files/one.feature", b"Feature: x".to_vec());
        store.seed(
            test_id,
            FetchedArtifacts {
                fs,
                step_definition_packages: vec![],
                tag_filters: vec!["not @Ignore".into()],
                topics: vec![],
            },
        );

        let (fsm_tx, mut fsm_rx) = mpsc::channel(8);
        let (handle, _join) = spawn(test_id, "bucket".into(), Arc::new(store), fsm_tx);
        handle
            .send(BlockStorageCmd::Initialize { bucket: None })
            .await
            .unwrap();

        let first = fsm_rx.recv().await.unwrap();
        assert!(matches!(first, FsmEvent::BlockStorageFetched { .. }));
        let second = fsm_rx.recv().await.unwrap();
        assert!(matches!(
            second,
            FsmEvent::ChildGoodToGo {
                child: ChildKind::BlockStorage
            }
        ));
    }

    #[tokio::test]
    async fn load_before_initialize_is_a_recoverable_validation_failure() {
        let store = Arc::new(FakeObjectStore::default());
        let (fsm_tx, mut fsm_rx) = mpsc::channel(8);
        let test_id = TestId::random();

        let (handle, _join) = spawn(test_id, "bucket".into(), store, fsm_tx);
        handle
            .send(BlockStorageCmd::LoadToBlockStorage {
                result: TestExecutionResult {
                    test_id,
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let event = fsm_rx.recv().await.unwrap();
        match event {
            FsmEvent::ChildFailed { error, .. } => assert!(error.is_resumable()),
            other => panic!("expected ChildFailed, got {other:?}"),
        }
    }
}
