//! TestExecution FSM: the per-test orchestrator. Spawns a fixed
//! set of children (BlockStorage, Vault, the Kafka producer/consumer
//! groups, CucumberExecution), drives the setup handshake, waits on the
//! barrier that gates scenario execution, then reports and tears down.
//!
//! States: `Created -> AwaitingSetup -> AwaitingReadiness -> Running ->
//! Reporting -> {Success, Failure, Cancelled}`. The FSM is single-writer
//! over its children set; every external signal (from the Queue or from a
//! child) arrives as a message on one of two mailboxes: `cmd_rx` for
//! Queue-issued commands, `fsm_rx` for child-issued events. Both ends of
//! `fsm_rx`'s sender are cloned out to every child at spawn time, following
//! the shared-event-channel pattern already used in `block_storage.rs` and
//! `vault.rs` (multi-message replies don't fit the request/reply `call`
//! helper in `actor.rs`, which expects exactly one reply per request).

use crate::actor;
use crate::codec::SchemaCodec;
use crate::config::KafkaConfig;
use crate::dsl_registry::DslRegistry;
use crate::error::Error;
use crate::model::{
    BlockStorageDirective, KafkaSecurityDirective, TestExecutionResult, TestId, TestStatus,
    TopicRole,
};
use crate::object_storage::ObjectStore;
use crate::test_execution::block_storage::{self, BlockStorageCmd};
use crate::test_execution::cucumber_execution::{self, CucumberCmd};
use crate::test_execution::kafka_consumer;
use crate::test_execution::kafka_producer;
use crate::test_execution::vault::{self, VaultCmd};
use crate::vault_backend::SecretVault;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, instrument, warn};

/// Identifies one of the FSM's five fixed children in an `FsmEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildKind {
    BlockStorage,
    Vault,
    KafkaConsumerGroup,
    KafkaProducerGroup,
    CucumberExecution,
}

/// Events posted onto the FSM's shared mailbox by its children.
#[derive(Debug)]
pub enum FsmEvent {
    BlockStorageFetched { directive: BlockStorageDirective },
    SecurityFetched { directives: Vec<KafkaSecurityDirective> },
    ChildGoodToGo { child: ChildKind },
    ChildFailed { child: ChildKind, error: Error },
    TestFinished { result: TestExecutionResult },
    BlockStorageUploadComplete,
}

/// Commands the Queue issues to one FSM.
pub enum FsmCmd {
    Start,
    Cancel,
}

pub type FsmHandle = mpsc::Sender<FsmCmd>;

/// What the FSM reports back to the Queue when it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct TerminalOutcome {
    pub status: TestStatus,
    pub result: Option<TestExecutionResult>,
}

/// Dependencies injected into one `TestExecutionActor`, bundling the
/// `ServiceFunctions` bundle with the per-test config it needs.
pub struct FsmDeps {
    pub test_id: TestId,
    pub default_bucket: String,
    pub object_store: Arc<dyn ObjectStore>,
    pub secret_vault: Arc<dyn SecretVault>,
    pub kafka_config: KafkaConfig,
    pub codec: Arc<SchemaCodec>,
    pub registry: Arc<DslRegistry>,
    pub restart_max: u32,
    pub restart_window: Duration,
}

const EXPECTED_CHILDREN: [ChildKind; 5] = [
    ChildKind::BlockStorage,
    ChildKind::Vault,
    ChildKind::KafkaConsumerGroup,
    ChildKind::KafkaProducerGroup,
    ChildKind::CucumberExecution,
];

/// Spawn one `TestExecutionActor`. Returns the command handle the Queue
/// uses to `Start`/`Cancel` it, a termination watch closed the instant the
/// FSM task exits (any reason), and the task's own `JoinHandle`.
pub fn spawn(
    deps: FsmDeps,
    done_tx: oneshot::Sender<TerminalOutcome>,
) -> (FsmHandle, watch::Receiver<()>, tokio::task::JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (term_tx, term_rx) = actor::termination_signal();

    let join = tokio::spawn(async move {
        run(deps, cmd_rx, done_tx).await;
        drop(term_tx);
    });

    (cmd_tx, term_rx, join)
}

struct Children {
    block_storage: mpsc::Sender<BlockStorageCmd>,
    vault: mpsc::Sender<VaultCmd>,
    cucumber: mpsc::Sender<CucumberCmd>,
    block_storage_join: tokio::task::JoinHandle<()>,
    vault_join: tokio::task::JoinHandle<()>,
    cucumber_join: tokio::task::JoinHandle<()>,
    producer_joins: Vec<tokio::task::JoinHandle<()>>,
    consumer_joins: Vec<tokio::task::JoinHandle<()>>,
}

#[instrument(skip(deps, cmd_rx, done_tx), fields(test_id = %deps.test_id))]
async fn run(
    deps: FsmDeps,
    mut cmd_rx: mpsc::Receiver<FsmCmd>,
    done_tx: oneshot::Sender<TerminalOutcome>,
) {
    let test_id = deps.test_id;
    let (fsm_tx, mut fsm_rx) = mpsc::channel::<FsmEvent>(64);

    // Setup (Created -> AwaitingSetup): spawns are unconditional. Failure to
    // spawn any child would be fatal for the test; nothing here can
    // actually fail since `tokio::spawn` itself cannot, so this step cannot
    // fail in practice — kept as a distinct phase for symmetry with the
    // states that follow.
    let (bs_tx, bs_join) = block_storage::spawn(
        test_id,
        deps.default_bucket.clone(),
        Arc::clone(&deps.object_store),
        fsm_tx.clone(),
    );
    let (vault_tx, vault_join) = vault::spawn(test_id, Arc::clone(&deps.secret_vault), fsm_tx.clone());
    let (cuke_tx, cuke_join) = cucumber_execution::spawn(test_id, Arc::clone(&deps.registry), fsm_tx.clone());

    let mut children = Children {
        block_storage: bs_tx.clone(),
        vault: vault_tx.clone(),
        cucumber: cuke_tx.clone(),
        block_storage_join: bs_join,
        vault_join,
        cucumber_join: cuke_join,
        producer_joins: Vec::new(),
        consumer_joins: Vec::new(),
    };

    let mut state = TestStatus::AwaitingSetup;
    let mut good_to_go: HashSet<ChildKind> = HashSet::new();
    let mut directive: Option<BlockStorageDirective> = None;
    let mut result: Option<TestExecutionResult> = None;
    // Running only begins once the Queue has sent `Start` (once admitted
    // and resources are fetched, hand control to the FSM) and the readiness
    // barrier below has collected every child's `ChildGoodToGo`. Either can
    // arrive first; the transition fires on whichever completes last.
    let mut start_requested = false;

    if bs_tx.send(BlockStorageCmd::Initialize { bucket: None }).await.is_err() {
        finish(test_id, TestStatus::Failure, None, children, done_tx).await;
        return;
    }

    'fsm: loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(FsmCmd::Cancel) | None => {
                        info!(test_id = %test_id, "cancellation requested, stopping children");
                        state = TestStatus::Cancelled;
                        break 'fsm;
                    }
                    Some(FsmCmd::Start) => {
                        start_requested = true;
                        if good_to_go.len() == EXPECTED_CHILDREN.len() && state == TestStatus::AwaitingReadiness {
                            state = TestStatus::Running;
                            info!(test_id = %test_id, "queue start received after barrier, starting scenario execution");
                            let _ = cuke_tx.send(CucumberCmd::StartTest).await;
                        }
                    }
                }
            }
            event = fsm_rx.recv() => {
                match event {
                    None => {
                        error!(test_id = %test_id, "fsm event channel closed unexpectedly");
                        state = TestStatus::Failure;
                        break 'fsm;
                    }
                    Some(FsmEvent::BlockStorageFetched { directive: d }) => {
                        state = TestStatus::AwaitingReadiness;
                        // Vault and CucumberExecution both only need the
                        // directive, so their Initialize calls fan out as
                        // soon as it is cached rather than waiting on each
                        // other — there is no dependency between them.
                        let _ = vault_tx.send(VaultCmd::Initialize { directive: d.clone() }).await;
                        let _ = cuke_tx.send(CucumberCmd::Initialize { directive: d.clone() }).await;
                        directive = Some(d);
                    }
                    Some(FsmEvent::SecurityFetched { directives }) => {
                        let Some(d) = directive.clone() else {
                            error!(test_id = %test_id, "security directives arrived before block storage directive");
                            state = TestStatus::Failure;
                            break 'fsm;
                        };
                        spawn_kafka_groups(test_id, &deps, &d, directives, &fsm_tx, &mut children).await;
                    }
                    Some(FsmEvent::ChildGoodToGo { child }) => {
                        good_to_go.insert(child);
                        if good_to_go.len() == EXPECTED_CHILDREN.len() && state == TestStatus::AwaitingReadiness && start_requested {
                            state = TestStatus::Running;
                            info!(test_id = %test_id, "all children ready, starting scenario execution");
                            let _ = cuke_tx.send(CucumberCmd::StartTest).await;
                        }
                    }
                    Some(FsmEvent::ChildFailed { child, error }) => {
                        // Any child failure before the barrier, or any
                        // unexpected `ChildGoodToGo` past it, is fatal for
                        // the test.
                        error!(test_id = %test_id, ?child, %error, "child reported failure, failing test");
                        result = Some(TestExecutionResult {
                            test_id,
                            passed: false,
                            error_message: Some(format!("testId={} child {:?} failed: {}", test_id, child, error)),
                            ..Default::default()
                        });
                        state = TestStatus::Failure;
                        break 'fsm;
                    }
                    Some(FsmEvent::TestFinished { result: r }) => {
                        state = TestStatus::Reporting;
                        result = Some(r.clone());
                        let _ = children
                            .block_storage
                            .send(BlockStorageCmd::LoadToBlockStorage { result: r })
                            .await;
                    }
                    Some(FsmEvent::BlockStorageUploadComplete) => {
                        state = match &result {
                            Some(r) if r.passed => TestStatus::Success,
                            Some(_) => TestStatus::Failure,
                            None => TestStatus::Failure,
                        };
                        break 'fsm;
                    }
                }
            }
        }
    }

    finish(test_id, state, result, children, done_tx).await;
}

/// Pairs the cached `BlockStorageDirective`'s topics (by position) with the
/// just-fetched security directives, then spawns both Kafka groups. Each
/// group's workers register themselves in the DSL registry as they spawn;
/// unlike `BlockStorage`/`Vault`/`CucumberExecution`, the group itself has
/// no mailbox of its own, so `spawn_group` returning is treated as the
/// group's `ChildGoodToGo` — a simplification against the per-worker handshake,
/// which describes a reply only once every worker has registered. Recorded
/// as an accepted simplification in the design notes: registration races
/// with the barrier are bounded by the same `call_timeout` every DSL lookup
/// already tolerates.
async fn spawn_kafka_groups(
    test_id: TestId,
    deps: &FsmDeps,
    directive: &BlockStorageDirective,
    security: Vec<KafkaSecurityDirective>,
    fsm_tx: &mpsc::Sender<FsmEvent>,
    children: &mut Children,
) {
    let mut producer_topics = Vec::new();
    let mut consumer_topics = Vec::new();

    for (topic_directive, security_directive) in directive.topics.iter().zip(security.into_iter()) {
        match topic_directive.role {
            TopicRole::Producer => producer_topics.push((topic_directive.topic.clone(), security_directive)),
            TopicRole::Consumer => consumer_topics.push((
                topic_directive.topic.clone(),
                topic_directive.event_filters.clone(),
                security_directive,
            )),
        }
    }

    children.producer_joins = kafka_producer::spawn_group(
        test_id,
        producer_topics,
        deps.kafka_config.clone(),
        Arc::clone(&deps.registry),
        deps.restart_max,
        deps.restart_window,
    );
    children.consumer_joins = kafka_consumer::spawn_group(
        test_id,
        consumer_topics,
        deps.kafka_config.clone(),
        Arc::clone(&deps.codec),
        Arc::clone(&deps.registry),
        deps.restart_max,
        deps.restart_window,
    );

    let _ = fsm_tx
        .send(FsmEvent::ChildGoodToGo { child: ChildKind::KafkaProducerGroup })
        .await;
    let _ = fsm_tx
        .send(FsmEvent::ChildGoodToGo { child: ChildKind::KafkaConsumerGroup })
        .await;
}

/// Stop every child, await their termination up to the configured
/// shutdown grace period, and report the terminal outcome to the Queue.
/// Cancellation and the happy path share this teardown: both send `Stop` to
/// every child and release the Queue's slot only once they are done.
async fn finish(
    test_id: TestId,
    state: TestStatus,
    result: Option<TestExecutionResult>,
    children: Children,
    done_tx: oneshot::Sender<TerminalOutcome>,
) {
    let _ = children.block_storage.send(BlockStorageCmd::Stop).await;
    let _ = children.vault.send(VaultCmd::Stop).await;
    let _ = children.cucumber.send(CucumberCmd::Stop).await;

    // Kafka group workers only accept `ProducerMsg`/`ConsumerMsg::Stop`
    // through the DSL registry's handles, which are unregistered on their
    // own exit path; aborting the join handles is sufficient here since a
    // cancelled test does not promise in-flight Kafka I/O drains to
    // completion (open question, recorded in DESIGN.md).
    for join in &children.producer_joins {
        join.abort();
    }
    for join in &children.consumer_joins {
        join.abort();
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), children.block_storage_join).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), children.vault_join).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), children.cucumber_join).await;

    info!(test_id = %test_id, ?state, "test execution reached terminal state");
    let _ = done_tx.send(TerminalOutcome { status: state, result });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_children_has_all_five_kinds() {
        let set: HashSet<ChildKind> = EXPECTED_CHILDREN.iter().copied().collect();
        assert_eq!(set.len(), 5);
    }
}
