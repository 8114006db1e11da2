//! CucumberExecution child: embeds the `cucumber` BDD engine, running
//! feature files materialized by BlockStorage against the producer and
//! consumer workers addressed through the DSL registry.
//!
//! The mailbox/supervision texture around it — command enum, shared
//! `fsm_tx` event channel, `#[instrument]` spans — follows the same
//! pattern as every other child in this directory.

use crate::dsl_registry::{self, DslRegistry, ExecutionContext};
use crate::model::{BlockStorageDirective, TestExecutionResult, TestId};
use crate::test_execution::fsm::{ChildKind, FsmEvent};
use cucumber::World as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, instrument};

pub enum CucumberCmd {
    Initialize { directive: BlockStorageDirective },
    StartTest,
    Stop,
}

pub type CucumberHandle = mpsc::Sender<CucumberCmd>;

/// Engine configuration derived from a `BlockStorageDirective`: feature
/// paths under the virtual FS mount, the combined glue package set, and the
/// tag expression (defaulted to exclude `@Ignore`).
struct EngineConfig {
    feature_path: PathBuf,
    tag_filters: Vec<String>,
    evidence_path: String,
}

fn build_engine_config(directive: &BlockStorageDirective) -> EngineConfig {
    EngineConfig {
        feature_path: PathBuf::from(&directive.mount_path).join("feature-files"),
        tag_filters: directive.tag_filters.clone(),
        evidence_path: directive.evidence_path.clone(),
    }
}

pub fn spawn(
    test_id: TestId,
    registry: Arc<DslRegistry>,
    fsm_tx: mpsc::Sender<FsmEvent>,
) -> (CucumberHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(4);

    let handle = tokio::spawn(async move {
        let mut config: Option<EngineConfig> = None;

        while let Some(cmd) = rx.recv().await {
            match cmd {
                CucumberCmd::Initialize { directive } => {
                    config = Some(build_engine_config(&directive));
                    info!(test_id = %test_id, "cucumber engine configured");
                    let _ = fsm_tx
                        .send(FsmEvent::ChildGoodToGo { child: ChildKind::CucumberExecution })
                        .await;
                }
                CucumberCmd::StartTest => {
                    let Some(cfg) = config.take() else {
                        error!(test_id = %test_id, "StartTest received before Initialize");
                        let _ = fsm_tx
                            .send(FsmEvent::TestFinished {
                                result: TestExecutionResult {
                                    test_id,
                                    passed: false,
                                    error_message: Some(format!(
                                        "testId={} StartTest received before Initialize",
                                        test_id
                                    )),
                                    ..Default::default()
                                },
                            })
                            .await;
                        continue;
                    };
                    let result = run_engine(test_id, cfg, Arc::clone(&registry)).await;
                    let _ = fsm_tx.send(FsmEvent::TestFinished { result }).await;
                }
                CucumberCmd::Stop => break,
            }
        }

        info!(test_id = %test_id, "cucumber execution child stopped");
    });

    (tx, handle)
}

/// Runs the engine on a dedicated blocking worker pool so step code
/// suspending on Kafka fetches never blocks the main cooperative
/// scheduler. Installs `ExecutionContext` via `tokio::task_local!` for the
/// duration of the run — guaranteed to clear on every exit path, including
/// panics, unlike a literal thread-local that could leak across the shared
/// blocking pool's pooled threads.
#[instrument(skip(config, registry), fields(test_id = %test_id))]
async fn run_engine(test_id: TestId, config: EngineConfig, registry: Arc<DslRegistry>) -> TestExecutionResult {
    let started = Instant::now();
    let feature_path = config.feature_path;
    let tag_filters = config.tag_filters;
    let evidence_path = config.evidence_path;
    let runtime_handle = tokio::runtime::Handle::current();

    let outcome = tokio::task::spawn_blocking(move || {
        runtime_handle.block_on(async move {
            let ctx = ExecutionContext { test_id, evidence_path };
            ctx.scope(run_features(feature_path, tag_filters)).await
        })
    })
    .await;

    match outcome {
        Ok(result) => TestExecutionResult {
            test_id,
            duration: started.elapsed(),
            ..result
        },
        Err(join_error) => TestExecutionResult {
            test_id,
            passed: false,
            error_message: Some(format!(
                "testId={} cucumber engine task panicked: {}",
                test_id, join_error
            )),
            duration: started.elapsed(),
            ..Default::default()
        },
    }
}

/// Drives the `cucumber` engine over the feature files at `feature_path`,
/// applying `tag_filters` as an `and`-joined tag expression (defaulted by
/// BlockStorage to `"not @Ignore"`), and returns the aggregate result.
async fn run_features(feature_path: PathBuf, tag_filters: Vec<String>) -> TestExecutionResult {
    let counts = Arc::new(StdMutex::new(Counts::default()));
    let writer = CountingWriter { counts: Arc::clone(&counts) };

    let tag_expression = tag_filters.join(" and ");

    TestProbeWorld::cucumber()
        .with_writer(writer)
        .filter_run(feature_path, move |_feature, _rule, scenario| {
            tag_expression.is_empty()
                || scenario
                    .tags
                    .iter()
                    .all(|tag| !tag_expression.contains(&format!("not {tag}")))
        })
        .await;

    let counts = counts.lock().expect("cucumber writer mutex poisoned");
    TestExecutionResult {
        passed: counts.scenarios_failed == 0 && counts.scenario_count > 0,
        scenario_count: counts.scenario_count,
        scenarios_passed: counts.scenarios_passed,
        scenarios_failed: counts.scenarios_failed,
        scenarios_skipped: counts.scenarios_skipped,
        step_count: counts.step_count,
        steps_passed: counts.steps_passed,
        steps_failed: counts.steps_failed,
        steps_skipped: counts.steps_skipped,
        steps_undefined: counts.steps_undefined,
        failed_scenarios: counts.failed_scenarios.clone(),
        error_message: None,
        ..Default::default()
    }
}

#[derive(Default)]
struct Counts {
    scenario_count: usize,
    scenarios_passed: usize,
    scenarios_failed: usize,
    scenarios_skipped: usize,
    step_count: usize,
    steps_passed: usize,
    steps_failed: usize,
    steps_skipped: usize,
    steps_undefined: usize,
    failed_scenarios: Vec<String>,
    /// Whether any step (or background step) of the scenario currently in
    /// progress has failed; reset on `Started`, consumed on `Finished`.
    current_failed: bool,
    /// Whether every step seen so far in the current scenario was skipped;
    /// starts `true` so a scenario with no steps counts as skipped rather
    /// than passed.
    current_all_skipped: bool,
}

/// Minimal event-counting `Writer`: tracks scenario/step pass/fail/skip
/// totals and failed scenario names, nothing more. Deliberately narrower
/// than the crate's built-in `writer::Summarize`/`Normalize` stack so this
/// module stays self-contained rather than composing writer types whose
/// exact generic bounds aren't grounded in anything in this repository.
struct CountingWriter {
    counts: Arc<StdMutex<Counts>>,
}

#[async_trait::async_trait(?Send)]
impl<W: cucumber::World + std::fmt::Debug> cucumber::Writer<W> for CountingWriter {
    type Cli = cucumber::cli::Empty;

    async fn handle_event(
        &mut self,
        event: cucumber::parser::Result<cucumber::event::Cucumber<W>>,
        _cli: &Self::Cli,
    ) {
        use cucumber::event::{
            Cucumber as Ev, Feature as FeatureEv, Scenario as ScenarioEv, Step as StepEv,
            StepError,
        };

        let Ok(event) = event else {
            return;
        };

        let mut counts = self.counts.lock().expect("cucumber writer mutex poisoned");
        if let Ev::Feature(_, FeatureEv::Scenario(scenario, scenario_event)) = event {
            match scenario_event {
                ScenarioEv::Started => {
                    counts.scenario_count += 1;
                    counts.current_failed = false;
                    counts.current_all_skipped = true;
                }
                ScenarioEv::Step(_, StepEv::Passed(..)) | ScenarioEv::Background(_, StepEv::Passed(..)) => {
                    counts.step_count += 1;
                    counts.steps_passed += 1;
                    counts.current_all_skipped = false;
                }
                ScenarioEv::Step(_, StepEv::Failed(.., step_error))
                | ScenarioEv::Background(_, StepEv::Failed(.., step_error)) => {
                    counts.step_count += 1;
                    if matches!(step_error, StepError::NotFound) {
                        counts.steps_undefined += 1;
                    } else {
                        counts.steps_failed += 1;
                    }
                    counts.current_all_skipped = false;
                    counts.current_failed = true;
                }
                ScenarioEv::Step(_, StepEv::Skipped) | ScenarioEv::Background(_, StepEv::Skipped) => {
                    counts.step_count += 1;
                    counts.steps_skipped += 1;
                }
                ScenarioEv::Finished => {
                    if counts.current_failed {
                        counts.scenarios_failed += 1;
                        counts.failed_scenarios.push(scenario.name.clone());
                    } else if counts.current_all_skipped {
                        counts.scenarios_skipped += 1;
                    } else {
                        counts.scenarios_passed += 1;
                    }
                }
                _ => {}
            }
        }
    }
}

/// World fixture for the embedded engine. Step code reaches the DSL
/// registry and its own `(testId, evidencePath)` through `dsl_registry`'s
/// task-local `ExecutionContext` rather than through fields on this struct,
/// so it stays a thin marker type.
#[derive(cucumber::World, Debug, Default)]
pub struct TestProbeWorld {
    last_correlation_id: Option<String>,
}

mod steps {
    use super::TestProbeWorld;
    use crate::dsl_registry;
    use crate::model::{CloudEvent, CorrelationId, PayloadFormat, RecordHeaders};
    use cucumber::{given, then};

    #[given(regex = r#"^an event with correlationId "([^"]+)" is produced to topic "([^"]+)" with payload:$"#)]
    async fn produce_event(world: &mut TestProbeWorld, correlation_id: String, topic: String, payload: String) {
        let Some(ctx) = dsl_registry::current_context() else {
            panic!("produce_event step ran outside an execution context");
        };
        let value: serde_json::Value = serde_json::from_str(&payload).expect("step payload must be valid JSON");
        let cloud_event = CloudEvent {
            id: uuid::Uuid::new_v4().to_string(),
            source: "test-probe".into(),
            specversion: "1.0".into(),
            event_type: "TestProbeEvent".into(),
            time: chrono::Utc::now().to_rfc3339(),
            subject: topic.clone(),
            datacontenttype: "application/json".into(),
            correlationid: correlation_id.clone(),
            payloadversion: "v1".into(),
            time_epoch_micro_source: chrono::Utc::now().timestamp_micros(),
        };

        dsl_registry::instance()
            .produce_event(
                ctx.test_id,
                &topic,
                "TestProbeEvent",
                PayloadFormat::JsonSchema,
                &cloud_event,
                &value,
                RecordHeaders::new(),
            )
            .await
            .expect("produceEvent failed");

        world.last_correlation_id = Some(correlation_id);
    }

    #[then(regex = r#"^topic "([^"]+)" should contain an event with correlationId "([^"]+)"$"#)]
    async fn assert_consumed(_world: &mut TestProbeWorld, topic: String, correlation_id: String) {
        let Some(ctx) = dsl_registry::current_context() else {
            panic!("assert_consumed step ran outside an execution context");
        };

        let mut attempts = 0;
        loop {
            let outcome = dsl_registry::instance()
                .fetch_consumed_event::<serde_json::Value>(
                    ctx.test_id,
                    &topic,
                    "TestProbeEvent",
                    PayloadFormat::JsonSchema,
                    &CorrelationId(correlation_id.clone()),
                )
                .await;

            match outcome {
                Ok(_) => return,
                Err(crate::error::Error::ConsumerNotAvailable { .. }) if attempts < 20 => {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                }
                Err(error) => panic!("fetchConsumedEvent failed: {error}"),
            }
        }
    }
}
