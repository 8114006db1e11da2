//! Kafka producer group: one supervisor per test, one streaming
//! worker per producer topic. Workers register themselves under
//! `(testId, topic)` in the DSL registry on spawn and unregister on stop.
//!
//! Wraps `FutureProducer` with the usual `ClientConfig` tuning knobs (acks,
//! idempotence, batching, compression, timeouts), generalized here to take
//! a per-test `KafkaSecurityDirective` instead of a single global broker
//! config, and driven by a mailbox loop instead of being called directly
//! from application code.

use crate::actor::{self, SupervisionDecision};
use crate::config::KafkaConfig;
use crate::dsl_registry::DslRegistry;
use crate::error::{Error, Result};
use crate::model::{KafkaSecurityDirective, ProduceOutcome, RecordHeaders, TestId, Topic};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

/// Commands accepted by one producer worker's mailbox.
pub enum ProducerMsg {
    ProduceEvent {
        key: Vec<u8>,
        value: Vec<u8>,
        headers: RecordHeaders,
        reply: oneshot::Sender<ProduceOutcome>,
    },
    Stop,
}

pub type ProducerHandle = mpsc::Sender<ProducerMsg>;

/// Spawn the producer supervisor for one test: one worker task per producer
/// topic, each registered in the DSL registry and supervised independently.
pub fn spawn_group(
    test_id: TestId,
    topics: Vec<(Topic, KafkaSecurityDirective)>,
    kafka_config: KafkaConfig,
    registry: Arc<DslRegistry>,
    restart_max: u32,
    restart_window: Duration,
) -> Vec<tokio::task::JoinHandle<()>> {
    topics
        .into_iter()
        .map(|(topic, directive)| {
            let kafka_config = kafka_config.clone();
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let label: &'static str = "kafka-producer-worker";
                let result = actor::supervise(label, restart_max, restart_window, move || {
                    let topic = topic.clone();
                    let directive = directive.clone();
                    let kafka_config = kafka_config.clone();
                    let registry = Arc::clone(&registry);
                    async move { run_worker(test_id, topic, directive, kafka_config, registry).await }
                })
                .await;

                if let Err(err) = result {
                    error!(test_id = %test_id, error = %err, "producer worker stopped permanently");
                }
            })
        })
        .collect()
}

async fn run_worker(
    test_id: TestId,
    topic: Topic,
    directive: KafkaSecurityDirective,
    kafka_config: KafkaConfig,
    registry: Arc<DslRegistry>,
) -> Result<()> {
    let producer = build_producer(&kafka_config, &directive)?;
    let (tx, mut rx) = mpsc::channel(actor::DEFAULT_MAILBOX_CAPACITY);

    registry.register_producer(test_id, topic.clone(), tx).await;
    info!(test_id = %test_id, topic = %topic, "producer worker registered");

    let outcome = async {
        while let Some(msg) = rx.recv().await {
            match msg {
                ProducerMsg::ProduceEvent {
                    key,
                    value,
                    headers,
                    reply,
                } => {
                    let outcome = produce_one(&producer, &topic, key, value, headers, kafka_config.delivery_timeout)
                        .await;
                    let _ = reply.send(outcome);
                }
                ProducerMsg::Stop => break,
            }
        }
        Ok::<(), Error>(())
    }
    .await;

    registry.unregister_producer(test_id, &topic).await;
    debug!(test_id = %test_id, topic = %topic, "producer worker unregistered");

    outcome
}

#[instrument(skip(producer, key, value, headers), fields(topic = topic))]
async fn produce_one(
    producer: &FutureProducer,
    topic: &str,
    key: Vec<u8>,
    value: Vec<u8>,
    headers: RecordHeaders,
    delivery_timeout: Duration,
) -> ProduceOutcome {
    let mut record = FutureRecord::to(topic).key(&key).payload(&value);

    let mut rdkafka_headers = rdkafka::message::OwnedHeaders::new();
    for (name, value) in &headers {
        rdkafka_headers = rdkafka_headers.insert(rdkafka::message::Header {
            key: name,
            value: Some(value.as_slice()),
        });
    }
    record = record.headers(rdkafka_headers);

    match producer.send(record, Timeout::After(delivery_timeout)).await {
        Ok((partition, offset)) => {
            debug!(partition, offset, "message delivered");
            ProduceOutcome::Ack
        }
        Err((err, _)) => {
            warn!(error = %err, "message delivery failed");
            ProduceOutcome::Nack(err.to_string())
        }
    }
}

fn build_producer(
    kafka_config: &KafkaConfig,
    directive: &KafkaSecurityDirective,
) -> Result<FutureProducer> {
    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", &kafka_config.bootstrap_servers)
        .set("client.id", "test-probe-producer")
        .set("security.protocol", directive.security_protocol.as_librdkafka_str())
        .set("acks", &kafka_config.acks)
        .set("enable.idempotence", kafka_config.idempotent.to_string())
        .set("compression.type", &kafka_config.compression)
        .set(
            "message.timeout.ms",
            kafka_config.message_timeout.as_millis().to_string(),
        )
        .set(
            "delivery.timeout.ms",
            kafka_config.delivery_timeout.as_millis().to_string(),
        )
        .set("message.max.bytes", kafka_config.max_message_bytes.to_string())
        .set(
            "reconnect.backoff.ms",
            kafka_config.reconnect_backoff_ms.to_string(),
        )
        .set(
            "reconnect.backoff.max.ms",
            kafka_config.reconnect_backoff_max_ms.to_string(),
        );

    if !directive.jaas_config.is_empty() {
        cfg.set("sasl.jaas.config", &directive.jaas_config);
    }

    if let Some(debug) = &kafka_config.rdkafka_debug {
        cfg.set("debug", debug);
    }

    cfg.create().map_err(|e| Error::Kafka {
        message: format!("failed to create producer for topic {}: {}", directive.topic, e).into(),
        source: Some(e),
    })
}

/// Supervision decision shared with the consumer side for documentation
/// purposes only; actual dispatch happens through `actor::classify`.
pub fn decision_for(err: &Error) -> SupervisionDecision {
    actor::classify(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_for_kafka_errors_is_restart() {
        assert_eq!(
            decision_for(&Error::kafka("broker unreachable")),
            SupervisionDecision::Restart
        );
    }
}
