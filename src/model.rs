//! Core data model shared by every component in the per-test execution
//! subsystem: identifiers, directives, wire envelopes, and outcomes.
//!
//! Types that cross a process boundary (REST bodies, object-storage
//! directive files, evidence metadata) derive `Serialize`/`Deserialize`;
//! types that are purely internal plumbing do not.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identifies one test execution end-to-end. Minted by the ingress at
/// submission time; unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(pub Uuid);

impl TestId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-event identifier threaded through a produced record's key into the
/// system under test and back on a consumed record. Derived deterministically
/// from a user-visible `eventTestId` so produce/consume can be paired.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Stable hash of a user-visible `eventTestId`: the same `eventTestId`
    /// always yields the same correlation id within a process.
    pub fn derive(event_test_id: &str) -> Self {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        event_test_id.hash(&mut hasher);
        Self(format!("{:016x}", hasher.finish()))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Topic name, used as a registry/map key alongside `TestId`.
pub type Topic = String;

/// Role a test plays on a given Kafka topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicRole {
    Producer,
    Consumer,
}

/// Predicate applied on the consumer side to suppress records the test is
/// not interested in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload_version: String,
}

impl EventFilter {
    pub fn matches(&self, event_type: &str, payload_version: &str) -> bool {
        self.event_type == event_type && self.payload_version == payload_version
    }
}

/// Declarative description of one topic this test will interact with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicDirective {
    pub topic: Topic,
    pub role: TopicRole,
    pub client_principal: String,
    #[serde(default)]
    pub event_filters: Vec<EventFilter>,
}

/// Supported payload encodings for Kafka record values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadFormat {
    JsonSchema,
    Avro,
    Protobuf,
}

/// {bucket, object path, in-memory-FS mount path, evidence output path,
/// topic directives, glue package names, tag filters} produced once
/// BlockStorage has materialized the feature artifacts for a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStorageDirective {
    pub bucket: String,
    pub object_path: String,
    pub mount_path: String,
    pub evidence_path: String,
    pub topics: Vec<TopicDirective>,
    pub step_definition_packages: Vec<String>,
    pub tag_filters: Vec<String>,
}

impl BlockStorageDirective {
    pub fn producer_topics(&self) -> impl Iterator<Item = &TopicDirective> {
        self.topics.iter().filter(|t| t.role == TopicRole::Producer)
    }

    pub fn consumer_topics(&self) -> impl Iterator<Item = &TopicDirective> {
        self.topics.iter().filter(|t| t.role == TopicRole::Consumer)
    }
}

/// Security protocol family for a Kafka client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityProtocol {
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_librdkafka_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }
}

/// Kafka security directive for one topic. **Confidential**: never appears
/// verbatim in a log record or error message. The manual `Debug` impl
/// below redacts every field but the topic name and protocol.
#[derive(Clone, Serialize, Deserialize)]
pub struct KafkaSecurityDirective {
    pub topic: Topic,
    pub role: TopicRole,
    pub security_protocol: SecurityProtocol,
    pub jaas_config: String,
    pub keystore: Option<Vec<u8>>,
    pub truststore: Option<Vec<u8>>,
}

impl fmt::Debug for KafkaSecurityDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSecurityDirective")
            .field("topic", &self.topic)
            .field("role", &self.role)
            .field("security_protocol", &self.security_protocol)
            .field("jaas_config", &"<redacted>")
            .field("keystore", &self.keystore.as_ref().map(|_| "<redacted>"))
            .field("truststore", &self.truststore.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Standard CloudEvents-shaped envelope used as the Kafka record key for
/// every produced event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: String,
    pub subject: String,
    pub datacontenttype: String,
    pub correlationid: String,
    pub payloadversion: String,
    #[serde(rename = "timeEpochMicroSource")]
    pub time_epoch_micro_source: i64,
}

impl CloudEvent {
    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId(self.correlationid.clone())
    }
}

/// A record observed on the consumer side, stored verbatim. Deserialization
/// is lazy, performed only when a step requests it through the DSL registry.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

/// Outcome of a single produce attempt.
#[derive(Debug, Clone)]
pub enum ProduceOutcome {
    Ack,
    Nack(String),
}

/// Outcome of a single consumer-side fetch-by-correlation-id.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Ack {
        key: Vec<u8>,
        value: Vec<u8>,
        headers: Vec<(String, Vec<u8>)>,
    },
    Nack {
        status: u16,
    },
}

/// Aggregate per-scenario / per-step counts plus pass/fail for one test run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestExecutionResult {
    pub test_id: TestId,
    pub passed: bool,
    pub scenario_count: usize,
    pub scenarios_passed: usize,
    pub scenarios_failed: usize,
    pub scenarios_skipped: usize,
    pub step_count: usize,
    pub steps_passed: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub steps_undefined: usize,
    pub duration: Duration,
    pub error_message: Option<String>,
    pub failed_scenarios: Vec<String>,
}

impl Serialize for TestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Uuid::parse_str(&s).map(TestId).map_err(serde::de::Error::custom)
    }
}

impl Default for TestId {
    fn default() -> Self {
        Self(Uuid::nil())
    }
}

/// Current high-level status of a test, reported by the Queue/REST ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Queued,
    AwaitingSetup,
    AwaitingReadiness,
    Running,
    Reporting,
    Success,
    Failure,
    Cancelled,
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueStatus {
    pub depth: usize,
    pub in_flight: usize,
}

/// Headers attached to a produced or consumed record.
pub type RecordHeaders = HashMap<String, Vec<u8>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_is_deterministic() {
        let a = CorrelationId::derive("evt-1");
        let b = CorrelationId::derive("evt-1");
        let c = CorrelationId::derive("evt-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn security_directive_debug_redacts_secrets() {
        let directive = KafkaSecurityDirective {
            topic: "orders".into(),
            role: TopicRole::Producer,
            security_protocol: SecurityProtocol::SaslSsl,
            jaas_config: "username=\"admin\" password=\"hunter2\"".into(),
            keystore: Some(vec![1, 2, 3]),
            truststore: None,
        };
        let rendered = format!("{:?}", directive);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("admin"));
    }

    #[test]
    fn directive_splits_producer_and_consumer_topics() {
        let directive = BlockStorageDirective {
            bucket: "b".into(),
            object_path: "p".into(),
            mount_path: "/m".into(),
            evidence_path: "/e".into(),
            topics: vec![
                TopicDirective {
                    topic: "orders".into(),
                    role: TopicRole::Producer,
                    client_principal: "p1".into(),
                    event_filters: vec![],
                },
                TopicDirective {
                    topic: "orders".into(),
                    role: TopicRole::Consumer,
                    client_principal: "p1".into(),
                    event_filters: vec![],
                },
            ],
            step_definition_packages: vec![],
            tag_filters: vec![],
        };
        assert_eq!(directive.producer_topics().count(), 1);
        assert_eq!(directive.consumer_topics().count(), 1);
    }
}
