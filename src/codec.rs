//! Schema codec cache: wraps a schema-registry client and
//! serializes/deserializes Kafka record keys and values under the
//! `topic-RecordName` subject strategy for JSON-Schema, Avro, and Protobuf
//! payloads.
//!
//! The registry client is a small hand-rolled `reqwest` wrapper around the
//! Confluent Schema Registry HTTP API, structured as a thin domain-specific
//! struct over the third-party HTTP client, the same way this crate wraps
//! `rdkafka`'s `ClientConfig` elsewhere.
//!
//! Wire format: JSON-Schema and Avro share `0x00 | schemaId(4 bytes BE) |
//! payload`; Protobuf adds a message-index varint sequence before the
//! payload (`0x00` for the first message in a schema with no nested oneof
//! selection).

use crate::error::{Error, Result};
use crate::model::{CloudEvent, PayloadFormat};
use moka::future::Cache;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const MAGIC_BYTE: u8 = 0x00;

/// Schema id plus the parsed descriptor needed to encode/decode payloads
/// under a subject, memoized per subject with single-flight semantics
/// courtesy of `moka`'s `get_with`.
#[derive(Clone)]
struct SchemaEntry {
    schema_id: u32,
    format: PayloadFormat,
    /// Present only for Protobuf subjects; used to build `DynamicMessage`s.
    descriptor: Option<MessageDescriptor>,
    /// Present only for Avro subjects; the registered writer schema.
    avro_schema: Option<Arc<apache_avro::Schema>>,
}

/// Minimal Confluent-compatible schema-registry client.
pub struct SchemaRegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl SchemaRegistryClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build schema registry client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    async fn latest_schema_id(&self, subject: &str) -> Result<u32> {
        #[derive(serde::Deserialize)]
        struct LatestVersion {
            id: u32,
        }

        let url = format!("{}/subjects/{}/versions/latest", self.base_url, subject);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::kafka(format!("schema registry request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Decode {
                subject: subject.to_string(),
                message: format!("schema registry returned {}", response.status()).into(),
            });
        }

        let parsed: LatestVersion = response
            .json()
            .await
            .map_err(|e| Error::kafka(format!("malformed schema registry response: {e}")))?;

        Ok(parsed.id)
    }

    async fn fetch_schema_text(&self, schema_id: u32) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct SchemaResponse {
            schema: String,
        }

        let url = format!("{}/schemas/ids/{}", self.base_url, schema_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::kafka(format!("schema registry request failed: {e}")))?;

        let parsed: SchemaResponse = response
            .json()
            .await
            .map_err(|e| Error::kafka(format!("malformed schema registry response: {e}")))?;

        Ok(parsed.schema)
    }

    async fn fetch_proto_descriptor(&self, schema_id: u32) -> Result<MessageDescriptor> {
        #[derive(serde::Deserialize)]
        struct SchemaResponse {
            schema: String,
        }

        let url = format!("{}/schemas/ids/{}", self.base_url, schema_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::kafka(format!("schema registry request failed: {e}")))?;

        let parsed: SchemaResponse = response
            .json()
            .await
            .map_err(|e| Error::kafka(format!("malformed schema registry response: {e}")))?;

        // The registry stores the raw FileDescriptorProto-derived schema text
        // for protobuf subjects; real deployments register compiled
        // descriptor bytes. Parsing here assumes the registry already
        // returned serialized `DescriptorPool` bytes (as Confluent's
        // protobuf provider does over its binary schema endpoint).
        let pool = DescriptorPool::decode(parsed.schema.as_bytes())
            .map_err(|e| Error::Decode {
                subject: schema_id.to_string(),
                message: format!("invalid protobuf descriptor: {e}").into(),
            })?;

        pool.all_messages()
            .next()
            .ok_or_else(|| Error::Decode {
                subject: schema_id.to_string(),
                message: "descriptor pool contained no messages".into(),
            })
    }
}

/// Schema codec cache (C13): single instance per process, shared by every
/// Kafka producer/consumer worker.
pub struct SchemaCodec {
    client: Arc<SchemaRegistryClient>,
    cache: Cache<String, SchemaEntry>,
}

impl SchemaCodec {
    pub fn new(client: SchemaRegistryClient, cache_capacity: u64) -> Self {
        Self {
            client: Arc::new(client),
            cache: Cache::builder().max_capacity(cache_capacity).build(),
        }
    }

    fn subject_for(topic: &str, record_name: &str) -> String {
        format!("{}-{}", topic, record_name)
    }

    async fn entry_for(&self, subject: &str, format: PayloadFormat) -> Result<SchemaEntry> {
        if let Some(entry) = self.cache.get(subject).await {
            return Ok(entry);
        }

        let client = Arc::clone(&self.client);
        let subject_owned = subject.to_string();
        let entry = self
            .cache
            .try_get_with(subject.to_string(), async move {
                let schema_id = client.latest_schema_id(&subject_owned).await?;
                let mut descriptor = None;
                let mut avro_schema = None;
                match format {
                    PayloadFormat::Protobuf => {
                        descriptor = Some(client.fetch_proto_descriptor(schema_id).await?);
                    }
                    PayloadFormat::Avro => {
                        let text = client.fetch_schema_text(schema_id).await?;
                        let schema =
                            apache_avro::Schema::parse_str(&text).map_err(|e| Error::Decode {
                                subject: subject_owned.clone(),
                                message: format!("invalid avro schema: {e}").into(),
                            })?;
                        avro_schema = Some(Arc::new(schema));
                    }
                    PayloadFormat::JsonSchema => {}
                }
                Ok::<_, Error>(SchemaEntry {
                    schema_id,
                    format,
                    descriptor,
                    avro_schema,
                })
            })
            .await
            .map_err(|e: Arc<Error>| Error::Decode {
                subject: subject.to_string(),
                message: e.to_string().into(),
            })?;

        Ok(entry)
    }

    /// Serialize the CloudEvent key envelope, subject `topic-CloudEvent`.
    #[instrument(skip(self, cloud_event), fields(topic = topic))]
    pub async fn serialize_key(&self, topic: &str, cloud_event: &CloudEvent) -> Result<Vec<u8>> {
        let subject = Self::subject_for(topic, "CloudEvent");
        let entry = self.entry_for(&subject, PayloadFormat::JsonSchema).await?;
        let json = serde_json::to_vec(cloud_event)?;
        Ok(frame_confluent(entry.schema_id, &json))
    }

    /// Serialize a payload value under `topic-<RecordName>` per the test's
    /// chosen `PayloadFormat`.
    #[instrument(skip(self, payload), fields(topic = topic, record = record_name))]
    pub async fn serialize_value<T: Serialize>(
        &self,
        topic: &str,
        record_name: &str,
        format: PayloadFormat,
        payload: &T,
    ) -> Result<Vec<u8>> {
        let subject = Self::subject_for(topic, record_name);
        let entry = self.entry_for(&subject, format).await?;

        match format {
            PayloadFormat::JsonSchema => {
                let json = serde_json::to_vec(payload)?;
                Ok(frame_confluent(entry.schema_id, &json))
            }
            PayloadFormat::Avro => {
                let schema = entry.avro_schema.ok_or_else(|| Error::Decode {
                    subject: subject.clone(),
                    message: "missing avro schema".into(),
                })?;
                let value = apache_avro::to_value(payload).map_err(|e| Error::Decode {
                    subject: subject.clone(),
                    message: format!("avro encode failed: {e}").into(),
                })?;
                let resolved = value.resolve(&schema).map_err(|e| Error::Decode {
                    subject: subject.clone(),
                    message: format!("avro schema resolution failed: {e}").into(),
                })?;
                let bytes =
                    apache_avro::to_avro_datum(&schema, resolved).map_err(|e| Error::Decode {
                        subject,
                        message: format!("avro encode failed: {e}").into(),
                    })?;
                Ok(frame_confluent(entry.schema_id, &bytes))
            }
            PayloadFormat::Protobuf => {
                let descriptor = entry.descriptor.ok_or_else(|| Error::Decode {
                    subject: subject.clone(),
                    message: "missing protobuf descriptor".into(),
                })?;
                let json = serde_json::to_value(payload)?;
                let dynamic = DynamicMessage::deserialize(descriptor, json).map_err(|e| {
                    Error::Decode {
                        subject: subject.clone(),
                        message: format!("protobuf encode failed: {e}").into(),
                    }
                })?;
                let mut proto_bytes = Vec::new();
                dynamic
                    .encode(&mut proto_bytes)
                    .map_err(|e| Error::Decode {
                        subject: subject.clone(),
                        message: format!("protobuf encode failed: {e}").into(),
                    })?;
                Ok(frame_confluent_protobuf(entry.schema_id, &proto_bytes))
            }
        }
    }

    /// Decode a CloudEvent key (always JSON-Schema framed).
    #[instrument(skip(self, bytes), fields(topic = topic))]
    pub async fn deserialize_key(&self, topic: &str, bytes: &[u8]) -> Result<CloudEvent> {
        let subject = Self::subject_for(topic, "CloudEvent");
        let (_, payload) = unframe_confluent(&subject, bytes)?;
        serde_json::from_slice(payload).map_err(Error::Json)
    }

    /// Decode a payload value under `topic-<RecordName>`.
    #[instrument(skip(self, bytes), fields(topic = topic, record = record_name))]
    pub async fn deserialize_value<T: DeserializeOwned>(
        &self,
        topic: &str,
        record_name: &str,
        format: PayloadFormat,
        bytes: &[u8],
    ) -> Result<T> {
        let subject = Self::subject_for(topic, record_name);

        match format {
            PayloadFormat::JsonSchema => {
                let (_, payload) = unframe_confluent(&subject, bytes)?;
                serde_json::from_slice(payload).map_err(Error::Json)
            }
            PayloadFormat::Avro => {
                let (_, payload) = unframe_confluent(&subject, bytes)?;
                let entry = self.entry_for(&subject, format).await?;
                let schema = entry.avro_schema.ok_or_else(|| Error::Decode {
                    subject: subject.clone(),
                    message: "missing avro schema".into(),
                })?;
                debug!(schema_id = entry.schema_id, "decoding avro payload");
                let mut cursor = std::io::Cursor::new(payload);
                let value = apache_avro::from_avro_datum(&schema, &mut cursor, None).map_err(
                    |e| Error::Decode {
                        subject: subject.clone(),
                        message: format!("avro decode failed: {e}").into(),
                    },
                )?;
                let json = apache_avro::from_value::<serde_json::Value>(&value).map_err(|e| {
                    Error::Decode {
                        subject,
                        message: format!("avro decode failed: {e}").into(),
                    }
                })?;
                serde_json::from_value(json).map_err(Error::Json)
            }
            PayloadFormat::Protobuf => {
                let (_, payload) = unframe_protobuf(&subject, bytes)?;
                let entry = self.entry_for(&subject, format).await?;
                let descriptor = entry.descriptor.ok_or_else(|| Error::Decode {
                    subject: subject.clone(),
                    message: "missing protobuf descriptor".into(),
                })?;
                let dynamic =
                    DynamicMessage::decode(descriptor, payload).map_err(|e| Error::Decode {
                        subject: subject.clone(),
                        message: format!("protobuf decode failed: {e}").into(),
                    })?;
                let json = serde_json::to_value(&dynamic).map_err(|e| {
                    Error::Decode {
                        subject,
                        message: format!("protobuf decode failed: {e}").into(),
                    }
                })?;
                serde_json::from_value(json).map_err(Error::Json)
            }
        }
    }
}

fn frame_confluent(schema_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(MAGIC_BYTE);
    buf.extend_from_slice(&schema_id.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn frame_confluent_protobuf(schema_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + payload.len());
    buf.push(MAGIC_BYTE);
    buf.extend_from_slice(&schema_id.to_be_bytes());
    buf.push(0x00); // single top-level message, first in the file
    buf.extend_from_slice(payload);
    buf
}

fn unframe_confluent<'a>(subject: &str, bytes: &'a [u8]) -> Result<(u32, &'a [u8])> {
    if bytes.len() < 5 || bytes[0] != MAGIC_BYTE {
        return Err(Error::Decode {
            subject: subject.to_string(),
            message: "missing Confluent wire-format magic byte".into(),
        });
    }
    let schema_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok((schema_id, &bytes[5..]))
}

fn unframe_protobuf<'a>(subject: &str, bytes: &'a [u8]) -> Result<(u32, &'a [u8])> {
    let (schema_id, rest) = unframe_confluent(subject, bytes)?;
    // Message-index varint: a single 0x00 byte for the common one-message
    // case this crate targets; multi-file schemas would need full varint
    // decoding, out of scope here.
    if rest.is_empty() {
        return Err(Error::Decode {
            subject: subject.to_string(),
            message: "missing protobuf message-index byte".into(),
        });
    }
    Ok((schema_id, &rest[1..]))
}
