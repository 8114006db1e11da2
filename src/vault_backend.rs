//! Secret vault backend used by the Vault child to resolve a
//! `KafkaSecurityDirective` for each topic a test references.
//!
//! A `moka::future::Cache`-backed client over `aws-sdk-secretsmanager`,
//! TTL-cached per secret name. Kafka security material is stored one
//! secret per topic under a configurable namespace prefix, as a JSON
//! document matching `KafkaSecurityDirective`'s shape minus the topic
//! (which is supplied by the caller).
//!
//! **Confidentiality contract.** No log record or error message this
//! module produces may contain JAAS config, keystore, or truststore bytes.
//! Backend errors are rewritten to reference only the test id.

use crate::config::VaultConfig;
use crate::error::{Error, Result};
use crate::model::{KafkaSecurityDirective, SecurityProtocol, TestId, TopicDirective, TopicRole};
use async_trait::async_trait;
use aws_sdk_secretsmanager::Client as SecretsClient;
use moka::future::Cache;
use serde::Deserialize;
use tracing::{debug, info};

/// Vault contract: `fetch_security_directives` resolves one
/// `KafkaSecurityDirective` per `TopicDirective`; `shutdown` releases any
/// held resources. Empty topic lists are valid and yield an empty list.
#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn fetch_security_directives(
        &self,
        test_id: TestId,
        topics: &[TopicDirective],
    ) -> Result<Vec<KafkaSecurityDirective>>;

    async fn shutdown(&self);
}

/// On-the-wire shape of one topic's security material in the backing
/// secret store, before the topic name and role are attached by the caller.
#[derive(Debug, Clone, Deserialize)]
struct StoredSecurityMaterial {
    security_protocol: SecurityProtocol,
    jaas_config: String,
    #[serde(default, with = "base64_opt")]
    keystore: Option<Vec<u8>>,
    #[serde(default, with = "base64_opt")]
    truststore: Option<Vec<u8>>,
}

mod base64_opt {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => base64::engine::general_purpose::STANDARD
                .decode(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// `SecretVault` over AWS Secrets Manager: a TTL-cached lookup per secret
/// name.
pub struct AwsSecretVault {
    client: SecretsClient,
    cache: Cache<String, StoredSecurityMaterial>,
    namespace: String,
}

impl AwsSecretVault {
    pub async fn new(config: VaultConfig) -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = SecretsClient::new(&sdk_config);
        let cache = Cache::builder()
            .max_capacity(500)
            .time_to_live(config.cache_ttl)
            .build();

        info!(
            namespace = %config.namespace,
            cache_ttl_secs = config.cache_ttl.as_secs(),
            "initialized AWS Secrets Manager vault backend"
        );

        Self {
            client,
            cache,
            namespace: config.namespace,
        }
    }

    fn secret_name(&self, topic: &str) -> String {
        format!("{}/{}", self.namespace, topic)
    }

    async fn fetch_one(&self, test_id: TestId, topic: &str) -> Result<StoredSecurityMaterial> {
        let secret_name = self.secret_name(topic);

        if let Some(cached) = self.cache.get(&secret_name).await {
            debug!(test_id = %test_id, topic = topic, "security directive served from cache");
            return Ok(cached);
        }

        debug!(test_id = %test_id, topic = topic, "fetching security directive from vault");

        let response = self
            .client
            .get_secret_value()
            .secret_id(&secret_name)
            .send()
            .await
            .map_err(|_| Error::Vault {
                test_id: test_id.to_string(),
            })?;

        let secret_string = response.secret_string().ok_or_else(|| Error::Vault {
            test_id: test_id.to_string(),
        })?;

        let material: StoredSecurityMaterial =
            serde_json::from_str(secret_string).map_err(|_| Error::Vault {
                test_id: test_id.to_string(),
            })?;

        self.cache.insert(secret_name, material.clone()).await;

        Ok(material)
    }
}

#[async_trait]
impl SecretVault for AwsSecretVault {
    async fn fetch_security_directives(
        &self,
        test_id: TestId,
        topics: &[TopicDirective],
    ) -> Result<Vec<KafkaSecurityDirective>> {
        let mut directives = Vec::with_capacity(topics.len());

        for topic in topics {
            let material = self.fetch_one(test_id, &topic.topic).await?;
            directives.push(KafkaSecurityDirective {
                topic: topic.topic.clone(),
                role: topic.role,
                security_protocol: material.security_protocol,
                jaas_config: material.jaas_config,
                keystore: material.keystore,
                truststore: material.truststore,
            });
        }

        Ok(directives)
    }

    async fn shutdown(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// In-memory `SecretVault` for tests: seeded per-topic directives,
    /// an optional per-topic failure, never touches AWS.
    #[derive(Clone, Default)]
    pub struct FakeSecretVault {
        pub directives: Arc<Mutex<HashMap<String, KafkaSecurityDirective>>>,
        pub failing_topics: Arc<Mutex<Vec<String>>>,
    }

    impl FakeSecretVault {
        pub fn seed(&self, directive: KafkaSecurityDirective) {
            self.directives.lock().insert(directive.topic.clone(), directive);
        }

        pub fn fail_topic(&self, topic: impl Into<String>) {
            self.failing_topics.lock().push(topic.into());
        }
    }

    #[async_trait]
    impl SecretVault for FakeSecretVault {
        async fn fetch_security_directives(
            &self,
            test_id: TestId,
            topics: &[TopicDirective],
        ) -> Result<Vec<KafkaSecurityDirective>> {
            let mut out = Vec::with_capacity(topics.len());
            for topic in topics {
                if self.failing_topics.lock().contains(&topic.topic) {
                    return Err(Error::Vault {
                        test_id: test_id.to_string(),
                    });
                }
                let directive = self
                    .directives
                    .lock()
                    .get(&topic.topic)
                    .cloned()
                    .unwrap_or_else(|| KafkaSecurityDirective {
                        topic: topic.topic.clone(),
                        role: topic.role,
                        security_protocol: SecurityProtocol::Plaintext,
                        jaas_config: String::new(),
                        keystore: None,
                        truststore: None,
                    });
                out.push(directive);
            }
            Ok(out)
        }

        async fn shutdown(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeSecretVault;
    use super::*;

    #[tokio::test]
    async fn fake_vault_returns_empty_list_for_empty_topics() {
        let vault = FakeSecretVault::default();
        let directives = vault
            .fetch_security_directives(TestId::random(), &[])
            .await
            .unwrap();
        assert!(directives.is_empty());
    }

    #[tokio::test]
    async fn fake_vault_surfaces_error_scoped_to_test_id() {
        let vault = FakeSecretVault::default();
        vault.fail_topic("orders");
        let test_id = TestId::random();

        let err = vault
            .fetch_security_directives(
                test_id,
                &[TopicDirective {
                    topic: "orders".into(),
                    role: TopicRole::Producer,
                    client_principal: "p1".into(),
                    event_filters: vec![],
                }],
            )
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains(&test_id.to_string()));
    }
}
