//! Object storage backend used by the BlockStorage child to materialize
//! feature/glue artifacts into an in-memory virtual filesystem and to
//! upload evidence at the end of a run.
//!
//! A thin client wrapper over `aws-sdk-s3`,
//! `put_object`/`get_object().body.collect()` for upload and download,
//! generalized here behind the `ObjectStore` trait so the FSM's
//! BlockStorage child never depends on the concrete AWS types.

use crate::config::ObjectStorageConfig;
use crate::error::{Error, Result};
use crate::model::{TestId, TopicDirective};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

/// In-memory virtual filesystem populated by a `fetch` call, rooted at
/// `/<root>/<testId>/…`. Directory layout is fixed: `feature-files/`,
/// `step-definitions/`, `evidence/{cucumber-reports, event-logs,
/// metadata.json}`, `results/`.
#[derive(Debug, Clone, Default)]
pub struct VirtualFs {
    files: HashMap<String, Vec<u8>>,
}

impl VirtualFs {
    pub fn insert(&mut self, path: impl Into<String>, bytes: Vec<u8>) {
        self.files.insert(path.into(), bytes);
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }

    pub fn paths_under(&self, prefix: &str) -> impl Iterator<Item = &str> {
        self.files.keys().filter(move |p| p.starts_with(prefix)).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Result of a `fetch` call: the materialized virtual FS plus the topic
/// directives and glue package names parsed out of the uploaded artifacts.
#[derive(Debug, Clone)]
pub struct FetchedArtifacts {
    pub fs: VirtualFs,
    pub step_definition_packages: Vec<String>,
    pub tag_filters: Vec<String>,
    /// Topic directives declared by the uploaded `topics.json` manifest
    /// (root of the test's object-storage prefix, sibling to
    /// `feature-files/` and `step-definitions/`). Absent manifest yields an
    /// empty list, which is valid.
    pub topics: Vec<TopicDirective>,
}

/// Object storage contract: `fetch` materializes feature/glue artifacts
/// into a virtual FS; `load` uploads evidence under a per-test prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, test_id: TestId, bucket: &str) -> Result<FetchedArtifacts>;

    async fn load(&self, test_id: TestId, bucket: &str, evidence: &VirtualFs) -> Result<()>;
}

/// `ObjectStore` over AWS S3.
pub struct S3ObjectStore {
    client: Client,
    config: ObjectStorageConfig,
}

impl S3ObjectStore {
    pub async fn new(config: ObjectStorageConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;
        let client = Client::new(&sdk_config);
        Self { client, config }
    }

    fn object_prefix(&self, test_id: TestId) -> String {
        format!("tests/{}", test_id)
    }

    async fn download_under(&self, bucket: &str, prefix: &str) -> Result<VirtualFs> {
        let mut fs = VirtualFs::default();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| Error::ObjectStorage {
                message: format!("failed to list objects under {}: {}", prefix, e).into(),
                source: Some(Box::new(e)),
            })?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    let body = self
                        .client
                        .get_object()
                        .bucket(bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(|e| Error::ObjectStorage {
                            message: format!("failed to download {}: {}", key, e).into(),
                            source: Some(Box::new(e)),
                        })?
                        .body
                        .collect()
                        .await
                        .map_err(|e| Error::ObjectStorage {
                            message: format!("failed to read body of {}: {}", key, e).into(),
                            source: Some(Box::new(e)),
                        })?;

                    let relative = key.strip_prefix(prefix).unwrap_or(key).trim_start_matches('/');
                    fs.insert(relative.to_string(), body.into_bytes().to_vec());
                }
            }

            continuation_token = response.next_continuation_token().map(|s| s.to_string());
            if continuation_token.is_none() {
                break;
            }
        }

        Ok(fs)
    }

    /// Best-effort download of the `topics.json` manifest declaring this
    /// test's `TopicDirective`s. A missing manifest is not an error: it
    /// means the test references no Kafka topics at all.
    async fn fetch_topics_manifest(&self, bucket: &str, prefix: &str) -> Vec<TopicDirective> {
        let key = format!("{}/topics.json", prefix);
        match self.client.get_object().bucket(bucket).key(&key).send().await {
            Ok(output) => match output.body.collect().await {
                Ok(bytes) => serde_json::from_slice(&bytes.into_bytes())
                    .map_err(|e| warn!(key = %key, error = %e, "malformed topics.json manifest"))
                    .unwrap_or_default(),
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to read topics.json body");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(test_id = %test_id, bucket = bucket))]
    async fn fetch(&self, test_id: TestId, bucket: &str) -> Result<FetchedArtifacts> {
        let prefix = self.object_prefix(test_id);
        info!("fetching feature artifacts from object storage");

        let features_fs = self
            .download_under(bucket, &format!("{}/feature-files/", prefix))
            .await?;
        let glue_fs = self
            .download_under(bucket, &format!("{}/step-definitions/", prefix))
            .await?;

        let mut fs = VirtualFs::default();
        for path in features_fs.paths_under("") {
            fs.insert(
                format!("feature-files/{}", path),
                features_fs.get(path).unwrap().to_vec(),
            );
        }
        let mut step_definition_packages = Vec::new();
        for path in glue_fs.paths_under("") {
            fs.insert(
                format!("step-definitions/{}", path),
                glue_fs.get(path).unwrap().to_vec(),
            );
            if let Some(package) = path.split('/').next() {
                if !step_definition_packages.contains(&package.to_string()) {
                    step_definition_packages.push(package.to_string());
                }
            }
        }

        debug!(file_count = fs.len(), "materialized virtual filesystem");

        let topics = self.fetch_topics_manifest(bucket, &prefix).await;

        Ok(FetchedArtifacts {
            fs,
            step_definition_packages,
            tag_filters: vec!["not @Ignore".to_string()],
            topics,
        })
    }

    #[instrument(skip(self, evidence), fields(test_id = %test_id, bucket = bucket))]
    async fn load(&self, test_id: TestId, bucket: &str, evidence: &VirtualFs) -> Result<()> {
        let prefix = format!("{}/evidence", self.object_prefix(test_id));
        info!(file_count = evidence.len(), "uploading evidence to object storage");

        for path in evidence.paths_under("") {
            let bytes = evidence.get(path).unwrap().to_vec();
            let key = format!("{}/{}", prefix, path);
            self.client
                .put_object()
                .bucket(bucket)
                .key(&key)
                .body(ByteStream::from(bytes))
                .send()
                .await
                .map_err(|e| Error::ObjectStorage {
                    message: format!("failed to upload {}: {}", key, e).into(),
                    source: Some(Box::new(e)),
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// In-memory `ObjectStore` used by integration tests so the FSM's
    /// orchestration logic can be exercised without a real bucket.
    #[derive(Clone, Default)]
    pub struct FakeObjectStore {
        pub fetch_responses: Arc<Mutex<HashMap<TestId, FetchedArtifacts>>>,
        pub uploads: Arc<Mutex<HashMap<TestId, VirtualFs>>>,
    }

    impl FakeObjectStore {
        pub fn seed(&self, test_id: TestId, artifacts: FetchedArtifacts) {
            self.fetch_responses.lock().insert(test_id, artifacts);
        }
    }

    #[async_trait]
    impl ObjectStore for FakeObjectStore {
        async fn fetch(&self, test_id: TestId, _bucket: &str) -> Result<FetchedArtifacts> {
            self.fetch_responses
                .lock()
                .get(&test_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("no seeded artifacts for {}", test_id)))
        }

        async fn load(&self, test_id: TestId, _bucket: &str, evidence: &VirtualFs) -> Result<()> {
            self.uploads.lock().insert(test_id, evidence.clone());
            Ok(())
        }
    }
}
