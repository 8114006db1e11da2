//! Error types for Test-Probe
//!
//! `thiserror` for ergonomic definitions, `Cow<'static, str>` messages,
//! `#[source]` chaining, classification helpers, and an `IntoResponse`
//! impl so the REST ingress can turn any internal error into a JSON body
//! without a translation layer at the handler boundary.
//!
//! The variant set maps directly onto the propagation policy each error
//! kind is handled under: `Assembly` is fatal, `Validation` is resumable,
//! `TransientIo` is restartable up to a bounded rate, `Decode` never stops
//! a stream, and so on. See `is_retryable`, `is_resumable`, and `is_fatal`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;

/// Result type alias for Test-Probe operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Test-Probe.
#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Assembly errors — fatal, process exits
    // ========================================================================
    #[error("assembly error: {message}")]
    Assembly { message: Cow<'static, str> },

    #[error("missing required module kind: {kind}")]
    MissingModule { kind: &'static str },

    // ========================================================================
    // Configuration errors
    // ========================================================================
    #[error("configuration error: {message}")]
    Config {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("invalid configuration value for {key}: {message}")]
    InvalidConfig {
        key: &'static str,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // Validation errors — resume policy, state preserved
    // ========================================================================
    #[error("validation error: {message}")]
    Validation { message: Cow<'static, str> },

    // ========================================================================
    // Transient infrastructural errors — restart up to a bounded rate
    // ========================================================================
    #[error("object storage error: {message}")]
    ObjectStorage {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("secret vault error for test {test_id}")]
    Vault { test_id: String },

    #[error("Kafka error: {message}")]
    Kafka {
        message: Cow<'static, str>,
        #[source]
        source: Option<rdkafka::error::KafkaError>,
    },

    #[error("Kafka producer failed: {cause}")]
    KafkaProducerFailed { cause: String },

    #[error("Kafka consumer error: {message}")]
    KafkaConsumer { message: Cow<'static, str> },

    #[error("transient I/O error: {message}")]
    TransientIo { message: Cow<'static, str> },

    // ========================================================================
    // Decode errors — never stop the stream, logged without payload bytes
    // ========================================================================
    #[error("decode error on subject {subject}: {message}")]
    Decode {
        subject: String,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // DSL registry errors
    // ========================================================================
    #[error("DSL registry not initialized")]
    DslNotInitialized,

    #[error("no {kind} registered for test {test_id} topic {topic}")]
    ActorNotRegistered {
        kind: &'static str,
        test_id: String,
        topic: String,
    },

    #[error("consumer not yet available for correlation {correlation_id} on topic {topic}")]
    ConsumerNotAvailable {
        correlation_id: String,
        topic: String,
    },

    // ========================================================================
    // Queue / FSM errors
    // ========================================================================
    #[error("queue is full")]
    QueueFull,

    #[error("unknown test id: {0}")]
    UnknownTest(String),

    #[error("test {test_id} already admitted")]
    DuplicateTest { test_id: String },

    // ========================================================================
    // API errors
    // ========================================================================
    #[error("bad request: {message}")]
    BadRequest { message: Cow<'static, str> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("internal server error")]
    Internal {
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // ========================================================================
    // Unrecoverable — stop the whole process
    // ========================================================================
    #[error("fatal error: {message}")]
    Fatal { message: Cow<'static, str> },

    // ========================================================================
    // Serialization / generic
    // ========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn kafka(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Kafka {
            message: message.into(),
            source: None,
        }
    }

    pub fn bad_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn internal(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal {
            source: Some(Box::new(source)),
        }
    }

    /// True if a supervisor should restart the failing actor (bounded rate)
    /// rather than fail the test outright. Matches the `TransientIoError`
    /// row of the propagation-policy table.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ObjectStorage { .. }
                | Error::Vault { .. }
                | Error::Kafka { .. }
                | Error::KafkaProducerFailed { .. }
                | Error::KafkaConsumer { .. }
                | Error::TransientIo { .. }
                | Error::Timeout { .. }
        )
    }

    /// True if a supervisor should resume the child with its state intact
    /// rather than restart or escalate. Matches the `ValidationError` row.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Error::Validation { .. } | Error::BadRequest { .. })
    }

    /// True if the whole process should stop. Matches the `Fatal` row.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Fatal { .. } | Error::Assembly { .. } | Error::MissingModule { .. }
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } | Error::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound(_) | Error::UnknownTest(_) => StatusCode::NOT_FOUND,
            Error::DuplicateTest { .. } => StatusCode::CONFLICT,
            Error::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Assembly { .. } | Error::MissingModule { .. } => "ASSEMBLY_ERROR",
            Error::Config { .. } | Error::MissingEnvVar { .. } | Error::InvalidConfig { .. } => {
                "CONFIG_ERROR"
            }
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::ObjectStorage { .. } => "OBJECT_STORAGE_ERROR",
            Error::Vault { .. } => "VAULT_ERROR",
            Error::Kafka { .. } | Error::KafkaProducerFailed { .. } | Error::KafkaConsumer { .. } => {
                "KAFKA_ERROR"
            }
            Error::TransientIo { .. } => "TRANSIENT_IO_ERROR",
            Error::Decode { .. } => "DECODE_ERROR",
            Error::DslNotInitialized => "DSL_NOT_INITIALIZED",
            Error::ActorNotRegistered { .. } => "ACTOR_NOT_REGISTERED",
            Error::ConsumerNotAvailable { .. } => "CONSUMER_NOT_AVAILABLE",
            Error::QueueFull => "QUEUE_FULL",
            Error::UnknownTest(_) => "UNKNOWN_TEST",
            Error::DuplicateTest { .. } => "DUPLICATE_TEST",
            Error::BadRequest { .. } => "BAD_REQUEST",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Internal { .. } | Error::Other(_) => "INTERNAL_ERROR",
            Error::Fatal { .. } => "FATAL",
            Error::Json(_) => "SERIALIZATION_ERROR",
        }
    }
}

// ============================================================================
// API error response
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        let body = ErrorResponse {
            error: ErrorBody { code, message },
        };

        (status, Json(body)).into_response()
    }
}

impl From<rdkafka::error::KafkaError> for Error {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Error::Kafka {
            message: err.to_string().into(),
            source: Some(err),
        }
    }
}
