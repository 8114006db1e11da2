//! Test-Probe
//!
//! A long-running service that executes BDD test scenarios against real
//! Kafka clusters.
//!
//! # Architecture
//!
//! - **Assembly**: validate/initialize/verify lifecycle over pluggable
//!   service modules (config, object storage, vault, actor runtime, REST
//!   ingress)
//! - **Guardian / Queue**: root supervisor and the single admission queue
//!   for test executions
//! - **TestExecutionActor**: per-test orchestrator and its fixed children
//!   (BlockStorage, Vault, Kafka producer/consumer groups, CucumberExecution)
//!
//! # Graceful Shutdown
//!
//! The process handles SIGTERM and SIGINT: the REST listener stops
//! accepting new connections, in-flight requests are given a grace period
//! to complete, and the process exits 0. Exit is non-zero only on a fatal
//! assembly failure.

use std::sync::Arc;
use test_probe::assembly::{
    ActorRuntimeModule, Assembler, ConfigModule, IngressModule, ObjectStorageModule,
    SecretVaultModule,
};
use test_probe::config::Config;
use test_probe::error::Result;
use test_probe::object_storage::S3ObjectStore;
use test_probe::vault_backend::AwsSecretVault;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  Test-Probe v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");

    let config = Arc::new(Config::from_env()?);
    info!("configuration loaded and validated");

    match run(config).await {
        Ok(()) => {
            info!("Test-Probe stopped gracefully");
            Ok(())
        }
        Err(err) => {
            error!(%err, "fatal assembly failure, exiting");
            Err(err)
        }
    }
}

async fn run(config: Arc<Config>) -> Result<()> {
    let object_store: Arc<dyn test_probe::object_storage::ObjectStore> =
        Arc::new(S3ObjectStore::new(config.object_storage.clone()).await);
    let secret_vault: Arc<dyn test_probe::vault_backend::SecretVault> =
        Arc::new(AwsSecretVault::new(config.vault.clone()).await);

    let mut assembler = Assembler::new();
    assembler
        .contribute(Box::new(ConfigModule { config: Arc::clone(&config) }))
        .contribute(Box::new(ObjectStorageModule {
            store: Arc::clone(&object_store),
            bucket: config.object_storage.bucket.clone(),
        }))
        .contribute(Box::new(SecretVaultModule { vault: Arc::clone(&secret_vault) }))
        .contribute(Box::new(ActorRuntimeModule {
            object_store: Arc::clone(&object_store),
            secret_vault: Arc::clone(&secret_vault),
        }))
        .contribute(Box::new(IngressModule));

    let build_timeout = config.actor_runtime.build_timeout;
    let ctx = tokio::time::timeout(build_timeout, assembler.build())
        .await
        .map_err(|_| test_probe::error::Error::Assembly {
            message: "assembly did not complete within the configured build timeout".into(),
        })??;
    info!("assembly complete, all modules validated/initialized/verified");

    let queue_handle = ctx.require_queue_handle()?.clone();
    let listener = Arc::clone(
        ctx.rest_listener
            .as_ref()
            .expect("IngressModule::verify guarantees the listener is present"),
    );
    let local_addr = listener.local_addr().ok();

    let router = test_probe::api::build_router(queue_handle);
    let std_listener = listener
        .try_clone()
        .map_err(|e| test_probe::error::Error::internal(e))?;
    let tokio_listener = tokio::net::TcpListener::from_std(std_listener)
        .map_err(|e| test_probe::error::Error::internal(e))?;

    info!(?local_addr, "REST ingress bound, serving");

    tokio::select! {
        result = axum::serve(tokio_listener, router) => {
            if let Err(e) = result {
                warn!(%e, "REST server exited with an error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    Ok(())
}

/// Initialize structured logging with tracing
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("test_probe=debug,tower_http=debug,rdkafka=warn,info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
