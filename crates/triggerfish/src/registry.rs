//! Trigger registry
//!
//! An explicitly constructed, explicitly disposed owner of every trigger
//! lifecycle in the process. Definitions are validated on `define`, and a
//! trigger name may be used once per table.
//!
//! Bulk `setup_all`/`listen_all` stop at the first failure; `stop_all`,
//! `drop_all` and `dispose` always visit every trigger and collect failures.

use crate::config::{RegistryConfig, TriggerfishConfig};
use crate::error::{Error, Result};
use crate::hooks::{Plugin, PluginChain};
use crate::lifecycle::{LifecycleContext, LocalHandlerId, TriggerLifecycle};
use crate::manager::{ConnectionManager, TeardownReport};
use crate::mirror::MetadataMirror;
use crate::multiplexer::{NotificationMultiplexer, Subscription};
use crate::pool::ConnectionFactory;
use crate::transport::ListenerConnector;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use triggerfish_sql::catalog::ModelCatalog;
use triggerfish_sql::trigger::TriggerBuilder;
use triggerfish_sql::ValidationError;

/// Owns every trigger lifecycle
pub struct Registry {
    ctx: LifecycleContext,
    catalog: Option<Arc<dyn ModelCatalog>>,
    default_schema: String,
    /// Definition order
    triggers: RwLock<Vec<Arc<TriggerLifecycle>>>,
    disposed: AtomicBool,
}

impl Registry {
    /// Create a registry over existing runtime components
    pub fn new(
        manager: ConnectionManager,
        multiplexer: NotificationMultiplexer,
        config: &RegistryConfig,
    ) -> Self {
        let mirror = config.metadata_mirror.then(|| {
            MetadataMirror::new(
                manager.clone(),
                &config.default_schema,
                &config.mirror_table,
            )
        });
        Self {
            ctx: LifecycleContext {
                manager,
                multiplexer,
                plugins: PluginChain::new(),
                mirror,
            },
            catalog: None,
            default_schema: config.default_schema.clone(),
            triggers: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Build the full runtime from configuration and explicit backends
    pub fn with_backends(
        config: &TriggerfishConfig,
        connector: Arc<dyn ListenerConnector>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = ConnectionManager::from_config(config, connector, factory);
        let multiplexer = NotificationMultiplexer::new(manager.clone(), &config.multiplexer);
        Ok(Self::new(manager, multiplexer, &config.registry))
    }

    /// Build a PostgreSQL-backed runtime from configuration
    #[cfg(feature = "postgres")]
    pub fn connect(config: &TriggerfishConfig) -> Result<Self> {
        config.validate()?;
        let manager = ConnectionManager::connect_postgres(config)?;
        let multiplexer = NotificationMultiplexer::new(manager.clone(), &config.multiplexer);
        Ok(Self::new(manager, multiplexer, &config.registry))
    }

    /// Resolve models through `catalog` when defining triggers
    pub fn with_catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Connection manager
    pub fn manager(&self) -> &ConnectionManager {
        &self.ctx.manager
    }

    /// Notification multiplexer
    pub fn multiplexer(&self) -> &NotificationMultiplexer {
        &self.ctx.multiplexer
    }

    /// Plugins shared by every lifecycle
    pub fn plugins(&self) -> &PluginChain {
        &self.ctx.plugins
    }

    /// Metadata mirror, when enabled
    pub fn mirror(&self) -> Option<&MetadataMirror> {
        self.ctx.mirror.as_ref()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::disposed("registry"));
        }
        Ok(())
    }

    /// Whether [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Add a plugin to every current and future trigger
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.ensure_active()?;
        self.ctx.plugins.register(plugin)
    }

    /// Validate a definition and register its lifecycle
    pub fn define(&self, builder: TriggerBuilder) -> Result<Arc<TriggerLifecycle>> {
        self.ensure_active()?;
        let builder = builder.default_schema(self.default_schema.clone());
        let spec = match &self.catalog {
            Some(catalog) => builder.build_with(catalog.as_ref())?,
            None => builder.build()?,
        };

        let mut triggers = self.triggers.write();
        let duplicate = triggers.iter().any(|t| {
            let existing = t.spec();
            existing.schema == spec.schema
                && existing.table == spec.table
                && existing.name == spec.name
        });
        if duplicate {
            return Err(ValidationError::DuplicateTrigger {
                schema: spec.schema,
                table: spec.table,
                name: spec.name,
            }
            .into());
        }

        let lifecycle = Arc::new(TriggerLifecycle::new(spec, self.ctx.clone()));
        triggers.push(lifecycle.clone());
        Ok(lifecycle)
    }

    /// Lifecycle by `schema.table.name`
    pub fn get(&self, key: &str) -> Option<Arc<TriggerLifecycle>> {
        self.triggers
            .read()
            .iter()
            .find(|t| t.key() == key)
            .cloned()
    }

    fn require(&self, key: &str) -> Result<Arc<TriggerLifecycle>> {
        self.get(key).ok_or_else(|| Error::UnknownTrigger {
            trigger: key.to_string(),
        })
    }

    /// Every lifecycle in definition order
    pub fn triggers(&self) -> Vec<Arc<TriggerLifecycle>> {
        self.triggers.read().clone()
    }

    /// Lifecycles defined on `model`
    pub fn triggers_for_model(&self, model: &str) -> Vec<Arc<TriggerLifecycle>> {
        self.triggers
            .read()
            .iter()
            .filter(|t| t.spec().model == model)
            .cloned()
            .collect()
    }

    /// Set up every trigger in definition order, stopping at the first failure
    pub async fn setup_all(&self) -> Result<()> {
        self.ensure_active()?;
        for trigger in self.triggers() {
            trigger.setup().await?;
        }
        info!("Set up {} trigger(s)", self.triggers.read().len());
        Ok(())
    }

    /// Start listening on every trigger, stopping at the first failure
    pub async fn listen_all(&self) -> Result<()> {
        self.ensure_active()?;
        for trigger in self.triggers() {
            trigger.listen().await?;
        }
        Ok(())
    }

    /// Stop every trigger, collecting failures
    pub async fn stop_all(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for trigger in self.triggers() {
            report.record(trigger.key(), trigger.stop().await);
        }
        report
    }

    /// Drop every trigger, collecting failures
    pub async fn drop_all(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for trigger in self.triggers() {
            report.record(trigger.key(), trigger.drop_trigger().await);
        }
        report
    }

    /// Store `subscription` on every trigger of `model`
    pub async fn subscribe_model(
        &self,
        model: &str,
        subscription: Subscription,
    ) -> Result<Vec<(String, LocalHandlerId)>> {
        self.ensure_active()?;
        let triggers = self.triggers_for_model(model);
        if triggers.is_empty() {
            return Err(ValidationError::UnknownModel(model.to_string()).into());
        }

        let mut ids = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let id = trigger.subscribe(subscription.clone()).await?;
            ids.push((trigger.key(), id));
        }
        Ok(ids)
    }

    /// Store `subscription` on one trigger
    pub async fn subscribe_trigger(
        &self,
        key: &str,
        subscription: Subscription,
    ) -> Result<LocalHandlerId> {
        self.ensure_active()?;
        self.require(key)?.subscribe(subscription).await
    }

    /// Remove a handler from one trigger; returns whether it existed
    pub async fn unsubscribe_trigger(&self, key: &str, id: LocalHandlerId) -> Result<bool> {
        self.ensure_active()?;
        self.require(key)?.unsubscribe(id).await
    }

    /// Stop every trigger, close every channel and both connections.
    ///
    /// Triggers stay installed in the database. Idempotent; failures are
    /// collected and never stop the remaining teardown.
    pub async fn dispose(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return report;
        }

        report.merge(self.stop_all().await);
        report.merge(self.ctx.multiplexer.dispose().await);
        report.merge(self.ctx.manager.dispose().await);
        self.triggers.write().clear();

        info!(
            "Registry disposed ({} steps, {} failures)",
            report.attempted,
            report.failures.len()
        );
        report
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("triggers", &self.triggers.read().len())
            .field("plugins", &self.ctx.plugins)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
