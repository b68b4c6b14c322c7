//! Lifecycle plugins
//!
//! A [`Plugin`] observes trigger lifecycles through a small, versioned set of
//! hooks. Plugins run in registration order. `before_create` may veto a
//! setup; every other hook is observational and a panic inside it is caught
//! and logged.

use crate::envelope::Notification;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};
use triggerfish_sql::trigger::TriggerSpec;

/// Hook API version implemented by this crate
pub const HOOK_API_VERSION: u32 = 1;

/// Lifecycle hooks; every method has a no-op default
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name
    fn name(&self) -> &str;

    /// Hook API version the plugin was written against
    fn api_version(&self) -> u32 {
        HOOK_API_VERSION
    }

    /// Before the trigger's DDL is applied; an error aborts the setup
    async fn before_create(&self, _spec: &TriggerSpec) -> Result<()> {
        Ok(())
    }

    /// After the trigger's DDL is applied
    async fn after_create(&self, _spec: &TriggerSpec) {}

    /// Before the trigger's DDL is removed
    async fn before_drop(&self, _spec: &TriggerSpec) {}

    /// After a notification was dispatched to the trigger's handlers
    fn after_notification(&self, _spec: &TriggerSpec, _notification: &Notification) {}

    /// When one of the trigger's handlers failed
    fn on_error(&self, _spec: &TriggerSpec, _error: &Error) {}
}

/// Ordered, shared list of plugins.
///
/// Clones share the same list, so plugins registered later are seen by every
/// lifecycle holding the chain.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Arc<RwLock<Vec<Arc<dyn Plugin>>>>,
}

impl PluginChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin after checking its hook API version
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        if plugin.api_version() != HOOK_API_VERSION {
            return Err(Error::config(format!(
                "plugin '{}' targets hook API v{}, this build provides v{}",
                plugin.name(),
                plugin.api_version(),
                HOOK_API_VERSION
            )));
        }
        debug!("Registered plugin {}", plugin.name());
        self.plugins.write().push(plugin);
        Ok(())
    }

    /// Number of plugins
    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.read().clone()
    }

    /// Run `before_create` hooks; the first error wins
    pub async fn before_create(&self, spec: &TriggerSpec) -> Result<()> {
        for plugin in self.snapshot() {
            plugin.before_create(spec).await.map_err(|e| {
                debug!("Plugin {} vetoed setup of {}: {}", plugin.name(), spec.key(), e);
                e
            })?;
        }
        Ok(())
    }

    /// Run `after_create` hooks
    pub async fn after_create(&self, spec: &TriggerSpec) {
        for plugin in self.snapshot() {
            plugin.after_create(spec).await;
        }
    }

    /// Run `before_drop` hooks
    pub async fn before_drop(&self, spec: &TriggerSpec) {
        for plugin in self.snapshot() {
            plugin.before_drop(spec).await;
        }
    }

    /// Run `after_notification` hooks
    pub fn after_notification(&self, spec: &TriggerSpec, notification: &Notification) {
        for plugin in self.snapshot() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                plugin.after_notification(spec, notification)
            }));
            if result.is_err() {
                error!("Plugin {} panicked in after_notification", plugin.name());
            }
        }
    }

    /// Run `on_error` hooks
    pub fn on_error(&self, spec: &TriggerSpec, err: &Error) {
        for plugin in self.snapshot() {
            let result = catch_unwind(AssertUnwindSafe(|| plugin.on_error(spec, err)));
            if result.is_err() {
                error!("Plugin {} panicked in on_error", plugin.name());
            }
        }
    }
}

impl std::fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .plugins
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        f.debug_struct("PluginChain").field("plugins", &names).finish()
    }
}
