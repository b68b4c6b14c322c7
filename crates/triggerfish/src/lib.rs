//! # triggerfish
//!
//! Runtime half of Triggerfish: PostgreSQL triggers whose row changes are
//! published with `pg_notify` and delivered to typed Rust handlers.
//!
//! ## Architecture
//!
//! ```text
//! Registry ──► TriggerLifecycle ──► NotificationMultiplexer ──► ConnectionManager
//!   define        setup/listen          one LISTEN per channel      listener + pool
//!                 stop/drop             many handlers per channel   reconnect/backoff
//! ```
//!
//! - [`ConnectionManager`] owns one dedicated listener connection and a pool of
//!   transaction connections for DDL
//! - [`NotificationMultiplexer`] parses each payload once and fans it out to
//!   every handler on the channel, isolating handler failures
//! - [`TriggerLifecycle`] drives a trigger through
//!   `DefinitionComplete → Created → Listening → Stopped → Dropped`
//! - [`Registry`] owns every lifecycle and tears the runtime down in one call
//!
//! Delivery is at-most-once: LISTEN/NOTIFY is not durable and notifications
//! published while the listener is reconnecting are lost.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use triggerfish::prelude::*;
//!
//! let registry = Registry::connect(&TriggerfishConfig::new("postgres://localhost/shop"))?;
//!
//! let trigger = registry.define(
//!     TriggerBuilder::new()
//!         .model("orders")
//!         .name("order_status")
//!         .after()
//!         .on_update()
//!         .watch_columns(["status"])
//!         .notify(),
//! )?;
//!
//! trigger
//!     .subscribe(Subscription::typed(|order: Order, _n| async move {
//!         println!("order {} is now {}", order.id, order.status);
//!         Ok(())
//!     }))
//!     .await?;
//!
//! registry.setup_all().await?;
//! registry.listen_all().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod envelope;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod manager;
pub mod mirror;
pub mod multiplexer;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod registry;
pub mod testing;
pub mod transport;

pub use config::{
    DatabaseConfig, ListenerConfig, MultiplexerConfig, PoolConfig, ReconnectPolicy,
    RegistryConfig, TriggerfishConfig,
};
pub use envelope::{Envelope, Notification};
pub use error::{BoxError, Error, ErrorCategory, Result};
pub use hooks::{Plugin, PluginChain, HOOK_API_VERSION};
pub use lifecycle::{LocalHandlerId, TriggerLifecycle, TriggerState};
pub use manager::{ConnectionEvent, ConnectionManager, TeardownFailure, TeardownReport};
pub use mirror::MetadataMirror;
pub use multiplexer::{
    DeliveryMode, DispatchError, FailureKind, HandlerFailure, HandlerId, HandlerResult,
    NotificationMultiplexer, Subscription,
};
pub use pool::{PoolStats, TransactionPool};
pub use registry::Registry;
pub use transport::{ListenerConnector, ListenerTransport, RawNotification, TransportEvent};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ReconnectPolicy, TriggerfishConfig};
    pub use crate::envelope::{Envelope, Notification};
    pub use crate::error::{Error, Result};
    pub use crate::hooks::Plugin;
    pub use crate::lifecycle::{TriggerLifecycle, TriggerState};
    pub use crate::manager::{ConnectionEvent, ConnectionManager, TeardownReport};
    pub use crate::multiplexer::{
        DeliveryMode, DispatchError, HandlerResult, NotificationMultiplexer, Subscription,
    };
    pub use crate::registry::Registry;
    pub use triggerfish_sql::prelude::{
        changed, new_field, old_field, Condition, FieldType, ModelCatalog, ModelInfo,
        StaticCatalog, TriggerBuilder, TriggerOperation, TriggerSpec,
    };
}
