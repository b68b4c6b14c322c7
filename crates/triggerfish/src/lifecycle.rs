//! Trigger lifecycle
//!
//! ```text
//! Uninitialized -> DefinitionComplete -> Created <-> Listening
//!                                          |           |
//!                                          v           v
//!                                        Dropped <-----+
//! ```
//!
//! `Stopped` is `Created` reached by leaving `Listening`; it accepts the same
//! transitions. `Dropped` is terminal. `setup`, `listen`, `stop` and
//! `drop_trigger` are idempotent in the states they lead to.
//!
//! Handlers can be added in any state; they are attached to the channel while
//! the trigger is `Listening` and detached otherwise.

use crate::envelope::Notification;
use crate::error::{Error, Result};
use crate::hooks::PluginChain;
use crate::manager::ConnectionManager;
use crate::mirror::MetadataMirror;
use crate::multiplexer::{HandlerId, NotificationMultiplexer, Subscription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};
use triggerfish_sql::ddl::TriggerDdl;
use triggerfish_sql::trigger::{TriggerBuilder, TriggerSpec};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerState {
    /// No validated definition yet
    Uninitialized,
    /// Definition validated, nothing applied
    DefinitionComplete,
    /// Function and trigger exist in the database
    Created,
    /// Created and attached to its channel
    Listening,
    /// Created, detached from its channel
    Stopped,
    /// Removed from the database (terminal)
    Dropped,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    /// Definition validated
    Define,
    /// Apply DDL
    Setup,
    /// Attach to the channel
    Listen,
    /// Detach from the channel
    Stop,
    /// Remove DDL
    Drop,
}

impl TriggerEvent {
    fn verb(self) -> &'static str {
        match self {
            Self::Define => "define",
            Self::Setup => "set up",
            Self::Listen => "listen on",
            Self::Stop => "stop",
            Self::Drop => "drop",
        }
    }
}

/// A rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    /// State the event was applied to
    pub state: TriggerState,
    /// Rejected event
    pub event: TriggerEvent,
}

impl TransitionError {
    /// As a crate error for trigger `key`
    pub fn into_error(self, key: &str) -> Error {
        match (self.state, self.event) {
            (TriggerState::DefinitionComplete, TriggerEvent::Listen) => Error::NotSetup {
                trigger: key.to_string(),
            },
            (state, event) => Error::InvalidState {
                trigger: key.to_string(),
                state: state.to_string(),
                operation: event.verb(),
            },
        }
    }
}

impl TriggerState {
    /// Next state for `event`; returning the current state means no-op
    pub fn transition(self, event: TriggerEvent) -> std::result::Result<Self, TransitionError> {
        use TriggerEvent as E;
        use TriggerState as S;

        let next = match (self, event) {
            (S::Uninitialized, E::Define) => S::DefinitionComplete,
            (S::DefinitionComplete, E::Setup) => S::Created,
            (S::Created | S::Listening | S::Stopped, E::Setup) => self,
            (S::Created | S::Stopped | S::Listening, E::Listen) => S::Listening,
            (S::Listening, E::Stop) => S::Stopped,
            (S::DefinitionComplete | S::Created | S::Stopped, E::Stop) => self,
            (S::DefinitionComplete | S::Created | S::Listening | S::Stopped, E::Drop) => {
                S::Dropped
            }
            (S::Dropped, E::Drop) => S::Dropped,
            (state, event) => return Err(TransitionError { state, event }),
        };
        Ok(next)
    }

    /// Whether the DDL is applied
    pub fn is_created(self) -> bool {
        matches!(self, Self::Created | Self::Listening | Self::Stopped)
    }
}

/// Identifies a handler stored on a lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalHandlerId(u64);

struct LocalHandler {
    id: LocalHandlerId,
    subscription: Subscription,
    attached: Option<HandlerId>,
}

#[derive(Default)]
struct Attachments {
    handlers: Vec<LocalHandler>,
    next_id: u64,
    /// Observer running `after_notification` plugin hooks
    observer: Option<HandlerId>,
}

/// Shared runtime services a lifecycle needs
#[derive(Clone)]
pub struct LifecycleContext {
    /// Connection manager for DDL
    pub manager: ConnectionManager,
    /// Multiplexer for channel attachment
    pub multiplexer: NotificationMultiplexer,
    /// Plugins
    pub plugins: PluginChain,
    /// Optional metadata mirror
    pub mirror: Option<MetadataMirror>,
}

/// One trigger's lifecycle
pub struct TriggerLifecycle {
    spec: Arc<TriggerSpec>,
    ctx: LifecycleContext,
    state: watch::Sender<TriggerState>,
    /// Serializes lifecycle operations and guards attachments
    attachments: Mutex<Attachments>,
}

impl TriggerLifecycle {
    /// Lifecycle for a validated spec, in `DefinitionComplete`
    pub fn new(spec: TriggerSpec, ctx: LifecycleContext) -> Self {
        let (state, _) = watch::channel(TriggerState::Uninitialized);
        let lifecycle = Self {
            spec: Arc::new(spec),
            ctx,
            state,
            attachments: Mutex::new(Attachments::default()),
        };
        lifecycle.state.send_replace(TriggerState::DefinitionComplete);
        lifecycle
    }

    /// Validate `builder` and create its lifecycle
    pub fn define(builder: TriggerBuilder, ctx: LifecycleContext) -> Result<Self> {
        let spec = builder.build()?;
        Ok(Self::new(spec, ctx))
    }

    /// Trigger specification
    pub fn spec(&self) -> &TriggerSpec {
        &self.spec
    }

    /// `schema.table.name`
    pub fn key(&self) -> String {
        self.spec.key()
    }

    /// Current state
    pub fn state(&self) -> TriggerState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn state_changes(&self) -> watch::Receiver<TriggerState> {
        self.state.subscribe()
    }

    fn next_state(&self, event: TriggerEvent) -> Result<TriggerState> {
        self.state()
            .transition(event)
            .map_err(|e| e.into_error(&self.key()))
    }

    fn channel(&self) -> Result<&str> {
        self.spec.channel.as_deref().ok_or_else(|| {
            Error::config(format!(
                "trigger '{}' has no notification channel; use listen_on()",
                self.key()
            ))
        })
    }

    /// Create the notify function (when managed) and the trigger.
    ///
    /// A no-op once created.
    pub async fn setup(&self) -> Result<()> {
        let _guard = self.attachments.lock().await;
        let current = self.state();
        if self.next_state(TriggerEvent::Setup)? == current {
            return Ok(());
        }

        self.ctx.plugins.before_create(&self.spec).await?;

        let statements = TriggerDdl::new(&self.spec).setup_statements();
        self.ctx
            .manager
            .run_in_transaction(move |tx| {
                Box::pin(async move {
                    for statement in &statements {
                        tx.batch_execute(statement).await?;
                    }
                    Ok(())
                })
            })
            .await?;

        self.state.send_replace(TriggerState::Created);
        info!("Created trigger {}", self.key());

        self.ctx.plugins.after_create(&self.spec).await;
        if let Some(mirror) = &self.ctx.mirror {
            mirror.record(&self.spec).await;
        }
        Ok(())
    }

    /// Attach every stored handler to the trigger's channel.
    ///
    /// Fails with [`Error::NotSetup`] before [`setup`](Self::setup).
    pub async fn listen(&self) -> Result<()> {
        let mut attachments = self.attachments.lock().await;
        if self.next_state(TriggerEvent::Listen)? == self.state() {
            return Ok(());
        }
        let channel = self.channel()?.to_string();

        if let Err(e) = self.attach_all(&channel, &mut attachments).await {
            self.detach_all(&channel, &mut attachments).await;
            return Err(e);
        }

        self.state.send_replace(TriggerState::Listening);
        info!("Trigger {} listening on {}", self.key(), channel);
        Ok(())
    }

    /// Detach from the channel; the trigger keeps firing in the database
    pub async fn stop(&self) -> Result<()> {
        let mut attachments = self.attachments.lock().await;
        let current = self.state();
        let next = self.next_state(TriggerEvent::Stop)?;
        if next == current {
            return Ok(());
        }

        let channel = self.channel()?.to_string();
        let result = self.detach_all(&channel, &mut attachments).await;
        self.state.send_replace(next);
        info!("Trigger {} stopped", self.key());
        result
    }

    /// Detach if listening, then drop the trigger and its managed function.
    ///
    /// Terminal; a dropped trigger cannot be set up again.
    pub async fn drop_trigger(&self) -> Result<()> {
        let mut attachments = self.attachments.lock().await;
        let current = self.state();
        if self.next_state(TriggerEvent::Drop)? == current {
            return Ok(());
        }

        if current == TriggerState::Listening {
            let channel = self.channel()?.to_string();
            let detached = self.detach_all(&channel, &mut attachments).await;
            self.state.send_replace(TriggerState::Stopped);
            detached?;
        }

        if current.is_created() {
            self.ctx.plugins.before_drop(&self.spec).await;
            let statements = TriggerDdl::new(&self.spec).teardown_statements();
            self.ctx
                .manager
                .run_in_transaction(move |tx| {
                    Box::pin(async move {
                        for statement in &statements {
                            tx.batch_execute(statement).await?;
                        }
                        Ok(())
                    })
                })
                .await?;
            if let Some(mirror) = &self.ctx.mirror {
                mirror.forget(&self.spec).await;
            }
        }

        self.state.send_replace(TriggerState::Dropped);
        info!("Dropped trigger {}", self.key());
        Ok(())
    }

    /// Store a handler; it receives notifications while the trigger listens
    pub async fn subscribe(&self, subscription: Subscription) -> Result<LocalHandlerId> {
        let mut attachments = self.attachments.lock().await;
        attachments.next_id += 1;
        let id = LocalHandlerId(attachments.next_id);

        let subscription = self.with_plugin_errors(subscription);
        let attached = if self.state() == TriggerState::Listening {
            let channel = self.channel()?;
            Some(
                self.ctx
                    .multiplexer
                    .subscribe(channel, subscription.clone())
                    .await?,
            )
        } else {
            None
        };

        attachments.handlers.push(LocalHandler {
            id,
            subscription,
            attached,
        });
        Ok(id)
    }

    /// Remove a stored handler; returns whether it existed
    pub async fn unsubscribe(&self, id: LocalHandlerId) -> Result<bool> {
        let mut attachments = self.attachments.lock().await;
        let Some(pos) = attachments.handlers.iter().position(|h| h.id == id) else {
            return Ok(false);
        };
        let handler = attachments.handlers.remove(pos);
        if let (Some(attached), Some(channel)) = (handler.attached, self.spec.channel.as_deref()) {
            self.ctx
                .multiplexer
                .unsubscribe(channel, Some(attached))
                .await?;
        }
        Ok(true)
    }

    /// Stored handlers
    pub async fn handler_count(&self) -> usize {
        self.attachments.lock().await.handlers.len()
    }

    fn with_plugin_errors(&self, subscription: Subscription) -> Subscription {
        let plugins = self.ctx.plugins.clone();
        let spec = self.spec.clone();
        subscription.observe_errors(move |failure| plugins.on_error(&spec, &failure.to_error()))
    }

    async fn attach_all(&self, channel: &str, attachments: &mut Attachments) -> Result<()> {
        for handler in attachments.handlers.iter_mut() {
            if handler.attached.is_none() {
                let id = self
                    .ctx
                    .multiplexer
                    .subscribe(channel, handler.subscription.clone())
                    .await?;
                handler.attached = Some(id);
            }
        }

        if !self.ctx.plugins.is_empty() && attachments.observer.is_none() {
            let plugins = self.ctx.plugins.clone();
            let spec = self.spec.clone();
            let name = format!("{}#plugins", spec.name);
            let observer = Subscription::from_fn(move |n: &Notification| {
                plugins.after_notification(&spec, n);
                Ok(())
            })
            .name(name);
            attachments.observer = Some(self.ctx.multiplexer.subscribe(channel, observer).await?);
        }
        Ok(())
    }

    /// Detach everything; keeps going past failures and returns the first
    async fn detach_all(&self, channel: &str, attachments: &mut Attachments) -> Result<()> {
        let mut first_error = None;
        let observer = attachments.observer.take();
        let ids = attachments
            .handlers
            .iter_mut()
            .filter_map(|h| h.attached.take())
            .chain(observer)
            .collect::<Vec<_>>();

        for id in ids {
            if let Err(e) = self.ctx.multiplexer.unsubscribe(channel, Some(id)).await {
                debug!("Failed to detach {} from {}: {}", id, channel, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for TriggerLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerLifecycle")
            .field("trigger", &self.key())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TriggerEvent as E;
    use TriggerState as S;

    #[test]
    fn test_transition_table() {
        assert_eq!(S::Uninitialized.transition(E::Define), Ok(S::DefinitionComplete));
        assert_eq!(S::DefinitionComplete.transition(E::Setup), Ok(S::Created));
        assert_eq!(S::Created.transition(E::Setup), Ok(S::Created));
        assert_eq!(S::Created.transition(E::Listen), Ok(S::Listening));
        assert_eq!(S::Listening.transition(E::Stop), Ok(S::Stopped));
        assert_eq!(S::Stopped.transition(E::Listen), Ok(S::Listening));
        assert_eq!(S::Stopped.transition(E::Drop), Ok(S::Dropped));
        assert_eq!(S::Listening.transition(E::Drop), Ok(S::Dropped));
        assert_eq!(S::Dropped.transition(E::Drop), Ok(S::Dropped));
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(S::Uninitialized.transition(E::Setup).is_err());
        assert!(S::Dropped.transition(E::Setup).is_err());
        assert!(S::Dropped.transition(E::Listen).is_err());

        let err = S::DefinitionComplete
            .transition(E::Listen)
            .unwrap_err()
            .into_error("public.orders.t");
        assert!(matches!(err, Error::NotSetup { .. }));

        let err = S::Dropped
            .transition(E::Setup)
            .unwrap_err()
            .into_error("public.orders.t");
        assert_eq!(
            err.to_string(),
            "cannot set up trigger 'public.orders.t' in state Dropped"
        );
    }
}
