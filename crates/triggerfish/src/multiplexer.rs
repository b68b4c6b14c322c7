//! Notification multiplexer
//!
//! Fans out one physical LISTEN per channel to any number of handlers.
//!
//! # Dispatch
//!
//! Each payload is parsed once per message. A malformed payload is reported
//! once on the [`errors`](NotificationMultiplexer::errors) channel and never
//! reaches a handler. A parsed message is handed to every registered handler
//! before the next message on that channel is looked at, so every handler
//! observes a channel's messages in arrival order.
//!
//! Handlers run independently: a handler that returns an error or panics is
//! reported individually and never affects sibling handlers, other channels,
//! or the dispatch loop. No timeout or back-pressure is applied to slow
//! handlers.
//!
//! # Delivery modes
//!
//! - [`DeliveryMode::Sequential`] (default): each handler has its own ordered
//!   queue and processes one message at a time
//! - [`DeliveryMode::Concurrent`]: one task per message per handler; a
//!   handler may see messages overlap

use crate::config::MultiplexerConfig;
use crate::envelope::{Envelope, Notification};
use crate::error::{BoxError, Error, Result};
use crate::manager::{ConnectionManager, RawHandler, TeardownReport};
use crate::transport::RawNotification;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a handler receives messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Per-handler ordered queue
    #[default]
    Sequential,
    /// One task per message
    Concurrent,
}

/// Identifies a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

type NotifyFn = Arc<dyn Fn(Arc<Notification>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&HandlerFailure, &str) + Send + Sync>;
type ValidatorFn = Arc<dyn Fn(&Notification) -> std::result::Result<(), String> + Send + Sync>;

/// Result returned by notification callbacks
pub type HandlerResult = std::result::Result<(), BoxError>;

/// A handler registration: callback plus optional name, error callback,
/// validator and delivery mode
#[derive(Clone)]
pub struct Subscription {
    on_notification: NotifyFn,
    on_error: Option<ErrorFn>,
    validator: Option<ValidatorFn>,
    name: Option<String>,
    delivery: Option<DeliveryMode>,
}

impl Subscription {
    /// Async callback
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(Arc<Notification>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            on_notification: Arc::new(move |n| callback(n).boxed()),
            on_error: None,
            validator: None,
            name: None,
            delivery: None,
        }
    }

    /// Synchronous callback
    pub fn from_fn<F>(callback: F) -> Self
    where
        F: Fn(&Notification) -> HandlerResult + Send + Sync + 'static,
    {
        Self::new(move |n: Arc<Notification>| futures::future::ready(callback(n.as_ref())))
    }

    /// Async callback receiving the row image decoded as `T`.
    ///
    /// A row that does not decode is reported as a handler failure.
    pub fn typed<T, F, Fut>(callback: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, Arc<Notification>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::new(move |n: Arc<Notification>| {
            let call = n
                .decode::<T>()
                .map(|row| callback(row, n.clone()))
                .map_err(|e| format!("failed to decode row: {}", e));
            async move {
                match call {
                    Ok(fut) => fut.await,
                    Err(message) => Err(message.into()),
                }
            }
        })
    }

    /// Name used in logs and failure reports
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Called with each failure of this handler and the raw payload.
    ///
    /// Replaces the default, which logs and continues. A panic in this
    /// callback is caught and logged.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&HandlerFailure, &str) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Reject messages before the callback runs
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Notification) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Override the multiplexer's default delivery mode
    pub fn delivery(mut self, mode: DeliveryMode) -> Self {
        self.delivery = Some(mode);
        self
    }

    /// Run `observer` after this handler's own error callback
    pub(crate) fn observe_errors<F>(mut self, observer: F) -> Self
    where
        F: Fn(&HandlerFailure) + Send + Sync + 'static,
    {
        let own = self.on_error.take();
        self.on_error = Some(Arc::new(move |failure: &HandlerFailure, raw: &str| {
            report_failure(own.as_ref(), failure, raw);
            observer(failure);
        }));
        self
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("delivery", &self.delivery)
            .field("on_error", &self.on_error.is_some())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// How a handler failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The validator rejected the message
    Rejected,
    /// The callback returned an error
    Failed,
    /// The validator or callback panicked
    Panicked,
}

/// One handler's failure on one message
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    /// Failing handler
    pub handler: HandlerId,
    /// Handler name, if set
    pub name: Option<String>,
    /// Channel of the message
    pub channel: String,
    /// Delivery the failure belongs to
    pub delivery_id: Uuid,
    /// Failure kind
    pub kind: FailureKind,
    /// Error text
    pub message: String,
}

impl HandlerFailure {
    /// Handler name, or its id when unnamed
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.handler.to_string())
    }

    /// As a crate error
    pub fn to_error(&self) -> Error {
        Error::Handler {
            handler: self.label(),
            channel: self.channel.clone(),
            message: self.message.clone(),
        }
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler {} failed on channel '{}': {}",
            self.label(),
            self.channel,
            self.message
        )
    }
}

/// Errors reported on the multiplexer's error channel
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// A payload could not be parsed; the message was dropped
    Payload {
        /// Channel
        channel: String,
        /// Payload as received
        raw: Arc<str>,
        /// Parser error
        message: String,
    },
    /// A handler failed
    Handler(HandlerFailure),
}

impl DispatchError {
    /// Channel the error occurred on
    pub fn channel(&self) -> &str {
        match self {
            Self::Payload { channel, .. } => channel,
            Self::Handler(failure) => &failure.channel,
        }
    }

    /// As a crate error
    pub fn to_error(&self) -> Error {
        match self {
            Self::Payload {
                channel, message, ..
            } => Error::PayloadParse {
                channel: channel.clone(),
                message: message.clone(),
            },
            Self::Handler(failure) => failure.to_error(),
        }
    }
}

/// Counters for one channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Registered handlers
    pub handlers: usize,
    /// Messages dispatched to the handler set
    pub delivered: u64,
    /// Payloads dropped as malformed
    pub parse_errors: u64,
    /// Individual handler failures
    pub handler_failures: u64,
}

/// Snapshot of every open channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    /// Per-channel counters
    pub channels: BTreeMap<String, ChannelStats>,
}

impl MultiplexerStats {
    /// Total registered handlers
    pub fn total_handlers(&self) -> usize {
        self.channels.values().map(|c| c.handlers).sum()
    }
}

#[derive(Debug, Default)]
struct ChannelCounters {
    delivered: AtomicU64,
    parse_errors: AtomicU64,
    handler_failures: AtomicU64,
}

struct HandlerRuntime {
    id: HandlerId,
    channel: String,
    subscription: Subscription,
    counters: Arc<ChannelCounters>,
    errors: broadcast::Sender<DispatchError>,
}

enum Sink {
    Sequential(mpsc::UnboundedSender<Arc<Notification>>),
    Concurrent,
}

struct HandlerSlot {
    id: HandlerId,
    runtime: Arc<HandlerRuntime>,
    sink: Sink,
}

impl HandlerSlot {
    fn start(runtime: HandlerRuntime, mode: DeliveryMode) -> Self {
        let id = runtime.id;
        let runtime = Arc::new(runtime);
        let sink = match mode {
            DeliveryMode::Sequential => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Notification>>();
                let worker = runtime.clone();
                tokio::spawn(async move {
                    while let Some(notification) = rx.recv().await {
                        deliver(&worker, notification).await;
                    }
                    debug!("Handler {} on {} stopped", worker.id, worker.channel);
                });
                Sink::Sequential(tx)
            }
            DeliveryMode::Concurrent => Sink::Concurrent,
        };
        Self { id, runtime, sink }
    }

    fn schedule(&self, notification: Arc<Notification>) {
        match &self.sink {
            Sink::Sequential(tx) => {
                if tx.send(notification).is_err() {
                    warn!("Handler {} queue closed", self.id);
                }
            }
            Sink::Concurrent => {
                let runtime = self.runtime.clone();
                tokio::spawn(async move { deliver(&runtime, notification).await });
            }
        }
    }
}

struct ChannelEntry {
    handlers: Vec<HandlerSlot>,
    counters: Arc<ChannelCounters>,
}

struct MuxInner {
    manager: ConnectionManager,
    channels: RwLock<HashMap<String, ChannelEntry>>,
    /// Sequences subscribe/unsubscribe/dispose
    ops: Mutex<()>,
    errors: broadcast::Sender<DispatchError>,
    next_id: AtomicU64,
    default_delivery: DeliveryMode,
    disposed: AtomicBool,
}

impl MuxInner {
    fn dispatch(&self, raw: RawNotification) {
        let channels = self.channels.read();
        let Some(entry) = channels.get(&raw.channel) else {
            debug!("No handlers for channel {}", raw.channel);
            return;
        };

        let envelope = match Envelope::from_json(&raw.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                entry.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed payload on {}: {}", raw.channel, e);
                let _ = self.errors.send(DispatchError::Payload {
                    channel: raw.channel,
                    raw: Arc::from(raw.payload),
                    message: e.to_string(),
                });
                return;
            }
        };

        let notification = Arc::new(Notification::new(raw, envelope));
        entry.counters.delivered.fetch_add(1, Ordering::Relaxed);
        for slot in &entry.handlers {
            slot.schedule(notification.clone());
        }
    }
}

/// Channel multiplexer over a [`ConnectionManager`]
#[derive(Clone)]
pub struct NotificationMultiplexer {
    inner: Arc<MuxInner>,
}

impl NotificationMultiplexer {
    /// Create a multiplexer
    pub fn new(manager: ConnectionManager, config: &MultiplexerConfig) -> Self {
        let (errors, _) = broadcast::channel(config.error_channel_capacity.max(1));
        Self {
            inner: Arc::new(MuxInner {
                manager,
                channels: RwLock::new(HashMap::new()),
                ops: Mutex::new(()),
                errors,
                next_id: AtomicU64::new(0),
                default_delivery: config.delivery,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::disposed("notification multiplexer"));
        }
        Ok(())
    }

    /// Underlying connection manager
    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    /// Register a handler on `channel`.
    ///
    /// The first handler on a channel waits for the LISTEN confirmation;
    /// later handlers are added without a round-trip.
    pub async fn subscribe(&self, channel: &str, subscription: Subscription) -> Result<HandlerId> {
        self.ensure_active()?;
        let _ops = self.inner.ops.lock().await;
        self.ensure_active()?;

        let is_new = !self.inner.channels.read().contains_key(channel);
        if is_new {
            self.inner.channels.write().insert(
                channel.to_string(),
                ChannelEntry {
                    handlers: Vec::new(),
                    counters: Arc::new(ChannelCounters::default()),
                },
            );

            let weak = Arc::downgrade(&self.inner);
            let dispatcher: RawHandler = Arc::new(move |raw| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(raw);
                }
            });
            if let Err(e) = self.inner.manager.subscribe(channel, dispatcher).await {
                self.inner.channels.write().remove(channel);
                return Err(e);
            }
            info!("Opened channel {}", channel);
        }

        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mode = subscription.delivery.unwrap_or(self.inner.default_delivery);

        let mut channels = self.inner.channels.write();
        let entry = channels
            .get_mut(channel)
            .ok_or_else(|| Error::transport(format!("channel {} closed during subscribe", channel)))?;
        let runtime = HandlerRuntime {
            id,
            channel: channel.to_string(),
            subscription,
            counters: entry.counters.clone(),
            errors: self.inner.errors.clone(),
        };
        entry.handlers.push(HandlerSlot::start(runtime, mode));
        debug!(
            "Registered {} on {} ({} handlers)",
            id,
            channel,
            entry.handlers.len()
        );
        Ok(id)
    }

    /// Remove one handler, or every handler when `handler` is `None`.
    ///
    /// The physical subscription is torn down with the last handler. Unknown
    /// channels and handlers are a no-op.
    pub async fn unsubscribe(&self, channel: &str, handler: Option<HandlerId>) -> Result<()> {
        self.ensure_active()?;
        let _ops = self.inner.ops.lock().await;

        let now_empty = {
            let mut channels = self.inner.channels.write();
            let Some(entry) = channels.get_mut(channel) else {
                return Ok(());
            };
            match handler {
                Some(id) => entry.handlers.retain(|h| h.id != id),
                None => entry.handlers.clear(),
            }
            if entry.handlers.is_empty() {
                channels.remove(channel);
                true
            } else {
                false
            }
        };

        if now_empty {
            self.inner.manager.unsubscribe(channel).await?;
            info!("Closed channel {}", channel);
        }
        Ok(())
    }

    /// Error channel: malformed payloads and handler failures
    pub fn errors(&self) -> broadcast::Receiver<DispatchError> {
        self.inner.errors.subscribe()
    }

    /// Open channels
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.inner.channels.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Handlers registered on `channel`
    pub fn handler_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .read()
            .get(channel)
            .map_or(0, |e| e.handlers.len())
    }

    /// Per-channel statistics
    pub fn stats(&self) -> MultiplexerStats {
        let channels = self.inner.channels.read();
        MultiplexerStats {
            channels: channels
                .iter()
                .map(|(name, entry)| {
                    let c = &entry.counters;
                    (
                        name.clone(),
                        ChannelStats {
                            handlers: entry.handlers.len(),
                            delivered: c.delivered.load(Ordering::Relaxed),
                            parse_errors: c.parse_errors.load(Ordering::Relaxed),
                            handler_failures: c.handler_failures.load(Ordering::Relaxed),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Whether [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Drop every handler and UNLISTEN every channel, collecting failures.
    ///
    /// Idempotent. Does not dispose the connection manager.
    pub async fn dispose(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return report;
        }

        let _ops = self.inner.ops.lock().await;
        let channels: Vec<String> = self
            .inner
            .channels
            .write()
            .drain()
            .map(|(channel, _)| channel)
            .collect();

        if self.inner.manager.is_disposed() {
            return report;
        }
        for channel in channels {
            let result = self.inner.manager.unsubscribe(&channel).await;
            report.record(channel, result);
        }
        report
    }
}

async fn deliver(runtime: &HandlerRuntime, notification: Arc<Notification>) {
    let Err((kind, message)) = invoke(&runtime.subscription, notification.clone()).await else {
        return;
    };

    runtime
        .counters
        .handler_failures
        .fetch_add(1, Ordering::Relaxed);
    let failure = HandlerFailure {
        handler: runtime.id,
        name: runtime.subscription.name.clone(),
        channel: runtime.channel.clone(),
        delivery_id: notification.delivery_id,
        kind,
        message,
    };

    report_failure(
        runtime.subscription.on_error.as_ref(),
        &failure,
        &notification.raw,
    );
    let _ = runtime.errors.send(DispatchError::Handler(failure));
}

/// Runs an error callback, falling back to a log line; a panicking callback is logged
fn report_failure(callback: Option<&ErrorFn>, failure: &HandlerFailure, raw: &str) {
    let reported = catch_unwind(AssertUnwindSafe(|| match callback {
        Some(on_error) => on_error(failure, raw),
        None => log_failure(failure),
    }));
    if let Err(panic) = reported {
        error!(
            "Error callback of {} panicked: {}",
            failure.label(),
            panic_message(panic)
        );
    }
}

async fn invoke(
    subscription: &Subscription,
    notification: Arc<Notification>,
) -> std::result::Result<(), (FailureKind, String)> {
    if let Some(validator) = &subscription.validator {
        match catch_unwind(AssertUnwindSafe(|| validator(notification.as_ref()))) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err((FailureKind::Rejected, reason)),
            Err(panic) => return Err((FailureKind::Panicked, panic_message(panic))),
        }
    }

    let call = catch_unwind(AssertUnwindSafe(|| {
        (subscription.on_notification)(notification)
    }))
    .map_err(|panic| (FailureKind::Panicked, panic_message(panic)))?;

    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err((FailureKind::Failed, e.to_string())),
        Err(panic) => Err((FailureKind::Panicked, panic_message(panic))),
    }
}

fn log_failure(failure: &HandlerFailure) {
    warn!("{}", failure);
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
