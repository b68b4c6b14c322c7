//! Listener transport seam
//!
//! A [`ListenerConnector`] opens one dedicated connection used only for
//! LISTEN/UNLISTEN. Inbound notifications and connection loss are pushed as
//! [`TransportEvent`]s into the channel handed to `connect`; the connection
//! manager owns that channel for its whole lifetime, so events from a
//! replacement connection arrive on the same receiver.

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A notification as delivered by the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    /// Channel name
    pub channel: String,
    /// Payload text
    pub payload: String,
    /// Backend process id of the sender
    pub process_id: i32,
}

impl RawNotification {
    /// Create a raw notification
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            process_id: 0,
        }
    }
}

/// Events pushed by a listener connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A notification arrived
    Notification(RawNotification),
    /// The connection was lost; no further events follow from it
    Disconnected {
        /// Why the connection ended
        reason: String,
    },
}

/// Sender half handed to [`ListenerConnector::connect`]
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// An open listener connection
#[async_trait]
pub trait ListenerTransport: Send + Sync {
    /// Subscribe to a channel; returns once the server confirmed it
    async fn listen(&self, channel: &str) -> Result<()>;

    /// Unsubscribe from a channel
    async fn unlisten(&self, channel: &str) -> Result<()>;

    /// Close the connection without emitting `Disconnected`
    async fn close(&self) -> Result<()>;
}

/// Opens listener connections
#[async_trait]
pub trait ListenerConnector: Send + Sync {
    /// Open a connection that pushes its events into `events`
    async fn connect(&self, events: EventSender) -> Result<Box<dyn ListenerTransport>>;
}
