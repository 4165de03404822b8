//! Collaborator seams invoked after a decision commits.
//!
//! Nothing here can write to the slot store or the ledger: every call receives
//! an owned snapshot, and every failure is reported back only as a value.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::model::{Mode, ProgramKey, SlotCoord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Email,
    WhatsApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::WhatsApp => "whatsapp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: Channel,
    pub recipient: String,
    pub template: &'static str,
    pub variables: BTreeMap<&'static str, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Queued,
    /// The sink chose not to deliver (e.g. no address on file).
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub payment_ref: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub program: ProgramKey,
    pub slot: SlotCoord,
    pub mode: Mode,
    pub attendee: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError(pub String);

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "adapter error: {}", self.0)
    }
}

impl std::error::Error for AdapterError {}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<DeliveryStatus, AdapterError>;
}

#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    async fn refund(&self, request: &RefundRequest) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait CalendarAdapter: Send + Sync {
    async fn create_event(&self, event: &CalendarEvent) -> Result<(), AdapterError>;
}

/// The set of collaborators one tenant dispatches to.
#[derive(Clone)]
pub struct Adapters {
    pub notifications: Arc<dyn NotificationSink>,
    pub payments: Arc<dyn PaymentAdapter>,
    pub calendar: Arc<dyn CalendarAdapter>,
}

impl Adapters {
    /// Log every call instead of talking to a real provider.
    pub fn logging() -> Self {
        let log = Arc::new(LogAdapter);
        Self {
            notifications: log.clone(),
            payments: log.clone(),
            calendar: log,
        }
    }
}

/// Stand-in used when no provider is wired up.
pub struct LogAdapter;

#[async_trait]
impl NotificationSink for LogAdapter {
    async fn send(&self, n: &Notification) -> Result<DeliveryStatus, AdapterError> {
        info!(
            channel = n.channel.as_str(),
            recipient = %n.recipient,
            template = n.template,
            "notification"
        );
        Ok(DeliveryStatus::Queued)
    }
}

#[async_trait]
impl PaymentAdapter for LogAdapter {
    async fn refund(&self, r: &RefundRequest) -> Result<(), AdapterError> {
        info!(payment_ref = %r.payment_ref, amount_cents = r.amount_cents, "refund requested");
        Ok(())
    }
}

#[async_trait]
impl CalendarAdapter for LogAdapter {
    async fn create_event(&self, e: &CalendarEvent) -> Result<(), AdapterError> {
        info!(program = %e.program, slot = %e.slot, attendee = %e.attendee, "calendar event");
        Ok(())
    }
}
