//! The delivery-source interface.
//!
//! A message source (the retry queue, a test harness) drives a target
//! through `start → add_rcpt* → body → commit/abort`. Targets are trait
//! objects so sources stay decoupled from any concrete engine.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    message::{MessageBody, MessageHeader, MessageMeta},
    status::Status,
};

/// Something that can accept a message for delivery.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// Opens a delivery transaction for one message.
    ///
    /// # Errors
    /// A [`Status`] the caller can relay verbatim, e.g. a temporary
    /// rejection when the target is saturated.
    async fn start(
        &self,
        meta: &MessageMeta,
        mail_from: &str,
    ) -> Result<Box<dyn Transaction>, Status>;
}

/// One in-flight message delivery.
///
/// `commit` and `abort` consume the transaction; either one releases every
/// resource the transaction holds (connections, limiter slots), so a
/// transaction can never be left half-closed.
#[async_trait]
pub trait Transaction: Send {
    /// Queues a recipient. Never performs network I/O; resolution happens
    /// in [`Self::body`].
    ///
    /// # Errors
    /// Rejection with the SMTP status the recipient should receive.
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<(), Status>;

    /// Delivers the message to every queued recipient, atomically from the
    /// caller's point of view.
    ///
    /// # Errors
    /// With one recipient, the recipient's own status verbatim; otherwise a
    /// composite status classified temporary if any per-recipient failure
    /// was temporary.
    async fn body(&mut self, header: &MessageHeader, body: &MessageBody) -> Result<(), Status>;

    /// Delivers the message, reporting each recipient's outcome through
    /// `collector` instead of collapsing them into one status.
    async fn body_non_atomic(
        &mut self,
        collector: &dyn StatusCollector,
        header: &MessageHeader,
        body: &MessageBody,
    );

    /// Finalizes the transaction.
    ///
    /// # Errors
    /// Currently never fails for this engine; the signature leaves room for
    /// targets with a real commit step.
    async fn commit(self: Box<Self>) -> Result<(), Status>;

    /// Discards the transaction, releasing held resources.
    async fn abort(self: Box<Self>);
}

/// Sink for per-recipient outcomes during a non-atomic delivery.
pub trait StatusCollector: Send + Sync {
    fn set_status(&self, rcpt: &str, result: Result<(), Status>);
}

/// A [`StatusCollector`] that records the first terminal status per
/// recipient. Later writes for the same recipient are ignored, so a status
/// is never overwritten once set.
#[derive(Debug, Default)]
pub struct StatusMap {
    inner: Mutex<HashMap<String, Result<(), Status>>>,
}

impl StatusMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, rcpt: &str) -> Option<Result<(), Status>> {
        self.inner.lock().get(rcpt).cloned()
    }

    #[must_use]
    pub fn into_inner(self) -> HashMap<String, Result<(), Status>> {
        self.inner.into_inner()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl StatusCollector for StatusMap {
    fn set_status(&self, rcpt: &str, result: Result<(), Status>) {
        self.inner
            .lock()
            .entry(rcpt.to_owned())
            .or_insert(result);
    }
}
