//! Transport collaborator interface and the shared error-reporting sink.

use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error funneled into [`ErrFunc`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reports failures that arise from background activity and have no
/// synchronous caller to return to (notification decode failures, sweep
/// unsubscribe failures, dispatcher handler errors).
pub type ErrFunc = Arc<dyn Fn(BoxError) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot subscribe to subject('{subject}'): {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("cannot unsubscribe from subject('{subject}'): {reason}")]
    Unsubscribe { subject: String, reason: String },
}

/// Receives messages delivered on a subscribed subject.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, msg: Message);
}

/// A live transport-level subscription.
#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    fn subject(&self) -> &str;

    async fn unsubscribe(&self) -> Result<(), TransportError>;
}

/// The underlying pub/sub transport. Implementations deliver messages
/// at-least-once with no ordering guarantee across subjects.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(
        &self,
        subject: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Box<dyn SubscriptionHandle>, TransportError>;
}
