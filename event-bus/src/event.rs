//! Typed event model consumed by the ordered dispatcher.

use crate::transport::BoxError;
use async_trait::async_trait;
use std::sync::Arc;

/// A business event carried on the bus.
///
/// `group_id` and `aggregate_id` identify the logical stream the event
/// belongs to; events of one stream are handed to handlers strictly in
/// arrival order and never concurrently.
pub trait Event: Send + Sync {
    fn group_id(&self) -> &str;
    fn aggregate_id(&self) -> &str;
    fn event_type(&self) -> &str;
}

pub type DynEvent = Arc<dyn Event>;

/// Derives the logical stream identity of an event.
pub fn stream_key(event: &dyn Event) -> String {
    format!("{}.{}", event.group_id(), event.aggregate_id())
}

/// Handles a batch of decoded events.
///
/// [`crate::OrderedPoolHandler`] both consumes and implements this trait, so
/// it can be placed wherever a plain handler can, including behind a
/// transport listener that decodes incoming messages.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, events: Vec<DynEvent>) -> Result<(), BoxError>;
}
