//! Opaque message type delivered by the underlying pub/sub transport.

/// A single message delivered on a bus subject.
///
/// The payload is opaque at this layer; consumers decode it into their own
/// event model. The bus delivers at-least-once, so consumers must tolerate
/// redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}
