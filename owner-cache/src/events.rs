//! Owner registration events and their bus subjects.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Notification published on an owner's registration subject whenever the
/// owner's device set changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistrationEvent {
    DevicesRegistered { device_ids: Vec<String> },
    DevicesUnregistered { device_ids: Vec<String> },
}

#[derive(Debug, Error)]
#[error("cannot decode registration event: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl RegistrationEvent {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing this enum cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn device_ids(&self) -> &[String] {
        match self {
            RegistrationEvent::DevicesRegistered { device_ids } => device_ids,
            RegistrationEvent::DevicesUnregistered { device_ids } => device_ids,
        }
    }
}

/// Subject carrying [`RegistrationEvent`]s for one owner.
pub fn registration_subject(owner: &str) -> String {
    format!("owners.{owner}.registrations")
}
