//! Authoritative device-directory collaborator interface.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Stream of device IDs owned by one owner, terminated by end-of-stream or
/// the first error.
pub type DeviceStream = BoxStream<'static, Result<String, DirectoryError>>;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("cannot get owner devices: {0}")]
    GetDevices(String),
    #[error("cannot receive owner devices: {0}")]
    Receive(String),
}

/// Authoritative source of owner-to-device mappings, used for full
/// resynchronization of the cache.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn get_devices(&self, owner: &str) -> Result<DeviceStream, DirectoryError>;
}
